pub use avconsole_protocol::*;
