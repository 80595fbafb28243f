pub mod api;
pub mod backoff;
pub mod cache;
pub mod config;
pub mod console;
pub mod http;
pub mod notifications;
pub mod player;
pub mod playhead;
pub mod protocol;
pub mod push;
pub mod reconcile;
pub mod session;
pub mod settings;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;
