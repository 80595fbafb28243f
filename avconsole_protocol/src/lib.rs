use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// The backend emits some ids as integers and others as strings; the client
/// always works with strings.
fn id_string<'de, D>(de: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Str(String),
        Int(i64),
        Float(f64),
    }

    Ok(match RawId::deserialize(de)? {
        RawId::Str(s) => s,
        RawId::Int(i) => i.to_string(),
        RawId::Float(f) => format!("{f}"),
    })
}

fn opt_id_string<'de, D>(de: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrap(#[serde(deserialize_with = "id_string")] String);

    Ok(Option::<Wrap>::deserialize(de)?.map(|w| w.0))
}

// --- Auth ---

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct User {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub role: String,
    #[serde(default, alias = "full_name")]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role.eq_ignore_ascii_case("admin")
    }
}

fn default_true() -> bool {
    true
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub expires_in: u64,
    pub user: User,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RefreshResponse {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

/// Error body returned by every failing backend handler.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ErrorResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub error_code: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    Operator,
    #[default]
    Viewer,
}

impl UserRole {
    pub fn as_str(self) -> &'static str {
        match self {
            UserRole::Admin => "admin",
            UserRole::Operator => "operator",
            UserRole::Viewer => "viewer",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CreateUserRequest {
    pub username: String,
    pub password: String,
    pub role: UserRole,
    pub full_name: String,
    #[serde(default)]
    pub email: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct VersionInfo {
    pub version: String,
    #[serde(default)]
    pub build_date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub go_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
}

// --- Presets ---

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Preset {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct PresetsResponse {
    #[serde(default)]
    pub presets: Vec<Preset>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct CurrentPreset {
    #[serde(default, alias = "preset_id", deserialize_with = "opt_id_string")]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IdRequest {
    pub id: String,
}

// --- Controls ---

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Control {
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Companion mute toggle of a volume fader.
    #[serde(default, alias = "secondId", skip_serializing_if = "Option::is_none")]
    pub second_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ControlsResponse {
    #[serde(default)]
    pub controls: Vec<Control>,
}

/// A control reading on the wire: a number for faders, a bool for mutes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(untagged)]
pub enum ControlReading {
    Flag(bool),
    Level(f64),
}

impl ControlReading {
    pub fn as_level(self) -> Option<f64> {
        match self {
            ControlReading::Level(v) => Some(v),
            ControlReading::Flag(_) => None,
        }
    }

    pub fn as_flag(self) -> Option<bool> {
        match self {
            ControlReading::Flag(b) => Some(b),
            ControlReading::Level(v) => Some(v != 0.0),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ControlValueResponse {
    pub id: String,
    pub value: ControlReading,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SetControlRequest {
    pub value: ControlReading,
}

// --- Player ---

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlayerState {
    Playing,
    Paused,
    Stopped,
    #[default]
    #[serde(rename = "nomedia", other)]
    NoMedia,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    #[default]
    #[serde(alias = "off")]
    None,
    #[serde(alias = "one")]
    Song,
    #[serde(alias = "all")]
    Group,
}

impl RepeatMode {
    /// The mode the repeat button advances to.
    pub fn next(self) -> Self {
        match self {
            RepeatMode::None => RepeatMode::Song,
            RepeatMode::Song => RepeatMode::Group,
            RepeatMode::Group => RepeatMode::None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RepeatMode::None => "none",
            RepeatMode::Song => "song",
            RepeatMode::Group => "group",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct PlayerStatus {
    #[serde(default)]
    pub state: PlayerState,
    #[serde(default, alias = "source", skip_serializing_if = "Option::is_none")]
    pub current_source: Option<String>,
    #[serde(default, alias = "current_song", skip_serializing_if = "Option::is_none")]
    pub song_title: Option<String>,
    /// Elapsed seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_time: Option<u64>,
    #[serde(default)]
    pub repeat_mode: RepeatMode,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Source {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Song {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub title: String,
    /// Seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
}

/// `{ "sources": [...] }` or a bare array; both shapes are served.
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum SourcesResponse {
    Wrapped { sources: Vec<Source> },
    Bare(Vec<Source>),
}

impl SourcesResponse {
    pub fn into_vec(self) -> Vec<Source> {
        match self {
            SourcesResponse::Wrapped { sources } => sources,
            SourcesResponse::Bare(v) => v,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum SongsResponse {
    Wrapped { songs: Vec<Song> },
    Bare(Vec<Song>),
}

impl SongsResponse {
    pub fn into_vec(self) -> Vec<Song> {
        match self {
            SongsResponse::Wrapped { songs } => songs,
            SongsResponse::Bare(v) => v,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SeekRequest {
    pub time: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RepeatRequest {
    pub mode: RepeatMode,
}

// --- Recorder ---

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecorderState {
    Recording,
    Stopped,
    #[default]
    #[serde(rename = "nomedia", other)]
    NoMedia,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct RecorderStatus {
    #[serde(default)]
    pub state: RecorderState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_time: Option<u64>,
    #[serde(default, alias = "current_file", skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct StartRecordingRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

// --- System ---

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SystemStatus {
    #[serde(default)]
    pub preset: Option<CurrentPreset>,
    #[serde(default)]
    pub player: Option<PlayerStatus>,
    #[serde(default)]
    pub recorder: Option<RecorderStatus>,
    #[serde(default)]
    pub controls: HashMap<String, serde_json::Value>,
}

// --- Push channel ---

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CommandExecuted {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub username: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UserPresence {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    CommandExecuted(CommandExecuted),
    StatusUpdate { status: serde_json::Value },
    UserConnected(UserPresence),
    UserDisconnected(UserPresence),
    /// A `type` this client does not know; kept so consumers can log it.
    Unknown { kind: String },
}

impl PushEvent {
    pub fn kind(&self) -> &str {
        match self {
            PushEvent::CommandExecuted(_) => "command_executed",
            PushEvent::StatusUpdate { .. } => "status_update",
            PushEvent::UserConnected(_) => "user_connected",
            PushEvent::UserDisconnected(_) => "user_disconnected",
            PushEvent::Unknown { kind } => kind,
        }
    }
}

/// Inbound envelope `{type, timestamp, data}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(try_from = "RawEnvelope", into = "RawEnvelope")]
pub struct PushMessage {
    pub timestamp: String,
    pub event: PushEvent,
}

#[doc(hidden)]
#[derive(Serialize, Deserialize)]
pub struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct StatusData {
    #[serde(default)]
    status: serde_json::Value,
}

impl TryFrom<RawEnvelope> for PushMessage {
    type Error = serde_json::Error;

    fn try_from(raw: RawEnvelope) -> Result<Self, Self::Error> {
        let event = match raw.kind.as_str() {
            "command_executed" => PushEvent::CommandExecuted(serde_json::from_value(raw.data)?),
            "status_update" => {
                let data: StatusData = serde_json::from_value(raw.data)?;
                PushEvent::StatusUpdate { status: data.status }
            }
            "user_connected" => PushEvent::UserConnected(serde_json::from_value(raw.data)?),
            "user_disconnected" => PushEvent::UserDisconnected(serde_json::from_value(raw.data)?),
            _ => PushEvent::Unknown { kind: raw.kind },
        };
        Ok(PushMessage {
            timestamp: raw.timestamp,
            event,
        })
    }
}

impl From<PushMessage> for RawEnvelope {
    fn from(msg: PushMessage) -> Self {
        let kind = msg.event.kind().to_string();
        let data = match msg.event {
            PushEvent::CommandExecuted(c) => serde_json::to_value(c).unwrap_or_default(),
            PushEvent::StatusUpdate { status } => serde_json::json!({ "status": status }),
            PushEvent::UserConnected(u) | PushEvent::UserDisconnected(u) => {
                serde_json::to_value(u).unwrap_or_default()
            }
            PushEvent::Unknown { .. } => serde_json::Value::Null,
        };
        RawEnvelope {
            kind,
            timestamp: msg.timestamp,
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_envelope_decodes_each_kind() {
        let cmd: PushMessage = serde_json::from_str(
            r#"{"type":"command_executed","timestamp":"2026-01-11T10:00:00Z","data":{"user_id":"u1","username":"ops","command":"player.play"}}"#,
        )
        .unwrap();
        match cmd.event {
            PushEvent::CommandExecuted(c) => {
                assert_eq!(c.username, "ops");
                assert_eq!(c.command, "player.play");
            }
            other => panic!("expected command_executed, got {other:?}"),
        }

        let status: PushMessage = serde_json::from_str(
            r#"{"type":"status_update","timestamp":"t","data":{"status":{"player":{}}}}"#,
        )
        .unwrap();
        assert_eq!(status.event.kind(), "status_update");

        let joined: PushMessage = serde_json::from_str(
            r#"{"type":"user_connected","timestamp":"t","data":{"user_id":"u2","username":"anna"}}"#,
        )
        .unwrap();
        assert!(matches!(joined.event, PushEvent::UserConnected(ref u) if u.username == "anna"));

        let odd: PushMessage =
            serde_json::from_str(r#"{"type":"heartbeat","timestamp":"t"}"#).unwrap();
        assert_eq!(odd.event, PushEvent::Unknown { kind: "heartbeat".into() });
    }

    #[test]
    fn numeric_ids_become_strings() {
        let presets: PresetsResponse =
            serde_json::from_str(r#"{"presets":[{"id":1,"name":"Morning"},{"id":"p2","name":"Evening"}]}"#)
                .unwrap();
        assert_eq!(presets.presets[0].id, "1");
        assert_eq!(presets.presets[1].id, "p2");

        let current: CurrentPreset = serde_json::from_str(r#"{"preset_id":3,"name":"Mass"}"#).unwrap();
        assert_eq!(current.id.as_deref(), Some("3"));
    }

    #[test]
    fn player_status_accepts_backend_and_legacy_names() {
        let s: PlayerStatus = serde_json::from_str(
            r#"{"song_title":"Ave","state":"playing","current_time":12,"total_time":200,"repeat_mode":"group","source":"usb"}"#,
        )
        .unwrap();
        assert_eq!(s.state, PlayerState::Playing);
        assert_eq!(s.current_source.as_deref(), Some("usb"));
        assert_eq!(s.repeat_mode, RepeatMode::Group);

        let legacy: PlayerStatus =
            serde_json::from_str(r#"{"state":"weird","repeat_mode":"one"}"#).unwrap();
        assert_eq!(legacy.state, PlayerState::NoMedia);
        assert_eq!(legacy.repeat_mode, RepeatMode::Song);
    }

    #[test]
    fn repeat_mode_cycles() {
        assert_eq!(RepeatMode::None.next(), RepeatMode::Song);
        assert_eq!(RepeatMode::Song.next(), RepeatMode::Group);
        assert_eq!(RepeatMode::Group.next(), RepeatMode::None);
    }

    #[test]
    fn control_reading_is_untagged() {
        let v: ControlValueResponse = serde_json::from_str(r#"{"id":"mic1","value":-12.5}"#).unwrap();
        assert_eq!(v.value.as_level(), Some(-12.5));
        let m: ControlValueResponse = serde_json::from_str(r#"{"id":"mic1m","value":true}"#).unwrap();
        assert_eq!(m.value.as_flag(), Some(true));
        assert_eq!(
            serde_json::to_string(&SetControlRequest { value: ControlReading::Level(40.0) }).unwrap(),
            r#"{"value":40.0}"#
        );
    }
}
