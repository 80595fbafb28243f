use crate::modules::config::ClientConfig;
use crate::modules::http::{ApiError, ApiRequest, ApiResponse, HttpTransport};
use crate::modules::protocol::*;
use crate::modules::session::SessionManager;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// Typed wrappers over the device-control REST surface. Every call goes
/// through the session so it gets the bearer and refresh handling.
pub struct DeviceApi<T: HttpTransport> {
    session: Arc<SessionManager<T>>,
    config: ClientConfig,
}

impl<T: HttpTransport> Clone for DeviceApi<T> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            config: self.config.clone(),
        }
    }
}

fn body<B: Serialize>(b: &B) -> Result<Option<serde_json::Value>, ApiError> {
    Ok(Some(serde_json::to_value(b)?))
}

fn decode<R: DeserializeOwned>(resp: ApiResponse) -> Result<R, ApiError> {
    Ok(resp.json()?)
}

impl<T: HttpTransport> DeviceApi<T> {
    pub fn new(session: Arc<SessionManager<T>>, config: ClientConfig) -> Self {
        Self { session, config }
    }

    pub fn session(&self) -> &Arc<SessionManager<T>> {
        &self.session
    }

    async fn get<R: DeserializeOwned>(&self, path: &str) -> Result<R, ApiError> {
        let resp = self
            .session
            .execute(ApiRequest::get(self.config.api_url(path)))
            .await?;
        decode(resp)
    }

    async fn post(&self, path: &str, payload: Option<serde_json::Value>) -> Result<ApiResponse, ApiError> {
        self.session
            .execute(ApiRequest::post(self.config.api_url(path), payload))
            .await
    }

    // --- auth & meta ---

    pub async fn me(&self) -> Result<User, ApiError> {
        self.get("/auth/me").await
    }

    /// Served outside the API prefix.
    pub async fn version(&self) -> Result<VersionInfo, ApiError> {
        let resp = self
            .session
            .execute(ApiRequest::get(self.config.root_url("/version")))
            .await?;
        decode(resp)
    }

    pub async fn system_status(&self) -> Result<SystemStatus, ApiError> {
        self.get("/device/status").await
    }

    // --- presets ---

    pub async fn presets(&self) -> Result<Vec<Preset>, ApiError> {
        let r: PresetsResponse = self.get("/device/presets").await?;
        Ok(r.presets)
    }

    pub async fn current_preset(&self) -> Result<CurrentPreset, ApiError> {
        self.get("/device/presets/current").await
    }

    pub async fn load_preset(&self, id: &str) -> Result<(), ApiError> {
        self.post("/device/presets/load", body(&IdRequest { id: id.to_string() })?)
            .await?;
        Ok(())
    }

    // --- controls ---

    pub async fn controls(&self) -> Result<Vec<Control>, ApiError> {
        let r: ControlsResponse = self.get("/device/controls").await?;
        Ok(r.controls)
    }

    pub async fn volume(&self, id: &str) -> Result<ControlValueResponse, ApiError> {
        self.get(&format!("/device/controls/volume/{id}")).await
    }

    /// `id` is the mute companion id (`secondId`).
    pub async fn mute(&self, id: &str) -> Result<ControlValueResponse, ApiError> {
        self.get(&format!("/device/controls/mute/{id}")).await
    }

    pub async fn set_control(&self, id: &str, value: ControlReading) -> Result<(), ApiError> {
        self.post(&format!("/device/controls/{id}"), body(&SetControlRequest { value })?)
            .await?;
        Ok(())
    }

    // --- player ---

    pub async fn sources(&self) -> Result<Vec<Source>, ApiError> {
        let r: SourcesResponse = self.get("/device/player/sources").await?;
        Ok(r.into_vec())
    }

    pub async fn songs(&self) -> Result<Vec<Song>, ApiError> {
        let r: SongsResponse = self.get("/device/player/songs").await?;
        Ok(r.into_vec())
    }

    pub async fn player_status(&self) -> Result<PlayerStatus, ApiError> {
        self.get("/device/player/status").await
    }

    pub async fn select_source(&self, id: &str) -> Result<(), ApiError> {
        self.post("/device/player/source", body(&IdRequest { id: id.to_string() })?)
            .await?;
        Ok(())
    }

    pub async fn select_song(&self, id: &str) -> Result<(), ApiError> {
        self.post("/device/player/song", body(&IdRequest { id: id.to_string() })?)
            .await?;
        Ok(())
    }

    pub async fn play(&self) -> Result<(), ApiError> {
        self.post("/device/player/play", None).await.map(drop)
    }

    pub async fn pause(&self) -> Result<(), ApiError> {
        self.post("/device/player/pause", None).await.map(drop)
    }

    pub async fn stop(&self) -> Result<(), ApiError> {
        self.post("/device/player/stop", None).await.map(drop)
    }

    pub async fn next(&self) -> Result<(), ApiError> {
        self.post("/device/player/next", None).await.map(drop)
    }

    pub async fn previous(&self) -> Result<(), ApiError> {
        self.post("/device/player/previous", None).await.map(drop)
    }

    pub async fn seek(&self, time: u64) -> Result<(), ApiError> {
        self.post("/device/player/seek", body(&SeekRequest { time })?)
            .await
            .map(drop)
    }

    pub async fn set_repeat(&self, mode: RepeatMode) -> Result<(), ApiError> {
        self.post("/device/player/repeat", body(&RepeatRequest { mode })?)
            .await
            .map(drop)
    }

    // --- recorder ---

    pub async fn recorder_status(&self) -> Result<RecorderStatus, ApiError> {
        self.get("/device/recorder/status").await
    }

    pub async fn start_recording(&self, filename: Option<String>) -> Result<(), ApiError> {
        self.post("/device/recorder/start", body(&StartRecordingRequest { filename })?)
            .await
            .map(drop)
    }

    pub async fn stop_recording(&self) -> Result<(), ApiError> {
        self.post("/device/recorder/stop", None).await.map(drop)
    }

    // --- users ---

    pub async fn users(&self) -> Result<Vec<User>, ApiError> {
        self.get("/users").await
    }

    pub async fn create_user(&self, req: &CreateUserRequest) -> Result<(), ApiError> {
        self.post("/users", body(req)?).await.map(drop)
    }

    pub async fn delete_user(&self, id: &str) -> Result<(), ApiError> {
        self.session
            .execute(ApiRequest::delete(self.config.api_url(&format!("/users/{id}"))))
            .await
            .map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::http::Method;
    use crate::modules::store::{keys, KeyValueStore, MemoryStore};
    use crate::modules::testing::{json, ok, path, FakeTransport, BASE};
    use serde_json::json as j;

    fn api(transport: FakeTransport) -> DeviceApi<FakeTransport> {
        let store = Arc::new(MemoryStore::new());
        store.set(keys::ACCESS_TOKEN, "tok").unwrap();
        let config = ClientConfig::new(BASE);
        let session = Arc::new(SessionManager::new(transport, store, config.api_url("")));
        DeviceApi::new(session, config)
    }

    #[tokio::test]
    async fn typed_reads_decode_backend_shapes() {
        let transport = FakeTransport::new(|req| match path(req) {
            "/device/presets" => json(200, j!({ "presets": [{ "id": "p1", "name": "Morning" }, { "id": 2, "name": "Evening" }] })),
            "/device/player/sources" => json(200, j!([{ "id": 1, "name": "USB", "type": "usb" }])),
            "/device/player/songs" => json(200, j!({ "songs": [{ "id": "s1", "title": "Ave", "duration": 180 }] })),
            "/device/controls/mute/mic1m" => json(200, j!({ "id": "mic1m", "value": true })),
            "/version" => json(200, j!({ "version": "1.4.0", "build_date": "2026-01-01" })),
            "/users" => json(200, j!([{ "id": 7, "username": "anna", "role": "operator", "full_name": "Anna" }])),
            _ => ok(),
        });
        let api = api(transport.clone());

        let presets = api.presets().await.unwrap();
        assert_eq!(presets[1].id, "2");
        assert_eq!(api.sources().await.unwrap()[0].kind, "usb");
        assert_eq!(api.songs().await.unwrap()[0].duration, Some(180));
        assert_eq!(api.mute("mic1m").await.unwrap().value, ControlReading::Flag(true));
        assert_eq!(api.version().await.unwrap().version, "1.4.0");
        let users = api.users().await.unwrap();
        assert_eq!(users[0].id, "7");
        assert_eq!(users[0].name, "Anna");

        assert!(transport.requests().iter().all(|r| r.bearer.as_deref() == Some("tok")));
        let version = transport.requests().into_iter().find(|r| r.url.ends_with("/version")).unwrap();
        assert_eq!(version.url, format!("{BASE}/version"));
    }

    #[tokio::test]
    async fn mutations_send_expected_bodies() {
        let transport = FakeTransport::new(|_| ok());
        let api = api(transport.clone());

        api.set_control("mic1", ControlReading::Level(-6.0)).await.unwrap();
        api.seek(42).await.unwrap();
        api.set_repeat(RepeatMode::Group).await.unwrap();
        api.start_recording(None).await.unwrap();
        api.delete_user("9").await.unwrap();

        let reqs = transport.requests();
        let by_path = |p: &str| reqs.iter().find(|r| path(r) == p).unwrap().clone();
        assert_eq!(by_path("/device/controls/mic1").body, Some(j!({ "value": -6.0 })));
        assert_eq!(by_path("/device/player/seek").body, Some(j!({ "time": 42 })));
        assert_eq!(by_path("/device/player/repeat").body, Some(j!({ "mode": "group" })));
        assert_eq!(by_path("/device/recorder/start").body, Some(j!({})));
        assert_eq!(transport.count(Method::Delete, "/users/9"), 1);
    }

    #[tokio::test]
    async fn backend_error_is_typed() {
        let transport = FakeTransport::new(|_| {
            json(403, j!({ "success": false, "error": "admin only", "error_code": "FORBIDDEN" }))
        });
        let err = api(transport).users().await.unwrap_err();
        assert!(matches!(err, ApiError::Status { status: 403, ref code, .. } if code == "FORBIDDEN"));
    }
}
