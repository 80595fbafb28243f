//! Session and bearer-token lifecycle.
//!
//! Every authenticated request goes through [`SessionManager::execute`], which
//! attaches the access token and, on a 401, performs at most one refresh
//! before replaying the request exactly once. Refreshes are single-flight: a
//! caller that loses the race replays with the token the winner stored.

use crate::modules::http::{ensure_success, ApiError, ApiRequest, ApiResponse, HttpTransport};
use crate::modules::protocol::{LoginRequest, LoginResponse, RefreshRequest, RefreshResponse, User};
use crate::modules::store::{keys, KeyValueStore};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    SignedOut,
    SignedIn(User),
    /// The refresh token was rejected; the front end must return to its login view.
    Expired,
}

impl SessionState {
    pub fn user(&self) -> Option<&User> {
        match self {
            SessionState::SignedIn(u) => Some(u),
            _ => None,
        }
    }
}

/// What the push channel needs to know about the session.
pub trait SessionSource: Send + Sync {
    fn access_token(&self) -> Option<String>;
    fn has_session(&self) -> bool;
    /// Sign-in, sign-out and expiry; the push channel starts and stops with them.
    fn session_changes(&self) -> watch::Receiver<SessionState>;
}

#[derive(Default)]
struct Tokens {
    access: Option<Zeroizing<String>>,
    refresh: Option<Zeroizing<String>>,
}

pub struct SessionManager<T: HttpTransport> {
    transport: T,
    store: Arc<dyn KeyValueStore>,
    api_base: String,
    tokens: Mutex<Tokens>,
    refresh_gate: tokio::sync::Mutex<()>,
    state: watch::Sender<SessionState>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: HttpTransport> SessionManager<T> {
    /// `api_base` is the REST root, e.g. `http://host:8000/api`.
    pub fn new(transport: T, store: Arc<dyn KeyValueStore>, api_base: impl Into<String>) -> Self {
        let tokens = Tokens {
            access: store.get(keys::ACCESS_TOKEN).map(Zeroizing::new),
            refresh: store.get(keys::REFRESH_TOKEN).map(Zeroizing::new),
        };
        let (state, _) = watch::channel(SessionState::SignedOut);
        Self {
            transport,
            store,
            api_base: api_base.into(),
            tokens: Mutex::new(tokens),
            refresh_gate: tokio::sync::Mutex::new(()),
            state,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn current_user(&self) -> Option<User> {
        self.state.borrow().user().cloned()
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(*self.state.borrow(), SessionState::SignedIn(_))
    }

    pub fn access_token(&self) -> Option<String> {
        lock(&self.tokens).access.as_ref().map(|t| t.to_string())
    }

    fn refresh_token(&self) -> Option<String> {
        lock(&self.tokens).refresh.as_ref().map(|t| t.to_string())
    }

    fn store_tokens(&self, access: &str, refresh: Option<&str>) {
        {
            let mut tokens = lock(&self.tokens);
            tokens.access = Some(Zeroizing::new(access.to_string()));
            if let Some(r) = refresh {
                tokens.refresh = Some(Zeroizing::new(r.to_string()));
            }
        }
        if let Err(e) = self.store.set(keys::ACCESS_TOKEN, access) {
            warn!("could not persist access token: {e}");
        }
        if let Some(r) = refresh {
            if let Err(e) = self.store.set(keys::REFRESH_TOKEN, r) {
                warn!("could not persist refresh token: {e}");
            }
        }
    }

    fn clear_tokens(&self) {
        *lock(&self.tokens) = Tokens::default();
        for key in [keys::ACCESS_TOKEN, keys::REFRESH_TOKEN] {
            if let Err(e) = self.store.remove(key) {
                warn!("could not clear {key}: {e}");
            }
        }
    }

    /// Bad credentials are reported as [`ApiError::InvalidCredentials`] and
    /// never trigger a token refresh.
    pub async fn login(&self, username: &str, password: &str) -> Result<User, ApiError> {
        let body = serde_json::to_value(LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        })?;
        let resp = self
            .transport
            .send(ApiRequest::post(self.url("/auth/login"), Some(body)))
            .await?;
        if resp.status == 401 {
            return Err(ApiError::InvalidCredentials);
        }
        let login: LoginResponse = ensure_success(resp)?.json()?;

        self.store_tokens(&login.access_token, Some(&login.refresh_token));
        info!(user = %login.user.username, "signed in");
        self.state.send_replace(SessionState::SignedIn(login.user.clone()));
        Ok(login.user)
    }

    /// Re-validates a persisted session with `GET /auth/me`. Any failure
    /// discards the stored tokens.
    pub async fn restore(&self) -> Option<User> {
        self.access_token()?;
        match self.execute(ApiRequest::get(self.url("/auth/me"))).await {
            Ok(resp) => match resp.json::<User>() {
                Ok(user) => {
                    info!(user = %user.username, "session restored");
                    self.state.send_replace(SessionState::SignedIn(user.clone()));
                    Some(user)
                }
                Err(e) => {
                    warn!("session check returned an unreadable user: {e}");
                    self.sign_out_local();
                    None
                }
            },
            Err(e) => {
                warn!("session verification failed: {e}");
                self.sign_out_local();
                None
            }
        }
    }

    /// Tells the backend (best effort) and forgets the session locally.
    pub async fn logout(&self) {
        if let Some(token) = self.access_token() {
            let req = ApiRequest::post(self.url("/auth/logout"), None).with_bearer(Some(token));
            match self.transport.send(req).await {
                Ok(resp) if !resp.is_success() => debug!(status = resp.status, "logout rejected"),
                Ok(_) => {}
                Err(e) => debug!("logout call failed: {e}"),
            }
        }
        self.sign_out_local();
        info!("signed out");
    }

    fn sign_out_local(&self) {
        self.clear_tokens();
        self.state.send_replace(SessionState::SignedOut);
    }

    fn expire(&self) {
        self.clear_tokens();
        self.state.send_replace(SessionState::Expired);
    }

    /// Sends `request` with the current bearer token and returns the 2xx
    /// response.
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let sent_with = self.access_token();
        let resp = self
            .transport
            .send(request.clone().with_bearer(sent_with.clone()))
            .await?;
        if resp.status != 401 {
            return ensure_success(resp);
        }

        debug!(url = %request.url, "401, refreshing access token");
        let token = self.refresh_after_unauthorized(sent_with.as_deref()).await?;

        // The replay is already a retry; a second 401 is final.
        let replay = self.transport.send(request.with_bearer(Some(token))).await?;
        if replay.status == 401 {
            warn!("request rejected again after refresh");
            return Err(ApiError::Unauthorized);
        }
        ensure_success(replay)
    }

    async fn refresh_after_unauthorized(&self, rejected: Option<&str>) -> Result<String, ApiError> {
        let _gate = self.refresh_gate.lock().await;

        if let Some(current) = self.access_token() {
            if rejected != Some(current.as_str()) {
                return Ok(current);
            }
        }

        let Some(refresh_token) = self.refresh_token() else {
            warn!("no refresh token available");
            self.expire();
            return Err(ApiError::SessionExpired);
        };

        let body = serde_json::to_value(RefreshRequest { refresh_token })?;
        let outcome = self
            .transport
            .send(ApiRequest::post(self.url("/auth/refresh"), Some(body)))
            .await;

        let refreshed = match outcome {
            Ok(resp) if resp.is_success() => resp.json::<RefreshResponse>().ok(),
            Ok(resp) => {
                warn!(status = resp.status, "token refresh rejected");
                None
            }
            Err(e) => {
                warn!("token refresh failed: {e}");
                None
            }
        };

        match refreshed {
            Some(r) => {
                self.store_tokens(&r.access_token, r.refresh_token.as_deref());
                info!("access token refreshed");
                Ok(r.access_token)
            }
            None => {
                self.expire();
                Err(ApiError::SessionExpired)
            }
        }
    }
}

impl<T: HttpTransport> SessionSource for SessionManager<T> {
    fn access_token(&self) -> Option<String> {
        SessionManager::access_token(self)
    }

    fn has_session(&self) -> bool {
        self.is_authenticated()
    }

    fn session_changes(&self) -> watch::Receiver<SessionState> {
        self.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::http::Method;
    use crate::modules::store::MemoryStore;
    use crate::modules::testing::{json, ok, path, unauthorized, FakeTransport, BASE};
    use serde_json::json as j;

    fn manager(transport: FakeTransport, store: Arc<MemoryStore>) -> SessionManager<FakeTransport> {
        SessionManager::new(transport, store, format!("{BASE}/api"))
    }

    fn user_json() -> serde_json::Value {
        j!({ "id": "u1", "username": "ops", "role": "admin", "name": "Ops", "email": "ops@example.org" })
    }

    fn seeded_store(access: &str, refresh: Option<&str>) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.set(keys::ACCESS_TOKEN, access).unwrap();
        if let Some(r) = refresh {
            store.set(keys::REFRESH_TOKEN, r).unwrap();
        }
        store
    }

    #[tokio::test]
    async fn login_persists_tokens_and_signs_in() {
        let transport = FakeTransport::new(|req| match path(req) {
            "/auth/login" => json(
                200,
                j!({ "access_token": "A1", "refresh_token": "R1", "expires_in": 900, "user": user_json() }),
            ),
            _ => ok(),
        });
        let store = Arc::new(MemoryStore::new());
        let session = manager(transport, store.clone());

        let user = session.login("ops", "secret").await.unwrap();
        assert_eq!(user.username, "ops");
        assert!(session.is_authenticated());
        assert_eq!(store.get(keys::ACCESS_TOKEN).as_deref(), Some("A1"));
        assert_eq!(store.get(keys::REFRESH_TOKEN).as_deref(), Some("R1"));
    }

    #[tokio::test]
    async fn bad_credentials_do_not_refresh() {
        let transport = FakeTransport::new(|_| unauthorized());
        let session = manager(transport.clone(), Arc::new(MemoryStore::new()));

        let err = session.login("ops", "wrong").await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidCredentials));
        assert_eq!(transport.count(Method::Post, "/auth/refresh"), 0);
        assert_eq!(session.state(), SessionState::SignedOut);
    }

    #[tokio::test]
    async fn single_refresh_then_replay_with_new_token() {
        let transport = FakeTransport::new(|req| match (path(req), req.bearer.as_deref()) {
            ("/auth/refresh", _) => json(200, j!({ "access_token": "NEW" })),
            ("/device/status", Some("NEW")) => json(200, j!({ "controls": {} })),
            ("/device/status", _) => unauthorized(),
            _ => ok(),
        });
        let store = seeded_store("OLD", Some("R1"));
        let session = manager(transport.clone(), store.clone());

        let resp = session
            .execute(ApiRequest::get(format!("{BASE}/api/device/status")))
            .await
            .unwrap();
        assert!(resp.is_success());

        assert_eq!(transport.count(Method::Post, "/auth/refresh"), 1);
        let status_calls: Vec<_> = transport
            .requests()
            .into_iter()
            .filter(|r| path(r) == "/device/status")
            .collect();
        assert_eq!(status_calls.len(), 2);
        assert_eq!(status_calls[0].bearer.as_deref(), Some("OLD"));
        assert_eq!(status_calls[1].bearer.as_deref(), Some("NEW"));
        assert_eq!(store.get(keys::ACCESS_TOKEN).as_deref(), Some("NEW"));

        let refresh = transport
            .requests()
            .into_iter()
            .find(|r| path(r) == "/auth/refresh")
            .unwrap();
        assert_eq!(refresh.bearer, None);
        assert_eq!(refresh.body, Some(j!({ "refresh_token": "R1" })));
    }

    #[tokio::test]
    async fn second_401_after_replay_is_final() {
        let transport = FakeTransport::new(|req| match path(req) {
            "/auth/refresh" => json(200, j!({ "access_token": "NEW" })),
            _ => unauthorized(),
        });
        let session = manager(transport.clone(), seeded_store("OLD", Some("R1")));

        let err = session
            .execute(ApiRequest::get(format!("{BASE}/api/users")))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized));
        assert_eq!(transport.count(Method::Post, "/auth/refresh"), 1);
        assert_eq!(transport.count(Method::Get, "/users"), 2);
    }

    #[tokio::test]
    async fn failed_refresh_expires_session() {
        let transport = FakeTransport::new(|req| match path(req) {
            "/auth/refresh" => json(401, j!({ "success": false, "error": "expired" })),
            _ => unauthorized(),
        });
        let store = seeded_store("OLD", Some("R1"));
        let session = manager(transport.clone(), store.clone());
        let mut state = session.subscribe();

        let err = session
            .execute(ApiRequest::get(format!("{BASE}/api/device/presets")))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::SessionExpired));
        assert_eq!(store.get(keys::ACCESS_TOKEN), None);
        assert_eq!(store.get(keys::REFRESH_TOKEN), None);
        assert!(state.has_changed().unwrap());
        assert_eq!(*state.borrow_and_update(), SessionState::Expired);
        assert_eq!(transport.count(Method::Get, "/device/presets"), 1);
    }

    #[tokio::test]
    async fn missing_refresh_token_counts_as_failure() {
        let transport = FakeTransport::new(|_| unauthorized());
        let session = manager(transport.clone(), seeded_store("OLD", None));

        let err = session
            .execute(ApiRequest::get(format!("{BASE}/api/device/status")))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::SessionExpired));
        assert_eq!(transport.count(Method::Post, "/auth/refresh"), 0);
    }

    #[tokio::test]
    async fn concurrent_401s_share_one_refresh() {
        let transport = FakeTransport::new(|req| match (path(req), req.bearer.as_deref()) {
            ("/auth/refresh", _) => json(200, j!({ "access_token": "NEW" })),
            (_, Some("NEW")) => ok(),
            _ => unauthorized(),
        });
        let session = Arc::new(manager(transport.clone(), seeded_store("OLD", Some("R1"))));

        let a = {
            let s = session.clone();
            tokio::spawn(async move { s.execute(ApiRequest::post(format!("{BASE}/api/device/player/play"), None)).await })
        };
        let b = {
            let s = session.clone();
            tokio::spawn(async move { s.execute(ApiRequest::post(format!("{BASE}/api/device/player/stop"), None)).await })
        };
        assert!(a.await.unwrap().is_ok());
        assert!(b.await.unwrap().is_ok());
        assert_eq!(transport.count(Method::Post, "/auth/refresh"), 1);
    }

    #[tokio::test]
    async fn restore_and_logout() {
        let transport = FakeTransport::new(|req| match path(req) {
            "/auth/me" => json(200, user_json()),
            _ => ok(),
        });
        let store = seeded_store("A1", Some("R1"));
        let session = manager(transport.clone(), store.clone());

        let user = session.restore().await.unwrap();
        assert_eq!(user.id, "u1");
        assert!(session.is_authenticated());

        session.logout().await;
        assert_eq!(session.state(), SessionState::SignedOut);
        assert_eq!(store.get(keys::ACCESS_TOKEN), None);
        let logout = transport
            .requests()
            .into_iter()
            .find(|r| path(r) == "/auth/logout")
            .unwrap();
        assert_eq!(logout.bearer.as_deref(), Some("A1"));
    }

    #[tokio::test]
    async fn restore_without_token_is_a_no_op() {
        let transport = FakeTransport::new(|_| ok());
        let session = manager(transport.clone(), Arc::new(MemoryStore::new()));
        assert!(session.restore().await.is_none());
        assert!(transport.requests().is_empty());
    }
}
