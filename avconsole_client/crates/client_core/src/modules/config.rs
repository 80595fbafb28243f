use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_API_PREFIX: &str = "/api";

/// How often each view re-reads backend state when nothing else invalidates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollIntervals {
    pub player_status: Duration,
    pub recorder_status: Duration,
    pub system_status: Duration,
    pub current_preset: Duration,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            player_status: Duration::from_secs(3),
            recorder_status: Duration::from_secs(2),
            system_status: Duration::from_secs(2),
            current_preset: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    pub api_prefix: String,
    pub state_path: PathBuf,
    pub query_retries: u32,
    pub http_timeout: Duration,
    pub polls: PollIntervals,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into().trim_end_matches('/').to_string(),
            api_prefix: DEFAULT_API_PREFIX.to_string(),
            state_path: default_state_path(),
            query_retries: 3,
            http_timeout: Duration::from_secs(30),
            polls: PollIntervals::default(),
        }
    }

    pub fn from_env() -> Self {
        let server = std::env::var("AVCONSOLE_SERVER_URL")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());
        let mut cfg = Self::new(server);

        if let Ok(prefix) = std::env::var("AVCONSOLE_API_PREFIX") {
            cfg.api_prefix = normalize_prefix(&prefix);
        }
        if let Some(path) = std::env::var_os("AVCONSOLE_STATE_FILE") {
            cfg.state_path = PathBuf::from(path);
        }
        if let Some(n) = env_u64("AVCONSOLE_QUERY_RETRIES") {
            cfg.query_retries = n.min(10) as u32;
        }
        if let Some(secs) = env_u64("AVCONSOLE_HTTP_TIMEOUT_SECS") {
            cfg.http_timeout = Duration::from_secs(secs.clamp(5, 120));
        }
        cfg
    }

    /// Absolute URL of a REST endpoint under the API prefix.
    pub fn api_url(&self, path: &str) -> String {
        format!("{}{}{}", self.server_url, self.api_prefix, path)
    }

    /// Absolute URL of an endpoint served at the server root (`/version`).
    pub fn root_url(&self, path: &str) -> String {
        format!("{}{}", self.server_url, path)
    }

    /// `ws(s)://host/ws?token=<bearer>`; `wss` iff the server is https.
    pub fn push_url(&self, token: &str) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&self.server_url)?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?;
        url.set_path("/ws");
        url.set_fragment(None);
        url.query_pairs_mut().clear().append_pair("token", token);
        Ok(url)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SERVER_URL)
    }
}

/// Copy of a push URL that is safe to log.
pub fn redact_token(url: &Url) -> String {
    let mut shown = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let v = if k == "token" { "***".to_string() } else { v.into_owned() };
            (k.into_owned(), v)
        })
        .collect();
    shown.query_pairs_mut().clear().extend_pairs(pairs);
    shown.to_string()
}

fn default_state_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("avconsole")
        .join("state.json")
}

fn normalize_prefix(raw: &str) -> String {
    let t = raw.trim().trim_end_matches('/');
    if t.is_empty() {
        String::new()
    } else if t.starts_with('/') {
        t.to_string()
    } else {
        format!("/{t}")
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<u64>().ok())
}
