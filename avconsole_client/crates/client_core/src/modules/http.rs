use crate::modules::protocol::ErrorResponse;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub bearer: Option<String>,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            bearer: None,
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: Option<serde_json::Value>) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            bearer: None,
            body,
        }
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self {
            method: Method::Delete,
            url: url.into(),
            bearer: None,
            body: None,
        }
    }

    pub fn with_bearer(mut self, token: Option<String>) -> Self {
        self.bearer = token;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("connection failed: {0}")]
    Connect(String),
}

/// Failure taxonomy surfaced to callers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("session expired, sign in again")]
    SessionExpired,
    #[error("request still unauthorized after token refresh")]
    Unauthorized,
    #[error("backend returned {status}: {message} ({code})")]
    Status {
        status: u16,
        code: String,
        message: String,
    },
    #[error("response decode failed: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ApiError {
    /// Network-level or server-side failures the query layer may retry.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Transport(_) => true,
            ApiError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub(crate) fn from_response(resp: &ApiResponse) -> Self {
        let body: ErrorResponse = resp.json().unwrap_or_default();
        let message = if body.error.is_empty() {
            String::from_utf8_lossy(&resp.body).trim().to_string()
        } else {
            body.error
        };
        ApiError::Status {
            status: resp.status,
            code: body.error_code,
            message,
        }
    }
}

pub(crate) fn ensure_success(resp: ApiResponse) -> Result<ApiResponse, ApiError> {
    if resp.is_success() {
        Ok(resp)
    } else {
        Err(ApiError::from_response(&resp))
    }
}

/// The seam between the client and the network.
pub trait HttpTransport: Send + Sync + 'static {
    fn send(
        &self,
        req: ApiRequest,
    ) -> impl Future<Output = Result<ApiResponse, TransportError>> + Send;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

impl HttpTransport for ReqwestTransport {
    async fn send(&self, req: ApiRequest) -> Result<ApiResponse, TransportError> {
        let mut builder = match req.method {
            Method::Get => self.client.get(&req.url),
            Method::Post => self.client.post(&req.url),
            Method::Delete => self.client.delete(&req.url),
        };
        if let Some(token) = req.bearer.as_deref() {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = req.body.as_ref() {
            builder = builder.json(body);
        } else if req.method == Method::Post {
            builder = builder.json(&serde_json::json!({}));
        }

        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await?.to_vec();
        Ok(ApiResponse { status, body })
    }
}
