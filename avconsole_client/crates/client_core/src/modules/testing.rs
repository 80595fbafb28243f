use crate::modules::http::{ApiRequest, ApiResponse, HttpTransport, Method, TransportError};
use std::sync::{Arc, Mutex};

type Handler = dyn Fn(&ApiRequest) -> Result<ApiResponse, TransportError> + Send + Sync;

/// Records every request and answers with a caller-supplied handler.
#[derive(Clone)]
pub struct FakeTransport {
    handler: Arc<Handler>,
    log: Arc<Mutex<Vec<ApiRequest>>>,
    stalled: Arc<Mutex<Vec<String>>>,
}

impl FakeTransport {
    pub fn new(
        handler: impl Fn(&ApiRequest) -> Result<ApiResponse, TransportError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Arc::new(handler),
            log: Arc::new(Mutex::new(Vec::new())),
            stalled: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Requests whose URL ends with `path_suffix` are recorded and never answered.
    pub fn stall(&self, path_suffix: &str) {
        self.stalled.lock().unwrap().push(path_suffix.to_string());
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, method: Method, path_suffix: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.method == method && r.url.ends_with(path_suffix))
            .count()
    }
}

impl HttpTransport for FakeTransport {
    async fn send(&self, req: ApiRequest) -> Result<ApiResponse, TransportError> {
        self.log.lock().unwrap().push(req.clone());
        let stalled = self
            .stalled
            .lock()
            .unwrap()
            .iter()
            .any(|suffix| req.url.ends_with(suffix.as_str()));
        if stalled {
            std::future::pending::<()>().await;
        }
        (self.handler)(&req)
    }
}

pub fn json(status: u16, body: serde_json::Value) -> Result<ApiResponse, TransportError> {
    Ok(ApiResponse {
        status,
        body: serde_json::to_vec(&body).unwrap(),
    })
}

pub fn ok() -> Result<ApiResponse, TransportError> {
    json(200, serde_json::json!({ "success": true }))
}

pub fn unauthorized() -> Result<ApiResponse, TransportError> {
    json(
        401,
        serde_json::json!({ "success": false, "error": "token expired", "error_code": "UNAUTHORIZED" }),
    )
}

/// Path of a request URL relative to the API prefix used in tests.
pub fn path(req: &ApiRequest) -> &str {
    req.url
        .strip_prefix(BASE)
        .map(|p| p.strip_prefix("/api").unwrap_or(p))
        .unwrap_or(&req.url)
}

pub const BASE: &str = "http://device.test";
