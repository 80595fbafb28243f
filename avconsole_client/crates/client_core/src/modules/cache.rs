//! Process-wide cache of backend reads, keyed hierarchically.
//!
//! Entries are never evicted by time; they go stale through `invalidate` (push
//! events, mutations) and are re-read by whoever next asks for them. Each key
//! carries a generation so a fetch started before `cancel` cannot land on top
//! of a newer optimistic write.

use crate::modules::backoff::Backoff;
use crate::modules::http::ApiError;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl<const N: usize> From<[&str; N]> for QueryKey {
    fn from(segments: [&str; N]) -> Self {
        QueryKey::new(segments)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

/// Keys used across the client.
pub mod keys {
    use super::QueryKey;

    pub fn controls() -> QueryKey {
        QueryKey::from(["controls"])
    }
    pub fn control_values() -> QueryKey {
        QueryKey::from(["controls", "values"])
    }
    pub fn presets() -> QueryKey {
        QueryKey::from(["presets"])
    }
    pub fn current_preset() -> QueryKey {
        QueryKey::from(["presets", "current"])
    }
    pub fn player() -> QueryKey {
        QueryKey::from(["player"])
    }
    pub fn player_status() -> QueryKey {
        QueryKey::from(["player", "status"])
    }
    pub fn player_sources() -> QueryKey {
        QueryKey::from(["player", "sources"])
    }
    pub fn player_songs() -> QueryKey {
        QueryKey::from(["player", "songs"])
    }
    pub fn recorder_status() -> QueryKey {
        QueryKey::from(["recorder", "status"])
    }
    pub fn system_status() -> QueryKey {
        QueryKey::from(["system", "status"])
    }
    pub fn users() -> QueryKey {
        QueryKey::from(["users"])
    }
    pub fn version() -> QueryKey {
        QueryKey::from(["version"])
    }
}

#[derive(Default)]
struct Entry {
    value: Option<Arc<dyn Any + Send + Sync>>,
    stale: bool,
    generation: u64,
    updated_at: Option<Instant>,
}

/// Proof that a fetch started at a given generation.
#[derive(Debug, Clone)]
pub struct FetchToken {
    key: QueryKey,
    generation: u64,
}

pub struct QueryCache {
    entries: Mutex<HashMap<QueryKey, Entry>>,
    retries: u32,
}

impl QueryCache {
    pub fn new(retries: u32) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            retries,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<QueryKey, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get<V: Clone + Send + Sync + 'static>(&self, key: &QueryKey) -> Option<V> {
        let entries = self.entries();
        let value = entries.get(key)?.value.as_ref()?;
        value.downcast_ref::<V>().cloned()
    }

    /// Writes a value and marks it fresh. Does not touch the generation; call
    /// [`QueryCache::cancel`] first when racing an in-flight read.
    pub fn set<V: Send + Sync + 'static>(&self, key: &QueryKey, value: V) {
        let mut entries = self.entries();
        let entry = entries.entry(key.clone()).or_default();
        entry.value = Some(Arc::new(value));
        entry.stale = false;
        entry.updated_at = Some(Instant::now());
    }

    /// Missing entries count as stale.
    pub fn is_stale(&self, key: &QueryKey) -> bool {
        self.entries()
            .get(key)
            .map(|e| e.stale || e.value.is_none())
            .unwrap_or(true)
    }

    pub fn updated_at(&self, key: &QueryKey) -> Option<Instant> {
        self.entries().get(key).and_then(|e| e.updated_at)
    }

    /// Marks every entry under `prefix` stale. Returns how many were hit.
    pub fn invalidate(&self, prefix: &QueryKey) -> usize {
        let mut hit = 0;
        for (key, entry) in self.entries().iter_mut() {
            if key.starts_with(prefix) {
                entry.stale = true;
                hit += 1;
            }
        }
        debug!(prefix = %prefix, hit, "invalidated");
        hit
    }

    /// Supersedes every fetch under `prefix` that is still in flight.
    pub fn cancel(&self, prefix: &QueryKey) {
        for (key, entry) in self.entries().iter_mut() {
            if key.starts_with(prefix) {
                entry.generation += 1;
            }
        }
    }

    pub fn begin_fetch(&self, key: &QueryKey) -> FetchToken {
        let mut entries = self.entries();
        let entry = entries.entry(key.clone()).or_default();
        FetchToken {
            key: key.clone(),
            generation: entry.generation,
        }
    }

    /// Stores a fetched value unless the key was cancelled since `token` was
    /// taken. Returns whether the value landed.
    pub fn complete_fetch<V: Send + Sync + 'static>(&self, token: &FetchToken, value: V) -> bool {
        let mut entries = self.entries();
        let entry = entries.entry(token.key.clone()).or_default();
        if entry.generation != token.generation {
            debug!(key = %token.key, "dropping superseded fetch result");
            return false;
        }
        entry.value = Some(Arc::new(value));
        entry.stale = false;
        entry.updated_at = Some(Instant::now());
        true
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    /// Runs `fetch`, retrying transient failures with capped exponential
    /// backoff. On final failure the previous value stays in place.
    pub async fn fetch_with_retry<V, F, Fut>(&self, key: &QueryKey, mut fetch: F) -> Result<V, ApiError>
    where
        V: Clone + Send + Sync + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<V, ApiError>>,
    {
        let token = self.begin_fetch(key);
        let mut backoff = Backoff::new(self.retries);
        loop {
            let err = match fetch().await {
                Ok(value) => {
                    self.complete_fetch(&token, value.clone());
                    return Ok(value);
                }
                Err(e) => e,
            };
            match backoff.next_delay().filter(|_| err.is_transient()) {
                Some(delay) => {
                    debug!(key = %key, attempt = backoff.attempts(), ?delay, "query failed, retrying: {err}");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!(key = %key, "query failed: {err}");
                    return Err(err);
                }
            }
        }
    }

    /// Cached value when fresh, otherwise a fetch.
    pub async fn query<V, F, Fut>(&self, key: &QueryKey, fetch: F) -> Result<V, ApiError>
    where
        V: Clone + Send + Sync + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<V, ApiError>>,
    {
        if !self.is_stale(key) {
            if let Some(v) = self.get::<V>(key) {
                return Ok(v);
            }
        }
        self.fetch_with_retry(key, fetch).await
    }
}
