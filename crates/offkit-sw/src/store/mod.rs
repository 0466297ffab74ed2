//! Versioned response caches.
//!
//! ```text
//! CacheBackend (storage engine: memory, sqlite, ...)
//!     └── cache "offkit-cache-v2"   <- active, owned by a StoreManager
//!     │       └── RequestKey → StoredResponse
//!     └── cache "offkit-cache-v1"   <- stale, removed at activation
//! ```

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::try_join_all;
use http::header::VARY;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use offkit_net::Response;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::{CacheError, RequestKey};

mod memory;
mod sqlite;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

// ==================== Stored Response ====================

/// Snapshot of a response as written to a cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResponse {
    /// Final response URL, if the response came from the network.
    pub url: Option<String>,

    pub status: u16,

    /// Header pairs in the order they were received, values as raw bytes.
    pub headers: Vec<(String, Vec<u8>)>,

    pub body: Bytes,

    /// Request header values for each name the response lists in `Vary`,
    /// as sent by the request that produced it. `None` means absent.
    #[serde(default)]
    pub vary: Vec<(String, Option<Vec<u8>>)>,

    /// Stored at timestamp (ms since epoch).
    pub stored_at_ms: u64,
}

impl StoredResponse {
    /// Snapshot a response fetched by a request carrying `request_headers`.
    pub fn capture(request_headers: &HeaderMap, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
            .collect();

        let vary = vary_names(response.headers.get_all(VARY).iter().map(|v| v.as_bytes()))
            .into_iter()
            .filter(|name| name != "*")
            .map(|name| {
                let value = joined_value(request_headers, &name);
                (name, value)
            })
            .collect();

        Self {
            url: response.url.as_ref().map(|u| u.to_string()),
            status: response.status.as_u16(),
            headers,
            body: response.body.clone(),
            vary,
            stored_at_ms: now_ms(),
        }
    }

    /// Whether this entry may answer a request carrying `request_headers`.
    ///
    /// Every header named in the stored `Vary` must carry the same value it
    /// had when the entry was written. `Vary: *` never matches.
    pub fn matches(&self, request_headers: &HeaderMap) -> bool {
        let names = vary_names(
            self.headers
                .iter()
                .filter(|(name, _)| name.eq_ignore_ascii_case(VARY.as_str()))
                .map(|(_, value)| value.as_slice()),
        );

        names.iter().all(|name| {
            if name == "*" {
                return false;
            }
            let recorded = self
                .vary
                .iter()
                .find(|(recorded, _)| recorded == name)
                .and_then(|(_, value)| value.as_deref());
            joined_value(request_headers, name).as_deref() == recorded
        })
    }

    /// Rebuild the response handed back to the page.
    pub fn into_response(self) -> Response {
        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value),
            ) {
                headers.append(name, value);
            }
        }

        Response::new(
            self.url.as_deref().and_then(|u| Url::parse(u).ok()),
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK),
            headers,
            self.body,
        )
    }
}

/// Lower-cased field names listed across `Vary` header values.
fn vary_names<'a>(values: impl Iterator<Item = &'a [u8]>) -> Vec<String> {
    let mut names = Vec::new();
    for value in values {
        for token in value.split(|b| *b == b',') {
            let token = String::from_utf8_lossy(token).trim().to_ascii_lowercase();
            if !token.is_empty() && !names.contains(&token) {
                names.push(token);
            }
        }
    }
    names
}

/// All values of one request header joined with `", "`.
fn joined_value(headers: &HeaderMap, name: &str) -> Option<Vec<u8>> {
    let mut values = headers.get_all(name).iter();
    let mut joined = values.next()?.as_bytes().to_vec();
    for value in values {
        joined.extend_from_slice(b", ");
        joined.extend_from_slice(value.as_bytes());
    }
    Some(joined)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ==================== Backend ====================

/// Storage engine holding named caches of request → response pairs.
///
/// Each call is atomic on its own: a `put` replaces the whole entry and a
/// concurrent `get` sees either the old or the new response. Two writers
/// racing on one key leave whichever finished last.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Create the named cache if absent.
    async fn open(&self, name: &str) -> Result<(), CacheError>;

    async fn has(&self, name: &str) -> Result<bool, CacheError>;

    /// Delete a cache and all its entries. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool, CacheError>;

    /// Names of all caches, sorted.
    async fn keys(&self) -> Result<Vec<String>, CacheError>;

    /// Exact lookup. A missing cache behaves like an empty one.
    async fn get(&self, name: &str, key: &RequestKey)
        -> Result<Option<StoredResponse>, CacheError>;

    /// Upsert, creating the cache if needed.
    async fn put(
        &self,
        name: &str,
        key: RequestKey,
        response: StoredResponse,
    ) -> Result<(), CacheError>;

    async fn remove(&self, name: &str, key: &RequestKey) -> Result<bool, CacheError>;

    /// Keys stored in one cache, sorted.
    async fn entries(&self, name: &str) -> Result<Vec<RequestKey>, CacheError>;
}

// ==================== Store Manager ====================

/// Access to the active cache version.
///
/// The active name is fixed at construction, so several managers over one
/// backend never interfere unless they share a version.
#[derive(Clone)]
pub struct StoreManager {
    backend: Arc<dyn CacheBackend>,
    active: String,
}

impl StoreManager {
    pub fn new(backend: Arc<dyn CacheBackend>, active: impl Into<String>) -> Self {
        Self {
            backend,
            active: active.into(),
        }
    }

    /// Name of the active cache.
    pub fn active(&self) -> &str {
        &self.active
    }

    /// Create the active cache if absent. Idempotent.
    pub async fn open(&self) -> Result<(), CacheError> {
        self.backend.open(&self.active).await
    }

    /// Lookup by key alone, as for a request without headers.
    pub async fn get(&self, key: &RequestKey) -> Result<Option<StoredResponse>, CacheError> {
        self.get_for(key, &HeaderMap::new()).await
    }

    /// Lookup for a request carrying `request_headers`.
    ///
    /// An entry whose `Vary` headers disagree with the request is a miss.
    pub async fn get_for(
        &self,
        key: &RequestKey,
        request_headers: &HeaderMap,
    ) -> Result<Option<StoredResponse>, CacheError> {
        let found = self.backend.get(&self.active, key).await?;
        Ok(found.filter(|stored| stored.matches(request_headers)))
    }

    /// Store a response under `key` as if fetched without request headers.
    pub async fn put(&self, key: RequestKey, response: &Response) -> Result<(), CacheError> {
        self.put_for(key, &HeaderMap::new(), response).await
    }

    /// Store a response under `key`, replacing any existing entry.
    ///
    /// Only GET keys and cacheable responses (2xx, not 206) are accepted.
    pub async fn put_for(
        &self,
        key: RequestKey,
        request_headers: &HeaderMap,
        response: &Response,
    ) -> Result<(), CacheError> {
        if !key.is_storable() {
            return Err(CacheError::NotCacheable(key.to_string()));
        }
        if !response.is_cacheable() {
            return Err(CacheError::NotCacheable(format!(
                "{key} answered {}",
                response.status
            )));
        }
        debug!(cache = %self.active, %key, status = %response.status, "Storing response");
        self.backend
            .put(
                &self.active,
                key,
                StoredResponse::capture(request_headers, response),
            )
            .await
    }

    pub async fn delete(&self, key: &RequestKey) -> Result<bool, CacheError> {
        self.backend.remove(&self.active, key).await
    }

    /// Keys in the active cache.
    pub async fn keys(&self) -> Result<Vec<RequestKey>, CacheError> {
        self.backend.entries(&self.active).await
    }

    /// Every cache the backend holds, active or not.
    pub async fn store_names(&self) -> Result<Vec<String>, CacheError> {
        self.backend.keys().await
    }

    /// Delete every cache except `keep`.
    ///
    /// All deletions are awaited before returning. Returns the deleted
    /// names.
    pub async fn delete_stores_except(&self, keep: &str) -> Result<Vec<String>, CacheError> {
        let stale: Vec<String> = self
            .backend
            .keys()
            .await?
            .into_iter()
            .filter(|name| name != keep)
            .collect();

        try_join_all(stale.iter().map(|name| self.backend.delete(name))).await?;

        if !stale.is_empty() {
            info!(kept = keep, deleted = ?stale, "Deleted stale caches");
        }
        Ok(stale)
    }
}

impl std::fmt::Debug for StoreManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreManager")
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}
