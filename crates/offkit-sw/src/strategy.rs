//! Strategy executors.
//!
//! All three share one [`StoreManager`] and one [`Fetcher`]. Store failures
//! never fail a request: reads degrade to a miss and writes are dropped
//! with a warning.

use std::sync::Arc;
use std::time::Duration;

use http::{HeaderMap, StatusCode};
use offkit_net::{fetch_with_timeout, Fetcher, NetError, Request, Response};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{RequestKey, StoreManager};

/// Body of the synthetic response for an offline navigation.
pub const OFFLINE_BODY: &str = "Offline";

// ==================== Background Tasks ====================

/// Revalidations still running after their request was answered.
#[derive(Debug, Default)]
pub struct BackgroundTasks {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    async fn track(&self, handle: JoinHandle<()>) {
        let mut handles = self.handles.lock().await;
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Number of tasks not yet finished.
    pub async fn pending(&self) -> usize {
        self.handles
            .lock()
            .await
            .iter()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Wait until every tracked task, including ones spawned meanwhile,
    /// has finished.
    pub async fn settle(&self) {
        loop {
            let drained: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock().await);
            if drained.is_empty() {
                return;
            }
            for handle in drained {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Background revalidation aborted");
                }
            }
        }
    }
}

// ==================== Executors ====================

/// The three request strategies.
pub struct Strategies {
    store: StoreManager,
    fetcher: Arc<dyn Fetcher>,
    navigation_key: RequestKey,
    fetch_timeout: Option<Duration>,
    background: BackgroundTasks,
}

impl Strategies {
    pub fn new(
        store: StoreManager,
        fetcher: Arc<dyn Fetcher>,
        navigation_key: RequestKey,
        fetch_timeout: Option<Duration>,
    ) -> Self {
        Self {
            store,
            fetcher,
            navigation_key,
            fetch_timeout,
            background: BackgroundTasks::new(),
        }
    }

    pub fn background(&self) -> &BackgroundTasks {
        &self.background
    }

    /// Network first, for navigations.
    ///
    /// Always resolves: fresh response, else the cached shell, else a 503
    /// `Offline` page.
    pub async fn network_first(&self, request: &Request) -> Response {
        match self.fetch(request).await {
            Ok(fresh) => {
                if fresh.is_cacheable() {
                    let key = self.navigation_key.clone();
                    store_quietly(&self.store, key, &HeaderMap::new(), &fresh).await;
                }
                fresh
            }
            Err(err) => {
                warn!(url = %request.url, error = %err, "Navigation fetch failed, using cached shell");
                match lookup(&self.store, &self.navigation_key, &HeaderMap::new()).await {
                    Some(cached) => cached,
                    None => Response::text(StatusCode::SERVICE_UNAVAILABLE, OFFLINE_BODY),
                }
            }
        }
    }

    /// Cache first, for same-origin sub-resources.
    ///
    /// A miss that also fails on the network propagates the failure.
    pub async fn cache_first(&self, request: &Request) -> Result<Response, NetError> {
        let key = RequestKey::from_request(request);

        if let Some(cached) = lookup(&self.store, &key, &request.headers).await {
            debug!(%key, "Cache hit");
            return Ok(cached);
        }

        debug!(%key, "Cache miss");
        let fresh = self.fetch(request).await?;
        if fresh.is_cacheable() {
            store_quietly(&self.store, key, &request.headers, &fresh).await;
        }
        Ok(fresh)
    }

    /// Stale-while-revalidate, for cross-origin images.
    ///
    /// Returns the cached copy immediately when there is one; the refresh
    /// keeps running in the background. Network failures are swallowed and
    /// end in an empty 504 only when nothing was cached.
    pub async fn stale_while_revalidate(&self, request: &Request) -> Response {
        let key = RequestKey::from_request(request);
        let cached = lookup(&self.store, &key, &request.headers).await;

        let (tx, rx) = oneshot::channel();
        let store = self.store.clone();
        let fetcher = Arc::clone(&self.fetcher);
        let request = request.clone();
        let bound = self.fetch_timeout;
        let handle = tokio::spawn(async move {
            let fresh = revalidate(&store, fetcher.as_ref(), &request, key, bound).await;
            let _ = tx.send(fresh);
        });
        self.background.track(handle).await;

        if let Some(cached) = cached {
            return cached;
        }

        match rx.await {
            Ok(Some(fresh)) => fresh,
            _ => Response::empty(StatusCode::GATEWAY_TIMEOUT),
        }
    }

    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        fetch_with_timeout(self.fetcher.as_ref(), request, self.fetch_timeout).await
    }
}

async fn revalidate(
    store: &StoreManager,
    fetcher: &dyn Fetcher,
    request: &Request,
    key: RequestKey,
    bound: Option<Duration>,
) -> Option<Response> {
    match fetch_with_timeout(fetcher, request, bound).await {
        Ok(fresh) => {
            if fresh.is_cacheable() {
                store_quietly(store, key, &request.headers, &fresh).await;
            }
            Some(fresh)
        }
        Err(err) => {
            debug!(%key, error = %err, "Revalidation failed");
            None
        }
    }
}

/// Store read that treats an unavailable store as a miss.
async fn lookup(
    store: &StoreManager,
    key: &RequestKey,
    request_headers: &HeaderMap,
) -> Option<Response> {
    if !key.is_storable() {
        return None;
    }
    match store.get_for(key, request_headers).await {
        Ok(found) => found.map(|stored| stored.into_response()),
        Err(err) => {
            warn!(%key, error = %err, "Cache read failed, treating as miss");
            None
        }
    }
}

async fn store_quietly(
    store: &StoreManager,
    key: RequestKey,
    request_headers: &HeaderMap,
    response: &Response,
) {
    if !key.is_storable() {
        return;
    }
    if let Err(err) = store.put_for(key, request_headers, response).await {
        warn!(error = %err, "Cache write failed");
    }
}
