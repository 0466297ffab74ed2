//! Install and activate.
//!
//! ```text
//! Parsed ──install──▶ Installing ──ok──▶ Installed ──activate──▶ Activating ──▶ Activated
//!                         │                                                      │
//!                         └──err──▶ Redundant ──install (retry)──▶ ...     activate (again)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use offkit_common::OffKitError;
use offkit_net::{fetch_with_timeout, Fetcher, NetError, Request, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::{CacheError, ClientRegistry, RequestKey, StoreManager};

// ==================== Errors ====================

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Asset {url} could not be fetched: {source}")]
    AssetFetch {
        url: String,
        #[source]
        source: NetError,
    },

    #[error("Asset {url} answered with status {status}")]
    AssetStatus { url: String, status: u16 },

    #[error("Store unavailable: {0}")]
    Store(#[from] CacheError),

    #[error("Cannot {action} while {state:?}")]
    InvalidState {
        action: &'static str,
        state: WorkerState,
    },
}

impl From<LifecycleError> for OffKitError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::AssetFetch { .. } | LifecycleError::AssetStatus { .. } => {
                OffKitError::network_with_source("install failed", err)
            }
            LifecycleError::Store(_) => OffKitError::storage_with_source("install failed", err),
            LifecycleError::InvalidState { .. } => OffKitError::Lifecycle(err.to_string()),
        }
    }
}

// ==================== State ====================

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WorkerState {
    /// Created, nothing run yet.
    #[default]
    Parsed,
    /// Seeding the cache.
    Installing,
    /// Seeded, waiting for activation.
    Installed,
    /// Removing stale caches and claiming clients.
    Activating,
    /// Serving requests.
    Activated,
    /// Install failed; may be retried.
    Redundant,
}

/// Lifecycle notifications for the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    StateChange { version: String, state: WorkerState },
    StoresDeleted { names: Vec<String> },
    ControllerChange { client_id: String, version: String },
}

/// What an activation did.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Activation {
    /// Stale caches removed.
    pub deleted: Vec<String>,
    /// Clients newly controlled by this version.
    pub claimed: Vec<String>,
}

// ==================== Controller ====================

/// Runs install and activate for one cache version.
pub struct LifecycleController {
    store: StoreManager,
    fetcher: Arc<dyn Fetcher>,
    assets: Vec<Url>,
    fetch_timeout: Option<Duration>,
    clients: Arc<RwLock<ClientRegistry>>,
    state: RwLock<WorkerState>,
    skip_waiting: AtomicBool,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl LifecycleController {
    pub fn new(
        store: StoreManager,
        fetcher: Arc<dyn Fetcher>,
        assets: Vec<Url>,
        fetch_timeout: Option<Duration>,
        clients: Arc<RwLock<ClientRegistry>>,
        event_tx: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            store,
            fetcher,
            assets,
            fetch_timeout,
            clients,
            state: RwLock::new(WorkerState::Parsed),
            skip_waiting: AtomicBool::new(false),
            event_tx,
        }
    }

    pub async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    /// Whether install asked to be activated without waiting for old
    /// clients to close.
    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    /// Open the cache and seed it with every asset.
    ///
    /// All or nothing: a failed fetch, a status that may not be cached
    /// (non-2xx or 206) or a failed write leaves no asset behind and marks
    /// the worker redundant.
    pub async fn install(&self) -> Result<(), LifecycleError> {
        {
            let mut state = self.state.write().await;
            if !matches!(*state, WorkerState::Parsed | WorkerState::Redundant) {
                return Err(LifecycleError::InvalidState {
                    action: "install",
                    state: *state,
                });
            }
            *state = WorkerState::Installing;
        }
        self.emit_state(WorkerState::Installing);
        info!(cache = %self.store.active(), assets = self.assets.len(), "Installing");

        match self.seed().await {
            Ok(()) => {
                self.set_state(WorkerState::Installed).await;
                self.skip_waiting.store(true, Ordering::SeqCst);
                info!(cache = %self.store.active(), "Installed");
                Ok(())
            }
            Err(err) => {
                warn!(cache = %self.store.active(), error = %err, "Install failed");
                self.set_state(WorkerState::Redundant).await;
                Err(err)
            }
        }
    }

    async fn seed(&self) -> Result<(), LifecycleError> {
        self.store.open().await?;

        let fetched = try_join_all(self.assets.iter().map(|url| self.fetch_asset(url))).await?;

        let mut written: Vec<RequestKey> = Vec::with_capacity(fetched.len());
        for (key, response) in fetched {
            if let Err(err) = self.store.put(key.clone(), &response).await {
                self.roll_back(&written).await;
                return Err(err.into());
            }
            written.push(key);
        }
        Ok(())
    }

    async fn fetch_asset(&self, url: &Url) -> Result<(RequestKey, Response), LifecycleError> {
        let request = Request::get(url.clone());
        let response = fetch_with_timeout(self.fetcher.as_ref(), &request, self.fetch_timeout)
            .await
            .map_err(|source| LifecycleError::AssetFetch {
                url: url.to_string(),
                source,
            })?;

        if !response.is_cacheable() {
            return Err(LifecycleError::AssetStatus {
                url: url.to_string(),
                status: response.status.as_u16(),
            });
        }

        debug!(%url, "Fetched asset");
        Ok((RequestKey::for_url(url), response))
    }

    async fn roll_back(&self, written: &[RequestKey]) {
        for key in written {
            if let Err(err) = self.store.delete(key).await {
                warn!(%key, error = %err, "Could not roll back seeded asset");
            }
        }
    }

    /// Delete every other cache version, then claim all clients.
    ///
    /// Running it again on an active worker deletes nothing and claims only
    /// clients opened since.
    pub async fn activate(&self) -> Result<Activation, LifecycleError> {
        let previous = {
            let mut state = self.state.write().await;
            if !matches!(*state, WorkerState::Installed | WorkerState::Activated) {
                return Err(LifecycleError::InvalidState {
                    action: "activate",
                    state: *state,
                });
            }
            std::mem::replace(&mut *state, WorkerState::Activating)
        };
        self.emit_state(WorkerState::Activating);

        let version = self.store.active().to_string();
        let deleted = match self.store.delete_stores_except(&version).await {
            Ok(deleted) => deleted,
            Err(err) => {
                warn!(cache = %version, error = %err, "Activation cleanup failed");
                self.set_state(previous).await;
                return Err(err.into());
            }
        };
        if !deleted.is_empty() {
            self.emit(WorkerEvent::StoresDeleted {
                names: deleted.clone(),
            });
        }

        let claimed = self.clients.write().await.claim(&version);
        for client_id in &claimed {
            self.emit(WorkerEvent::ControllerChange {
                client_id: client_id.clone(),
                version: version.clone(),
            });
        }

        self.set_state(WorkerState::Activated).await;
        info!(cache = %version, deleted = deleted.len(), claimed = claimed.len(), "Activated");

        Ok(Activation { deleted, claimed })
    }

    async fn set_state(&self, state: WorkerState) {
        *self.state.write().await = state;
        self.emit_state(state);
    }

    fn emit_state(&self, state: WorkerState) {
        self.emit(WorkerEvent::StateChange {
            version: self.store.active().to_string(),
            state,
        });
    }

    fn emit(&self, event: WorkerEvent) {
        // The host may have dropped its receiver; events are advisory.
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CacheBackend, MemoryBackend};
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};

    /// Answers 200 for every URL except those listed as missing, partial
    /// or down.
    #[derive(Default)]
    struct AssetServer {
        missing: Vec<&'static str>,
        partial: Vec<&'static str>,
        down: Vec<&'static str>,
    }

    #[async_trait]
    impl Fetcher for AssetServer {
        async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
            let path = request.url.path();
            if self.down.contains(&path) {
                return Err(NetError::RequestFailed("connection reset".to_string()));
            }
            let status = if self.missing.contains(&path) {
                StatusCode::NOT_FOUND
            } else if self.partial.contains(&path) {
                StatusCode::PARTIAL_CONTENT
            } else {
                StatusCode::OK
            };
            Ok(Response::new(
                Some(request.url.clone()),
                status,
                HeaderMap::new(),
                Bytes::from(path.to_string()),
            ))
        }
    }

    fn controller(
        backend: Arc<dyn CacheBackend>,
        server: AssetServer,
        assets: &[&str],
    ) -> (LifecycleController, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let base = Url::parse("https://app.example/").unwrap();
        let assets = assets.iter().map(|a| base.join(a).unwrap()).collect();
        let controller = LifecycleController::new(
            StoreManager::new(backend, "v2"),
            Arc::new(server),
            assets,
            None,
            Arc::new(RwLock::new(ClientRegistry::new())),
            tx,
        );
        (controller, rx)
    }

    fn server() -> AssetServer {
        AssetServer::default()
    }

    #[tokio::test]
    async fn test_install_seeds_and_requests_skip_waiting() {
        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryBackend::new());
        let (controller, _rx) = controller(Arc::clone(&backend), server(), &["/", "/app.js"]);

        controller.install().await.unwrap();

        assert_eq!(controller.state().await, WorkerState::Installed);
        assert!(controller.skip_waiting_requested());
        assert_eq!(backend.entries("v2").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_install_missing_asset_writes_nothing() {
        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryBackend::new());
        let server = AssetServer {
            missing: vec!["/logo.png"],
            ..AssetServer::default()
        };
        let (controller, _rx) = controller(Arc::clone(&backend), server, &["/", "/logo.png"]);

        let err = controller.install().await.unwrap_err();

        assert!(matches!(err, LifecycleError::AssetStatus { status: 404, .. }));
        assert_eq!(controller.state().await, WorkerState::Redundant);
        assert!(backend.entries("v2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_install_rejects_partial_content() {
        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryBackend::new());
        let server = AssetServer {
            partial: vec!["/a.js"],
            ..AssetServer::default()
        };
        let (controller, _rx) = controller(Arc::clone(&backend), server, &["/", "/a.js"]);

        let err = controller.install().await.unwrap_err();

        assert!(matches!(err, LifecycleError::AssetStatus { status: 206, .. }));
        assert_eq!(controller.state().await, WorkerState::Redundant);
        assert!(backend.entries("v2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_install_network_failure() {
        let server = AssetServer {
            down: vec!["/app.js"],
            ..AssetServer::default()
        };
        let (controller, _rx) =
            controller(Arc::new(MemoryBackend::new()), server, &["/", "/app.js"]);

        let err = controller.install().await.unwrap_err();
        assert!(matches!(err, LifecycleError::AssetFetch { .. }));

        let host: OffKitError = err.into();
        assert!(host.is_retryable());
    }

    #[tokio::test]
    async fn test_install_quota_failure_rolls_back() {
        // "/" and "/app.js" bodies are 1 and 7 bytes.
        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryBackend::with_quota(4));
        let (controller, _rx) = controller(Arc::clone(&backend), server(), &["/", "/app.js"]);

        let err = controller.install().await.unwrap_err();

        assert!(matches!(err, LifecycleError::Store(CacheError::Unavailable(_))));
        assert!(backend.entries("v2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_install_can_be_retried() {
        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryBackend::with_quota(0));
        let (controller, _rx) = controller(backend, server(), &["/"]);
        assert!(controller.install().await.is_err());

        // Redundant workers may install again.
        assert!(matches!(
            controller.install().await,
            Err(LifecycleError::Store(_))
        ));
    }

    #[tokio::test]
    async fn test_activate_before_install_is_rejected() {
        let (controller, _rx) = controller(Arc::new(MemoryBackend::new()), server(), &["/"]);

        let err = controller.activate().await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::InvalidState {
                action: "activate",
                state: WorkerState::Parsed
            }
        ));
    }

    #[tokio::test]
    async fn test_install_twice_is_rejected() {
        let (controller, _rx) = controller(Arc::new(MemoryBackend::new()), server(), &["/"]);
        controller.install().await.unwrap();

        assert!(matches!(
            controller.install().await,
            Err(LifecycleError::InvalidState { action: "install", .. })
        ));
    }

    #[tokio::test]
    async fn test_activate_emits_events_in_order() {
        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryBackend::new());
        backend.open("v1").await.unwrap();
        let (controller, mut rx) = controller(Arc::clone(&backend), server(), &["/"]);
        let client = controller
            .clients
            .write()
            .await
            .open(Url::parse("https://app.example/").unwrap());

        controller.install().await.unwrap();
        let activation = controller.activate().await.unwrap();

        assert_eq!(activation.deleted, vec!["v1".to_string()]);
        assert_eq!(activation.claimed, vec![client.id.clone()]);

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        let state = |state| WorkerEvent::StateChange {
            version: "v2".to_string(),
            state,
        };
        assert_eq!(
            events,
            vec![
                state(WorkerState::Installing),
                state(WorkerState::Installed),
                state(WorkerState::Activating),
                WorkerEvent::StoresDeleted {
                    names: vec!["v1".to_string()]
                },
                WorkerEvent::ControllerChange {
                    client_id: client.id,
                    version: "v2".to_string()
                },
                state(WorkerState::Activated),
            ]
        );
    }
}
