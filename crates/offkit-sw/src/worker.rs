//! The worker as seen by its host: install, activate, fetch.

use std::sync::Arc;

use offkit_net::{Fetcher, NetError, Request, Response};
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::{
    Activation, CacheBackend, Classifier, ClientRegistry, ConfigError, LifecycleController,
    LifecycleError, Strategies, Strategy, StoreManager, WorkerConfig, WorkerEvent, WorkerState,
};

/// Result of handling one fetch event.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Answer the page with this response.
    Respond(Response),
    /// The request failed; the page sees a failed fetch.
    Failed(NetError),
    /// Not intercepted; the host fetches it as usual.
    Passthrough,
}

impl FetchOutcome {
    pub fn response(&self) -> Option<&Response> {
        match self {
            FetchOutcome::Respond(response) => Some(response),
            _ => None,
        }
    }

    pub fn into_response(self) -> Option<Response> {
        match self {
            FetchOutcome::Respond(response) => Some(response),
            _ => None,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self, FetchOutcome::Passthrough)
    }
}

/// One cache version's worker.
pub struct ServiceWorker {
    classifier: Classifier,
    store: StoreManager,
    strategies: Strategies,
    lifecycle: LifecycleController,
    clients: Arc<RwLock<ClientRegistry>>,
}

impl ServiceWorker {
    /// Build a worker from validated configuration.
    ///
    /// The receiver yields lifecycle events; dropping it is fine.
    pub fn new(
        config: &WorkerConfig,
        backend: Arc<dyn CacheBackend>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<WorkerEvent>), ConfigError> {
        config.validate()?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let origin = config.origin_url()?;
        let store = StoreManager::new(backend, config.cache_name.clone());
        let clients = Arc::new(RwLock::new(ClientRegistry::new()));

        let strategies = Strategies::new(
            store.clone(),
            Arc::clone(&fetcher),
            config.navigation_request_key()?,
            config.fetch_timeout(),
        );

        let lifecycle = LifecycleController::new(
            store.clone(),
            fetcher,
            config.resolved_assets()?,
            config.fetch_timeout(),
            Arc::clone(&clients),
            event_tx,
        );

        Ok((
            Self {
                classifier: Classifier::new(origin.origin()),
                store,
                strategies,
                lifecycle,
                clients,
            },
            event_rx,
        ))
    }

    /// Install event. Resolves once the cache is fully seeded.
    pub async fn install(&self) -> Result<(), LifecycleError> {
        self.lifecycle.install().await
    }

    /// Activate event. Resolves after stale caches are gone and clients
    /// are claimed.
    pub async fn activate(&self) -> Result<Activation, LifecycleError> {
        self.lifecycle.activate().await
    }

    /// Fetch event.
    pub async fn handle_fetch(&self, request: &Request) -> FetchOutcome {
        let strategy = self.classifier.classify(request);
        debug!(
            id = request.id.raw(),
            url = %request.url,
            strategy = strategy.name(),
            "Handling fetch"
        );

        match strategy {
            Strategy::Navigation => {
                FetchOutcome::Respond(self.strategies.network_first(request).await)
            }
            Strategy::SameOrigin => match self.strategies.cache_first(request).await {
                Ok(response) => FetchOutcome::Respond(response),
                Err(err) => FetchOutcome::Failed(err),
            },
            Strategy::CrossOriginImage => {
                FetchOutcome::Respond(self.strategies.stale_while_revalidate(request).await)
            }
            Strategy::Unhandled => FetchOutcome::Passthrough,
        }
    }

    /// Wait for background revalidations to finish.
    pub async fn settle(&self) {
        self.strategies.background().settle().await;
    }

    pub fn classify(&self, request: &Request) -> Strategy {
        self.classifier.classify(request)
    }

    pub async fn state(&self) -> WorkerState {
        self.lifecycle.state().await
    }

    pub fn skip_waiting_requested(&self) -> bool {
        self.lifecycle.skip_waiting_requested()
    }

    pub fn store(&self) -> &StoreManager {
        &self.store
    }

    pub fn clients(&self) -> Arc<RwLock<ClientRegistry>> {
        Arc::clone(&self.clients)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryBackend;
    use async_trait::async_trait;

    struct Unreachable;

    #[async_trait]
    impl Fetcher for Unreachable {
        async fn fetch(&self, _request: &Request) -> Result<Response, NetError> {
            Err(NetError::RequestFailed("no network in this test".to_string()))
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = WorkerConfig {
            origin: "not a url".to_string(),
            ..Default::default()
        };
        let result = ServiceWorker::new(
            &config,
            Arc::new(MemoryBackend::new()),
            Arc::new(Unreachable),
        );
        assert!(matches!(result, Err(ConfigError::InvalidOrigin { .. })));
    }

    #[tokio::test]
    async fn test_new_worker_state() {
        let (worker, _rx) = ServiceWorker::new(
            &WorkerConfig::default(),
            Arc::new(MemoryBackend::new()),
            Arc::new(Unreachable),
        )
        .unwrap();

        assert_eq!(worker.state().await, WorkerState::Parsed);
        assert!(!worker.skip_waiting_requested());
        assert_eq!(worker.store().active(), "offkit-cache-v1");
    }

    #[test]
    fn test_outcome_accessors() {
        let outcome = FetchOutcome::Respond(Response::empty(http::StatusCode::OK));
        assert!(outcome.response().is_some());
        assert!(!outcome.is_passthrough());
        assert!(FetchOutcome::Passthrough.into_response().is_none());
    }
}
