//! Shared state handed to every delivery route.

use shared::config::server::Config;
use std::{fmt, sync::Arc};
use tokio_util::sync::CancellationToken;

use crate::{
    bus::FanoutBus, delivery::DeliveryEngine, metrics::StreamMetrics,
    services::ChatOrchestrator,
};

/// State shared by every delivery-engine route.
#[derive(Clone)]
pub struct AppState {
    pub(crate) bus: Arc<dyn FanoutBus>,
    pub(crate) engine: DeliveryEngine,
    pub(crate) orchestrator: ChatOrchestrator,
    pub(crate) metrics: Arc<StreamMetrics>,
    pub(crate) config: Arc<Config>,
    /// Cancelled on process shutdown; every stream observes a child of it.
    pub(crate) shutdown: CancellationToken,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("bus_connected", &self.bus.is_connected())
            .field("engine", &self.engine)
            .field("orchestrator", &self.orchestrator)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Wires the delivery engine and orchestrator around one bus handle.
    pub fn new(
        bus: Arc<dyn FanoutBus>,
        origin: Option<Arc<dyn crate::services::GenerationOrigin>>,
        config: Arc<Config>,
        metrics: Arc<StreamMetrics>,
    ) -> Self {
        let engine = DeliveryEngine::new(Arc::clone(&bus), &config.delivery, Arc::clone(&metrics));
        let orchestrator = ChatOrchestrator::new(engine.clone(), origin);
        Self {
            bus,
            engine,
            orchestrator,
            metrics,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Process-wide metrics sink.
    #[must_use]
    pub fn metrics(&self) -> &Arc<StreamMetrics> {
        &self.metrics
    }

    /// Resolved configuration.
    #[must_use]
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Token whose cancellation ends every open stream.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}
