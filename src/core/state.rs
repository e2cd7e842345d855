use std::sync::Arc;

use crate::core::config::Settings;
use crate::llm::LlmGateway;
use crate::queue::QueueBroker;
use crate::services::rasterizer::PageRasterizer;
use crate::storage::StorageProvider;
use crate::store::StateStore;

/// Shared handle threaded through every task and worker. All mutable state
/// lives behind the store; this is configuration plus ports.
#[derive(Clone)]
pub struct EngineState {
    inner: Arc<InnerState>,
}

struct InnerState {
    settings: Settings,
    store: Arc<dyn StateStore>,
    queue: Arc<dyn QueueBroker>,
    storage: Arc<dyn StorageProvider>,
    gateway: Arc<LlmGateway>,
    rasterizer: Arc<dyn PageRasterizer>,
}

impl EngineState {
    pub fn new(
        settings: Settings,
        store: Arc<dyn StateStore>,
        queue: Arc<dyn QueueBroker>,
        storage: Arc<dyn StorageProvider>,
        gateway: Arc<LlmGateway>,
        rasterizer: Arc<dyn PageRasterizer>,
    ) -> Self {
        Self {
            inner: Arc::new(InnerState { settings, store, queue, storage, gateway, rasterizer }),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.inner.store
    }

    pub fn queue(&self) -> &Arc<dyn QueueBroker> {
        &self.inner.queue
    }

    pub fn storage(&self) -> &Arc<dyn StorageProvider> {
        &self.inner.storage
    }

    pub fn gateway(&self) -> &Arc<LlmGateway> {
        &self.inner.gateway
    }

    pub fn rasterizer(&self) -> &Arc<dyn PageRasterizer> {
        &self.inner.rasterizer
    }
}
