pub mod agents;
pub mod core;
pub mod domain;
pub mod engine;
pub mod llm;
pub mod queue;
pub mod services;
pub mod storage;
pub mod store;
pub mod tasks;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use crate::core::{config::Settings, state::EngineState};
use crate::llm::{LlmGateway, OpenAiChat};
use crate::queue::RedisQueue;
use crate::services::rasterizer::PdfiumRasterizer;
use crate::storage::MemoryStorage;
use crate::store::MemoryStore;

/// Run the worker process: connect the broker, wire the ports, and consume
/// the named queues until shutdown. Deployments with external state and
/// object storage build an [`EngineState`] with their own port
/// implementations and call [`tasks::scheduler::run`] equivalently through
/// [`run_worker_with`].
pub async fn run_worker() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    core::telemetry::init_tracing(&settings)?;
    core::metrics::init(&settings)?;

    let redis = RedisQueue::new(settings.redis().redis_url());
    redis.connect().await?;
    match redis.reclaim_processing().await {
        Ok(0) => {}
        Ok(reclaimed) => tracing::info!(reclaimed, "requeued stranded deliveries"),
        Err(err) => tracing::warn!(error = %err, "failed to reclaim processing lists"),
    }

    let api = OpenAiChat::from_settings(&settings)?;
    let gateway = Arc::new(LlmGateway::from_settings(&settings, Arc::new(api)));

    let state = EngineState::new(
        settings,
        Arc::new(MemoryStore::new()),
        Arc::new(redis.clone()),
        Arc::new(MemoryStorage::new()),
        gateway,
        Arc::new(PdfiumRasterizer::new()),
    );

    tracing::info!("scriptmark worker starting");
    let result = run_worker_with(state).await;

    redis.disconnect().await;
    tracing::info!("redis disconnected");

    result
}

/// Consume the task queues with an externally assembled [`EngineState`].
pub async fn run_worker_with(state: EngineState) -> anyhow::Result<()> {
    tasks::scheduler::run(state).await
}
