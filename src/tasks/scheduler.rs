use anyhow::Result;
use tokio::signal;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};

use crate::core::state::EngineState;
use crate::queue::QueueName;
use crate::tasks::{self, TaskMessage};

/// Start the worker pools, one per named queue, and run until shutdown.
pub(crate) async fn run(state: EngineState) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = state.settings().worker();
    let mut handles = Vec::new();
    for _ in 0..worker.default_workers.max(1) {
        handles.push(tokio::spawn(worker_loop(
            state.clone(),
            QueueName::Default,
            shutdown_rx.clone(),
        )));
    }
    for _ in 0..worker.ocr_workers.max(1) {
        handles.push(tokio::spawn(worker_loop(state.clone(), QueueName::Ocr, shutdown_rx.clone())));
    }
    for _ in 0..worker.evaluation_workers.max(1) {
        handles.push(tokio::spawn(worker_loop(
            state.clone(),
            QueueName::Evaluation,
            shutdown_rx.clone(),
        )));
    }

    shutdown_requested(handles.len()).await;
    if shutdown_tx.send(true).is_err() {
        tracing::warn!("Failed to broadcast shutdown signal to workers");
    }

    for handle in handles {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "Worker join failed");
        }
    }

    tracing::info!("all queue workers stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM. Workers finish the task they hold before
/// stopping; unacked deliveries from a hard kill are redelivered by the
/// broker and absorbed by the per-task idempotency checks. A signal source
/// whose handler cannot be installed is logged and never readied.
async fn shutdown_requested(worker_count: usize) {
    let interrupt = async {
        match signal::ctrl_c().await {
            Ok(()) => {}
            Err(err) => {
                tracing::error!(error = %err, "Ctrl+C handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => tracing::info!(worker_count, "interrupt received, draining queue workers"),
        _ = terminate => tracing::info!(worker_count, "terminate received, draining queue workers"),
    }
}

async fn worker_loop(state: EngineState, queue: QueueName, mut shutdown: watch::Receiver<bool>) {
    let poll_interval = Duration::from_secs(state.settings().worker().poll_interval_seconds.max(1));

    loop {
        if *shutdown.borrow() {
            break;
        }

        match process_one(&state, queue).await {
            Ok(true) => continue,
            Ok(false) => {}
            Err(err) => {
                tracing::error!(queue = queue.as_str(), error = %err, "worker iteration failed")
            }
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = sleep(poll_interval) => {}
        }
    }
}

/// Pull and dispatch a single task. The delivery is acknowledged only after
/// dispatch returns, so a worker crash mid-task leads to redelivery
/// (at-least-once); the per-task idempotency checks make replays harmless.
pub(crate) async fn process_one(
    state: &EngineState,
    queue: QueueName,
) -> Result<bool, crate::domain::error::EngineError> {
    let Some(delivery) = state.queue().dequeue(queue).await? else {
        return Ok(false);
    };

    match serde_json::from_str::<TaskMessage>(&delivery.payload) {
        Ok(message) => {
            if let Err(err) = tasks::dispatch(state, message).await {
                tracing::error!(queue = queue.as_str(), error = %err, "task dispatch failed");
            }
        }
        Err(err) => {
            tracing::error!(queue = queue.as_str(), error = %err, "undecodable task payload dropped");
        }
    }

    state.queue().ack(queue, &delivery.receipt).await?;
    Ok(true)
}

/// Drive every queue to empty. Test harness for exercising the task graph
/// without background workers.
#[cfg(test)]
pub(crate) async fn drain(state: &EngineState) -> Result<u64, crate::domain::error::EngineError> {
    let mut processed = 0_u64;
    loop {
        let mut any = false;
        for queue in QueueName::ALL {
            while process_one(state, queue).await? {
                processed += 1;
                any = true;
            }
        }
        if !any {
            return Ok(processed);
        }
    }
}
