use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, Client, RedisError};
use tokio::sync::RwLock;

use crate::domain::error::EngineError;
use crate::queue::{Delivery, QueueBroker, QueueName};

/// Redis-backed broker using the reliable-list pattern: LPUSH onto the ready
/// list, LMOVE into a per-queue processing list on dequeue, LREM on ack.
/// Entries stranded in the processing list by a dead worker are swept back by
/// the scheduler's maintenance loop.
#[derive(Clone)]
pub struct RedisQueue {
    url: String,
    manager: Arc<RwLock<Option<ConnectionManager>>>,
}

impl RedisQueue {
    pub fn new(url: String) -> Self {
        Self { url, manager: Arc::new(RwLock::new(None)) }
    }

    pub async fn connect(&self) -> Result<(), RedisError> {
        let client = Client::open(self.url.clone())?;
        let manager = ConnectionManager::new(client).await?;
        let mut guard = self.manager.write().await;
        *guard = Some(manager);
        Ok(())
    }

    pub async fn disconnect(&self) {
        let mut guard = self.manager.write().await;
        *guard = None;
    }

    /// Requeue everything left in processing lists, e.g. after an unclean
    /// shutdown. Returns the number of reclaimed payloads.
    pub async fn reclaim_processing(&self) -> Result<u64, EngineError> {
        let mut manager = self.connection().await?;
        let mut reclaimed = 0_u64;
        for queue in QueueName::ALL {
            loop {
                let moved: Option<String> = cmd("LMOVE")
                    .arg(processing_key(queue))
                    .arg(ready_key(queue))
                    .arg("RIGHT")
                    .arg("LEFT")
                    .query_async(&mut manager)
                    .await
                    .map_err(redis_err)?;
                match moved {
                    Some(_) => reclaimed += 1,
                    None => break,
                }
            }
        }
        Ok(reclaimed)
    }

    async fn connection(&self) -> Result<ConnectionManager, EngineError> {
        let manager = { self.manager.read().await.clone() };
        manager.ok_or_else(|| EngineError::Queue("redis broker not connected".into()))
    }
}

fn ready_key(queue: QueueName) -> String {
    format!("queue:{}", queue.as_str())
}

fn processing_key(queue: QueueName) -> String {
    format!("queue:{}:processing", queue.as_str())
}

fn redis_err(err: RedisError) -> EngineError {
    EngineError::Queue(err.to_string())
}

#[async_trait]
impl QueueBroker for RedisQueue {
    async fn enqueue(&self, queue: QueueName, payload: String) -> Result<(), EngineError> {
        let mut manager = self.connection().await?;
        cmd("LPUSH")
            .arg(ready_key(queue))
            .arg(payload)
            .query_async::<_, ()>(&mut manager)
            .await
            .map_err(redis_err)
    }

    async fn dequeue(&self, queue: QueueName) -> Result<Option<Delivery>, EngineError> {
        let mut manager = self.connection().await?;
        let payload: Option<String> = cmd("LMOVE")
            .arg(ready_key(queue))
            .arg(processing_key(queue))
            .arg("RIGHT")
            .arg("LEFT")
            .query_async(&mut manager)
            .await
            .map_err(redis_err)?;

        Ok(payload.map(|payload| Delivery { receipt: payload.clone(), payload }))
    }

    async fn ack(&self, queue: QueueName, receipt: &str) -> Result<(), EngineError> {
        let mut manager = self.connection().await?;
        cmd("LREM")
            .arg(processing_key(queue))
            .arg(1)
            .arg(receipt)
            .query_async::<_, ()>(&mut manager)
            .await
            .map_err(redis_err)
    }
}
