mod memory;
mod redis;

pub use memory::MemoryQueue;
pub use redis::RedisQueue;

use async_trait::async_trait;

use crate::domain::error::EngineError;

/// The named queues the workers consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    Default,
    Ocr,
    Evaluation,
}

impl QueueName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Ocr => "ocr",
            Self::Evaluation => "evaluation",
        }
    }

    pub const ALL: [QueueName; 3] = [Self::Default, Self::Ocr, Self::Evaluation];
}

/// A dequeued message. The receipt is handed back on acknowledgement; an
/// unacknowledged delivery becomes visible again, giving at-least-once
/// semantics.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub payload: String,
    pub receipt: String,
}

/// Broker port: named queues with at-least-once delivery and ack on
/// completion. Payloads are opaque serialized task envelopes.
#[async_trait]
pub trait QueueBroker: Send + Sync {
    async fn enqueue(&self, queue: QueueName, payload: String) -> Result<(), EngineError>;
    async fn dequeue(&self, queue: QueueName) -> Result<Option<Delivery>, EngineError>;
    async fn ack(&self, queue: QueueName, receipt: &str) -> Result<(), EngineError>;
}
