use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::error::EngineError;
use crate::queue::{Delivery, QueueBroker, QueueName};

const DEFAULT_VISIBILITY: Duration = Duration::from_secs(120);

struct InFlight {
    queue: QueueName,
    payload: String,
    deadline: Instant,
}

#[derive(Default)]
struct Inner {
    ready: HashMap<QueueName, VecDeque<String>>,
    in_flight: HashMap<String, InFlight>,
}

/// In-process broker with the same visibility-timeout contract as the Redis
/// adapter. Unacked deliveries return to their queue after the timeout.
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    visibility: Duration,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()), visibility: DEFAULT_VISIBILITY }
    }

    pub fn with_visibility(visibility: Duration) -> Self {
        Self { inner: Mutex::new(Inner::default()), visibility }
    }

    fn reclaim_expired(inner: &mut Inner, now: Instant) {
        let expired: Vec<String> = inner
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some(entry) = inner.in_flight.remove(&receipt) {
                inner.ready.entry(entry.queue).or_default().push_back(entry.payload);
            }
        }
    }
}

fn lock_err<T>(_: T) -> EngineError {
    EngineError::Queue("queue mutex poisoned".into())
}

#[async_trait]
impl QueueBroker for MemoryQueue {
    async fn enqueue(&self, queue: QueueName, payload: String) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().map_err(lock_err)?;
        inner.ready.entry(queue).or_default().push_back(payload);
        Ok(())
    }

    async fn dequeue(&self, queue: QueueName) -> Result<Option<Delivery>, EngineError> {
        let mut inner = self.inner.lock().map_err(lock_err)?;
        let now = Instant::now();
        Self::reclaim_expired(&mut inner, now);

        let Some(payload) = inner.ready.entry(queue).or_default().pop_front() else {
            return Ok(None);
        };

        let receipt = Uuid::new_v4().to_string();
        inner.in_flight.insert(
            receipt.clone(),
            InFlight { queue, payload: payload.clone(), deadline: now + self.visibility },
        );
        Ok(Some(Delivery { payload, receipt }))
    }

    async fn ack(&self, _queue: QueueName, receipt: &str) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().map_err(lock_err)?;
        inner.in_flight.remove(receipt);
        Ok(())
    }
}
