mod memory;

pub use memory::MemoryStorage;

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::error::EngineError;

/// Hard ceiling on signed-URL lifetimes.
pub const MAX_SIGNED_URL_TTL: Duration = Duration::from_secs(15 * 60);

/// Object-storage port. Keys are opaque to callers; the engine composes them
/// under `uploads/{upload_id}/...`.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Store bytes and return an addressable URL for the key.
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, EngineError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, EngineError>;

    /// Time-limited access URL. Implementations clamp `ttl` to
    /// [`MAX_SIGNED_URL_TTL`].
    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String, EngineError>;
}

pub(crate) fn clamp_ttl(ttl: Duration) -> Duration {
    ttl.min(MAX_SIGNED_URL_TTL)
}
