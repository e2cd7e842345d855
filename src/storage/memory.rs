use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::error::EngineError;
use crate::storage::{clamp_ttl, StorageProvider};

struct StoredObject {
    bytes: Vec<u8>,
    content_type: String,
}

/// In-process object store for tests and single-node runs.
#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<String, StoredObject>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageProvider for MemoryStorage {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, EngineError> {
        let mut objects = self
            .objects
            .lock()
            .map_err(|_| EngineError::Storage("storage mutex poisoned".into()))?;
        objects.insert(
            key.to_string(),
            StoredObject { bytes, content_type: content_type.to_string() },
        );
        Ok(format!("memory://{key}"))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, EngineError> {
        let objects = self
            .objects
            .lock()
            .map_err(|_| EngineError::Storage("storage mutex poisoned".into()))?;
        objects
            .get(key)
            .map(|object| object.bytes.clone())
            .ok_or_else(|| EngineError::Storage(format!("object not found: {key}")))
    }

    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String, EngineError> {
        let objects = self
            .objects
            .lock()
            .map_err(|_| EngineError::Storage("storage mutex poisoned".into()))?;
        if !objects.contains_key(key) {
            return Err(EngineError::Storage(format!("object not found: {key}")));
        }
        let ttl = clamp_ttl(ttl);
        Ok(format!("memory://{key}?expires={}", ttl.as_secs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MAX_SIGNED_URL_TTL;

    #[tokio::test]
    async fn put_get_roundtrip() {
        let storage = MemoryStorage::new();
        let url = storage
            .put("uploads/u1/original", b"pdf bytes".to_vec(), "application/pdf")
            .await
            .unwrap();
        assert_eq!(url, "memory://uploads/u1/original");
        assert_eq!(storage.get("uploads/u1/original").await.unwrap(), b"pdf bytes");
        assert!(storage.get("uploads/missing").await.is_err());
    }

    #[tokio::test]
    async fn signed_url_ttl_is_clamped() {
        let storage = MemoryStorage::new();
        storage.put("k", vec![1], "application/octet-stream").await.unwrap();

        let url = storage.signed_url("k", Duration::from_secs(3600)).await.unwrap();
        assert!(url.ends_with(&format!("expires={}", MAX_SIGNED_URL_TTL.as_secs())));
    }
}
