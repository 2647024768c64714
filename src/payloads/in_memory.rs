use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{PayloadStore, TOKEN_PREFIX};
use crate::error::WorkerError;

/// Process-local payload store for tests and the in-memory task hub.
#[derive(Debug, Default)]
pub struct InMemoryPayloadStore {
    blobs: Mutex<HashMap<String, String>>,
    next: AtomicU64,
}

impl InMemoryPayloadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.lock().await.is_empty()
    }
}

#[async_trait]
impl PayloadStore for InMemoryPayloadStore {
    async fn upload(&self, payload: &str) -> Result<String, WorkerError> {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        let token = format!("{TOKEN_PREFIX}memory:{n}");
        self.blobs.lock().await.insert(token.clone(), payload.to_string());
        Ok(token)
    }

    async fn download(&self, token: &str) -> Result<String, WorkerError> {
        self.blobs
            .lock()
            .await
            .get(token)
            .cloned()
            .ok_or_else(|| WorkerError::PayloadStore(format!("unknown payload token '{token}'")))
    }
}
