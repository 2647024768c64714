//! Large-payload externalization.
//!
//! Payloads above a size threshold are uploaded to a [`PayloadStore`] and
//! replaced by an opaque `blob:v1:` token before they leave the worker.
//! Tokens found in incoming history are downloaded and substituted back
//! before the orchestrator sees them.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::WorkerError;
use crate::runtime::limits::DEFAULT_EXTERNALIZE_THRESHOLD_BYTES;
use crate::{HistoryEvent, OrchestratorAction};

pub mod chunking;
pub mod in_memory;

pub use in_memory::InMemoryPayloadStore;

/// Prefix of every reference token.
pub const TOKEN_PREFIX: &str = "blob:v1:";

#[async_trait]
pub trait PayloadStore: Send + Sync {
    /// Store `payload` and return a reference token.
    async fn upload(&self, payload: &str) -> Result<String, WorkerError>;

    async fn download(&self, token: &str) -> Result<String, WorkerError>;

    fn is_reference(&self, value: &str) -> bool {
        value.starts_with(TOKEN_PREFIX)
    }
}

#[derive(Debug, Clone)]
pub struct LargePayloadOptions {
    /// Payloads strictly larger than this are externalized.
    pub threshold_bytes: usize,
    /// Hard cap; larger payloads are rejected instead of uploaded.
    pub max_payload_bytes: usize,
}

impl Default for LargePayloadOptions {
    fn default() -> Self {
        Self {
            threshold_bytes: DEFAULT_EXTERNALIZE_THRESHOLD_BYTES,
            max_payload_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Applies a [`PayloadStore`] to the payloads crossing the worker boundary.
#[derive(Clone)]
pub struct PayloadExternalizer {
    store: Arc<dyn PayloadStore>,
    options: LargePayloadOptions,
}

impl PayloadExternalizer {
    pub fn new(store: Arc<dyn PayloadStore>, options: LargePayloadOptions) -> Self {
        Self { store, options }
    }

    pub fn store(&self) -> &Arc<dyn PayloadStore> {
        &self.store
    }

    /// Replace `payload` with a token when it exceeds the threshold.
    pub async fn externalize(&self, payload: &mut String) -> Result<(), WorkerError> {
        if payload.len() <= self.options.threshold_bytes || self.store.is_reference(payload) {
            return Ok(());
        }
        if payload.len() > self.options.max_payload_bytes {
            return Err(WorkerError::PayloadStore(format!(
                "payload of {} bytes exceeds the maximum of {} bytes",
                payload.len(),
                self.options.max_payload_bytes
            )));
        }
        let token = self.store.upload(payload).await?;
        tracing::debug!(size = payload.len(), token = %token, "externalized payload");
        *payload = token;
        Ok(())
    }

    /// Substitute the stored payload for a token. Plain values are left alone.
    pub async fn resolve(&self, payload: &mut String) -> Result<(), WorkerError> {
        if self.store.is_reference(payload) {
            *payload = self.store.download(payload).await?;
        }
        Ok(())
    }

    pub async fn resolve_events(&self, events: &mut [HistoryEvent]) -> Result<(), WorkerError> {
        for payload in events.iter_mut().filter_map(HistoryEvent::payload_mut) {
            self.resolve(payload).await?;
        }
        Ok(())
    }

    pub async fn externalize_actions(&self, actions: &mut [OrchestratorAction]) -> Result<(), WorkerError> {
        for action in actions.iter_mut() {
            for payload in action.payloads_mut() {
                self.externalize(payload).await?;
            }
        }
        Ok(())
    }
}
