//! JSON encoding for typed inputs and results.
//!
//! Payloads cross the worker boundary as strings; the typed helpers on
//! [`crate::OrchestrationContext`] and [`crate::ActivityContext`] go through here.

use anyhow::Context as _;
use serde::Serialize;
use serde::de::DeserializeOwned;

pub fn encode<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<String> {
    serde_json::to_string(value).context("failed to encode payload as JSON")
}

/// Decode a JSON payload. An empty string decodes as JSON `null`.
pub fn decode<T: DeserializeOwned>(payload: &str) -> anyhow::Result<T> {
    let payload = if payload.is_empty() { "null" } else { payload };
    serde_json::from_str(payload).with_context(|| format!("failed to decode payload as {}", std::any::type_name::<T>()))
}
