//! Splitting of orchestration completions into size-bounded chunks.
//!
//! Actions are packed greedily in order. The last chunk carries the custom
//! status, which counts against that chunk's budget, and is the only one with
//! `is_partial == false`.

use crate::error::WorkerError;
use crate::transport::{OrchestrationCompletion, TransportError};

fn action_size(action: &crate::OrchestratorAction) -> Result<usize, WorkerError> {
    Ok(serde_json::to_vec(action)?.len())
}

/// Serialized size of everything a chunk carries besides its envelope fields.
pub fn payload_size(chunk: &OrchestrationCompletion) -> Result<usize, WorkerError> {
    let mut size = 0;
    for action in &chunk.actions {
        size += action_size(action)?;
    }
    if let Some(status) = &chunk.custom_status {
        size += serde_json::to_vec(status)?.len();
    }
    Ok(size)
}

/// Split `completion` so that the serialized actions of each chunk, plus the
/// custom status on the last one, fit in `max_chunk_bytes`.
///
/// # Errors
///
/// Returns [`WorkerError::PayloadTooLarge`] when a single action alone exceeds the budget
/// and [`WorkerError::CustomStatusTooLarge`] when the custom status alone does.
pub fn split_completion(
    completion: OrchestrationCompletion,
    max_chunk_bytes: usize,
) -> Result<Vec<OrchestrationCompletion>, WorkerError> {
    let OrchestrationCompletion {
        instance_id,
        completion_token,
        actions,
        custom_status,
        ..
    } = completion;

    let mut groups: Vec<Vec<crate::OrchestratorAction>> = vec![Vec::new()];
    let mut current_size = 0usize;
    for action in actions {
        let size = action_size(&action)?;
        if size > max_chunk_bytes {
            return Err(WorkerError::PayloadTooLarge {
                action_id: action.id,
                action_kind: action.kind_name(),
                size,
                limit: max_chunk_bytes,
            });
        }
        let start_new = current_size + size > max_chunk_bytes && groups.last().is_some_and(|g| !g.is_empty());
        if start_new {
            groups.push(Vec::new());
            current_size = 0;
        }
        current_size += size;
        if let Some(group) = groups.last_mut() {
            group.push(action);
        }
    }

    if let Some(status) = &custom_status {
        let size = serde_json::to_vec(status)?.len();
        if size > max_chunk_bytes {
            return Err(WorkerError::CustomStatusTooLarge {
                size,
                limit: max_chunk_bytes,
            });
        }
        if current_size + size > max_chunk_bytes && groups.last().is_some_and(|g| !g.is_empty()) {
            groups.push(Vec::new());
        }
    }

    let last = groups.len() - 1;
    Ok(groups
        .into_iter()
        .enumerate()
        .map(|(i, actions)| OrchestrationCompletion {
            instance_id: instance_id.clone(),
            completion_token: completion_token.clone(),
            actions,
            custom_status: if i == last { custom_status.clone() } else { None },
            chunk_index: i as u32,
            is_partial: i != last,
        })
        .collect())
}

/// Rebuild a completion from its chunks, validating their order.
pub fn reassemble(chunks: Vec<OrchestrationCompletion>) -> Result<OrchestrationCompletion, TransportError> {
    const OP: &str = "reassemble_completion";
    let count = chunks.len();
    let mut iter = chunks.into_iter().enumerate();
    let Some((_, mut merged)) = iter.next() else {
        return Err(TransportError::permanent(OP, "no chunks to reassemble"));
    };
    if merged.chunk_index != 0 {
        return Err(TransportError::permanent(
            OP,
            format!("first chunk has index {}", merged.chunk_index),
        ));
    }
    for (i, chunk) in iter {
        if chunk.chunk_index as usize != i {
            return Err(TransportError::permanent(
                OP,
                format!("expected chunk {i}, got chunk {}", chunk.chunk_index),
            ));
        }
        if chunk.completion_token != merged.completion_token {
            return Err(TransportError::permanent(OP, "chunks belong to different work items"));
        }
        merged.actions.extend(chunk.actions);
        merged.custom_status = chunk.custom_status;
        merged.is_partial = chunk.is_partial;
    }
    if merged.is_partial {
        return Err(TransportError::permanent(
            OP,
            format!("final chunk missing after {count} chunks"),
        ));
    }
    merged.chunk_index = 0;
    Ok(merged)
}
