//! Chunked Runner (C6, §4.5): wraps one bounded call into C5 so the caller
//! (C8) can interleave chunks of many jobs' entities rather than blocking
//! until an entire entity finishes.

use crate::error::Classify;
use crate::executor::{run_entity_sync_chunk, SyncContext, SyncError};
use crate::model::FetchState;

pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// Hard safety cap on chunks per entity (§4.5): guards against a pagination
/// bug that never sets `hasMore=false` turning into an infinite loop that
/// silently never completes.
pub const MAX_CHUNKS_PER_ENTITY: u32 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum ChunkedError {
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("entity `{0}` did not complete within {1} chunks")]
    ChunkCapExceeded(String, u32),
}

impl crate::error::Classify for ChunkedError {
    fn classify(&self) -> crate::error::ErrorClass {
        match self {
            ChunkedError::Sync(e) => e.classify(),
            ChunkedError::ChunkCapExceeded(..) => crate::error::ErrorClass::Fatal,
        }
    }
}

pub struct ChunkedResult {
    pub state: FetchState,
    pub completed: bool,
}

/// One call = one chunk (§4.5's `runEntityChunked`). The chunk-count cap is
/// enforced by the caller looping this; see [`run_entity_to_completion`] for
/// the bounded-loop convenience the runtime actually uses.
pub async fn run_entity_chunked(
    ctx: &SyncContext<'_>,
    entity: &str,
    state: Option<FetchState>,
) -> Result<ChunkedResult, ChunkedError> {
    let next_state = run_entity_sync_chunk(ctx, entity, state, DEFAULT_MAX_ITERATIONS).await?;
    let completed = !next_state.has_more;
    Ok(ChunkedResult {
        state: next_state,
        completed,
    })
}

/// Loops [`run_entity_chunked`] until `completed` or [`MAX_CHUNKS_PER_ENTITY`]
/// is hit, which C8 uses for each entity of a resumable-fetch job (§4.6).
pub async fn run_entity_to_completion(ctx: &SyncContext<'_>, entity: &str) -> Result<(), ChunkedError> {
    let mut state = None;
    for chunk_no in 0..MAX_CHUNKS_PER_ENTITY {
        let result = run_entity_chunked(ctx, entity, state).await?;
        if result.completed {
            return Ok(());
        }
        state = Some(result.state);
        log::debug!("entity {entity}: chunk {chunk_no} complete, more remains");
    }
    Err(ChunkedError::ChunkCapExceeded(entity.to_string(), MAX_CHUNKS_PER_ENTITY))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_iteration_and_chunk_caps_match_spec_defaults() {
        assert_eq!(DEFAULT_MAX_ITERATIONS, 10);
        assert_eq!(MAX_CHUNKS_PER_ENTITY, 1000);
    }
}
