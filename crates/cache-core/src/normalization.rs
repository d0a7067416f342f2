use crate::{
    error::{CacheError, CacheErrorCategory},
    events::{MutationAck, SyncEvent},
    types::{MutationState, PendingHandle},
};

/// Convert a settle outcome into a stable `SyncEvent::MutationSettled`.
pub fn normalize_settlement<T>(handle: &PendingHandle, outcome: &Result<T, CacheError>) -> SyncEvent {
    let (state, error_code) = match outcome {
        Ok(_) => (MutationState::Committed, None),
        Err(error) => (MutationState::RolledBack, Some(error.code.clone())),
    };
    SyncEvent::MutationSettled(MutationAck {
        txn_id: handle.txn_id,
        kind: handle.kind,
        state,
        error_code,
    })
}

/// Convert a generic transport failure message to a remote-classified error.
pub fn classify_transport_error(message: impl Into<String>) -> CacheError {
    CacheError::new(CacheErrorCategory::Remote, "transport_failed", message.into())
}
