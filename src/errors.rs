use thiserror::Error;

use crate::types::{EntityId, RequestKind};

/// Errors surfaced by gameplay-core operations.
///
/// The variants follow the handling policy they require rather than the module
/// they come from: validation failures reject locally with no state change,
/// concurrency conflicts abort the enclosing protocol session, and persistence
/// failures are logged without rolling back in-memory state.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A precondition was not met; the operation was rejected with no state change.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Spend amount exceeded the current balance.
    #[error("insufficient funds")]
    InsufficientFunds,

    /// A staged resource became unavailable before commit; the enclosing
    /// protocol session must abort.
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// A durable write failed. In-memory state stays authoritative; the next
    /// write-through retries.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// Inventory or trade-slot capacity exceeded.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Snapshot missing or corrupt at connect time; the session is refused.
    #[error("fatal load error for {0}: {1}")]
    FatalLoad(EntityId, String),

    /// Referenced entity is not connected or does not exist.
    #[error("entity not found: {0}")]
    NotFound(EntityId),

    /// A request of this kind is already pending for the entity.
    #[error("request already pending: {0:?}")]
    RequestPending(RequestKind),

    /// The target entity's mutation stream is gone (disconnecting or closed).
    #[error("entity stream closed: {0}")]
    StreamClosed(EntityId),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        CoreError::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        CoreError::ConcurrencyConflict(msg.into())
    }

    pub fn exhausted(msg: impl Into<String>) -> Self {
        CoreError::ResourceExhausted(msg.into())
    }
}
