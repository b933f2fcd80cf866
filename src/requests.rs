//! Per-entity pending request map.
//!
//! One outstanding request per kind; confirm/deny flows initiated by the
//! counterpart consume the entry. A stale request is silently displaced only
//! when it has outlived its time-to-live.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use crate::errors::CoreError;
use crate::types::{EntityId, RequestKind};

/// How long a pending request stays valid before a new one may displace it.
const REQUEST_TTL_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub from: EntityId,
    /// Auxiliary datum (e.g. proposed team id, mentor terms).
    pub datum: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct RequestMap {
    pending: HashMap<RequestKind, PendingRequest>,
}

impl RequestMap {
    /// Record an incoming request. Fails while a live request of the same
    /// kind is already pending.
    pub fn put(&mut self, kind: RequestKind, from: EntityId, datum: u32) -> Result<(), CoreError> {
        let now = Utc::now();
        if let Some(existing) = self.pending.get(&kind) {
            if now - existing.created_at < Duration::seconds(REQUEST_TTL_SECS) {
                return Err(CoreError::RequestPending(kind));
            }
        }
        self.pending.insert(
            kind,
            PendingRequest {
                from,
                datum,
                created_at: now,
            },
        );
        Ok(())
    }

    pub fn get(&self, kind: RequestKind) -> Option<&PendingRequest> {
        self.pending.get(&kind)
    }

    /// Consume the pending request of `kind` if it came from `from`.
    /// Confirm and deny flows both go through here so the entry is cleared
    /// exactly once.
    pub fn take_from(&mut self, kind: RequestKind, from: EntityId) -> Option<PendingRequest> {
        match self.pending.get(&kind) {
            Some(pending) if pending.from == from => self.pending.remove(&kind),
            _ => None,
        }
    }

    /// Drop the pending request of `kind`, whoever sent it.
    pub fn clear(&mut self, kind: RequestKind) -> Option<PendingRequest> {
        self.pending.remove(&kind)
    }

    /// Drop every pending request (entity detach).
    pub fn clear_all(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
