//! Status effect registry: per-entity set of active timed effects.
//!
//! One active instance per kind; a second attach follows the kind's declared
//! refresh policy. Tick-counted effects expire from the scheduler's status
//! tick, wall-clock effects (transformation, call-pet leases) expire from
//! their own subsystems, and the Dead/Ghost meta markers only leave via
//! explicit detach.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::errors::CoreError;
use crate::types::{EntityId, RefreshPolicy, StatusKind};

/// How an effect instance expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EffectExpiry {
    /// Remaining scheduler ticks; decremented by `tick`.
    Ticks(u32),
    /// Wall-clock deadline, checked by the owning subsystem.
    At(DateTime<Utc>),
    /// Never expires on its own (meta markers).
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEffect {
    pub kind: StatusKind,
    pub power: u32,
    pub expiry: EffectExpiry,
    /// Who applied the effect.
    pub source: EntityId,
    /// Ticks elapsed since attach; drives recurring pulses.
    ticks_seen: u32,
}

/// Outcome of an attach against the kind's refresh policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    Attached,
    Replaced,
    Extended,
}

/// Result of advancing all active effects by one scheduler interval.
#[derive(Debug, Default)]
pub struct StatusTickReport {
    /// Kinds that expired this tick; instances already removed.
    pub expired: Vec<StatusKind>,
    /// Recurring pulses due this tick: (kind, power).
    pub pulses: Vec<(StatusKind, u32)>,
}

#[derive(Debug, Default)]
pub struct StatusSet {
    active: HashMap<StatusKind, StatusEffect>,
}

impl StatusSet {
    /// Attach an effect, resolving a same-kind collision per the kind's
    /// refresh policy. Reject-policy kinds fail with a validation error while
    /// an instance is active.
    pub fn attach(
        &mut self,
        kind: StatusKind,
        power: u32,
        expiry: EffectExpiry,
        source: EntityId,
    ) -> Result<AttachOutcome, CoreError> {
        if let Some(existing) = self.active.get_mut(&kind) {
            return match kind.refresh_policy() {
                RefreshPolicy::Replace => {
                    existing.power = power;
                    existing.expiry = expiry;
                    existing.source = source;
                    Ok(AttachOutcome::Replaced)
                }
                RefreshPolicy::Extend => {
                    existing.power = existing.power.max(power);
                    existing.expiry = extend_expiry(existing.expiry, expiry);
                    Ok(AttachOutcome::Extended)
                }
                RefreshPolicy::Reject => {
                    Err(CoreError::validation(format!("{kind:?} already active")))
                }
            };
        }
        self.active.insert(
            kind,
            StatusEffect {
                kind,
                power,
                expiry,
                source,
                ticks_seen: 0,
            },
        );
        Ok(AttachOutcome::Attached)
    }

    /// Remove an effect regardless of remaining duration. This is the only
    /// path that removes meta markers.
    pub fn detach(&mut self, kind: StatusKind) -> Option<StatusEffect> {
        self.active.remove(&kind)
    }

    pub fn query_active(&self, kind: StatusKind) -> Option<&StatusEffect> {
        self.active.get(&kind)
    }

    pub fn active_kinds(&self) -> Vec<StatusKind> {
        self.active.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Advance every tick-counted effect by one scheduler interval. Meta
    /// markers and wall-clock effects are untouched.
    pub fn tick(&mut self) -> StatusTickReport {
        let mut report = StatusTickReport::default();
        let mut expired = Vec::new();
        for (kind, effect) in self.active.iter_mut() {
            if kind.is_meta() {
                continue;
            }
            effect.ticks_seen += 1;
            if let Some(every) = kind.recurring_every() {
                if effect.ticks_seen % every == 0 {
                    report.pulses.push((*kind, effect.power));
                }
            }
            if let EffectExpiry::Ticks(remaining) = &mut effect.expiry {
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 {
                    expired.push(*kind);
                }
            }
        }
        for kind in expired {
            self.active.remove(&kind);
            report.expired.push(kind);
        }
        report
    }

    /// Detach `kind` if it carries a wall-clock deadline that has passed.
    /// Used by the transformation and call-pet expiry subsystems.
    pub fn expire_deadline(&mut self, kind: StatusKind, now: DateTime<Utc>) -> bool {
        let due = matches!(
            self.active.get(&kind),
            Some(StatusEffect {
                expiry: EffectExpiry::At(deadline),
                ..
            }) if *deadline <= now
        );
        if due {
            self.active.remove(&kind);
        }
        due
    }
}

fn extend_expiry(current: EffectExpiry, added: EffectExpiry) -> EffectExpiry {
    match (current, added) {
        (EffectExpiry::Ticks(a), EffectExpiry::Ticks(b)) => EffectExpiry::Ticks(a.saturating_add(b)),
        (EffectExpiry::At(a), EffectExpiry::At(b)) => {
            let gained = b - Utc::now();
            EffectExpiry::At(a + gained.max(chrono::Duration::zero()))
        }
        // Mixed representations fall back to whichever was just applied.
        (_, new) => new,
    }
}
