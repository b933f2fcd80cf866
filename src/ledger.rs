//! Currency and attribute point ledger.
//!
//! All operations are check-then-apply against a single entity's snapshot and
//! run inside that entity's mutation stream, so no further synchronization is
//! needed. Awards always succeed and clamp at the per-currency maximum;
//! spends fail whole when the balance is short. Cross-entity transfers are
//! composed by the exchange protocols from pairs of these single-entity
//! operations, never here.

use crate::entity::EntitySnapshot;
use crate::errors::CoreError;
use crate::types::CurrencyKind;

/// Current balance of a currency.
pub fn balance(snapshot: &EntitySnapshot, kind: CurrencyKind) -> u64 {
    match kind {
        CurrencyKind::Money => snapshot.money as u64,
        CurrencyKind::BoundPoints => snapshot.bound_points as u64,
        CurrencyKind::UnboundPoints => snapshot.unbound_points as u64,
        CurrencyKind::VirtuePoints => snapshot.virtue_points as u64,
        CurrencyKind::AttributePoints => snapshot.attribute_points as u64,
    }
}

fn write_balance(snapshot: &mut EntitySnapshot, kind: CurrencyKind, value: u64) {
    match kind {
        CurrencyKind::Money => snapshot.money = value as u32,
        CurrencyKind::BoundPoints => snapshot.bound_points = value as u32,
        CurrencyKind::UnboundPoints => snapshot.unbound_points = value as u32,
        CurrencyKind::VirtuePoints => snapshot.virtue_points = value as u32,
        CurrencyKind::AttributePoints => snapshot.attribute_points = value as u16,
    }
    snapshot.touch();
}

/// Increase a balance, clamping at the currency's maximum. Returns the amount
/// actually credited.
pub fn award(snapshot: &mut EntitySnapshot, kind: CurrencyKind, amount: u64) -> u64 {
    if amount == 0 {
        return 0;
    }
    let before = balance(snapshot, kind);
    let after = before.saturating_add(amount).min(kind.max_value());
    if after != before {
        write_balance(snapshot, kind, after);
    }
    after - before
}

/// Decrease a balance, failing whole with `InsufficientFunds` when the
/// balance is short. The balance is untouched on failure.
pub fn spend(snapshot: &mut EntitySnapshot, kind: CurrencyKind, amount: u64) -> Result<(), CoreError> {
    let before = balance(snapshot, kind);
    if amount > before {
        return Err(CoreError::InsufficientFunds);
    }
    if amount > 0 {
        write_balance(snapshot, kind, before - amount);
    }
    Ok(())
}

/// Signed convenience wrapper dispatching to award or spend.
pub fn change(snapshot: &mut EntitySnapshot, kind: CurrencyKind, delta: i64) -> Result<(), CoreError> {
    if delta >= 0 {
        award(snapshot, kind, delta as u64);
        Ok(())
    } else {
        spend(snapshot, kind, delta.unsigned_abs())
    }
}
