//! Player-to-player trade sessions.
//!
//! A session is shared between exactly two entities. Staging and acceptance
//! happen in each owner's own mutation stream; commit is a two-phase escrow
//! sequenced across both streams so the exchange is all-or-nothing without
//! ever mutating two entities from one job:
//!
//!   1. the side whose accept completed the pair debits its staged resources
//!      into session escrow (revalidating everything it staged),
//!   2. a continuation on the counterpart debits the other side the same way,
//!   3. with both escrows held, each side is credited with the other's escrow.
//!
//! Any revalidation failure before step 3 aborts the session and refunds
//! whatever escrow was already taken. Disconnect of either party aborts.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use log::{debug, info};
use uuid::Uuid;

use crate::entity::Entity;
use crate::errors::CoreError;
use crate::inventory;
use crate::ledger;
use crate::metrics;
use crate::types::{
    CurrencyKind, EntityId, ItemInstance, OutboundMessage, RequestKind, TRADE_SLOT_CAPACITY,
};
use crate::world::{AuditRecord, World};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeState {
    /// Staging and acceptance in progress.
    Open,
    /// Both accepted; escrow debits running. Staging is frozen.
    Validating,
    Committed,
    Aborted,
}

#[derive(Debug)]
struct TradeSide {
    owner: EntityId,
    staged_items: Vec<Uuid>,
    staged_money: u32,
    staged_bound_points: u32,
    accepted: bool,
    escrow_items: Vec<ItemInstance>,
    escrow_taken: bool,
    credit_taken: bool,
}

impl TradeSide {
    fn new(owner: EntityId) -> Self {
        Self {
            owner,
            staged_items: Vec::new(),
            staged_money: 0,
            staged_bound_points: 0,
            accepted: false,
            escrow_items: Vec::new(),
            escrow_taken: false,
            credit_taken: false,
        }
    }
}

#[derive(Debug)]
pub struct TradeSession {
    pub id: Uuid,
    state: TradeState,
    sides: [TradeSide; 2],
}

pub type SharedSession = Arc<Mutex<TradeSession>>;

impl TradeSession {
    fn new(first: EntityId, second: EntityId) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: TradeState::Open,
            sides: [TradeSide::new(first), TradeSide::new(second)],
        }
    }

    pub fn state(&self) -> TradeState {
        self.state
    }

    fn index_of(&self, id: EntityId) -> usize {
        if self.sides[0].owner == id {
            0
        } else {
            1
        }
    }

    fn counterpart_of(&self, id: EntityId) -> EntityId {
        self.sides[1 - self.index_of(id)].owner
    }

    fn both_accepted(&self) -> bool {
        self.sides[0].accepted && self.sides[1].accepted
    }

    /// Any change to staging voids prior acceptance on both sides.
    fn reset_acceptance(&mut self) {
        self.sides[0].accepted = false;
        self.sides[1].accepted = false;
    }
}

fn session_of(entity: &Entity) -> Result<SharedSession, CoreError> {
    entity
        .trade
        .clone()
        .ok_or_else(|| CoreError::validation("no trade in progress"))
}

/// Invite `target` to trade. The invitation lands in the target's request map
/// and must be accepted before a session exists.
pub fn request_trade(entity: &mut Entity, world: &Arc<World>, target: EntityId) -> Result<(), CoreError> {
    if target == entity.id() {
        return Err(CoreError::validation("cannot trade with yourself"));
    }
    if entity.trade.is_some() {
        return Err(CoreError::validation("already trading"));
    }
    if !entity.is_alive() {
        return Err(CoreError::validation("the dead cannot trade"));
    }
    let from = entity.id();
    world.enqueue(target, move |other, world| {
        match other.requests.put(RequestKind::Trade, from, 0) {
            Ok(()) => world.send(other.id(), OutboundMessage::TradeInvited { from }),
            Err(e) => {
                debug!("trade invite from {from} to {} refused: {e}", other.id());
                world.send(
                    from,
                    OutboundMessage::Notice {
                        text: "They are busy right now.".into(),
                    },
                );
            }
        }
    })
}

/// Accept a pending trade invitation from `counterpart`, opening the session
/// on both sides.
pub fn accept_invite(entity: &mut Entity, world: &Arc<World>, counterpart: EntityId) -> Result<(), CoreError> {
    entity
        .requests
        .take_from(RequestKind::Trade, counterpart)
        .ok_or_else(|| CoreError::validation("no trade invitation from them"))?;
    if entity.trade.is_some() {
        return Err(CoreError::validation("already trading"));
    }
    let me = entity.id();
    let session: SharedSession = Arc::new(Mutex::new(TradeSession::new(me, counterpart)));
    entity.trade = Some(Arc::clone(&session));

    let for_other = Arc::clone(&session);
    let result = world.enqueue(counterpart, move |other, world| {
        if other.trade.is_some() {
            abort_session(world, &for_other, "counterpart started another trade");
            return;
        }
        other.trade = Some(Arc::clone(&for_other));
        world.send(
            other.id(),
            OutboundMessage::Notice {
                text: "Trade window opened.".into(),
            },
        );
    });
    if result.is_err() {
        entity.trade = None;
        return Err(CoreError::NotFound(counterpart));
    }
    info!("trade session opened between {me} and {counterpart}");
    Ok(())
}

fn ensure_open(session: &TradeSession) -> Result<(), CoreError> {
    match session.state {
        TradeState::Open => Ok(()),
        TradeState::Validating => Err(CoreError::conflict("trade is committing")),
        TradeState::Committed | TradeState::Aborted => {
            Err(CoreError::conflict("trade already closed"))
        }
    }
}

/// Stage an inventory item. Staged items stay in the owner's inventory until
/// commit; they are revalidated at debit time.
pub fn stage_item(entity: &mut Entity, world: &Arc<World>, uid: Uuid) -> Result<(), CoreError> {
    let session = session_of(entity)?;
    let item = inventory::find_item(&entity.snapshot, uid)
        .ok_or_else(|| CoreError::validation("item not in inventory"))?;
    if !inventory::is_tradeable(item, world.items.as_ref()) {
        return Err(CoreError::validation("item cannot be traded"));
    }
    let counterpart;
    {
        let mut guard = session.lock().expect("trade session poisoned");
        ensure_open(&guard)?;
        let idx = guard.index_of(entity.id());
        if guard.sides[idx].staged_items.contains(&uid) {
            return Err(CoreError::validation("item already staged"));
        }
        if guard.sides[idx].staged_items.len() >= TRADE_SLOT_CAPACITY {
            return Err(CoreError::exhausted(format!(
                "trade window holds {TRADE_SLOT_CAPACITY} items"
            )));
        }
        guard.sides[idx].staged_items.push(uid);
        guard.reset_acceptance();
        counterpart = guard.counterpart_of(entity.id());
    }
    notify_staged(world, entity.id(), counterpart);
    Ok(())
}

/// Pull a staged item back out of the offer.
pub fn unstage_item(entity: &mut Entity, world: &Arc<World>, uid: Uuid) -> Result<(), CoreError> {
    let session = session_of(entity)?;
    let counterpart;
    {
        let mut guard = session.lock().expect("trade session poisoned");
        ensure_open(&guard)?;
        let idx = guard.index_of(entity.id());
        let pos = guard.sides[idx]
            .staged_items
            .iter()
            .position(|staged| *staged == uid)
            .ok_or_else(|| CoreError::validation("item not staged"))?;
        guard.sides[idx].staged_items.remove(pos);
        guard.reset_acceptance();
        counterpart = guard.counterpart_of(entity.id());
    }
    notify_staged(world, entity.id(), counterpart);
    Ok(())
}

/// Stage a money amount (replaces any previously staged amount).
pub fn stage_money(entity: &mut Entity, world: &Arc<World>, amount: u32) -> Result<(), CoreError> {
    stage_currency(entity, world, amount, false)
}

/// Stage bound points (replaces any previously staged amount).
pub fn stage_bound_points(entity: &mut Entity, world: &Arc<World>, amount: u32) -> Result<(), CoreError> {
    stage_currency(entity, world, amount, true)
}

fn stage_currency(
    entity: &mut Entity,
    world: &Arc<World>,
    amount: u32,
    bound: bool,
) -> Result<(), CoreError> {
    let session = session_of(entity)?;
    let kind = if bound {
        CurrencyKind::BoundPoints
    } else {
        CurrencyKind::Money
    };
    if (amount as u64) > ledger::balance(&entity.snapshot, kind) {
        return Err(CoreError::InsufficientFunds);
    }
    let counterpart;
    {
        let mut guard = session.lock().expect("trade session poisoned");
        ensure_open(&guard)?;
        let idx = guard.index_of(entity.id());
        if bound {
            guard.sides[idx].staged_bound_points = amount;
        } else {
            guard.sides[idx].staged_money = amount;
        }
        guard.reset_acceptance();
        counterpart = guard.counterpart_of(entity.id());
    }
    notify_staged(world, entity.id(), counterpart);
    Ok(())
}

fn notify_staged(world: &Arc<World>, me: EntityId, counterpart: EntityId) {
    world.send(
        me,
        OutboundMessage::TradeStaged {
            counterpart_accepted: false,
        },
    );
    world.send(
        counterpart,
        OutboundMessage::TradeStaged {
            counterpart_accepted: false,
        },
    );
}

/// Mark this side accepted. When both sides stand accepted, staging freezes
/// and the escrow commit chain starts in this entity's stream.
pub fn accept_offer(entity: &mut Entity, world: &Arc<World>) -> Result<(), CoreError> {
    let session = session_of(entity)?;
    let (counterpart, start_commit);
    {
        let mut guard = session.lock().expect("trade session poisoned");
        ensure_open(&guard)?;
        let idx = guard.index_of(entity.id());
        guard.sides[idx].accepted = true;
        counterpart = guard.counterpart_of(entity.id());
        start_commit = guard.both_accepted();
        if start_commit {
            guard.state = TradeState::Validating;
        }
    }
    world.send(
        counterpart,
        OutboundMessage::TradeStaged {
            counterpart_accepted: true,
        },
    );
    if start_commit {
        commit_first_phase(entity, world, &session);
    }
    Ok(())
}

/// Cancel the session from this entity's side (player action or detach).
///
/// This is the backstop that keeps escrow disconnect-safe: with `&mut Entity`
/// in hand it can settle this side directly even when the mutation stream that
/// would normally carry the refund or credit is already closed.
pub fn cancel_trade(entity: &mut Entity, world: &Arc<World>, reason: &str) {
    let Some(session) = entity.trade.take() else {
        return;
    };
    let committed = session.lock().expect("trade session poisoned").state == TradeState::Committed;
    if committed {
        // The exchange already went through; collect any credit still owed.
        credit_from_escrow(entity, world, &session);
    } else {
        abort_session(world, &session, reason);
        reclaim_own_escrow(entity, &session);
    }
}

// ----------------------------------------------------------------------------
// Commit machinery
// ----------------------------------------------------------------------------

/// Revalidate and pull this side's staged resources into session escrow, and
/// confirm this side has room to receive what the counterpart staged.
fn debit_into_escrow(entity: &mut Entity, world: &Arc<World>, session: &SharedSession) -> Result<(), CoreError> {
    let mut guard = session.lock().expect("trade session poisoned");
    let idx = guard.index_of(entity.id());
    let other = 1 - idx;

    // Receive-side checks first: incoming items must fit (net of outgoing)
    // and incoming currency must not overflow the cap.
    let incoming_items = guard.sides[other].staged_items.len();
    let outgoing_items = guard.sides[idx].staged_items.len();
    let free = inventory::free_slots(&entity.snapshot) + outgoing_items;
    if incoming_items > free {
        return Err(CoreError::exhausted("not enough room for offered items"));
    }
    for (kind, incoming, outgoing) in [
        (
            CurrencyKind::Money,
            guard.sides[other].staged_money,
            guard.sides[idx].staged_money,
        ),
        (
            CurrencyKind::BoundPoints,
            guard.sides[other].staged_bound_points,
            guard.sides[idx].staged_bound_points,
        ),
    ] {
        let after =
            ledger::balance(&entity.snapshot, kind).saturating_sub(outgoing as u64) + incoming as u64;
        if after > kind.max_value() {
            return Err(CoreError::validation("receiving would exceed the currency cap"));
        }
    }

    // Debit items: every staged item must still be held and tradeable.
    let staged = guard.sides[idx].staged_items.clone();
    let mut escrow = Vec::with_capacity(staged.len());
    for uid in &staged {
        let held = inventory::find_item(&entity.snapshot, *uid)
            .ok_or_else(|| CoreError::conflict("staged item no longer held"))?;
        if !inventory::is_tradeable(held, world.items.as_ref()) {
            return Err(CoreError::conflict("staged item became untradeable"));
        }
        escrow.push(*uid);
    }
    let money = guard.sides[idx].staged_money as u64;
    let points = guard.sides[idx].staged_bound_points as u64;
    ledger::spend(&mut entity.snapshot, CurrencyKind::Money, money)?;
    if let Err(e) = ledger::spend(&mut entity.snapshot, CurrencyKind::BoundPoints, points) {
        // Compensate the money debit that already landed.
        ledger::award(&mut entity.snapshot, CurrencyKind::Money, money);
        return Err(e);
    }
    for uid in escrow {
        let item = inventory::remove_item(&mut entity.snapshot, uid)?;
        guard.sides[idx].escrow_items.push(item);
    }
    guard.sides[idx].escrow_taken = true;
    Ok(())
}

/// Hand this side the counterpart's escrow. Both escrows are held when this
/// runs, so it cannot fail. Idempotent: the credit is delivered exactly once
/// even when both the continuation and the detach path reach for it.
fn credit_from_escrow(entity: &mut Entity, world: &Arc<World>, session: &SharedSession) {
    let taken = {
        let mut guard = session.lock().expect("trade session poisoned");
        let idx = guard.index_of(entity.id());
        if guard.sides[idx].credit_taken {
            None
        } else {
            guard.sides[idx].credit_taken = true;
            let other = 1 - idx;
            Some((
                std::mem::take(&mut guard.sides[other].escrow_items),
                guard.sides[other].staged_money as u64,
                guard.sides[other].staged_bound_points as u64,
            ))
        }
    };
    let Some((items, money, points)) = taken else {
        return;
    };
    for item in items {
        world.send(entity.id(), OutboundMessage::ItemGained { item: item.clone() });
        // Capacity was reserved during the debit phase.
        entity.snapshot.inventory.push(item);
    }
    ledger::award(&mut entity.snapshot, CurrencyKind::Money, money);
    ledger::award(&mut entity.snapshot, CurrencyKind::BoundPoints, points);
    entity.snapshot.touch();
    world.persist_entity(&entity.snapshot);
}

/// Phase one, in the stream of the side whose accept completed the pair.
fn commit_first_phase(entity: &mut Entity, world: &Arc<World>, session: &SharedSession) {
    if let Err(e) = debit_into_escrow(entity, world, session) {
        debug!("trade debit failed for {}: {e}", entity.id());
        abort_session(world, session, "your offer could not be validated");
        return;
    }
    let counterpart = session
        .lock()
        .expect("trade session poisoned")
        .counterpart_of(entity.id());
    let chained = Arc::clone(session);
    if world
        .enqueue(counterpart, move |other, world| {
            commit_second_phase(other, world, &chained);
        })
        .is_err()
    {
        abort_session(world, session, "counterpart disconnected");
    }
}

/// Phase two, in the counterpart's stream: debit this side, then credit both.
fn commit_second_phase(entity: &mut Entity, world: &Arc<World>, session: &SharedSession) {
    {
        let guard = session.lock().expect("trade session poisoned");
        if guard.state != TradeState::Validating {
            return;
        }
    }
    if let Err(e) = debit_into_escrow(entity, world, session) {
        debug!("trade debit failed for {}: {e}", entity.id());
        abort_session(world, session, "their offer could not be validated");
        return;
    }

    let sealed = {
        let mut guard = session.lock().expect("trade session poisoned");
        if guard.state != TradeState::Validating {
            None
        } else {
            guard.state = TradeState::Committed;
            let record = AuditRecord::TradeCommitted {
                session: guard.id,
                first: guard.sides[0].owner,
                second: guard.sides[1].owner,
                first_items: guard.sides[0].escrow_items.len() as u32,
                first_money: guard.sides[0].staged_money,
                second_items: guard.sides[1].escrow_items.len() as u32,
                second_money: guard.sides[1].staged_money,
                at: Utc::now(),
            };
            Some((guard.id, guard.sides[0].owner, guard.sides[1].owner, record))
        }
    };
    let Some((session_id, first, second, record)) = sealed else {
        // The counterpart aborted while our debit ran. The abort either queued
        // our refund or left the escrow in the session; take back what it left.
        reclaim_own_escrow(entity, session);
        return;
    };

    // Credit this side now; the counterpart's credit is a continuation.
    credit_from_escrow(entity, world, session);
    entity.trade = None;
    world.send(entity.id(), OutboundMessage::TradeCommitted { session: session_id });

    let counterpart = if first == entity.id() { second } else { first };
    let chained = Arc::clone(session);
    // If the counterpart's stream is already gone, the credit stays in the
    // session and its detach path collects it.
    let _ = world.enqueue(counterpart, move |other, world| {
        credit_from_escrow(other, world, &chained);
        other.trade = None;
        world.send(other.id(), OutboundMessage::TradeCommitted { session: session_id });
    });

    world.write_audit(record);
    metrics::inc_trade_committed();
    info!("trade {session_id} committed between {first} and {second}");
}

/// Mark the session aborted (idempotent), refund any escrow already taken,
/// and clear both parties' session references.
///
/// Refunds travel through each owner's stream. When a stream is already
/// closed the escrow stays in the session instead, where that owner's detach
/// path (`cancel_trade` -> `reclaim_own_escrow`) hands it back directly.
fn abort_session(world: &Arc<World>, session: &SharedSession, reason: &str) {
    let (session_id, owners) = {
        let mut guard = session.lock().expect("trade session poisoned");
        match guard.state {
            TradeState::Committed | TradeState::Aborted => return,
            _ => guard.state = TradeState::Aborted,
        }
        (guard.id, [guard.sides[0].owner, guard.sides[1].owner])
    };

    for owner in owners {
        let taken = {
            let mut guard = session.lock().expect("trade session poisoned");
            let idx = guard.index_of(owner);
            if guard.sides[idx].escrow_taken {
                guard.sides[idx].escrow_taken = false;
                Some((
                    std::mem::take(&mut guard.sides[idx].escrow_items),
                    guard.sides[idx].staged_money as u64,
                    guard.sides[idx].staged_bound_points as u64,
                ))
            } else {
                None
            }
        };
        let Some((items, money, points)) = taken else {
            continue;
        };
        let queued_items = items.clone();
        let queued = world.enqueue(owner, move |e, world| {
            for item in queued_items {
                // Returning escrowed property; capacity cannot refuse it.
                e.snapshot.inventory.push(item);
            }
            ledger::award(&mut e.snapshot, CurrencyKind::Money, money);
            ledger::award(&mut e.snapshot, CurrencyKind::BoundPoints, points);
            e.snapshot.touch();
            world.persist_entity(&e.snapshot);
        });
        if queued.is_err() {
            let mut guard = session.lock().expect("trade session poisoned");
            let idx = guard.index_of(owner);
            guard.sides[idx].escrow_items = items;
            guard.sides[idx].escrow_taken = true;
        }
    }

    let reason = reason.to_string();
    for owner in owners {
        let session_ref = Arc::clone(session);
        let text = reason.clone();
        let _ = world.enqueue(owner, move |e, world| {
            if e.trade.as_ref().is_some_and(|s| Arc::ptr_eq(s, &session_ref)) {
                e.trade = None;
            }
            world.send(
                e.id(),
                OutboundMessage::TradeAborted {
                    session: session_id,
                    reason: text,
                },
            );
        });
    }
    metrics::inc_trade_aborted();
    info!("trade {session_id} aborted: {reason}");
}

/// Take this side's escrow back out of an aborted session, for the detach
/// path where the refund can no longer be delivered through the stream.
fn reclaim_own_escrow(entity: &mut Entity, session: &SharedSession) {
    let reclaimed = {
        let mut guard = session.lock().expect("trade session poisoned");
        let idx = guard.index_of(entity.id());
        if guard.sides[idx].escrow_taken {
            guard.sides[idx].escrow_taken = false;
            Some((
                std::mem::take(&mut guard.sides[idx].escrow_items),
                guard.sides[idx].staged_money as u64,
                guard.sides[idx].staged_bound_points as u64,
            ))
        } else {
            None
        }
    };
    let Some((items, money, points)) = reclaimed else {
        return;
    };
    for item in items {
        entity.snapshot.inventory.push(item);
    }
    ledger::award(&mut entity.snapshot, CurrencyKind::Money, money);
    ledger::award(&mut entity.snapshot, CurrencyKind::BoundPoints, points);
    entity.snapshot.touch();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acceptance_resets_when_staging_changes() {
        let mut session = TradeSession::new(EntityId(1), EntityId(2));
        session.sides[0].accepted = true;
        session.sides[1].accepted = true;
        session.reset_acceptance();
        assert!(!session.both_accepted());
        assert!(!session.sides[0].accepted);
    }

    #[test]
    fn counterpart_lookup_is_symmetric() {
        let session = TradeSession::new(EntityId(1), EntityId(2));
        assert_eq!(session.counterpart_of(EntityId(1)), EntityId(2));
        assert_eq!(session.counterpart_of(EntityId(2)), EntityId(1));
    }

    #[test]
    fn reclaim_returns_undelivered_escrow_exactly_once() {
        use crate::entity::EntitySnapshot;
        use crate::types::Position;

        let mut entity = Entity::from_snapshot(EntitySnapshot::new(
            EntityId(1),
            "alice",
            10,
            Position {
                map_id: 1002,
                x: 300,
                y: 300,
            },
        ));
        let session: SharedSession = Arc::new(Mutex::new(TradeSession::new(EntityId(1), EntityId(2))));
        {
            let mut guard = session.lock().unwrap();
            guard.state = TradeState::Aborted;
            guard.sides[0].staged_money = 250;
            guard.sides[0].escrow_items.push(ItemInstance::new(300));
            guard.sides[0].escrow_taken = true;
        }
        reclaim_own_escrow(&mut entity, &session);
        assert_eq!(entity.snapshot.money, 250);
        assert_eq!(entity.snapshot.inventory.len(), 1);

        reclaim_own_escrow(&mut entity, &session);
        assert_eq!(entity.snapshot.money, 250);
        assert_eq!(entity.snapshot.inventory.len(), 1);
    }
}
