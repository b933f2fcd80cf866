//! Per-entity tick scheduler.
//!
//! The world's tick driver enqueues `run_entity_tick` onto every connected
//! entity's mutation stream once per base interval. Inside the tick, a fixed
//! table of subsystems runs in order; each subsystem paces itself by
//! comparing elapsed time against its own last-fired instant, so a slow or
//! skipped tick never double-fires anything and subsystems with different
//! periods coexist on one driver.
//!
//! Fault isolation: a subsystem returning an error is logged and counted, and
//! the remaining subsystems in the same tick still run. Dead entities run a
//! reduced subset (message boxes and relationship timers keep working while
//! the body is on the floor).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use log::warn;
use rand::Rng;
use tokio::time::Instant;

use crate::entity::Entity;
use crate::inventory;
use crate::metrics;
use crate::types::{ExpiryConsequence, ItemInstance, OutboundMessage, StatusKind};
use crate::world::World;

/// Item type produced by a successful auto-mine swing.
pub const ORE_ITEM_ID: u32 = 1072;
/// Percent chance one swing yields ore.
const MINE_YIELD_PERCENT: u32 = 30;
/// Mana drained per channelled spell pulse.
pub const SPELL_MANA_COST: u16 = 5;

/// Last-fired instants, one slot per subsystem name. Self-pacing state is
/// per-entity so a freshly connected entity does not inherit another's phase.
#[derive(Debug, Default)]
pub struct SubsystemTimers {
    last: HashMap<&'static str, Instant>,
}

impl SubsystemTimers {
    /// True when at least `interval` has elapsed since this subsystem last
    /// fired for this entity; records the new firing instant when so.
    pub fn due(&mut self, name: &'static str, interval: Duration) -> bool {
        let now = Instant::now();
        match self.last.get(name) {
            Some(prev) if now.duration_since(*prev) < interval => false,
            _ => {
                self.last.insert(name, now);
                true
            }
        }
    }
}

type Subsystem = fn(&mut Entity, &Arc<World>) -> Result<()>;

/// Fixed execution order. The bool marks subsystems that still run while the
/// entity is dead.
const SUBSYSTEMS: &[(&str, bool, Subsystem)] = &[
    ("status_tick", false, status_tick),
    ("pk_decay", false, pk_decay),
    ("regen", false, regen),
    ("mentor_drip", false, mentor_drip),
    ("lucky_decay", false, lucky_decay),
    ("vigor_regen", false, vigor_regen),
    ("transformation_expiry", false, transformation_expiry),
    ("callpet_expiry", false, callpet_expiry),
    ("auto_mine", false, auto_mine),
    ("auto_heal", false, auto_heal),
    ("message_box_expiry", true, message_box_expiry),
    ("team_leader_ping", false, team_leader_ping),
    ("betrayal_check", true, betrayal_check),
    ("battle_cadence", false, battle_cadence),
    ("spell_cadence", false, spell_cadence),
];

/// One scheduler pass over a single entity. Always runs every eligible
/// subsystem; an error in one is contained to that subsystem.
pub fn run_entity_tick(entity: &mut Entity, world: &Arc<World>) {
    metrics::inc_ticks_run();
    let alive = entity.is_alive();
    for &(name, runs_when_dead, subsystem) in SUBSYSTEMS {
        if !alive && !runs_when_dead {
            continue;
        }
        match subsystem(entity, world) {
            Ok(()) => metrics::record_subsystem_run(name),
            Err(e) => {
                metrics::inc_subsystem_fault();
                warn!("{} subsystem {name} failed: {e:#}", entity.id());
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Subsystems
// ----------------------------------------------------------------------------

/// Advance tick-counted status effects: recurring pulses (poison), expiries,
/// and the stat resync both imply.
fn status_tick(entity: &mut Entity, world: &Arc<World>) -> Result<()> {
    // Pulse sources must be read before tick() can expire the instances.
    let poison_source = entity
        .statuses
        .query_active(StatusKind::Poison)
        .map(|e| e.source);
    let report = entity.statuses.tick();
    entity.counters.status_ticks += 1;

    for (kind, power) in &report.pulses {
        if *kind == StatusKind::Poison {
            let killed = entity.take_damage(*power);
            world.sync_attributes(entity);
            if killed {
                let killer = poison_source.unwrap_or_else(|| entity.id());
                crate::combat::handle_death(entity, world, killer);
            }
        }
    }
    if !report.expired.is_empty() {
        entity.clamp_vitals(world.items.as_ref());
        for kind in &report.expired {
            world.send(entity.id(), OutboundMessage::StatusRemoved { status: *kind });
        }
        world.sync_attributes(entity);
    }
    Ok(())
}

/// PK points bleed off over time so a flagged name eventually clears.
fn pk_decay(entity: &mut Entity, world: &Arc<World>) -> Result<()> {
    let interval = Duration::from_secs(world.config.pk.decay_secs);
    if !entity.timers.due("pk_decay", interval) || entity.snapshot.pk_points == 0 {
        return Ok(());
    }
    entity.snapshot.pk_points = entity
        .snapshot
        .pk_points
        .saturating_sub(world.config.pk.decay_amount);
    entity.snapshot.touch();
    world.persist_entity(&entity.snapshot);
    Ok(())
}

fn regen(entity: &mut Entity, world: &Arc<World>) -> Result<()> {
    let cfg = &world.config.regen;
    if !entity.timers.due("regen", Duration::from_secs(cfg.pulse_secs)) {
        return Ok(());
    }
    entity.counters.regen_pulses += 1;
    let healed = entity.heal(cfg.life_per_pulse, world.items.as_ref());
    let restored = entity.restore_mana(cfg.mana_per_pulse, world.items.as_ref());
    if healed > 0 || restored > 0 {
        world.sync_attributes(entity);
    }
    Ok(())
}

/// Transfer a slice of banked mentor credit to the online mentor as
/// experience.
fn mentor_drip(entity: &mut Entity, world: &Arc<World>) -> Result<()> {
    let cfg = &world.config.mentor;
    if !entity.timers.due("mentor_drip", Duration::from_secs(cfg.drip_secs)) {
        return Ok(());
    }
    let Some(mentor) = entity.mentor else {
        return Ok(());
    };
    if entity.snapshot.mentor_credit == 0 || world.handle(mentor).is_none() {
        return Ok(());
    }
    let amount = entity.snapshot.mentor_credit.min(cfg.drip_amount);
    entity.snapshot.mentor_credit -= amount;
    entity.snapshot.touch();
    entity.counters.mentor_drips += 1;
    if world
        .enqueue(mentor, move |m, w| w.grant_experience(m, amount))
        .is_err()
    {
        // Mentor vanished between the check and the enqueue; keep the credit.
        entity.snapshot.mentor_credit += amount;
    }
    world.persist_entity(&entity.snapshot);
    Ok(())
}

/// Count lucky time down in wall-clock seconds; the buff marker detaches when
/// the balance runs out.
fn lucky_decay(entity: &mut Entity, world: &Arc<World>) -> Result<()> {
    if !entity.timers.due("lucky_decay", Duration::from_secs(1))
        || entity.snapshot.lucky_time_secs == 0
    {
        return Ok(());
    }
    entity.snapshot.lucky_time_secs -= 1;
    if entity.snapshot.lucky_time_secs == 0 {
        world.detach_status(entity, StatusKind::LuckyTime);
    }
    Ok(())
}

fn vigor_regen(entity: &mut Entity, world: &Arc<World>) -> Result<()> {
    let cfg = &world.config.regen;
    if !entity
        .timers
        .due("vigor_regen", Duration::from_secs(cfg.vigor_pulse_secs))
    {
        return Ok(());
    }
    if entity.snapshot.vigor >= cfg.max_vigor {
        return Ok(());
    }
    let mut pulse = cfg.vigor_per_pulse as u32;
    if let Some(tonic) = entity.statuses.query_active(StatusKind::VigorTonic) {
        pulse += tonic.power;
    }
    entity.snapshot.vigor = entity
        .snapshot
        .vigor
        .saturating_add(pulse.min(u16::MAX as u32) as u16)
        .min(cfg.max_vigor);
    entity.snapshot.touch();
    Ok(())
}

/// Wall-clock expiry for the transformation lease.
fn transformation_expiry(entity: &mut Entity, world: &Arc<World>) -> Result<()> {
    if entity
        .statuses
        .expire_deadline(StatusKind::Transformed, Utc::now())
    {
        entity.clamp_vitals(world.items.as_ref());
        world.send(
            entity.id(),
            OutboundMessage::StatusRemoved {
                status: StatusKind::Transformed,
            },
        );
        world.sync_attributes(entity);
    }
    Ok(())
}

/// Wall-clock expiry for the summoned-pet lease.
fn callpet_expiry(entity: &mut Entity, world: &Arc<World>) -> Result<()> {
    if entity
        .statuses
        .expire_deadline(StatusKind::CallPet, Utc::now())
    {
        world.send(
            entity.id(),
            OutboundMessage::StatusRemoved {
                status: StatusKind::CallPet,
            },
        );
    }
    Ok(())
}

/// Swing at the ground: needs the entity's map, a mineable region, and a free
/// inventory slot. Map lookup failure is a contained subsystem fault.
fn auto_mine(entity: &mut Entity, world: &Arc<World>) -> Result<()> {
    let interval = Duration::from_secs(world.config.scheduler.auto_mine_secs);
    if !entity.mining || !entity.timers.due("auto_mine", interval) {
        return Ok(());
    }
    let pos = entity.snapshot.position;
    let map = world
        .maps
        .map(pos.map_id)
        .ok_or_else(|| anyhow!("map {} unavailable", pos.map_id))?;
    if !map.mine_region(pos.x, pos.y) {
        entity.mining = false;
        world.send(
            entity.id(),
            OutboundMessage::Notice {
                text: "There is nothing to mine here.".into(),
            },
        );
        return Ok(());
    }
    entity.counters.auto_mine_swings += 1;
    if rand::thread_rng().gen_range(0..100) < MINE_YIELD_PERCENT {
        let ore = ItemInstance::new(ORE_ITEM_ID);
        match inventory::add_item(&mut entity.snapshot, ore.clone()) {
            Ok(()) => {
                world.send(entity.id(), OutboundMessage::ItemGained { item: ore });
                world.persist_entity(&entity.snapshot);
            }
            Err(_) => {
                entity.mining = false;
                world.send(
                    entity.id(),
                    OutboundMessage::Notice {
                        text: "Your pack is full; you stop mining.".into(),
                    },
                );
            }
        }
    }
    Ok(())
}

/// Consume a potion (an unslotted item with a life bonus) while wounded.
fn auto_heal(entity: &mut Entity, world: &Arc<World>) -> Result<()> {
    let interval = Duration::from_secs(world.config.scheduler.auto_heal_secs);
    if !entity.auto_heal || !entity.timers.due("auto_heal", interval) {
        return Ok(());
    }
    let max_life = entity.derive(world.items.as_ref()).max_life;
    if entity.snapshot.life >= max_life {
        return Ok(());
    }
    let potion = entity.snapshot.inventory.iter().find_map(|item| {
        world.items.item_stats(item.item_id).and_then(|stats| {
            (stats.slot.is_none() && stats.life_bonus > 0).then_some((item.uid, stats.life_bonus))
        })
    });
    let Some((uid, potency)) = potion else {
        entity.auto_heal = false;
        world.send(
            entity.id(),
            OutboundMessage::Notice {
                text: "Out of potions; auto-heal stops.".into(),
            },
        );
        return Ok(());
    };
    inventory::remove_item(&mut entity.snapshot, uid)?;
    entity.heal(potency, world.items.as_ref());
    entity.counters.auto_heal_pulses += 1;
    world.send(entity.id(), OutboundMessage::ItemRemoved { uid });
    world.sync_attributes(entity);
    world.persist_entity(&entity.snapshot);
    Ok(())
}

/// Enforce each expired timed message box's consequence exactly once.
fn message_box_expiry(entity: &mut Entity, world: &Arc<World>) -> Result<()> {
    let now = Utc::now();
    let id = entity.id();
    let (expired, keep): (Vec<_>, Vec<_>) = entity
        .message_boxes
        .drain(..)
        .partition(|boxed| boxed.expires_at <= now);
    entity.message_boxes = keep;
    let mut force_logout = false;
    for boxed in expired {
        world.send(id, OutboundMessage::MessageBoxExpired { id: boxed.id });
        match boxed.on_expiry {
            ExpiryConsequence::DefaultDecline => {}
            ExpiryConsequence::ForceLogout => force_logout = true,
        }
    }
    if force_logout {
        world.disconnect(id);
    }
    Ok(())
}

/// The team leader broadcasts their position so members can follow.
fn team_leader_ping(entity: &mut Entity, world: &Arc<World>) -> Result<()> {
    let interval = Duration::from_secs(world.config.scheduler.leader_ping_secs);
    let Some(team) = entity.team else {
        return Ok(());
    };
    if world.teams.leader(team) != Some(entity.id()) || !entity.timers.due("team_leader_ping", interval)
    {
        return Ok(());
    }
    let position = entity.snapshot.position;
    for member in world.teams.members(team) {
        if member != entity.id() {
            world.send(member, OutboundMessage::TeamLeaderPosition { position });
        }
    }
    Ok(())
}

/// A pending guild betrayal lands its consequence after the grace period.
fn betrayal_check(entity: &mut Entity, world: &Arc<World>) -> Result<()> {
    let Some(since) = entity.pending_betrayal else {
        return Ok(());
    };
    let grace = chrono::Duration::seconds(world.config.scheduler.betrayal_grace_secs);
    if Utc::now() - since < grace {
        return Ok(());
    }
    entity.pending_betrayal = None;
    // The betrayer loses their mentor relationship along with the guild.
    entity.mentor = None;
    world.send(
        entity.id(),
        OutboundMessage::Notice {
            text: "Your betrayal is complete; old bonds are severed.".into(),
        },
    );
    Ok(())
}

fn battle_cadence(entity: &mut Entity, world: &Arc<World>) -> Result<()> {
    let interval = Duration::from_millis(world.config.combat.attack_cadence_ms);
    if entity.battle.is_none() || !entity.timers.due("battle_cadence", interval) {
        return Ok(());
    }
    if entity.statuses.query_active(StatusKind::Stun).is_some() {
        return Ok(());
    }
    crate::combat::perform_attack_round(entity, world)
}

fn spell_cadence(entity: &mut Entity, world: &Arc<World>) -> Result<()> {
    let interval = Duration::from_millis(world.config.combat.spell_cadence_ms);
    if entity.active_spell.is_none() || !entity.timers.due("spell_cadence", interval) {
        return Ok(());
    }
    if entity.statuses.query_active(StatusKind::Stun).is_some() {
        return Ok(());
    }
    crate::combat::perform_spell_pulse(entity, world)
}
