//! Battle invocation: when to swing, who resolves damage, what a kill does.
//!
//! The core never computes damage. It decides cadence (scheduler), assembles
//! `CombatSnapshot`s, invokes the injected `CombatResolver`, and applies the
//! outcome inside the defender's mutation stream. Kill consequences (death
//! marker, PK flagging, drops, experience) are sequenced here as enqueued
//! continuations.

use std::sync::Arc;

use anyhow::Result;
use log::debug;
use rand::Rng;

use crate::entity::{ActiveSpell, BattleState, Entity};
use crate::errors::CoreError;
use crate::inventory;
use crate::types::{CurrencyKind, EntityId, OutboundMessage, PkStatus, StatusKind};
use crate::world::{CombatSnapshot, World};

/// Flatten the combat-relevant view of an entity for the damage formula.
pub fn combat_snapshot(entity: &Entity, world: &Arc<World>) -> CombatSnapshot {
    CombatSnapshot {
        id: entity.id(),
        level: entity.snapshot.level,
        derived: entity.derive(world.items.as_ref()),
        life: entity.snapshot.life,
        statuses: entity.statuses.active_kinds(),
    }
}

/// Enter automatic attack mode against `target`.
pub fn begin_attack(entity: &mut Entity, world: &Arc<World>, target: EntityId) -> Result<(), CoreError> {
    if target == entity.id() {
        return Err(CoreError::validation("cannot attack yourself"));
    }
    if !entity.is_alive() {
        return Err(CoreError::validation("the dead cannot fight"));
    }
    if world.handle(target).is_none() {
        return Err(CoreError::NotFound(target));
    }
    let map = world
        .maps
        .map(entity.snapshot.position.map_id)
        .ok_or_else(|| CoreError::validation("current map unavailable"))?;
    if !map.pk_allowed() {
        return Err(CoreError::validation("fighting is forbidden here"));
    }
    entity.battle = Some(BattleState { target });
    Ok(())
}

pub fn stop_attack(entity: &mut Entity) {
    entity.battle = None;
}

/// Start channelling a spell at `target`; pulses on its own cadence,
/// independent of weapon swings.
pub fn begin_spell(
    entity: &mut Entity,
    world: &Arc<World>,
    spell_id: u32,
    target: EntityId,
) -> Result<(), CoreError> {
    if !entity.snapshot.skills.contains_key(&spell_id) {
        return Err(CoreError::validation(format!("spell {spell_id} not learned")));
    }
    if world.handle(target).is_none() {
        return Err(CoreError::NotFound(target));
    }
    entity.active_spell = Some(ActiveSpell { spell_id, target });
    Ok(())
}

pub fn stop_spell(entity: &mut Entity) {
    entity.active_spell = None;
}

/// One automatic weapon swing: snapshot the attacker, hand resolution to the
/// defender's stream. A vanished target ends the battle quietly.
pub fn perform_attack_round(entity: &mut Entity, world: &Arc<World>) -> Result<()> {
    let Some(battle) = &entity.battle else {
        return Ok(());
    };
    let target = battle.target;
    let Some(handle) = world.handle(target) else {
        debug!("{} target {target} gone; battle ends", entity.id());
        entity.battle = None;
        return Ok(());
    };
    entity.counters.attack_rounds += 1;
    let attacker = combat_snapshot(entity, world);
    handle
        .enqueue(move |defender, world| resolve_and_apply(defender, world, attacker))
        .map_err(anyhow::Error::from)
}

/// One channelled spell pulse. Drains mana; the channel breaks when mana runs
/// dry. Spell potency scales with the learned skill level.
pub fn perform_spell_pulse(entity: &mut Entity, world: &Arc<World>) -> Result<()> {
    let Some(spell) = entity.active_spell.clone() else {
        return Ok(());
    };
    let Some(handle) = world.handle(spell.target) else {
        entity.active_spell = None;
        return Ok(());
    };
    if entity.snapshot.mana < crate::scheduler::SPELL_MANA_COST {
        entity.active_spell = None;
        world.send(
            entity.id(),
            OutboundMessage::Notice {
                text: "You are out of mana.".into(),
            },
        );
        return Ok(());
    }
    entity.snapshot.mana -= crate::scheduler::SPELL_MANA_COST;
    entity.counters.spell_pulses += 1;
    let mut attacker = combat_snapshot(entity, world);
    let skill_level = entity.snapshot.skills.get(&spell.spell_id).copied().unwrap_or(1);
    attacker.derived.attack += skill_level as u32 * 10;
    world.sync_attributes(entity);
    handle
        .enqueue(move |defender, world| resolve_and_apply(defender, world, attacker))
        .map_err(anyhow::Error::from)
}

/// Runs in the defender's stream: invoke the formula engine, apply damage and
/// inflicted effects, and trigger kill handling when life reaches zero.
pub fn resolve_and_apply(defender: &mut Entity, world: &Arc<World>, attacker: CombatSnapshot) {
    if !defender.is_alive() {
        return;
    }
    let defender_view = combat_snapshot(defender, world);
    let outcome = world.combat.resolve_attack(&attacker, &defender_view);

    for (kind, power, ticks) in outcome.inflict {
        let _ = defender.statuses.attach(
            kind,
            power,
            crate::status::EffectExpiry::Ticks(ticks),
            attacker.id,
        );
    }
    let killed = defender.take_damage(outcome.damage);
    world.sync_attributes(defender);
    if killed {
        handle_death(defender, world, attacker.id);
    } else {
        world.persist_entity(&defender.snapshot);
    }
}

/// Kill consequences, run in the victim's stream. The killer's share (PK
/// flagging, loot, experience) lands on the killer's stream as continuations.
pub fn handle_death(victim: &mut Entity, world: &Arc<World>, killer: EntityId) {
    let _ = victim.statuses.attach(
        StatusKind::Dead,
        0,
        crate::status::EffectExpiry::Never,
        killer,
    );
    victim.battle = None;
    victim.active_spell = None;
    victim.mining = false;
    world.send(victim.id(), OutboundMessage::Killed { by: killer });

    let victim_status = victim.snapshot.pk_status();
    let drop_percent = match victim_status {
        PkStatus::Clear => 0,
        PkStatus::Red => world.config.pk.red_drop_percent,
        PkStatus::Black => world.config.pk.black_drop_percent,
    };
    if drop_percent > 0 && rand::thread_rng().gen_range(0..100) < drop_percent {
        let dropped = victim
            .snapshot
            .inventory
            .iter()
            .find(|item| inventory::is_tradeable(item, world.items.as_ref()))
            .map(|item| item.uid)
            .and_then(|uid| inventory::remove_item(&mut victim.snapshot, uid).ok());
        if let Some(item) = dropped {
            world.send(victim.id(), OutboundMessage::ItemRemoved { uid: item.uid });
            let _ = world.enqueue(killer, move |k, w| {
                if inventory::add_item(&mut k.snapshot, item.clone()).is_ok() {
                    w.send(k.id(), OutboundMessage::ItemGained { item });
                    w.persist_entity(&k.snapshot);
                }
            });
        }
    }

    // Killing an unflagged player is murder; flagged victims are fair game.
    if victim_status == PkStatus::Clear && killer != victim.id() {
        let points = world.config.pk.points_per_kill;
        let _ = world.enqueue(killer, move |k, w| {
            k.snapshot.pk_points = k.snapshot.pk_points.saturating_add(points);
            k.snapshot.touch();
            w.persist_entity(&k.snapshot);
        });
    }

    let exp = victim.snapshot.level as u64 * world.config.combat.exp_per_victim_level;
    if exp > 0 && killer != victim.id() {
        let _ = world.enqueue(killer, move |k, w| {
            k.battle = None;
            w.grant_experience(k, exp);
        });
    }

    world.persist_entity(&victim.snapshot);
}

/// Revive a dead entity at partial health. Only the death marker's removal
/// makes the entity act again.
pub fn revive(entity: &mut Entity, world: &Arc<World>) -> Result<(), CoreError> {
    if entity.statuses.detach(StatusKind::Dead).is_none() {
        return Err(CoreError::validation("not dead"));
    }
    entity.statuses.detach(StatusKind::Ghost);
    let max = entity.derive(world.items.as_ref()).max_life;
    entity.snapshot.life = (max / 2).max(1);
    entity.snapshot.touch();
    world.sync_attributes(entity);
    world.persist_entity(&entity.snapshot);
    Ok(())
}

/// Award virtue for burying a corpse or similar good deeds.
pub fn award_virtue(entity: &mut Entity, world: &Arc<World>, amount: u64) {
    world.award_currency(entity, CurrencyKind::VirtuePoints, amount);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntitySnapshot;
    use crate::types::{EntityId, Position};
    use crate::world::WorldBuilder;

    fn entity(id: u32) -> Entity {
        Entity::from_snapshot(EntitySnapshot::new(
            EntityId(id),
            "fighter",
            10,
            Position {
                map_id: 1002,
                x: 5,
                y: 5,
            },
        ))
    }

    #[tokio::test]
    async fn begin_attack_rejects_self_and_missing_targets() {
        let world = WorldBuilder::new(Default::default()).build();
        let mut me = entity(1);
        assert!(begin_attack(&mut me, &world, EntityId(1)).is_err());
        assert!(matches!(
            begin_attack(&mut me, &world, EntityId(2)),
            Err(CoreError::NotFound(_))
        ));
        assert!(me.battle.is_none());
    }

    #[tokio::test]
    async fn spell_requires_learned_skill() {
        let world = WorldBuilder::new(Default::default()).build();
        let mut me = entity(1);
        assert!(begin_spell(&mut me, &world, 9001, EntityId(2)).is_err());
        me.snapshot.skills.insert(9001, 3);
        // Target still offline.
        assert!(matches!(
            begin_spell(&mut me, &world, 9001, EntityId(2)),
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn revive_clears_the_death_marker() {
        let world = WorldBuilder::new(Default::default()).build();
        let mut me = entity(1);
        handle_death(&mut me, &world, EntityId(7));
        assert!(!me.is_alive());
        revive(&mut me, &world).expect("revive");
        assert!(me.is_alive());
        assert!(me.snapshot.life > 0);
        assert!(revive(&mut me, &world).is_err());
    }
}
