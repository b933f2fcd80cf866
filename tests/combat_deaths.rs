//! Battle invocation and kill handling: damage flows through the injected
//! resolver, and death consequences land on both streams.

mod common;

use std::sync::Arc;

use common::*;
use worldcore::combat;
use worldcore::scheduler;
use worldcore::types::{EntityId, OutboundMessage, PkStatus};
use worldcore::world::{
    AttackOutcome, CombatResolver, CombatSnapshot, MemoryPersistence, RecordingMessenger,
    WorldBuilder,
};

struct Lethal;

impl CombatResolver for Lethal {
    fn resolve_attack(&self, _a: &CombatSnapshot, _d: &CombatSnapshot) -> AttackOutcome {
        AttackOutcome {
            damage: 100_000,
            inflict: Vec::new(),
        }
    }
}

struct Graze;

impl CombatResolver for Graze {
    fn resolve_attack(&self, attacker: &CombatSnapshot, defender: &CombatSnapshot) -> AttackOutcome {
        AttackOutcome {
            damage: attacker.derived.attack.saturating_sub(defender.derived.defense).max(1),
            inflict: Vec::new(),
        }
    }
}

fn combat_world(resolver: Arc<dyn CombatResolver>) -> (Arc<worldcore::World>, Arc<MemoryPersistence>, Arc<RecordingMessenger>) {
    let persistence = Arc::new(MemoryPersistence::default());
    let messenger = Arc::new(RecordingMessenger::default());
    let world = WorldBuilder::new(Default::default())
        .persistence(Arc::clone(&persistence) as _)
        .messenger(Arc::clone(&messenger) as _)
        .combat(resolver)
        .levels(Arc::new(worldcore::world::StaticLevelTable::new(vec![
            1000, 1200, 1500,
        ])))
        .build();
    (world, persistence, messenger)
}

#[tokio::test]
async fn killing_a_clear_victim_flags_the_killer_and_pays_experience() {
    let (world, persistence, messenger) = combat_world(Arc::new(Lethal));
    let killer = EntityId(1);
    let victim = EntityId(2);
    let mut victim_snap = base_snapshot(2, "victim");
    victim_snap.level = 4;
    persistence.insert(base_snapshot(1, "killer"));
    persistence.insert(victim_snap);
    world.connect(killer).expect("connect");
    world.connect(victim).expect("connect");

    world
        .enqueue(killer, move |e, w| {
            combat::begin_attack(e, w, victim).expect("engage");
            combat::perform_attack_round(e, w).expect("swing");
        })
        .unwrap();
    settle_pair(&world, killer, victim).await;

    assert!(!probe(&world, victim, |e| e.is_alive()).await);
    assert!(messenger
        .sent_to(victim)
        .iter()
        .any(|m| matches!(m, OutboundMessage::Killed { by } if *by == killer)));

    let killer_snap = snapshot_of(&world, killer).await;
    assert_eq!(killer_snap.pk_status(), PkStatus::Clear);
    assert!(killer_snap.pk_points > 0, "murder of a clear name is flagged");
    // Victim level 4 at the default 50 exp per level.
    assert!(killer_snap.level > 1 || killer_snap.experience >= 200);
}

#[tokio::test]
async fn battle_ends_quietly_when_the_target_disconnects() {
    let (world, persistence, _messenger) = combat_world(Arc::new(Graze));
    let attacker = EntityId(3);
    let target = EntityId(4);
    persistence.insert(base_snapshot(3, "attacker"));
    persistence.insert(base_snapshot(4, "target"));
    world.connect(attacker).expect("connect");
    world.connect(target).expect("connect");

    world
        .enqueue(attacker, move |e, w| {
            combat::begin_attack(e, w, target).expect("engage");
        })
        .unwrap();
    settle(&world, attacker).await;

    world.disconnect(target);
    world
        .enqueue(attacker, |e, w| {
            combat::perform_attack_round(e, w).expect("swing at nothing");
        })
        .unwrap();
    settle(&world, attacker).await;
    assert!(probe(&world, attacker, |e| e.battle.is_none()).await);
}

#[tokio::test(start_paused = true)]
async fn attack_cadence_runs_from_the_scheduler() {
    let (world, persistence, _messenger) = combat_world(Arc::new(Graze));
    let attacker = EntityId(5);
    let target = EntityId(6);
    persistence.insert(base_snapshot(5, "attacker"));
    let mut tough = base_snapshot(6, "target");
    tough.vitality = 500;
    tough.life = 500;
    persistence.insert(tough);
    world.connect(attacker).expect("connect");
    world.connect(target).expect("connect");

    world
        .enqueue(attacker, move |e, w| {
            combat::begin_attack(e, w, target).expect("engage");
        })
        .unwrap();
    settle(&world, attacker).await;

    // Two scheduler passes inside one attack cadence period: one swing.
    world
        .enqueue(attacker, |e, w| scheduler::run_entity_tick(e, w))
        .unwrap();
    world
        .enqueue(attacker, |e, w| scheduler::run_entity_tick(e, w))
        .unwrap();
    settle_pair(&world, attacker, target).await;
    assert_eq!(probe(&world, attacker, |e| e.counters.attack_rounds).await, 1);

    let life_after_one = probe(&world, target, |e| e.snapshot.life).await;
    assert!(life_after_one < 500, "the swing landed on the defender");

    tokio::time::advance(std::time::Duration::from_millis(1100)).await;
    world
        .enqueue(attacker, |e, w| scheduler::run_entity_tick(e, w))
        .unwrap();
    settle_pair(&world, attacker, target).await;
    assert_eq!(probe(&world, attacker, |e| e.counters.attack_rounds).await, 2);
}
