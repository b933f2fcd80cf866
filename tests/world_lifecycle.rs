//! World-level lifecycle: connect/disconnect semantics, write-through
//! persistence, progression glue, and rebirth.

mod common;

use std::sync::Arc;

use common::*;
use worldcore::errors::CoreError;
use worldcore::types::{EntityId, OutboundMessage, RebirthRow};
use worldcore::world::{MemoryPersistence, Persistence, StaticRebirthTable, WorldBuilder};

#[tokio::test]
async fn missing_snapshot_refuses_the_session() {
    let h = harness();
    match h.world.connect(EntityId(404)) {
        Err(CoreError::FatalLoad(EntityId(404), _)) => {}
        other => panic!("expected fatal load, got {other:?}"),
    }
}

#[tokio::test]
async fn double_connect_is_rejected() {
    let h = harness();
    spawn(&h, base_snapshot(1, "alice"));
    assert!(h.world.connect(EntityId(1)).is_err());
}

#[tokio::test]
async fn disconnect_persists_the_final_state() {
    let h = harness();
    let id = EntityId(2);
    spawn(&h, base_snapshot(2, "bob"));
    h.world
        .enqueue(id, |e, w| {
            e.snapshot.money = 777;
            e.snapshot.touch();
            w.persist_entity(&e.snapshot);
            e.snapshot.money = 778;
        })
        .unwrap();
    settle(&h.world, id).await;
    h.world.disconnect(id);

    // Wait for the worker to drain and detach.
    for _ in 0..100 {
        if h.persistence
            .load_snapshot(id)
            .expect("load")
            .is_some_and(|s| s.money == 778)
        {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("detach never persisted the final snapshot");
}

#[tokio::test]
async fn experience_grant_notifies_each_level_crossed() {
    let h = harness();
    let id = EntityId(3);
    spawn(&h, base_snapshot(3, "climber"));

    h.world
        .enqueue(id, |e, w| {
            // Thresholds 1000 + 1200 both crossed in one grant.
            w.grant_experience(e, 2300);
        })
        .unwrap();
    settle(&h.world, id).await;

    let levels: Vec<u8> = h
        .messenger
        .sent_to(id)
        .iter()
        .filter_map(|m| match m {
            OutboundMessage::LevelUp { level } => Some(*level),
            _ => None,
        })
        .collect();
    assert_eq!(levels, vec![2, 3]);
    let persisted = h.persistence.load_snapshot(id).expect("load").expect("present");
    assert_eq!(persisted.level, 3);
    assert_eq!(persisted.experience, 100);
}

#[tokio::test]
async fn rebirth_resets_through_the_world_glue() {
    let persistence = Arc::new(MemoryPersistence::default());
    let rebirths = StaticRebirthTable::new(vec![RebirthRow {
        min_level: 3,
        from_profession: 10,
        to_profession: 21,
        reset_level: 2,
        base_strength: 20,
        base_agility: 20,
        base_vitality: 15,
        base_spirit: 5,
        learn_skills: vec![2001],
        remove_skills: vec![],
    }]);
    let world = WorldBuilder::new(Default::default())
        .persistence(Arc::clone(&persistence) as _)
        .rebirths(Arc::new(rebirths))
        .build();

    let id = EntityId(4);
    let mut snap = base_snapshot(4, "phoenix");
    snap.level = 5;
    persistence.insert(snap);
    world.connect(id).expect("connect");

    let outcome = {
        let (tx, rx) = tokio::sync::oneshot::channel();
        world
            .enqueue(id, |e, w| {
                let _ = tx.send(w.perform_rebirth(e).expect("rebirth"));
            })
            .unwrap();
        rx.await.unwrap()
    };
    assert_eq!(outcome.new_profession, 21);
    assert_eq!(outcome.new_level, 2);

    let persisted = persistence.load_snapshot(id).expect("load").expect("present");
    assert_eq!(persisted.profession, 21);
    assert_eq!(persisted.level, 2);
    assert_eq!(persisted.rebirth_count, 1);
    assert!(persisted.skills.contains_key(&2001));
}
