//! Scheduler behavior over real mutation streams: per-subsystem fault
//! isolation, self-pacing, the dead-entity reduced subset, and timed message
//! box consequences.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use worldcore::metrics;
use worldcore::scheduler;
use worldcore::status::EffectExpiry;
use worldcore::types::{EntityId, ExpiryConsequence, StatusKind};
use worldcore::world::{MapHandle, MapProvider, MemoryPersistence, WorldBuilder};

/// Provider whose maps are all missing; any subsystem needing one faults.
struct NoMaps;

impl MapProvider for NoMaps {
    fn map(&self, _id: u32) -> Option<Arc<dyn MapHandle>> {
        None
    }
}

fn tick(h: &Harness, id: EntityId) {
    h.world
        .enqueue(id, |e, w| scheduler::run_entity_tick(e, w))
        .expect("enqueue tick");
}

#[tokio::test(start_paused = true)]
async fn faulting_subsystem_does_not_stop_the_rest() {
    let persistence = Arc::new(MemoryPersistence::default());
    let world = WorldBuilder::new(Default::default())
        .persistence(Arc::clone(&persistence) as _)
        .maps(Arc::new(NoMaps))
        .build();
    let id = EntityId(1);
    let mut snap = base_snapshot(1, "miner");
    snap.life = 1;
    persistence.insert(snap);
    world.connect(id).expect("connect");
    world
        .enqueue(id, |e, _| {
            e.mining = true;
        })
        .unwrap();

    let faults_before = metrics::snapshot().subsystem_faults;
    tokio::time::advance(Duration::from_secs(10)).await;
    world
        .enqueue(id, |e, w| scheduler::run_entity_tick(e, w))
        .unwrap();
    settle(&world, id).await;

    let (regen_pulses, still_mining, life) = probe(&world, id, |e| {
        (e.counters.regen_pulses, e.mining, e.snapshot.life)
    })
    .await;
    // Auto-mine faulted on the missing map; regen in the same tick still ran.
    assert!(metrics::snapshot().subsystem_faults > faults_before);
    assert_eq!(regen_pulses, 1);
    assert!(life > 1);
    assert!(still_mining, "a fault is contained, not a shutdown");
}

#[tokio::test(start_paused = true)]
async fn subsystems_pace_themselves_against_their_own_interval() {
    let h = harness();
    let id = EntityId(2);
    spawn(&h, base_snapshot(2, "idler"));

    // First tick fires every subsystem once; an immediate second tick fires
    // nothing with a longer period than the tick itself.
    tick(&h, id);
    tick(&h, id);
    settle(&h.world, id).await;
    assert_eq!(probe(&h.world, id, |e| e.counters.regen_pulses).await, 1);

    // Under the 4s regen period nothing fires; past it, exactly one pulse,
    // even after a long stall covering many periods.
    tokio::time::advance(Duration::from_secs(1)).await;
    tick(&h, id);
    settle(&h.world, id).await;
    assert_eq!(probe(&h.world, id, |e| e.counters.regen_pulses).await, 1);

    tokio::time::advance(Duration::from_secs(30)).await;
    tick(&h, id);
    settle(&h.world, id).await;
    assert_eq!(probe(&h.world, id, |e| e.counters.regen_pulses).await, 2);
}

#[tokio::test(start_paused = true)]
async fn dead_entities_run_only_the_reduced_subset() {
    let h = harness();
    let id = EntityId(3);
    let mut snap = base_snapshot(3, "corpse");
    snap.life = 0;
    spawn(&h, snap);

    h.world
        .enqueue(id, |e, w| {
            e.statuses
                .attach(StatusKind::Dead, 0, EffectExpiry::Never, e.id())
                .expect("mark dead");
            // Already-expired box: the reduced subset must still clear it.
            w.show_message_box(e, "rise?", -1, ExpiryConsequence::DefaultDecline);
        })
        .unwrap();

    tokio::time::advance(Duration::from_secs(10)).await;
    tick(&h, id);
    settle(&h.world, id).await;

    let (regen_pulses, status_ticks, boxes) = probe(&h.world, id, |e| {
        (
            e.counters.regen_pulses,
            e.counters.status_ticks,
            e.message_boxes.len(),
        )
    })
    .await;
    assert_eq!(regen_pulses, 0, "vitals do not regenerate while dead");
    assert_eq!(status_ticks, 0, "buffs are frozen while dead");
    assert_eq!(boxes, 0, "message boxes still expire while dead");
}

#[tokio::test(start_paused = true)]
async fn force_logout_box_disconnects_on_expiry() {
    let h = harness();
    let id = EntityId(4);
    spawn(&h, base_snapshot(4, "afk"));

    h.world
        .enqueue(id, |e, w| {
            w.show_message_box(e, "still there?", -1, ExpiryConsequence::ForceLogout);
        })
        .unwrap();
    tick(&h, id);

    for _ in 0..50 {
        if h.world.handle(id).is_none() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(h.world.handle(id).is_none(), "expiry forced the logout");
}

#[tokio::test(start_paused = true)]
async fn poison_pulses_and_expires_through_the_tick() {
    let h = harness();
    let id = EntityId(5);
    // Full health so the interleaved regen pulse has nothing to heal.
    let mut snap = base_snapshot(5, "envenomed");
    snap.vitality = 20;
    snap.life = 495;
    spawn(&h, snap);

    h.world
        .enqueue(id, |e, _| {
            e.statuses
                .attach(StatusKind::Poison, 10, EffectExpiry::Ticks(4), EntityId(99))
                .expect("poison");
        })
        .unwrap();

    for _ in 0..4 {
        tick(&h, id);
        settle(&h.world, id).await;
    }
    let (life, poisoned) = probe(&h.world, id, |e| {
        (
            e.snapshot.life,
            e.statuses.query_active(StatusKind::Poison).is_some(),
        )
    })
    .await;
    // Two pulses of 10 over a 4-tick life.
    assert_eq!(life, 475);
    assert!(!poisoned);
}
