#![allow(dead_code)]

//! Shared harness for integration tests: a world wired to in-memory
//! collaborators, plus helpers for seeding entities and synchronizing with
//! their mutation streams.

use std::sync::Arc;

use worldcore::config::TuningConfig;
use worldcore::entity::{Entity, EntitySnapshot};
use worldcore::types::{EntityId, ItemStats, Position};
use worldcore::world::{
    EntityHandle, MemoryPersistence, RecordingMessenger, StaticItemTable, StaticLevelTable, World,
    WorldBuilder,
};

pub struct Harness {
    pub world: Arc<World>,
    pub persistence: Arc<MemoryPersistence>,
    pub messenger: Arc<RecordingMessenger>,
}

pub fn harness() -> Harness {
    harness_with(TuningConfig::default(), default_items())
}

pub fn harness_with(config: TuningConfig, items: StaticItemTable) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let persistence = Arc::new(MemoryPersistence::default());
    let messenger = Arc::new(RecordingMessenger::default());
    let world = WorldBuilder::new(config)
        .persistence(Arc::clone(&persistence) as _)
        .messenger(Arc::clone(&messenger) as _)
        .items(Arc::new(items))
        .levels(Arc::new(StaticLevelTable::new(vec![
            1000, 1200, 1500, 2000, 2000, 2000, 2000, 2000,
        ])))
        .build();
    Harness {
        world,
        persistence,
        messenger,
    }
}

/// Item table with a tradeable robe (300), a quest token (301, untradeable),
/// and a potion (302).
pub fn default_items() -> StaticItemTable {
    let mut items = StaticItemTable::default();
    items.insert(
        300,
        ItemStats {
            name: "silk robe".into(),
            tradeable: true,
            value: 500,
            ..Default::default()
        },
    );
    items.insert(
        301,
        ItemStats {
            name: "quest token".into(),
            tradeable: false,
            ..Default::default()
        },
    );
    items.insert(
        302,
        ItemStats {
            name: "healing draught".into(),
            tradeable: true,
            life_bonus: 50,
            ..Default::default()
        },
    );
    items
}

pub fn base_snapshot(id: u32, name: &str) -> EntitySnapshot {
    EntitySnapshot::new(
        EntityId(id),
        name,
        10,
        Position {
            map_id: 1002,
            x: 300,
            y: 300,
        },
    )
}

/// Seed a snapshot into persistence and bring the entity online.
pub fn spawn(h: &Harness, snapshot: EntitySnapshot) -> EntityHandle {
    h.persistence.insert(snapshot.clone());
    h.world.connect(snapshot.id).expect("connect")
}

/// Wait until `id`'s stream has drained everything enqueued before this call.
pub async fn settle(world: &Arc<World>, id: EntityId) {
    let (tx, rx) = tokio::sync::oneshot::channel();
    world
        .enqueue(id, move |_, _| {
            let _ = tx.send(());
        })
        .expect("enqueue settle");
    rx.await.expect("settle");
}

/// Drain both streams several times, enough for any cross-entity continuation
/// chain in the exchange protocols to finish.
pub async fn settle_pair(world: &Arc<World>, a: EntityId, b: EntityId) {
    for _ in 0..4 {
        settle(world, a).await;
        settle(world, b).await;
    }
}

/// Read a value out of the entity through its own stream.
pub async fn probe<R, F>(world: &Arc<World>, id: EntityId, f: F) -> R
where
    R: Send + 'static,
    F: FnOnce(&Entity) -> R + Send + 'static,
{
    let (tx, rx) = tokio::sync::oneshot::channel();
    world
        .enqueue(id, move |entity, _| {
            let _ = tx.send(f(entity));
        })
        .expect("enqueue probe");
    rx.await.expect("probe")
}

pub async fn snapshot_of(world: &Arc<World>, id: EntityId) -> EntitySnapshot {
    probe(world, id, |e| e.snapshot.clone()).await
}
