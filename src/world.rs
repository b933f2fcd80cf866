//! World runtime: collaborator boundaries and per-entity mutation streams.
//!
//! Every connected entity is owned by exactly one worker task that drains an
//! unbounded command channel; network handlers and the tick driver both
//! enqueue closures onto that channel, which serializes all mutations of the
//! entity without locks. Cross-entity effects are enqueued as continuations
//! onto the other entity's stream, never applied directly.
//!
//! The external collaborators (persistence, messaging, maps, combat formula,
//! content tables) are injected trait objects so the core runs against fakes
//! in tests and against real backends in the host server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::TuningConfig;
use crate::entity::{Entity, EntitySnapshot};
use crate::errors::CoreError;
use crate::ledger;
use crate::progression;
use crate::status::EffectExpiry;
use crate::team::TeamRegistry;
use crate::types::{
    CurrencyKind, DerivedStats, EntityId, ExpiryConsequence, ItemStats, MessageBox,
    OutboundMessage, RebirthRow, StatusKind,
};

// ============================================================================
// Collaborator traits
// ============================================================================

/// Durable snapshot storage. Failures are recoverable: the core logs them and
/// keeps in-memory state authoritative.
pub trait Persistence: Send + Sync {
    fn load_snapshot(&self, id: EntityId) -> Result<Option<EntitySnapshot>, CoreError>;
    fn save_snapshot(&self, snapshot: &EntitySnapshot) -> Result<(), CoreError>;
    fn delete_snapshot(&self, id: EntityId) -> Result<(), CoreError>;
    /// Append a trade/booth audit record.
    fn append_audit(&self, record: &AuditRecord) -> Result<(), CoreError>;
}

/// Best-effort outbound messaging. Send failures are logged, never propagated
/// into game logic.
pub trait Messenger: Send + Sync {
    fn send(&self, to: EntityId, message: OutboundMessage) -> Result<(), CoreError>;
}

/// Read-only placement and region predicates for one map.
pub trait MapHandle: Send + Sync {
    fn id(&self) -> u32;
    fn valid(&self, x: u16, y: u16) -> bool;
    /// Whether the coordinate lies in a mineable region.
    fn mine_region(&self, x: u16, y: u16) -> bool;
    fn pk_allowed(&self) -> bool;
}

pub trait MapProvider: Send + Sync {
    fn map(&self, id: u32) -> Option<Arc<dyn MapHandle>>;
}

/// Flattened combat-relevant view of an entity, handed to the damage formula.
#[derive(Debug, Clone)]
pub struct CombatSnapshot {
    pub id: EntityId,
    pub level: u8,
    pub derived: DerivedStats,
    pub life: u16,
    pub statuses: Vec<StatusKind>,
}

/// Result of one attack resolution from the external formula engine.
#[derive(Debug, Clone, Default)]
pub struct AttackOutcome {
    pub damage: u32,
    /// Status effects the attack applies: (kind, power, duration ticks).
    pub inflict: Vec<(StatusKind, u32, u32)>,
}

/// External damage formula. The core decides when to invoke it and what to do
/// with the result; it never computes damage itself.
pub trait CombatResolver: Send + Sync {
    fn resolve_attack(&self, attacker: &CombatSnapshot, defender: &CombatSnapshot) -> AttackOutcome;
}

/// Experience-per-level content table.
pub trait LevelTable: Send + Sync {
    /// Banked experience needed to advance past `level`, or `None` beyond the
    /// table's last row.
    fn threshold(&self, level: u8) -> Option<u64>;
}

/// Rebirth eligibility content table.
pub trait RebirthTable: Send + Sync {
    fn find(&self, level: u8, profession: u16, rebirth_count: u8) -> Option<RebirthRow>;
}

/// Static item data content table.
pub trait ItemTable: Send + Sync {
    fn item_stats(&self, item_id: u32) -> Option<ItemStats>;
}

// ============================================================================
// Audit records
// ============================================================================

/// Durable audit entry for committed exchanges.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditRecord {
    TradeCommitted {
        session: Uuid,
        first: EntityId,
        second: EntityId,
        first_items: u32,
        first_money: u32,
        second_items: u32,
        second_money: u32,
        at: DateTime<Utc>,
    },
    BoothSale {
        seller: EntityId,
        buyer: EntityId,
        item_id: u32,
        price: u64,
        currency: CurrencyKind,
        at: DateTime<Utc>,
    },
}

// ============================================================================
// Reference collaborator implementations
// ============================================================================

/// In-memory persistence, for tests and single-process hosts.
#[derive(Default)]
pub struct MemoryPersistence {
    snapshots: Mutex<HashMap<EntityId, EntitySnapshot>>,
    audit: Mutex<Vec<AuditRecord>>,
}

impl MemoryPersistence {
    pub fn audit_records(&self) -> Vec<AuditRecord> {
        self.audit.lock().expect("audit mutex poisoned").clone()
    }

    pub fn insert(&self, snapshot: EntitySnapshot) {
        self.snapshots
            .lock()
            .expect("snapshot mutex poisoned")
            .insert(snapshot.id, snapshot);
    }
}

impl Persistence for MemoryPersistence {
    fn load_snapshot(&self, id: EntityId) -> Result<Option<EntitySnapshot>, CoreError> {
        Ok(self
            .snapshots
            .lock()
            .expect("snapshot mutex poisoned")
            .get(&id)
            .cloned())
    }

    fn save_snapshot(&self, snapshot: &EntitySnapshot) -> Result<(), CoreError> {
        self.snapshots
            .lock()
            .expect("snapshot mutex poisoned")
            .insert(snapshot.id, snapshot.clone());
        Ok(())
    }

    fn delete_snapshot(&self, id: EntityId) -> Result<(), CoreError> {
        self.snapshots
            .lock()
            .expect("snapshot mutex poisoned")
            .remove(&id);
        Ok(())
    }

    fn append_audit(&self, record: &AuditRecord) -> Result<(), CoreError> {
        self.audit
            .lock()
            .expect("audit mutex poisoned")
            .push(record.clone());
        Ok(())
    }
}

/// Messenger that records everything it was asked to send.
#[derive(Default)]
pub struct RecordingMessenger {
    sent: Mutex<Vec<(EntityId, OutboundMessage)>>,
}

impl RecordingMessenger {
    pub fn sent_to(&self, id: EntityId) -> Vec<OutboundMessage> {
        self.sent
            .lock()
            .expect("sent mutex poisoned")
            .iter()
            .filter(|(to, _)| *to == id)
            .map(|(_, msg)| msg.clone())
            .collect()
    }

    pub fn all(&self) -> Vec<(EntityId, OutboundMessage)> {
        self.sent.lock().expect("sent mutex poisoned").clone()
    }
}

impl Messenger for RecordingMessenger {
    fn send(&self, to: EntityId, message: OutboundMessage) -> Result<(), CoreError> {
        self.sent
            .lock()
            .expect("sent mutex poisoned")
            .push((to, message));
        Ok(())
    }
}

struct OpenMap {
    id: u32,
}

impl MapHandle for OpenMap {
    fn id(&self) -> u32 {
        self.id
    }
    fn valid(&self, _x: u16, _y: u16) -> bool {
        true
    }
    fn mine_region(&self, _x: u16, _y: u16) -> bool {
        true
    }
    fn pk_allowed(&self) -> bool {
        true
    }
}

/// Map provider where every map id resolves to an unbounded, fully mineable,
/// PK-enabled map.
#[derive(Default)]
pub struct OpenWorldMaps;

impl MapProvider for OpenWorldMaps {
    fn map(&self, id: u32) -> Option<Arc<dyn MapHandle>> {
        Some(Arc::new(OpenMap { id }))
    }
}

/// Resolver that always lands a fixed amount of damage; useful as a stub.
pub struct FixedCombat {
    pub damage: u32,
}

impl CombatResolver for FixedCombat {
    fn resolve_attack(&self, _attacker: &CombatSnapshot, _defender: &CombatSnapshot) -> AttackOutcome {
        AttackOutcome {
            damage: self.damage,
            inflict: Vec::new(),
        }
    }
}

/// Level table backed by an in-memory vector; row N holds the threshold to
/// advance past level N+1.
#[derive(Default)]
pub struct StaticLevelTable {
    thresholds: Vec<u64>,
}

impl StaticLevelTable {
    pub fn new(thresholds: Vec<u64>) -> Self {
        Self { thresholds }
    }
}

impl LevelTable for StaticLevelTable {
    fn threshold(&self, level: u8) -> Option<u64> {
        if level == 0 {
            return None;
        }
        self.thresholds.get(level as usize - 1).copied()
    }
}

#[derive(Default)]
pub struct StaticRebirthTable {
    rows: Vec<RebirthRow>,
}

impl StaticRebirthTable {
    pub fn new(rows: Vec<RebirthRow>) -> Self {
        Self { rows }
    }
}

impl RebirthTable for StaticRebirthTable {
    fn find(&self, level: u8, profession: u16, _rebirth_count: u8) -> Option<RebirthRow> {
        self.rows
            .iter()
            .find(|row| row.from_profession == profession && level >= row.min_level)
            .cloned()
    }
}

#[derive(Default)]
pub struct StaticItemTable {
    items: HashMap<u32, ItemStats>,
}

impl StaticItemTable {
    pub fn insert(&mut self, item_id: u32, stats: ItemStats) {
        self.items.insert(item_id, stats);
    }
}

impl ItemTable for StaticItemTable {
    fn item_stats(&self, item_id: u32) -> Option<ItemStats> {
        self.items.get(&item_id).cloned()
    }
}

// ============================================================================
// Mutation streams
// ============================================================================

/// A queued state transition against one entity, applied by that entity's
/// worker with exclusive access.
pub type EntityMutation = Box<dyn FnOnce(&mut Entity, &Arc<World>) + Send>;

/// Cheap cloneable handle for enqueueing work onto an entity's stream.
#[derive(Clone, Debug)]
pub struct EntityHandle {
    pub id: EntityId,
    tx: mpsc::UnboundedSender<EntityMutation>,
}

impl EntityHandle {
    pub fn enqueue(
        &self,
        job: impl FnOnce(&mut Entity, &Arc<World>) + Send + 'static,
    ) -> Result<(), CoreError> {
        self.tx
            .send(Box::new(job))
            .map_err(|_| CoreError::StreamClosed(self.id))
    }
}

// ============================================================================
// World
// ============================================================================

pub struct World {
    pub config: TuningConfig,
    pub persistence: Arc<dyn Persistence>,
    pub messenger: Arc<dyn Messenger>,
    pub maps: Arc<dyn MapProvider>,
    pub combat: Arc<dyn CombatResolver>,
    pub levels: Arc<dyn LevelTable>,
    pub rebirths: Arc<dyn RebirthTable>,
    pub items: Arc<dyn ItemTable>,
    pub teams: TeamRegistry,
    entities: RwLock<HashMap<EntityId, EntityHandle>>,
    connected: AtomicU32,
}

/// Builder wiring collaborators into a `World`; omitted collaborators fall
/// back to the in-memory reference implementations.
pub struct WorldBuilder {
    config: TuningConfig,
    persistence: Option<Arc<dyn Persistence>>,
    messenger: Option<Arc<dyn Messenger>>,
    maps: Option<Arc<dyn MapProvider>>,
    combat: Option<Arc<dyn CombatResolver>>,
    levels: Option<Arc<dyn LevelTable>>,
    rebirths: Option<Arc<dyn RebirthTable>>,
    items: Option<Arc<dyn ItemTable>>,
}

impl WorldBuilder {
    pub fn new(config: TuningConfig) -> Self {
        Self {
            config,
            persistence: None,
            messenger: None,
            maps: None,
            combat: None,
            levels: None,
            rebirths: None,
            items: None,
        }
    }

    pub fn persistence(mut self, p: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(p);
        self
    }

    pub fn messenger(mut self, m: Arc<dyn Messenger>) -> Self {
        self.messenger = Some(m);
        self
    }

    pub fn maps(mut self, m: Arc<dyn MapProvider>) -> Self {
        self.maps = Some(m);
        self
    }

    pub fn combat(mut self, c: Arc<dyn CombatResolver>) -> Self {
        self.combat = Some(c);
        self
    }

    pub fn levels(mut self, t: Arc<dyn LevelTable>) -> Self {
        self.levels = Some(t);
        self
    }

    pub fn rebirths(mut self, t: Arc<dyn RebirthTable>) -> Self {
        self.rebirths = Some(t);
        self
    }

    pub fn items(mut self, t: Arc<dyn ItemTable>) -> Self {
        self.items = Some(t);
        self
    }

    pub fn build(self) -> Arc<World> {
        Arc::new(World {
            config: self.config,
            persistence: self
                .persistence
                .unwrap_or_else(|| Arc::new(MemoryPersistence::default())),
            messenger: self
                .messenger
                .unwrap_or_else(|| Arc::new(RecordingMessenger::default())),
            maps: self.maps.unwrap_or_else(|| Arc::new(OpenWorldMaps)),
            combat: self
                .combat
                .unwrap_or_else(|| Arc::new(FixedCombat { damage: 10 })),
            levels: self
                .levels
                .unwrap_or_else(|| Arc::new(StaticLevelTable::default())),
            rebirths: self
                .rebirths
                .unwrap_or_else(|| Arc::new(StaticRebirthTable::default())),
            items: self
                .items
                .unwrap_or_else(|| Arc::new(StaticItemTable::default())),
            teams: TeamRegistry::default(),
            entities: RwLock::new(HashMap::new()),
            connected: AtomicU32::new(0),
        })
    }
}

impl World {
    /// Load the snapshot for `id` and bring the entity online with its own
    /// mutation-stream worker. Refuses the session when the snapshot is
    /// missing or unreadable.
    pub fn connect(self: &Arc<Self>, id: EntityId) -> Result<EntityHandle, CoreError> {
        {
            let registry = self.entities.read().expect("entity registry poisoned");
            if registry.contains_key(&id) {
                return Err(CoreError::validation(format!("{id} already connected")));
            }
        }
        let snapshot = self
            .persistence
            .load_snapshot(id)?
            .ok_or_else(|| CoreError::FatalLoad(id, "snapshot missing".into()))?;
        Ok(self.bring_online(Entity::from_snapshot(snapshot)))
    }

    /// Create a brand-new character and bring it online.
    pub fn create(self: &Arc<Self>, snapshot: EntitySnapshot) -> Result<EntityHandle, CoreError> {
        self.persistence.save_snapshot(&snapshot)?;
        Ok(self.bring_online(Entity::from_snapshot(snapshot)))
    }

    fn bring_online(self: &Arc<Self>, entity: Entity) -> EntityHandle {
        let id = entity.id();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = EntityHandle { id, tx };
        self.entities
            .write()
            .expect("entity registry poisoned")
            .insert(id, handle.clone());
        let online = self.connected.fetch_add(1, Ordering::Relaxed) + 1;
        info!("{id} connected ({online} online)");
        spawn_worker(Arc::clone(self), entity, rx);
        handle
    }

    /// Take the entity offline. The worker drains already-enqueued work, then
    /// detaches (final persist, trade abort, team notice).
    pub fn disconnect(&self, id: EntityId) {
        let removed = self
            .entities
            .write()
            .expect("entity registry poisoned")
            .remove(&id);
        if removed.is_some() {
            let online = self.connected.fetch_sub(1, Ordering::Relaxed) - 1;
            info!("{id} disconnecting ({online} online)");
        }
    }

    pub fn handle(&self, id: EntityId) -> Option<EntityHandle> {
        self.entities
            .read()
            .expect("entity registry poisoned")
            .get(&id)
            .cloned()
    }

    pub fn connected_ids(&self) -> Vec<EntityId> {
        self.entities
            .read()
            .expect("entity registry poisoned")
            .keys()
            .copied()
            .collect()
    }

    /// Enqueue a mutation onto `id`'s stream.
    pub fn enqueue(
        &self,
        id: EntityId,
        job: impl FnOnce(&mut Entity, &Arc<World>) + Send + 'static,
    ) -> Result<(), CoreError> {
        self.handle(id).ok_or(CoreError::NotFound(id))?.enqueue(job)
    }

    /// Drive ticks for every connected entity. Returns the driver task handle
    /// so hosts can abort it on shutdown.
    pub fn start_ticker(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let world = Arc::clone(self);
        let period = std::time::Duration::from_millis(world.config.scheduler.tick_ms);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                for id in world.connected_ids() {
                    let _ = world.enqueue(id, |entity, world| {
                        crate::scheduler::run_entity_tick(entity, world);
                    });
                }
            }
        })
    }

    // ------------------------------------------------------------------
    // Side-effect glue: persistence, messaging, ledger, progression
    // ------------------------------------------------------------------

    /// Write-through persist. A storage hiccup is logged and never rolls back
    /// the in-memory mutation; the next write-through retries.
    pub fn persist_entity(&self, snapshot: &EntitySnapshot) {
        if let Err(e) = self.persistence.save_snapshot(snapshot) {
            warn!("write-through persist failed for {}: {e}", snapshot.id);
        }
    }

    /// Best-effort client notification.
    pub fn send(&self, to: EntityId, message: OutboundMessage) {
        if let Err(e) = self.messenger.send(to, message) {
            debug!("send to {to} failed: {e}");
        }
    }

    /// Push current vitals and derived stats to the client.
    pub fn sync_attributes(&self, entity: &Entity) {
        let derived = entity.derive(self.items.as_ref());
        self.send(
            entity.id(),
            OutboundMessage::AttributeSync {
                life: entity.snapshot.life,
                mana: entity.snapshot.mana,
                derived,
            },
        );
    }

    /// Award a bounded currency: clamp, persist, notify.
    pub fn award_currency(&self, entity: &mut Entity, kind: CurrencyKind, amount: u64) -> u64 {
        let credited = ledger::award(&mut entity.snapshot, kind, amount);
        if credited > 0 {
            self.persist_entity(&entity.snapshot);
            self.send(
                entity.id(),
                OutboundMessage::CurrencySync {
                    currency: kind,
                    balance: ledger::balance(&entity.snapshot, kind),
                },
            );
        }
        credited
    }

    /// Spend from a bounded currency: check-then-apply, persist, notify.
    pub fn spend_currency(
        &self,
        entity: &mut Entity,
        kind: CurrencyKind,
        amount: u64,
    ) -> Result<(), CoreError> {
        ledger::spend(&mut entity.snapshot, kind, amount)?;
        self.persist_entity(&entity.snapshot);
        self.send(
            entity.id(),
            OutboundMessage::CurrencySync {
                currency: kind,
                balance: ledger::balance(&entity.snapshot, kind),
            },
        );
        Ok(())
    }

    /// Award experience, resolving any level-ups: one notification per level
    /// crossed, auto-allot reapplication, vitals resync, team bonus refresh.
    pub fn grant_experience(self: &Arc<Self>, entity: &mut Entity, amount: u64) {
        let outcome = progression::award_experience(
            &mut entity.snapshot,
            amount,
            self.levels.as_ref(),
            self.config.mentor.share_percent,
        );
        self.send(
            entity.id(),
            OutboundMessage::ExperienceSync {
                experience: entity.snapshot.experience,
            },
        );
        for level in &outcome.levels_gained {
            self.send(entity.id(), OutboundMessage::LevelUp { level: *level });
        }
        if outcome.leveled() {
            entity.clamp_vitals(self.items.as_ref());
            self.sync_attributes(entity);
            if let Some(team) = entity.team {
                crate::team::recompute_benefits(self, team);
            }
        }
        self.persist_entity(&entity.snapshot);
    }

    /// Attach a status effect: policy resolution, vitals resync, notify.
    pub fn attach_status(
        &self,
        entity: &mut Entity,
        kind: StatusKind,
        power: u32,
        expiry: EffectExpiry,
        source: EntityId,
    ) -> Result<(), CoreError> {
        entity.statuses.attach(kind, power, expiry, source)?;
        entity.clamp_vitals(self.items.as_ref());
        self.send(
            entity.id(),
            OutboundMessage::StatusAttached {
                status: kind,
                power,
            },
        );
        self.sync_attributes(entity);
        Ok(())
    }

    /// Detach a status effect and run its on-expire consequences.
    pub fn detach_status(&self, entity: &mut Entity, kind: StatusKind) {
        if entity.statuses.detach(kind).is_some() {
            entity.clamp_vitals(self.items.as_ref());
            self.send(entity.id(), OutboundMessage::StatusRemoved { status: kind });
            self.sync_attributes(entity);
        }
    }

    /// Rebirth: match the entity against the eligibility table and apply the
    /// reset-with-carry-over transition.
    pub fn perform_rebirth(&self, entity: &mut Entity) -> Result<progression::RebirthOutcome, CoreError> {
        let snap = &entity.snapshot;
        let row = self
            .rebirths
            .find(snap.level, snap.profession, snap.rebirth_count)
            .ok_or_else(|| CoreError::validation("no rebirth path from here"))?;
        let outcome = progression::apply_rebirth(&mut entity.snapshot, &row)?;
        entity.clamp_vitals(self.items.as_ref());
        self.send(
            entity.id(),
            OutboundMessage::Reborn {
                profession: outcome.new_profession,
                level: outcome.new_level,
            },
        );
        self.sync_attributes(entity);
        self.persist_entity(&entity.snapshot);
        Ok(outcome)
    }

    /// Queue a timed message box; the scheduler enforces its expiry
    /// consequence if it goes unanswered.
    pub fn show_message_box(
        &self,
        entity: &mut Entity,
        text: impl Into<String>,
        ttl_secs: i64,
        on_expiry: ExpiryConsequence,
    ) -> Uuid {
        let boxed = MessageBox::new(text, ttl_secs, on_expiry);
        let id = boxed.id;
        self.send(
            entity.id(),
            OutboundMessage::MessageBoxShown {
                id,
                text: boxed.text.clone(),
            },
        );
        entity.message_boxes.push(boxed);
        id
    }

    /// Record an audit entry; storage failures are logged, the exchange is
    /// not rolled back.
    pub fn write_audit(&self, record: AuditRecord) {
        if let Err(e) = self.persistence.append_audit(&record) {
            warn!("audit write failed: {e}");
        }
    }
}

fn spawn_worker(world: Arc<World>, mut entity: Entity, mut rx: mpsc::UnboundedReceiver<EntityMutation>) {
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            job(&mut entity, &world);
        }
        detach(&mut entity, &world);
    });
}

/// Final teardown on the worker after the stream closes: abort any live
/// trade, close the booth, leave the team, clear requests, persist once more.
fn detach(entity: &mut Entity, world: &Arc<World>) {
    if entity.trade.is_some() {
        crate::trade::cancel_trade(entity, world, "counterpart disconnected");
    }
    if entity.booth.is_some() {
        crate::booth::close_booth(entity, world);
    }
    if let Some(team) = entity.team.take() {
        crate::team::member_went_offline(world, team, entity.id());
    }
    entity.requests.clear_all();
    world.persist_entity(&entity.snapshot);
    debug!("{} detached", entity.id());
}
