//! Entity state: the authoritative in-memory record for one connected
//! character.
//!
//! The durable half (`EntitySnapshot`) is everything that survives a
//! disconnect and is flushed write-through on every mutation that changes it.
//! The transient half lives on `Entity` and is rebuilt on connect: active
//! status effects, pending requests, protocol session references, and the
//! per-subsystem scheduler timers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::requests::RequestMap;
use crate::scheduler::SubsystemTimers;
use crate::status::StatusSet;
use crate::trade::TradeSession;
use crate::types::{
    DerivedStats, EntityId, EquipSlot, ItemInstance, MessageBox, PkStatus, Position, StatusKind,
    TeamId, ENTITY_SCHEMA_VERSION,
};
use crate::world::ItemTable;

/// Durable character state, persisted write-through and restored on connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub id: EntityId,
    pub name: String,
    pub profession: u16,
    pub level: u8,
    pub experience: u64,
    pub rebirth_count: u8,

    pub strength: u16,
    pub agility: u16,
    pub vitality: u16,
    pub spirit: u16,
    pub attribute_points: u16,

    pub life: u16,
    pub mana: u16,

    pub money: u32,
    pub bound_points: u32,
    pub unbound_points: u32,
    pub virtue_points: u32,

    pub pk_points: u16,
    /// When set, level-up attribute points are allotted automatically.
    pub auto_allot: bool,
    /// Mentor-experience credit accumulated from this apprentice's level-ups,
    /// dripped to the mentor by the scheduler.
    pub mentor_credit: u64,
    /// Remaining lucky-time, in seconds of wall clock.
    pub lucky_time_secs: u32,
    /// Mount stamina.
    pub vigor: u16,

    pub position: Position,
    pub equipment: HashMap<EquipSlot, ItemInstance>,
    pub inventory: Vec<ItemInstance>,
    /// Learned skills: skill id -> skill level.
    pub skills: HashMap<u32, u8>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub schema_version: u8,
}

impl EntitySnapshot {
    pub fn new(id: EntityId, name: &str, profession: u16, position: Position) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.to_string(),
            profession,
            level: 1,
            experience: 0,
            rebirth_count: 0,
            strength: 5,
            agility: 5,
            vitality: 5,
            spirit: 5,
            attribute_points: 0,
            life: 100,
            mana: 50,
            money: 0,
            bound_points: 0,
            unbound_points: 0,
            virtue_points: 0,
            pk_points: 0,
            auto_allot: true,
            mentor_credit: 0,
            lucky_time_secs: 0,
            vigor: 100,
            position,
            equipment: HashMap::new(),
            inventory: Vec::new(),
            skills: HashMap::new(),
            created_at: now,
            updated_at: now,
            schema_version: ENTITY_SCHEMA_VERSION,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn pk_status(&self) -> PkStatus {
        crate::types::pk_status(self.pk_points)
    }
}

/// Per-entity counters advanced by scheduler subsystems. Transient; exposed so
/// operators and tests can observe that independent subsystems keep running.
#[derive(Debug, Default, Clone)]
pub struct TickCounters {
    pub regen_pulses: u64,
    pub status_ticks: u64,
    pub mentor_drips: u64,
    pub auto_mine_swings: u64,
    pub auto_heal_pulses: u64,
    pub attack_rounds: u64,
    pub spell_pulses: u64,
}

/// Automatic combat state: who this entity is swinging at.
#[derive(Debug, Clone)]
pub struct BattleState {
    pub target: EntityId,
}

/// A spell being channelled on a cadence independent from weapon swings.
#[derive(Debug, Clone)]
pub struct ActiveSpell {
    pub spell_id: u32,
    pub target: EntityId,
}

/// Runtime state for one connected character. Owned exclusively by the
/// entity's mutation-stream worker; nothing outside that task ever holds a
/// reference to it.
pub struct Entity {
    pub snapshot: EntitySnapshot,
    pub statuses: StatusSet,
    pub requests: RequestMap,
    pub trade: Option<Arc<Mutex<TradeSession>>>,
    pub team: Option<TeamId>,
    pub battle: Option<BattleState>,
    pub active_spell: Option<ActiveSpell>,
    pub message_boxes: Vec<MessageBox>,
    pub timers: SubsystemTimers,
    pub counters: TickCounters,
    /// Guild betrayal pending since this instant; consequence lands after the
    /// configured grace period.
    pub pending_betrayal: Option<DateTime<Utc>>,
    pub mentor: Option<EntityId>,
    pub apprentices: Vec<EntityId>,
    pub mining: bool,
    pub auto_heal: bool,
    /// Booth catalogue when this entity has a stall open.
    pub booth: Option<crate::booth::Booth>,
}

impl Entity {
    pub fn from_snapshot(snapshot: EntitySnapshot) -> Self {
        Self {
            snapshot,
            statuses: StatusSet::default(),
            requests: RequestMap::default(),
            trade: None,
            team: None,
            battle: None,
            active_spell: None,
            message_boxes: Vec::new(),
            timers: SubsystemTimers::default(),
            counters: TickCounters::default(),
            pending_betrayal: None,
            mentor: None,
            apprentices: Vec::new(),
            mining: false,
            auto_heal: false,
            booth: None,
        }
    }

    pub fn id(&self) -> EntityId {
        self.snapshot.id
    }

    pub fn is_alive(&self) -> bool {
        self.snapshot.life > 0 && self.statuses.query_active(StatusKind::Dead).is_none()
    }

    /// Recompute display/combat stats from base attributes, equipped item
    /// bonuses, and active status effects. Pure with respect to current
    /// state; callers must not cache the result across mutations.
    pub fn derive(&self, items: &dyn ItemTable) -> DerivedStats {
        let snap = &self.snapshot;
        let mut max_life = snap.vitality as u32 * 24 + snap.strength as u32 * 3;
        let mut max_mana = snap.spirit as u32 * 5;
        let mut attack = snap.strength as u32 * 2 + snap.agility as u32;
        let mut defense = snap.vitality as u32;

        for item in snap.equipment.values() {
            if let Some(stats) = items.item_stats(item.item_id) {
                max_life += stats.life_bonus as u32;
                max_mana += stats.mana_bonus as u32;
                attack += stats.attack;
                defense += stats.defense;
            }
        }

        if let Some(shield) = self.statuses.query_active(StatusKind::Shield) {
            defense += defense * shield.power / 100;
        }
        if let Some(haste) = self.statuses.query_active(StatusKind::Haste) {
            attack += attack * haste.power / 100;
        }
        if let Some(morph) = self.statuses.query_active(StatusKind::Transformed) {
            // Transformation power stands in for the morphed body's stats.
            attack += morph.power;
            defense += morph.power / 2;
        }

        DerivedStats {
            max_life: max_life.min(u16::MAX as u32) as u16,
            max_mana: max_mana.min(u16::MAX as u32) as u16,
            attack,
            defense,
        }
    }

    /// Raise life, clamped to the derived maximum. Returns the amount applied.
    /// Life already at or past the maximum is left alone; only `clamp_vitals`
    /// pulls an over-cap pool down.
    pub fn heal(&mut self, amount: u16, items: &dyn ItemTable) -> u16 {
        let max = self.derive(items).max_life;
        let before = self.snapshot.life;
        if before >= max {
            return 0;
        }
        self.snapshot.life = before.saturating_add(amount).min(max);
        if self.snapshot.life != before {
            self.snapshot.touch();
        }
        self.snapshot.life - before
    }

    /// Lower life, saturating at zero. Returns true when this reduced life to
    /// zero (the caller owes kill handling).
    pub fn take_damage(&mut self, amount: u32) -> bool {
        let before = self.snapshot.life;
        let applied = amount.min(before as u32) as u16;
        self.snapshot.life = before - applied;
        if applied > 0 {
            self.snapshot.touch();
        }
        before > 0 && self.snapshot.life == 0
    }

    /// Raise mana, clamped to the derived maximum. An over-cap pool is left
    /// alone, like `heal`.
    pub fn restore_mana(&mut self, amount: u16, items: &dyn ItemTable) -> u16 {
        let max = self.derive(items).max_mana;
        let before = self.snapshot.mana;
        if before >= max {
            return 0;
        }
        self.snapshot.mana = before.saturating_add(amount).min(max);
        if self.snapshot.mana != before {
            self.snapshot.touch();
        }
        self.snapshot.mana - before
    }

    /// Clamp current life/mana after anything that can shrink the derived
    /// maxima (unequip, transformation expiry, rebirth).
    pub fn clamp_vitals(&mut self, items: &dyn ItemTable) {
        let derived = self.derive(items);
        if self.snapshot.life > derived.max_life {
            self.snapshot.life = derived.max_life;
            self.snapshot.touch();
        }
        if self.snapshot.mana > derived.max_mana {
            self.snapshot.mana = derived.max_mana;
            self.snapshot.touch();
        }
    }
}
