use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const ENTITY_SCHEMA_VERSION: u8 = 2;
pub const TRADE_RECORD_SCHEMA_VERSION: u8 = 1;

/// Hard level cap. Experience past this is discarded, never banked.
pub const MAX_LEVEL: u8 = 130;
/// Levels at or below this earn virtue points on level-up.
pub const VIRTUE_LEVEL_CUTOFF: u8 = 70;
/// Attribute points granted per level gained when auto-allot is on.
pub const POINTS_PER_LEVEL: u16 = 3;
/// Extra attribute points per level when the player allots manually.
pub const MANUAL_ALLOT_BONUS: u16 = 1;

pub const MAX_MONEY: u32 = 1_000_000_000;
pub const MAX_BOUND_POINTS: u32 = 10_000_000;
pub const MAX_UNBOUND_POINTS: u32 = 10_000_000;
pub const MAX_VIRTUE_POINTS: u32 = 30_000;
pub const MAX_ATTRIBUTE_POINTS: u16 = 10_000;

pub const INVENTORY_CAPACITY: usize = 40;
pub const TRADE_SLOT_CAPACITY: usize = 20;
pub const BOOTH_CAPACITY: usize = 10;
pub const TEAM_CAPACITY: usize = 5;

/// Stable identifier for a character entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u32);

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "entity:{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TeamId(pub u32);

impl std::fmt::Display for TeamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "team:{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub map_id: u32,
    pub x: u16,
    pub y: u16,
}

// ============================================================================
// Currency kinds
// ============================================================================

/// Closed set of bounded ledger currencies. Experience is handled separately
/// by the progression engine because it participates in level resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurrencyKind {
    Money,
    BoundPoints,
    UnboundPoints,
    VirtuePoints,
    AttributePoints,
}

impl CurrencyKind {
    /// Upper bound for this currency; awards clamp here.
    pub fn max_value(&self) -> u64 {
        match self {
            CurrencyKind::Money => MAX_MONEY as u64,
            CurrencyKind::BoundPoints => MAX_BOUND_POINTS as u64,
            CurrencyKind::UnboundPoints => MAX_UNBOUND_POINTS as u64,
            CurrencyKind::VirtuePoints => MAX_VIRTUE_POINTS as u64,
            CurrencyKind::AttributePoints => MAX_ATTRIBUTE_POINTS as u64,
        }
    }
}

// ============================================================================
// Status effects
// ============================================================================

/// What happens when a status kind is attached while an instance of the same
/// kind is already active on the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPolicy {
    /// New duration and power overwrite the old instance.
    Replace,
    /// New duration is added to the remaining duration.
    Extend,
    /// The attach is rejected while an instance is active.
    Reject,
}

/// Closed set of status effect kinds. At most one active instance per
/// (kind, target); the refresh policy decides what a second attach does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Shield,
    Haste,
    Poison,
    Stun,
    Invisibility,
    LuckyTime,
    VigorTonic,
    Transformed,
    CallPet,
    /// Meta marker: entity is dead. Removed only by explicit detach (revive).
    Dead,
    /// Meta marker: entity is a ghost walking back to its corpse.
    Ghost,
}

impl StatusKind {
    pub fn refresh_policy(&self) -> RefreshPolicy {
        match self {
            StatusKind::Shield
            | StatusKind::Haste
            | StatusKind::Poison
            | StatusKind::Stun
            | StatusKind::Invisibility => RefreshPolicy::Replace,
            StatusKind::LuckyTime | StatusKind::VigorTonic => RefreshPolicy::Extend,
            StatusKind::Transformed | StatusKind::CallPet => RefreshPolicy::Reject,
            // Attaching an already-present meta marker is a no-op.
            StatusKind::Dead | StatusKind::Ghost => RefreshPolicy::Reject,
        }
    }

    /// Meta markers never expire from ticking; only explicit detach removes them.
    pub fn is_meta(&self) -> bool {
        matches!(self, StatusKind::Dead | StatusKind::Ghost)
    }

    /// Interval in scheduler ticks between recurring applications of this
    /// effect (damage-over-time and similar). `None` means no recurring pulse.
    pub fn recurring_every(&self) -> Option<u32> {
        match self {
            StatusKind::Poison => Some(2),
            _ => None,
        }
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Closed set of request types. At most one outstanding request per kind per
/// entity; confirm/deny flows initiated by the counterpart consume them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Friend,
    Trade,
    TeamInvite,
    TeamJoin,
    Marriage,
    Mentor,
    Apprentice,
    GuildInvite,
}

// ============================================================================
// Items and equipment
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EquipSlot {
    Weapon,
    Armor,
    Helmet,
    Necklace,
    Ring,
    Boots,
}

impl EquipSlot {
    pub const ALL: [EquipSlot; 6] = [
        EquipSlot::Weapon,
        EquipSlot::Armor,
        EquipSlot::Helmet,
        EquipSlot::Necklace,
        EquipSlot::Ring,
        EquipSlot::Boots,
    ];
}

/// A concrete owned item. Static stats come from the item table by `item_id`;
/// the instance carries only per-copy state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemInstance {
    pub uid: Uuid,
    pub item_id: u32,
    pub durability: u16,
    /// Bound items cannot be traded or sold.
    pub bound: bool,
}

impl ItemInstance {
    pub fn new(item_id: u32) -> Self {
        Self {
            uid: Uuid::new_v4(),
            item_id,
            durability: 100,
            bound: false,
        }
    }
}

/// Static per-item-type data served by the content-table collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemStats {
    pub name: String,
    pub attack: u32,
    pub defense: u32,
    pub life_bonus: u16,
    pub mana_bonus: u16,
    /// Item types flagged untradeable can never be staged or listed.
    pub tradeable: bool,
    pub slot: Option<EquipSlot>,
    pub value: u32,
}

// ============================================================================
// Content table rows
// ============================================================================

/// One row of the experience-per-level table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LevelRow {
    /// Banked experience needed to advance past this level.
    pub threshold: u64,
}

/// One row of the rebirth eligibility table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebirthRow {
    pub min_level: u8,
    pub from_profession: u16,
    pub to_profession: u16,
    /// Level the character restarts at.
    pub reset_level: u8,
    /// Profession-seeded base attributes after the reset.
    pub base_strength: u16,
    pub base_agility: u16,
    pub base_vitality: u16,
    pub base_spirit: u16,
    /// Skills granted by the new profession.
    pub learn_skills: Vec<u32>,
    /// Skills removed with the old profession.
    pub remove_skills: Vec<u32>,
}

// ============================================================================
// PK status
// ============================================================================

/// Name-flag derived from accumulated PK points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PkStatus {
    Clear,
    Red,
    Black,
}

pub fn pk_status(points: u16) -> PkStatus {
    match points {
        0..=29 => PkStatus::Clear,
        30..=99 => PkStatus::Red,
        _ => PkStatus::Black,
    }
}

// ============================================================================
// Timed message boxes
// ============================================================================

/// What happens when a timed message box expires unanswered. Enforced exactly
/// once by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryConsequence {
    DefaultDecline,
    ForceLogout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageBox {
    pub id: Uuid,
    pub text: String,
    pub expires_at: DateTime<Utc>,
    pub on_expiry: ExpiryConsequence,
}

impl MessageBox {
    pub fn new(text: impl Into<String>, ttl_secs: i64, on_expiry: ExpiryConsequence) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            expires_at: Utc::now() + chrono::Duration::seconds(ttl_secs),
            on_expiry,
        }
    }
}

// ============================================================================
// Derived stats
// ============================================================================

/// Display/combat stats recomputed on demand; never cached across mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DerivedStats {
    pub max_life: u16,
    pub max_mana: u16,
    pub attack: u32,
    pub defense: u32,
}

// ============================================================================
// Outbound synchronization messages
// ============================================================================

/// Client-visible synchronization messages pushed through the messaging
/// collaborator. Best-effort; send failures are logged and never block a
/// mutation stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundMessage {
    AttributeSync {
        life: u16,
        mana: u16,
        derived: DerivedStats,
    },
    CurrencySync {
        currency: CurrencyKind,
        balance: u64,
    },
    ExperienceSync {
        experience: u64,
    },
    LevelUp {
        level: u8,
    },
    Reborn {
        profession: u16,
        level: u8,
    },
    StatusAttached {
        status: StatusKind,
        power: u32,
    },
    StatusRemoved {
        status: StatusKind,
    },
    ItemGained {
        item: ItemInstance,
    },
    ItemRemoved {
        uid: Uuid,
    },
    TradeInvited {
        from: EntityId,
    },
    TradeStaged {
        counterpart_accepted: bool,
    },
    TradeCommitted {
        session: Uuid,
    },
    TradeAborted {
        session: Uuid,
        reason: String,
    },
    BoothSale {
        item_id: u32,
        price: u64,
    },
    TeamBonusSync {
        team: TeamId,
        exp_share_percent: u32,
    },
    TeamLeaderPosition {
        position: Position,
    },
    RequestReceived {
        request: RequestKind,
        from: EntityId,
    },
    MessageBoxShown {
        id: Uuid,
        text: String,
    },
    MessageBoxExpired {
        id: Uuid,
    },
    Killed {
        by: EntityId,
    },
    Notice {
        text: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pk_status_thresholds() {
        assert_eq!(pk_status(0), PkStatus::Clear);
        assert_eq!(pk_status(29), PkStatus::Clear);
        assert_eq!(pk_status(30), PkStatus::Red);
        assert_eq!(pk_status(99), PkStatus::Red);
        assert_eq!(pk_status(100), PkStatus::Black);
    }

    #[test]
    fn meta_statuses_never_recur() {
        for kind in [StatusKind::Dead, StatusKind::Ghost] {
            assert!(kind.is_meta());
            assert_eq!(kind.recurring_every(), None);
        }
    }

    #[test]
    fn refresh_policies_cover_every_kind() {
        // Transform and pet leases are exclusive; timed bonuses extend.
        assert_eq!(StatusKind::Transformed.refresh_policy(), RefreshPolicy::Reject);
        assert_eq!(StatusKind::CallPet.refresh_policy(), RefreshPolicy::Reject);
        assert_eq!(StatusKind::LuckyTime.refresh_policy(), RefreshPolicy::Extend);
        assert_eq!(StatusKind::Shield.refresh_policy(), RefreshPolicy::Replace);
    }

    #[test]
    fn outbound_messages_tag_cleanly_as_json() {
        let msg = OutboundMessage::RequestReceived {
            request: RequestKind::Trade,
            from: EntityId(7),
        };
        let json = serde_json::to_string(&msg).expect("serialize");
        assert!(json.contains("\"kind\":\"request_received\""));
        assert!(json.contains("\"request\""));
    }
}
