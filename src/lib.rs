//! # Worldcore - Live Gameplay Core for a Persistent Multiplayer World
//!
//! Worldcore is the in-memory gameplay heart of a persistent-world game
//! server: entity state, timed effects, currencies, progression, exchange
//! protocols, and the per-entity scheduler that keeps it all moving.
//!
//! ## Features
//!
//! - **Single-Writer Entity Streams**: Every connected entity is owned by one
//!   worker task draining a command channel, so mutations are serialized
//!   without locks; cross-entity effects are enqueued continuations.
//! - **Status Effect Registry**: One active instance per effect kind with
//!   per-kind refresh policies (replace, extend, reject), recurring pulses,
//!   and tick or wall-clock expiry.
//! - **Bounded Ledger**: Clamped awards and all-or-nothing spends across
//!   money, bound/unbound points, virtue, and attribute points.
//! - **Progression Engine**: Multi-threshold level-up resolution in one pass,
//!   auto-allotment, mentor credit, and rebirth with carry-over.
//! - **Self-Pacing Scheduler**: Fifteen timed subsystems per entity, each
//!   pacing itself against its own last-fired instant, with per-subsystem
//!   fault isolation.
//! - **Exchange Protocols**: Two-party trades with two-phase escrow commit,
//!   vendor booths with quoted-price validation, and bounded teams with
//!   roster-derived shared benefits.
//! - **Pluggable Collaborators**: Persistence, messaging, maps, the damage
//!   formula, and content tables are injected traits; sled-backed and
//!   in-memory reference implementations ship in the crate.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use worldcore::config::TuningConfig;
//! use worldcore::persist::SledStore;
//! use worldcore::types::EntityId;
//! use worldcore::world::WorldBuilder;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = TuningConfig::load("tuning.toml").await?;
//!     let store = Arc::new(SledStore::open("data/world")?);
//!     let world = WorldBuilder::new(config).persistence(store).build();
//!     let _ticker = world.start_ticker();
//!
//!     let handle = world.connect(EntityId(1))?;
//!     handle.enqueue(|entity, world| {
//!         world.grant_experience(entity, 500);
//!     })?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`world`] - Mutation streams, collaborator traits, world glue
//! - [`entity`] - Durable snapshots and runtime entity state
//! - [`scheduler`] - The per-entity tick loop and its subsystems
//! - [`trade`], [`booth`], [`team`] - Exchange protocols
//! - [`persist`] - Sled-backed snapshot and audit storage

pub mod booth;
pub mod combat;
pub mod config;
pub mod entity;
pub mod errors;
pub mod inventory;
pub mod ledger;
pub mod metrics;
pub mod persist;
pub mod progression;
pub mod requests;
pub mod scheduler;
pub mod status;
pub mod team;
pub mod trade;
pub mod types;
pub mod world;

pub use errors::CoreError;
pub use types::{CurrencyKind, EntityId, StatusKind, TeamId};
pub use world::{World, WorldBuilder};
