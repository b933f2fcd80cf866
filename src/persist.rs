//! Sled-backed durable storage for entity snapshots and audit records.
//!
//! Snapshots are bincode under a fixed-width big-endian id key so range scans
//! stay ordered. Audit records are append-only JSON keyed by timestamp, which
//! keeps them greppable offline with standard tooling.

use std::path::Path;

use chrono::Utc;
use log::{info, warn};

use crate::entity::EntitySnapshot;
use crate::errors::CoreError;
use crate::types::{EntityId, ENTITY_SCHEMA_VERSION};
use crate::world::{AuditRecord, Persistence};

const ENTITY_TREE: &str = "entities";
const AUDIT_TREE: &str = "audit";

pub struct SledStore {
    _db: sled::Db,
    entities: sled::Tree,
    audit: sled::Tree,
}

fn store_err(e: impl std::fmt::Display) -> CoreError {
    CoreError::Persistence(e.to_string())
}

impl SledStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CoreError> {
        let db = sled::open(path.as_ref()).map_err(store_err)?;
        let entities = db.open_tree(ENTITY_TREE).map_err(store_err)?;
        let audit = db.open_tree(AUDIT_TREE).map_err(store_err)?;
        info!(
            "entity store opened at {} ({} snapshots)",
            path.as_ref().display(),
            entities.len()
        );
        Ok(Self {
            _db: db,
            entities,
            audit,
        })
    }

    fn key(id: EntityId) -> [u8; 4] {
        id.0.to_be_bytes()
    }

    /// Bring an older on-disk snapshot up to the current schema. Newer
    /// snapshots than we understand refuse to load.
    fn migrate(mut snapshot: EntitySnapshot) -> Result<EntitySnapshot, CoreError> {
        if snapshot.schema_version > ENTITY_SCHEMA_VERSION {
            return Err(CoreError::FatalLoad(
                snapshot.id,
                format!(
                    "snapshot schema v{} is newer than supported v{ENTITY_SCHEMA_VERSION}",
                    snapshot.schema_version
                ),
            ));
        }
        if snapshot.schema_version < ENTITY_SCHEMA_VERSION {
            // v1 and v2 share a wire layout; stamping the version forward is
            // the whole migration.
            info!(
                "migrating {} snapshot v{} -> v{ENTITY_SCHEMA_VERSION}",
                snapshot.id, snapshot.schema_version
            );
            snapshot.schema_version = ENTITY_SCHEMA_VERSION;
            snapshot.touch();
        }
        Ok(snapshot)
    }

    /// Every audit record written, oldest first. Operator/forensics surface.
    pub fn audit_records(&self) -> Result<Vec<AuditRecord>, CoreError> {
        let mut records = Vec::new();
        for entry in self.audit.iter() {
            let (_, value) = entry.map_err(store_err)?;
            match serde_json::from_slice(&value) {
                Ok(record) => records.push(record),
                Err(e) => warn!("skipping unreadable audit record: {e}"),
            }
        }
        Ok(records)
    }

    pub fn snapshot_count(&self) -> usize {
        self.entities.len()
    }
}

impl Persistence for SledStore {
    fn load_snapshot(&self, id: EntityId) -> Result<Option<EntitySnapshot>, CoreError> {
        let Some(bytes) = self.entities.get(Self::key(id)).map_err(store_err)? else {
            return Ok(None);
        };
        let snapshot: EntitySnapshot = bincode::deserialize(&bytes)
            .map_err(|e| CoreError::FatalLoad(id, format!("corrupt snapshot: {e}")))?;
        Ok(Some(Self::migrate(snapshot)?))
    }

    fn save_snapshot(&self, snapshot: &EntitySnapshot) -> Result<(), CoreError> {
        let bytes = bincode::serialize(snapshot).map_err(store_err)?;
        self.entities
            .insert(Self::key(snapshot.id), bytes)
            .map_err(store_err)?;
        Ok(())
    }

    fn delete_snapshot(&self, id: EntityId) -> Result<(), CoreError> {
        self.entities.remove(Self::key(id)).map_err(store_err)?;
        Ok(())
    }

    fn append_audit(&self, record: &AuditRecord) -> Result<(), CoreError> {
        let mut key = [0u8; 12];
        key[..8].copy_from_slice(&(Utc::now().timestamp_micros() as u64).to_be_bytes());
        key[8..].copy_from_slice(&rand::random::<u32>().to_be_bytes());
        let bytes = serde_json::to_vec(record).map_err(store_err)?;
        self.audit.insert(key, bytes).map_err(store_err)?;
        Ok(())
    }
}
