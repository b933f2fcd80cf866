//! Bounded inventory operations over an entity snapshot.

use uuid::Uuid;

use crate::entity::EntitySnapshot;
use crate::errors::CoreError;
use crate::types::{ItemInstance, INVENTORY_CAPACITY};
use crate::world::ItemTable;

/// Number of free inventory slots.
pub fn free_slots(snapshot: &EntitySnapshot) -> usize {
    INVENTORY_CAPACITY.saturating_sub(snapshot.inventory.len())
}

/// Check whether `count` more items would fit.
pub fn has_capacity(snapshot: &EntitySnapshot, count: usize) -> bool {
    free_slots(snapshot) >= count
}

/// Add an item, failing when the inventory is full.
pub fn add_item(snapshot: &mut EntitySnapshot, item: ItemInstance) -> Result<(), CoreError> {
    if !has_capacity(snapshot, 1) {
        return Err(CoreError::exhausted(format!(
            "inventory full ({INVENTORY_CAPACITY} slots)"
        )));
    }
    snapshot.inventory.push(item);
    snapshot.touch();
    Ok(())
}

/// Remove an item by instance uid. Fails when the item is not held.
pub fn remove_item(snapshot: &mut EntitySnapshot, uid: Uuid) -> Result<ItemInstance, CoreError> {
    let index = snapshot
        .inventory
        .iter()
        .position(|item| item.uid == uid)
        .ok_or_else(|| CoreError::validation(format!("item {uid} not in inventory")))?;
    let item = snapshot.inventory.remove(index);
    snapshot.touch();
    Ok(item)
}

pub fn find_item(snapshot: &EntitySnapshot, uid: Uuid) -> Option<&ItemInstance> {
    snapshot.inventory.iter().find(|item| item.uid == uid)
}

pub fn holds_item(snapshot: &EntitySnapshot, uid: Uuid) -> bool {
    find_item(snapshot, uid).is_some()
}

/// Find the first held item of a given static type.
pub fn find_by_type(snapshot: &EntitySnapshot, item_id: u32) -> Option<&ItemInstance> {
    snapshot.inventory.iter().find(|item| item.item_id == item_id)
}

/// An item may change owners only when the instance is unbound and the item
/// type is flagged tradeable.
pub fn is_tradeable(item: &ItemInstance, items: &dyn ItemTable) -> bool {
    if item.bound {
        return false;
    }
    items
        .item_stats(item.item_id)
        .map(|stats| stats.tradeable)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityId, ItemStats, Position};
    use crate::world::StaticItemTable;

    fn snapshot() -> EntitySnapshot {
        EntitySnapshot::new(
            EntityId(9),
            "bob",
            20,
            Position {
                map_id: 1002,
                x: 1,
                y: 1,
            },
        )
    }

    #[test]
    fn add_then_remove_round_trips() {
        let mut snap = snapshot();
        let item = ItemInstance::new(100);
        let uid = item.uid;
        add_item(&mut snap, item).expect("add");
        assert!(holds_item(&snap, uid));
        let removed = remove_item(&mut snap, uid).expect("remove");
        assert_eq!(removed.uid, uid);
        assert!(!holds_item(&snap, uid));
    }

    #[test]
    fn capacity_is_enforced() {
        let mut snap = snapshot();
        for _ in 0..INVENTORY_CAPACITY {
            add_item(&mut snap, ItemInstance::new(1)).expect("fits");
        }
        assert!(!has_capacity(&snap, 1));
        let err = add_item(&mut snap, ItemInstance::new(1)).unwrap_err();
        assert!(matches!(err, CoreError::ResourceExhausted(_)));
    }

    #[test]
    fn remove_missing_item_fails() {
        let mut snap = snapshot();
        assert!(remove_item(&mut snap, Uuid::new_v4()).is_err());
    }

    #[test]
    fn bound_items_are_untradeable() {
        let mut table = StaticItemTable::default();
        table.insert(
            5,
            ItemStats {
                name: "ring".into(),
                tradeable: true,
                ..Default::default()
            },
        );
        let mut item = ItemInstance::new(5);
        assert!(is_tradeable(&item, &table));
        item.bound = true;
        assert!(!is_tradeable(&item, &table));
    }

    #[test]
    fn untradeable_type_blocks_trade() {
        let mut table = StaticItemTable::default();
        table.insert(
            6,
            ItemStats {
                name: "quest token".into(),
                tradeable: false,
                ..Default::default()
            },
        );
        let item = ItemInstance::new(6);
        assert!(!is_tradeable(&item, &table));
    }
}
