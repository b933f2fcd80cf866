//! Vendor booths: a bounded catalogue of priced listings sold while the
//! owner idles.
//!
//! Listing an item moves it out of the seller's inventory into the booth, so
//! "is it still for sale" is a catalogue lookup rather than a racy inventory
//! scan. A sale is an escrowed exchange across both mutation streams: the
//! buyer's funds come out first, the seller validates the listing against the
//! quoted price, and any mismatch refunds the buyer in full.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::entity::Entity;
use crate::errors::CoreError;
use crate::inventory;
use crate::ledger;
use crate::metrics;
use crate::types::{CurrencyKind, EntityId, ItemInstance, OutboundMessage, BOOTH_CAPACITY};
use crate::world::{AuditRecord, Persistence, World};

#[derive(Debug, Clone)]
pub struct Listing {
    pub item: ItemInstance,
    pub price: u64,
    pub currency: CurrencyKind,
}

#[derive(Debug, Default)]
pub struct Booth {
    pub name: String,
    pub catalogue: Vec<Listing>,
}

impl Booth {
    fn find(&self, uid: Uuid) -> Option<&Listing> {
        self.catalogue.iter().find(|l| l.item.uid == uid)
    }
}

fn booth_of(entity: &mut Entity) -> Result<&mut Booth, CoreError> {
    entity
        .booth
        .as_mut()
        .ok_or_else(|| CoreError::validation("no booth open"))
}

/// Open an empty stall. Trading and vending are mutually exclusive.
pub fn open_booth(entity: &mut Entity, name: &str) -> Result<(), CoreError> {
    if entity.booth.is_some() {
        return Err(CoreError::validation("booth already open"));
    }
    if entity.trade.is_some() {
        return Err(CoreError::validation("cannot vend while trading"));
    }
    if !entity.is_alive() {
        return Err(CoreError::validation("the dead cannot vend"));
    }
    entity.booth = Some(Booth {
        name: name.to_string(),
        catalogue: Vec::new(),
    });
    Ok(())
}

/// Price an inventory item into the catalogue. Only money and unbound points
/// are accepted as sale currencies.
pub fn list_item(
    entity: &mut Entity,
    world: &Arc<World>,
    uid: Uuid,
    price: u64,
    currency: CurrencyKind,
) -> Result<(), CoreError> {
    if !matches!(currency, CurrencyKind::Money | CurrencyKind::UnboundPoints) {
        return Err(CoreError::validation("items sell for money or unbound points"));
    }
    if price == 0 || price > currency.max_value() {
        return Err(CoreError::validation("bad price"));
    }
    let item = inventory::find_item(&entity.snapshot, uid)
        .ok_or_else(|| CoreError::validation("item not in inventory"))?;
    if !inventory::is_tradeable(item, world.items.as_ref()) {
        return Err(CoreError::validation("item cannot be sold"));
    }
    {
        let booth = booth_of(entity)?;
        if booth.catalogue.len() >= BOOTH_CAPACITY {
            return Err(CoreError::exhausted(format!(
                "booth holds {BOOTH_CAPACITY} listings"
            )));
        }
    }
    let item = inventory::remove_item(&mut entity.snapshot, uid)?;
    booth_of(entity)?.catalogue.push(Listing {
        item,
        price,
        currency,
    });
    world.persist_entity(&entity.snapshot);
    Ok(())
}

/// Pull a listing back into the inventory.
pub fn unlist_item(entity: &mut Entity, world: &Arc<World>, uid: Uuid) -> Result<(), CoreError> {
    if !inventory::has_capacity(&entity.snapshot, 1) {
        return Err(CoreError::exhausted("no room to take the item back"));
    }
    let booth = booth_of(entity)?;
    let index = booth
        .catalogue
        .iter()
        .position(|l| l.item.uid == uid)
        .ok_or_else(|| CoreError::validation("not listed"))?;
    let listing = booth.catalogue.remove(index);
    entity.snapshot.inventory.push(listing.item);
    entity.snapshot.touch();
    world.persist_entity(&entity.snapshot);
    Ok(())
}

/// Close the stall and return every unsold listing. Escrowed property always
/// comes back, even past nominal capacity.
pub fn close_booth(entity: &mut Entity, world: &Arc<World>) {
    if let Some(booth) = entity.booth.take() {
        for listing in booth.catalogue {
            entity.snapshot.inventory.push(listing.item);
        }
        entity.snapshot.touch();
        world.persist_entity(&entity.snapshot);
    }
}

/// Buy `uid` from `seller`'s booth at the quoted price. Runs in the buyer's
/// stream; funds are escrowed out before the seller validates the listing,
/// and any mismatch refunds them.
pub fn buy(
    entity: &mut Entity,
    world: &Arc<World>,
    seller: EntityId,
    uid: Uuid,
    quoted_price: u64,
    currency: CurrencyKind,
) -> Result<(), CoreError> {
    if seller == entity.id() {
        return Err(CoreError::validation("cannot buy from yourself"));
    }
    if !inventory::has_capacity(&entity.snapshot, 1) {
        return Err(CoreError::exhausted("inventory full"));
    }
    if world.handle(seller).is_none() {
        return Err(CoreError::NotFound(seller));
    }
    // Escrow the buyer's funds before crossing streams.
    world.spend_currency(entity, currency, quoted_price)?;
    let buyer = entity.id();
    let enqueued = world.enqueue(seller, move |s, world| {
        seller_side_sale(s, world, buyer, uid, quoted_price, currency);
    });
    if enqueued.is_err() {
        ledger::award(&mut entity.snapshot, currency, quoted_price);
        return Err(CoreError::NotFound(seller));
    }
    Ok(())
}

/// Runs in the seller's stream: validate the listing against the quote, take
/// payment, and hand the item to the buyer's stream.
fn seller_side_sale(
    seller: &mut Entity,
    world: &Arc<World>,
    buyer: EntityId,
    uid: Uuid,
    quoted_price: u64,
    currency: CurrencyKind,
) {
    let valid = seller
        .booth
        .as_ref()
        .and_then(|b| b.find(uid))
        .is_some_and(|l| l.price == quoted_price && l.currency == currency);
    if !valid {
        debug!("sale of {uid} to {buyer} failed validation; refunding");
        refund_buyer(world, buyer, currency, quoted_price, "That item is no longer for sale.");
        return;
    }
    let booth = seller.booth.as_mut().expect("validated above");
    let index = booth
        .catalogue
        .iter()
        .position(|l| l.item.uid == uid)
        .expect("validated above");
    let listing = booth.catalogue.remove(index);
    let item = listing.item.clone();

    world.award_currency(seller, currency, quoted_price);
    world.send(
        seller.id(),
        OutboundMessage::BoothSale {
            item_id: item.item_id,
            price: quoted_price,
        },
    );
    world.write_audit(AuditRecord::BoothSale {
        seller: seller.id(),
        buyer,
        item_id: item.item_id,
        price: quoted_price,
        currency,
        at: Utc::now(),
    });
    metrics::inc_booth_sale();
    info!("{} sold item {} to {buyer} for {quoted_price}", seller.id(), item.item_id);

    let seller_id = seller.id();
    let delivery = item.clone();
    let delivered = world.enqueue(buyer, move |b, world| {
        match inventory::add_item(&mut b.snapshot, delivery.clone()) {
            Ok(()) => {
                world.send(b.id(), OutboundMessage::ItemGained { item: delivery });
                world.persist_entity(&b.snapshot);
            }
            Err(_) => {
                // Buyer filled up since the capacity check: undo both sides.
                refund_buyer(world, b.id(), currency, quoted_price, "No room for your purchase.");
                let _ = world.enqueue(seller_id, move |s, world| {
                    if let Err(e) = ledger::spend(&mut s.snapshot, currency, quoted_price) {
                        debug!("could not reclaim sale proceeds from {}: {e}", s.id());
                    }
                    if let Some(booth) = s.booth.as_mut() {
                        booth.catalogue.push(Listing {
                            item: delivery.clone(),
                            price: quoted_price,
                            currency,
                        });
                    } else {
                        s.snapshot.inventory.push(delivery.clone());
                    }
                    world.persist_entity(&s.snapshot);
                });
            }
        }
    });
    if delivered.is_err() {
        // Buyer's stream closed before delivery. Reverse the sale right here
        // in the seller's stream and push the refund straight into the buyer's
        // persisted snapshot.
        debug!("buyer {buyer} vanished mid-sale; reversing the sale");
        if let Err(e) = ledger::spend(&mut seller.snapshot, currency, quoted_price) {
            debug!("could not reclaim sale proceeds from {}: {e}", seller.id());
        }
        if let Some(booth) = seller.booth.as_mut() {
            booth.catalogue.push(Listing {
                item,
                price: quoted_price,
                currency,
            });
        } else {
            seller.snapshot.inventory.push(item);
        }
        seller.snapshot.touch();
        world.persist_entity(&seller.snapshot);
        refund_offline(world, buyer, currency, quoted_price);
    }
}

/// Credit a refund straight into the persisted snapshot when the buyer's
/// stream is already gone.
fn refund_offline(world: &Arc<World>, buyer: EntityId, currency: CurrencyKind, amount: u64) {
    match world.persistence.load_snapshot(buyer) {
        Ok(Some(mut snapshot)) => {
            ledger::award(&mut snapshot, currency, amount);
            snapshot.touch();
            world.persist_entity(&snapshot);
        }
        Ok(None) => warn!("no snapshot for {buyer}; refund of {amount} dropped"),
        Err(e) => warn!("offline refund for {buyer} failed to load: {e}"),
    }
}

fn refund_buyer(world: &Arc<World>, buyer: EntityId, currency: CurrencyKind, amount: u64, notice: &str) {
    let text = notice.to_string();
    let _ = world.enqueue(buyer, move |b, world| {
        world.award_currency(b, currency, amount);
        world.send(b.id(), OutboundMessage::Notice { text });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntitySnapshot;
    use crate::types::{EntityId, ItemStats, Position};
    use crate::world::{StaticItemTable, WorldBuilder};

    fn entity(id: u32) -> Entity {
        Entity::from_snapshot(EntitySnapshot::new(
            EntityId(id),
            "vendor",
            20,
            Position {
                map_id: 1036,
                x: 200,
                y: 200,
            },
        ))
    }

    fn world_with_item() -> Arc<World> {
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
        WorldBuilder::new(Default::default())
            .items(Arc::new(items))
            .build()
    }

    #[tokio::test]
    async fn listing_escrows_the_item_out_of_inventory() {
        let world = world_with_item();
        let mut v = entity(1);
        let item = ItemInstance::new(300);
        let uid = item.uid;
        v.snapshot.inventory.push(item);
        open_booth(&mut v, "silks").expect("open");
        list_item(&mut v, &world, uid, 500, CurrencyKind::Money).expect("list");
        assert!(!inventory::holds_item(&v.snapshot, uid));
        assert!(v.booth.as_ref().unwrap().find(uid).is_some());

        unlist_item(&mut v, &world, uid).expect("unlist");
        assert!(inventory::holds_item(&v.snapshot, uid));
    }

    #[tokio::test]
    async fn catalogue_capacity_enforced() {
        let world = world_with_item();
        let mut v = entity(1);
        open_booth(&mut v, "bulk").expect("open");
        for _ in 0..BOOTH_CAPACITY {
            let item = ItemInstance::new(300);
            let uid = item.uid;
            v.snapshot.inventory.push(item);
            list_item(&mut v, &world, uid, 10, CurrencyKind::Money).expect("fits");
        }
        let item = ItemInstance::new(300);
        let uid = item.uid;
        v.snapshot.inventory.push(item);
        let err = list_item(&mut v, &world, uid, 10, CurrencyKind::Money).unwrap_err();
        assert!(matches!(err, CoreError::ResourceExhausted(_)));
        // The over-capacity item stayed in the inventory.
        assert!(inventory::holds_item(&v.snapshot, uid));
    }

    #[tokio::test]
    async fn close_returns_everything() {
        let world = world_with_item();
        let mut v = entity(1);
        open_booth(&mut v, "closing").expect("open");
        for _ in 0..3 {
            let item = ItemInstance::new(300);
            let uid = item.uid;
            v.snapshot.inventory.push(item);
            list_item(&mut v, &world, uid, 10, CurrencyKind::Money).expect("list");
        }
        assert_eq!(v.snapshot.inventory.len(), 0);
        close_booth(&mut v, &world);
        assert!(v.booth.is_none());
        assert_eq!(v.snapshot.inventory.len(), 3);
    }

    #[tokio::test]
    async fn virtue_points_are_not_a_sale_currency() {
        let world = world_with_item();
        let mut v = entity(1);
        let item = ItemInstance::new(300);
        let uid = item.uid;
        v.snapshot.inventory.push(item);
        open_booth(&mut v, "odd").expect("open");
        assert!(list_item(&mut v, &world, uid, 10, CurrencyKind::VirtuePoints).is_err());
    }
}
