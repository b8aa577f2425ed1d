//! Persistence boundary
//!
//! The engine needs exactly three storage capabilities: read-with-version,
//! compare-and-swap write for the records more than one checkout can touch
//! (inventory, coupons, orders), and plain keyed writes for records with a
//! single owner (carts, reservations). The traits here express that surface;
//! [`MemoryStore`] is the process-local reference implementation. Which
//! database sits behind a production implementation is out of scope.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use jiff::Timestamp;
use mockall::automock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    carts::{Cart, CartId, CartOwner, VariantId},
    coupons::{Coupon, CouponCode, CouponUsage},
    inventory::{InventoryRecord, Reservation, ReservationId},
    orders::{Order, OrderId},
};

/// Monotonic record version for optimistic concurrency control.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Version(u64);

impl Version {
    /// The version of a freshly created record.
    pub const fn initial() -> Self {
        Self(0)
    }

    /// The version after one more mutation.
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// The raw counter value.
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Errors from the storage boundary.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// No record exists for the key.
    #[error("record not found")]
    NotFound,

    /// A record already exists for the key.
    #[error("record already exists")]
    AlreadyExists,

    /// The record's version moved since it was read; re-read and retry.
    #[error("version check failed")]
    VersionMismatch,
}

/// Cart storage. Carts have a single owner, so writes are plain overwrites.
#[automock]
#[async_trait]
pub trait CartStore: Send + Sync {
    /// Read a cart.
    async fn cart(&self, id: CartId) -> Result<Cart, StoreError>;

    /// Create a cart.
    async fn insert_cart(&self, cart: Cart) -> Result<(), StoreError>;

    /// Overwrite a cart.
    async fn put_cart(&self, cart: Cart) -> Result<(), StoreError>;
}

/// Coupon storage with a version-checked write for the usage counter.
#[automock]
#[async_trait]
pub trait CouponStore: Send + Sync {
    /// Read a coupon by code.
    async fn coupon(&self, code: &CouponCode) -> Result<Coupon, StoreError>;

    /// Create a coupon.
    async fn insert_coupon(&self, coupon: Coupon) -> Result<(), StoreError>;

    /// Write a coupon back iff its stored version equals `expected`.
    async fn put_coupon(&self, expected: Version, coupon: Coupon) -> Result<(), StoreError>;

    /// How many times an owner has used a coupon.
    async fn user_usage_count(&self, code: &CouponCode, owner: &CartOwner)
    -> Result<u32, StoreError>;

    /// Append a usage row.
    async fn record_usage(&self, usage: CouponUsage) -> Result<(), StoreError>;

    /// Remove the usage row for an order, compensating a failed checkout.
    async fn delete_usage(&self, code: &CouponCode, order: OrderId) -> Result<(), StoreError>;
}

/// Inventory and reservation storage. Inventory writes are version-checked;
/// reservations have a single owning checkout and are plain overwrites.
#[automock]
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Read a variant's inventory record.
    async fn inventory(&self, variant: VariantId) -> Result<InventoryRecord, StoreError>;

    /// Create an inventory record.
    async fn insert_inventory(&self, record: InventoryRecord) -> Result<(), StoreError>;

    /// Write a record back iff its stored version equals `expected`.
    async fn put_inventory(
        &self,
        expected: Version,
        record: InventoryRecord,
    ) -> Result<(), StoreError>;

    /// Create a reservation.
    async fn insert_reservation(&self, reservation: Reservation) -> Result<(), StoreError>;

    /// Read a reservation.
    async fn reservation(&self, id: ReservationId) -> Result<Reservation, StoreError>;

    /// Write a reservation back iff its stored version equals `expected`.
    /// Status flips race between the owning checkout and the expiry sweep.
    async fn put_reservation(
        &self,
        expected: Version,
        reservation: Reservation,
    ) -> Result<(), StoreError>;

    /// Pending reservations whose expiry is before `now`.
    async fn expired_reservations(&self, now: Timestamp) -> Result<Vec<Reservation>, StoreError>;
}

/// Order storage. State transitions are version-checked because more than
/// one actor can drive them; the history itself is append-only by
/// construction.
#[automock]
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Read an order.
    async fn order(&self, id: OrderId) -> Result<Order, StoreError>;

    /// Create an order.
    async fn insert_order(&self, order: Order) -> Result<(), StoreError>;

    /// Write an order back iff its stored version equals `expected`.
    async fn put_order(&self, expected: Version, order: Order) -> Result<(), StoreError>;
}

/// Everything checkout needs from storage, in one bound.
pub trait CheckoutStore: CartStore + CouponStore + InventoryStore + OrderStore {}

impl<T: CartStore + CouponStore + InventoryStore + OrderStore> CheckoutStore for T {}

#[derive(Debug, Default)]
struct Inner {
    carts: FxHashMap<CartId, Cart>,
    coupons: FxHashMap<CouponCode, Coupon>,
    usages: Vec<CouponUsage>,
    inventory: FxHashMap<VariantId, InventoryRecord>,
    reservations: FxHashMap<ReservationId, Reservation>,
    orders: FxHashMap<OrderId, Order>,
}

/// In-memory store: the reference [`CheckoutStore`] for tests and
/// single-process deployments. One mutex guards all tables, which makes each
/// store call its own transactional boundary.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        f(&mut inner)
    }
}

#[async_trait]
impl CartStore for MemoryStore {
    async fn cart(&self, id: CartId) -> Result<Cart, StoreError> {
        self.with(|inner| inner.carts.get(&id).cloned().ok_or(StoreError::NotFound))
    }

    async fn insert_cart(&self, cart: Cart) -> Result<(), StoreError> {
        self.with(|inner| {
            if inner.carts.contains_key(&cart.id) {
                return Err(StoreError::AlreadyExists);
            }

            inner.carts.insert(cart.id, cart);

            Ok(())
        })
    }

    async fn put_cart(&self, cart: Cart) -> Result<(), StoreError> {
        self.with(|inner| {
            if !inner.carts.contains_key(&cart.id) {
                return Err(StoreError::NotFound);
            }

            inner.carts.insert(cart.id, cart);

            Ok(())
        })
    }
}

#[async_trait]
impl CouponStore for MemoryStore {
    async fn coupon(&self, code: &CouponCode) -> Result<Coupon, StoreError> {
        self.with(|inner| inner.coupons.get(code).cloned().ok_or(StoreError::NotFound))
    }

    async fn insert_coupon(&self, coupon: Coupon) -> Result<(), StoreError> {
        self.with(|inner| {
            if inner.coupons.contains_key(&coupon.code) {
                return Err(StoreError::AlreadyExists);
            }

            inner.coupons.insert(coupon.code.clone(), coupon);

            Ok(())
        })
    }

    async fn put_coupon(&self, expected: Version, coupon: Coupon) -> Result<(), StoreError> {
        self.with(|inner| {
            let stored = inner
                .coupons
                .get_mut(&coupon.code)
                .ok_or(StoreError::NotFound)?;

            if stored.version != expected {
                return Err(StoreError::VersionMismatch);
            }

            *stored = coupon;

            Ok(())
        })
    }

    async fn user_usage_count(
        &self,
        code: &CouponCode,
        owner: &CartOwner,
    ) -> Result<u32, StoreError> {
        self.with(|inner| {
            let count = inner
                .usages
                .iter()
                .filter(|usage| usage.code == *code && usage.owner == *owner)
                .count();

            Ok(u32::try_from(count).unwrap_or(u32::MAX))
        })
    }

    async fn record_usage(&self, usage: CouponUsage) -> Result<(), StoreError> {
        self.with(|inner| {
            inner.usages.push(usage);

            Ok(())
        })
    }

    async fn delete_usage(&self, code: &CouponCode, order: OrderId) -> Result<(), StoreError> {
        self.with(|inner| {
            inner
                .usages
                .retain(|usage| !(usage.code == *code && usage.order == order));

            Ok(())
        })
    }
}

#[async_trait]
impl InventoryStore for MemoryStore {
    async fn inventory(&self, variant: VariantId) -> Result<InventoryRecord, StoreError> {
        self.with(|inner| {
            inner
                .inventory
                .get(&variant)
                .copied()
                .ok_or(StoreError::NotFound)
        })
    }

    async fn insert_inventory(&self, record: InventoryRecord) -> Result<(), StoreError> {
        self.with(|inner| {
            if inner.inventory.contains_key(&record.variant) {
                return Err(StoreError::AlreadyExists);
            }

            inner.inventory.insert(record.variant, record);

            Ok(())
        })
    }

    async fn put_inventory(
        &self,
        expected: Version,
        record: InventoryRecord,
    ) -> Result<(), StoreError> {
        self.with(|inner| {
            let stored = inner
                .inventory
                .get_mut(&record.variant)
                .ok_or(StoreError::NotFound)?;

            if stored.version != expected {
                return Err(StoreError::VersionMismatch);
            }

            *stored = record;

            Ok(())
        })
    }

    async fn insert_reservation(&self, reservation: Reservation) -> Result<(), StoreError> {
        self.with(|inner| {
            if inner.reservations.contains_key(&reservation.id) {
                return Err(StoreError::AlreadyExists);
            }

            inner.reservations.insert(reservation.id, reservation);

            Ok(())
        })
    }

    async fn reservation(&self, id: ReservationId) -> Result<Reservation, StoreError> {
        self.with(|inner| {
            inner
                .reservations
                .get(&id)
                .cloned()
                .ok_or(StoreError::NotFound)
        })
    }

    async fn put_reservation(
        &self,
        expected: Version,
        reservation: Reservation,
    ) -> Result<(), StoreError> {
        self.with(|inner| {
            let stored = inner
                .reservations
                .get_mut(&reservation.id)
                .ok_or(StoreError::NotFound)?;

            if stored.version != expected {
                return Err(StoreError::VersionMismatch);
            }

            *stored = reservation;

            Ok(())
        })
    }

    async fn expired_reservations(&self, now: Timestamp) -> Result<Vec<Reservation>, StoreError> {
        self.with(|inner| {
            Ok(inner
                .reservations
                .values()
                .filter(|reservation| {
                    reservation.status == crate::inventory::ReservationStatus::Pending
                        && reservation.is_expired(now)
                })
                .cloned()
                .collect())
        })
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn order(&self, id: OrderId) -> Result<Order, StoreError> {
        self.with(|inner| inner.orders.get(&id).cloned().ok_or(StoreError::NotFound))
    }

    async fn insert_order(&self, order: Order) -> Result<(), StoreError> {
        self.with(|inner| {
            if inner.orders.contains_key(&order.id) {
                return Err(StoreError::AlreadyExists);
            }

            inner.orders.insert(order.id, order);

            Ok(())
        })
    }

    async fn put_order(&self, expected: Version, order: Order) -> Result<(), StoreError> {
        self.with(|inner| {
            let stored = inner.orders.get_mut(&order.id).ok_or(StoreError::NotFound)?;

            if stored.version != expected {
                return Err(StoreError::VersionMismatch);
            }

            *stored = order;

            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;

    use super::*;

    #[tokio::test]
    async fn put_inventory_rejects_stale_versions() -> TestResult {
        let store = MemoryStore::new();
        let variant = VariantId::new();
        let record = InventoryRecord::new(variant, 10);

        store.insert_inventory(record).await?;

        let mut updated = record;
        updated.available = 9;
        updated.version = record.version.next();

        store.put_inventory(record.version, updated).await?;

        // A second writer that read version 0 must lose.
        let mut racing = record;
        racing.available = 8;
        racing.version = record.version.next();

        let result = store.put_inventory(record.version, racing).await;

        assert_eq!(result, Err(StoreError::VersionMismatch));

        Ok(())
    }

    #[tokio::test]
    async fn insert_twice_reports_already_exists() -> TestResult {
        let store = MemoryStore::new();
        let record = InventoryRecord::new(VariantId::new(), 1);

        store.insert_inventory(record).await?;
        let result = store.insert_inventory(record).await;

        assert_eq!(result, Err(StoreError::AlreadyExists));

        Ok(())
    }

    #[tokio::test]
    async fn usage_rows_count_per_owner_and_delete_by_order() -> TestResult {
        use jiff::Timestamp;

        use crate::money::{Currency, Money};

        let store = MemoryStore::new();
        let code = CouponCode::new("SAVE");
        let owner = CartOwner::Guest("sess-1".into());
        let other = CartOwner::Guest("sess-2".into());
        let order = OrderId::new();

        store
            .record_usage(CouponUsage {
                code: code.clone(),
                owner: owner.clone(),
                order,
                discount: Money::from_minor(1_00, Currency::Usd),
                used_at: Timestamp::now(),
            })
            .await?;

        assert_eq!(store.user_usage_count(&code, &owner).await?, 1);
        assert_eq!(store.user_usage_count(&code, &other).await?, 0);

        store.delete_usage(&code, order).await?;
        assert_eq!(store.user_usage_count(&code, &owner).await?, 0);

        Ok(())
    }
}
