//! Carts
//!
//! A cart is the mutable, pre-checkout aggregate: it belongs to one customer
//! or guest session, holds at most one line per product variant, and carries
//! at most one coupon. Checkout snapshots it; nothing here touches storage.

use jiff::{SignedDuration, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    config::StackingPolicy,
    coupons::CouponCode,
    ids::TypedUuid,
    money::{Currency, Money, MoneyError},
};

/// Cart identifier.
pub type CartId = TypedUuid<Cart>;

/// Product-variant identifier, shared with inventory and the catalog.
pub type VariantId = TypedUuid<VariantMarker>;

/// Marker type for [`VariantId`]. Variants themselves live in the catalog.
#[derive(Debug)]
pub struct VariantMarker;

/// Registered-customer identifier.
pub type CustomerId = TypedUuid<CustomerMarker>;

/// Marker type for [`CustomerId`]. Customer records are out of scope.
#[derive(Debug)]
pub struct CustomerMarker;

/// Product category, used for coupon eligibility.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CategoryId(String);

impl CategoryId {
    /// Wrap a category name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The category name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Who a cart (and later its order) belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CartOwner {
    /// A registered customer.
    Customer(CustomerId),

    /// An anonymous visitor, keyed by session token.
    Guest(String),
}

/// Cart lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CartStatus {
    /// Open for mutation.
    Active,

    /// Left behind; kept for re-engagement, no longer valid for checkout.
    Abandoned,

    /// Turned into an order.
    Converted,

    /// Past its expiry timestamp.
    Expired,
}

/// Errors from cart mutation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CartError {
    /// Quantities must be positive; use `set_quantity(.., 0)` to remove.
    #[error("quantity must be greater than zero")]
    ZeroQuantity,

    /// An item's currency differs from the cart currency.
    #[error("item has currency {item}, but cart has currency {cart}")]
    CurrencyMismatch {
        /// Currency of the offending item.
        item: &'static str,
        /// Currency of the cart.
        cart: &'static str,
    },

    /// A second coupon was attached under [`StackingPolicy::RejectAdditional`].
    #[error("cart already has coupon {0} attached")]
    CouponAlreadyAttached(CouponCode),
}

/// One line of a cart: a product variant with its price snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
    /// The product variant this line references.
    pub variant: VariantId,

    /// Units requested. Always positive.
    pub quantity: u32,

    /// Unit price captured when the item was added. Re-validated against the
    /// catalog at checkout; never silently replaced.
    pub unit_price: Money,

    /// When the unit price was captured.
    pub priced_at: Timestamp,

    /// Unit weight, for shipping tiers.
    pub unit_weight: Decimal,

    /// Category, for coupon eligibility.
    pub category: CategoryId,
}

impl CartItem {
    /// Line subtotal: unit price times quantity.
    ///
    /// # Errors
    ///
    /// Returns a [`MoneyError`] on arithmetic overflow.
    pub fn line_total(&self) -> Result<Money, MoneyError> {
        self.unit_price.mul_quantity(self.quantity)
    }
}

/// A shopping cart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cart {
    /// Cart identifier.
    pub id: CartId,

    /// Owning customer or guest session.
    pub owner: CartOwner,

    /// Lifecycle status.
    pub status: CartStatus,

    /// Currency every line must be priced in.
    pub currency: Currency,

    /// Lines, in insertion order. At most one per variant.
    pub items: Vec<CartItem>,

    /// Attached coupon code, if any.
    pub coupon: Option<CouponCode>,

    /// When the cart was created.
    pub created_at: Timestamp,

    /// When the cart stops being valid for checkout.
    pub expires_at: Timestamp,
}

impl Cart {
    /// Create an empty, active cart.
    pub fn new(owner: CartOwner, currency: Currency, now: Timestamp, ttl: SignedDuration) -> Self {
        Self {
            id: CartId::new(),
            owner,
            status: CartStatus::Active,
            currency,
            items: Vec::new(),
            coupon: None,
            created_at: now,
            expires_at: now.saturating_add(ttl).unwrap_or(Timestamp::MAX),
        }
    }

    /// Add units of a variant, merging into an existing line for the same
    /// variant so the one-line-per-variant invariant holds.
    ///
    /// # Errors
    ///
    /// Returns a [`CartError`] for a zero quantity or a currency mismatch.
    pub fn add_item(&mut self, item: CartItem) -> Result<(), CartError> {
        if item.quantity == 0 {
            return Err(CartError::ZeroQuantity);
        }

        if item.unit_price.currency() != self.currency {
            return Err(CartError::CurrencyMismatch {
                item: item.unit_price.currency().code(),
                cart: self.currency.code(),
            });
        }

        if let Some(existing) = self.items.iter_mut().find(|line| line.variant == item.variant) {
            existing.quantity = existing.quantity.saturating_add(item.quantity);
        } else {
            self.items.push(item);
        }

        Ok(())
    }

    /// Remove the line for a variant. Returns whether a line was removed.
    pub fn remove_item(&mut self, variant: VariantId) -> bool {
        let before = self.items.len();
        self.items.retain(|line| line.variant != variant);

        self.items.len() != before
    }

    /// Set the quantity for a variant's line; zero removes the line.
    /// Returns whether the cart had such a line.
    pub fn set_quantity(&mut self, variant: VariantId, quantity: u32) -> bool {
        if quantity == 0 {
            return self.remove_item(variant);
        }

        match self.items.iter_mut().find(|line| line.variant == variant) {
            Some(line) => {
                line.quantity = quantity;
                true
            }
            None => false,
        }
    }

    /// Attach a coupon under the given stacking policy. Returns the code it
    /// replaced, if any.
    ///
    /// # Errors
    ///
    /// Returns [`CartError::CouponAlreadyAttached`] when the policy rejects
    /// stacking and a coupon is already present.
    pub fn attach_coupon(
        &mut self,
        code: CouponCode,
        policy: StackingPolicy,
    ) -> Result<Option<CouponCode>, CartError> {
        match (&self.coupon, policy) {
            (Some(existing), StackingPolicy::RejectAdditional) => {
                Err(CartError::CouponAlreadyAttached(existing.clone()))
            }
            _ => Ok(self.coupon.replace(code)),
        }
    }

    /// Detach the coupon, returning it.
    pub fn detach_coupon(&mut self) -> Option<CouponCode> {
        self.coupon.take()
    }

    /// Remove every line.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Sum of line subtotals from the captured unit prices.
    ///
    /// # Errors
    ///
    /// Returns a [`MoneyError`] on arithmetic overflow.
    pub fn subtotal(&self) -> Result<Money, MoneyError> {
        self.items
            .iter()
            .try_fold(Money::zero(self.currency), |acc, line| {
                acc.add(line.line_total()?)
            })
    }

    /// Total number of units across all lines.
    pub fn total_quantity(&self) -> u64 {
        self.items.iter().map(|line| u64::from(line.quantity)).sum()
    }

    /// Total weight across all lines.
    pub fn total_weight(&self) -> Decimal {
        self.items
            .iter()
            .map(|line| line.unit_weight * Decimal::from(line.quantity))
            .sum()
    }

    /// Whether the cart has no lines.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether the cart is past its expiry.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now > self.expires_at
    }

    /// Push the expiry out from `now`.
    pub fn extend_expiry(&mut self, ttl: SignedDuration, now: Timestamp) {
        self.expires_at = now.saturating_add(ttl).unwrap_or(Timestamp::MAX);
    }

    /// Mark the cart abandoned.
    pub fn mark_abandoned(&mut self) {
        self.status = CartStatus::Abandoned;
    }

    /// Mark the cart as converted into an order.
    pub fn mark_converted(&mut self) {
        self.status = CartStatus::Converted;
    }
}
