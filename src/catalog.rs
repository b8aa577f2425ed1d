//! Catalog collaborators
//!
//! The engine does not own product data, tax rules, or carrier rates. It
//! consumes them through the narrow interfaces here: an async price/stock
//! lookup and two injectable rule capabilities (tax rate, shipping cost).

use async_trait::async_trait;
use mockall::automock;
use rust_decimal::Decimal;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    carts::{CartItem, VariantId},
    money::{Money, MoneyError},
};

/// Errors from catalog lookups.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    /// The catalog has no such variant.
    #[error("variant {0} not found in catalog")]
    UnknownVariant(VariantId),

    /// The catalog could not be reached or answered with an error.
    #[error("catalog lookup failed: {0}")]
    Unavailable(String),
}

/// Where an order ships to, as far as tax and shipping rules care.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    /// ISO country code.
    pub country: String,

    /// Postal code, when the rule set needs it.
    pub postal_code: Option<String>,
}

impl Destination {
    /// Build a destination from a country code.
    pub fn new(country: impl Into<String>) -> Self {
        Self {
            country: country.into(),
            postal_code: None,
        }
    }
}

/// Live catalog prices and stock levels.
///
/// `current_stock` is a conflict-detection hint only; the authoritative read
/// happens inside the reservation manager.
#[automock]
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// The current catalog price for a variant.
    async fn current_price(&self, variant: VariantId) -> Result<Money, CatalogError>;

    /// The current stock level for a variant.
    async fn current_stock(&self, variant: VariantId) -> Result<u32, CatalogError>;
}

/// A fixed in-memory price list. The reference [`PriceSource`] for tests and
/// single-process deployments.
#[derive(Debug, Clone, Default)]
pub struct StaticPrices {
    prices: FxHashMap<VariantId, Money>,
    stock_hints: FxHashMap<VariantId, u32>,
}

impl StaticPrices {
    /// An empty price list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the price (and optionally a stock hint) for a variant.
    pub fn insert(&mut self, variant: VariantId, price: Money, stock: u32) {
        self.prices.insert(variant, price);
        self.stock_hints.insert(variant, stock);
    }
}

#[async_trait]
impl PriceSource for StaticPrices {
    async fn current_price(&self, variant: VariantId) -> Result<Money, CatalogError> {
        self.prices
            .get(&variant)
            .copied()
            .ok_or(CatalogError::UnknownVariant(variant))
    }

    async fn current_stock(&self, variant: VariantId) -> Result<u32, CatalogError> {
        self.stock_hints
            .get(&variant)
            .copied()
            .ok_or(CatalogError::UnknownVariant(variant))
    }
}

/// Tax-jurisdiction rate lookup. Jurisdiction rules themselves are out of
/// scope; the engine only consumes the resulting rate.
#[automock]
pub trait TaxRateLookup: Send + Sync {
    /// The tax rate (e.g. `0.08` for 8%) for a destination and line set.
    fn rate_for(&self, destination: &Destination, lines: &[CartItem]) -> Decimal;
}

/// A single flat tax rate regardless of destination.
#[derive(Debug, Clone, Copy)]
pub struct FlatTaxRate(pub Decimal);

impl TaxRateLookup for FlatTaxRate {
    fn rate_for(&self, _destination: &Destination, _lines: &[CartItem]) -> Decimal {
        self.0
    }
}

/// One step of a weight-tiered shipping table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightTier {
    /// Upper weight bound for this tier; `None` means open-ended.
    pub up_to: Option<Decimal>,

    /// Cost charged for weights in this tier.
    pub cost: Money,
}

/// Shipping cost rules. The calculator treats these as an opaque function of
/// weight, destination, and merchandise total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ShippingRuleSet {
    /// Same cost for every shipment.
    FlatRate(Money),

    /// Cost steps by total cart weight; tiers are checked in order.
    WeightTiered {
        /// Tiers in ascending weight order, last one usually open-ended.
        tiers: Vec<WeightTier>,
    },

    /// A base cost waived once the merchandise total reaches a threshold.
    FreeAboveThreshold {
        /// Merchandise total at which shipping becomes free.
        threshold: Money,

        /// Cost below the threshold.
        base: Money,
    },
}

impl ShippingRuleSet {
    /// Shipping cost for a cart.
    ///
    /// # Errors
    ///
    /// Returns a [`MoneyError`] when comparing amounts across currencies.
    pub fn cost(
        &self,
        cart_weight: Decimal,
        _destination: &Destination,
        merchandise_total: Money,
    ) -> Result<Money, MoneyError> {
        match self {
            ShippingRuleSet::FlatRate(cost) => Ok(*cost),
            ShippingRuleSet::WeightTiered { tiers } => {
                let tier = tiers
                    .iter()
                    .find(|tier| tier.up_to.is_none_or(|bound| cart_weight <= bound))
                    .or_else(|| tiers.last());

                Ok(tier.map_or(Money::zero(merchandise_total.currency()), |tier| tier.cost))
            }
            ShippingRuleSet::FreeAboveThreshold { threshold, base } => {
                // min() is only here to surface currency mismatches early.
                merchandise_total.min(*threshold)?;

                if merchandise_total.amount() >= threshold.amount() {
                    Ok(Money::zero(base.currency()))
                } else {
                    Ok(*base)
                }
            }
        }
    }
}
