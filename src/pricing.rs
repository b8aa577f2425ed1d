//! Pricing
//!
//! Totals computation for a cart snapshot. [`CartCalculator::compute_totals`]
//! is a pure function: identical inputs always produce identical totals, and
//! nothing here touches storage. Catalog price verification is the one
//! read-only collaborator call, kept in its own step so checkout can surface
//! price drift before anything is reserved.

use jiff::{SignedDuration, Timestamp};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::{
    carts::{Cart, VariantId},
    catalog::{CatalogError, Destination, PriceSource, ShippingRuleSet, TaxRateLookup},
    config::CheckoutConfig,
    coupons::AppliedDiscount,
    money::{Currency, Money, MoneyError},
};

/// Errors from totals computation.
#[derive(Debug, Error, PartialEq)]
pub enum PricingError {
    /// Money arithmetic failed.
    #[error(transparent)]
    Money(#[from] MoneyError),

    /// A catalog price lookup failed.
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// A unit price that drifted from its cart snapshot beyond tolerance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceChange {
    /// The affected variant.
    pub variant: VariantId,

    /// Units of it in the cart.
    pub quantity: u32,

    /// The price the customer was shown.
    pub quoted: Money,

    /// The price the catalog answers now.
    pub current: Money,
}

/// Per-line breakdown inside [`Totals`]. Display data, never authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineTotal {
    /// The product variant.
    pub variant: VariantId,

    /// Units charged.
    pub quantity: u32,

    /// Unit price charged.
    pub unit_price: Money,

    /// Unit price times quantity.
    pub line_subtotal: Money,

    /// This line's share of the cart discount. Line shares always sum to the
    /// cart discount exactly.
    pub line_discount: Money,
}

/// The priced result of a cart snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    /// Sum of line subtotals.
    pub subtotal: Money,

    /// Coupon discount on the merchandise total.
    pub discount: Money,

    /// Tax on the discounted merchandise total, rounded half-even.
    pub tax: Money,

    /// Shipping cost after any free-shipping waiver.
    pub shipping: Money,

    /// `subtotal - discount + tax + shipping`, clamped at zero.
    pub grand_total: Money,

    /// Per-line breakdown.
    pub lines: Vec<LineTotal>,
}

impl Totals {
    /// All-zero totals in a currency.
    pub fn empty(currency: Currency) -> Self {
        Self {
            subtotal: Money::zero(currency),
            discount: Money::zero(currency),
            tax: Money::zero(currency),
            shipping: Money::zero(currency),
            grand_total: Money::zero(currency),
            lines: Vec::new(),
        }
    }
}

/// Computes totals for cart snapshots.
#[derive(Debug, Clone, Copy)]
pub struct CartCalculator {
    staleness: SignedDuration,
    tolerance_minor: i64,
}

impl CartCalculator {
    /// Build a calculator with an explicit staleness window and price
    /// tolerance in minor units.
    pub fn new(staleness: SignedDuration, tolerance_minor: i64) -> Self {
        Self {
            staleness,
            tolerance_minor,
        }
    }

    /// Build a calculator from engine configuration.
    pub fn from_config(config: &CheckoutConfig) -> Self {
        Self::new(config.price_staleness, config.price_tolerance_minor)
    }

    /// Re-check stale unit-price snapshots against the catalog and report
    /// every price that moved beyond tolerance. Fresh snapshots are trusted
    /// and cost no lookup.
    ///
    /// # Errors
    ///
    /// Returns a [`PricingError`] when a catalog lookup fails.
    pub async fn verify_prices(
        &self,
        cart: &Cart,
        prices: &dyn PriceSource,
        now: Timestamp,
    ) -> Result<Vec<PriceChange>, PricingError> {
        let mut changes = Vec::new();

        for line in &cart.items {
            if now.duration_since(line.priced_at) <= self.staleness {
                continue;
            }

            let current = prices.current_price(line.variant).await?;
            let drift = (current.to_minor_units()? - line.unit_price.to_minor_units()?).abs();

            if drift > self.tolerance_minor {
                changes.push(PriceChange {
                    variant: line.variant,
                    quantity: line.quantity,
                    quoted: line.unit_price,
                    current,
                });
            }
        }

        Ok(changes)
    }

    /// Compute totals for a cart snapshot. Pure: no lookups, no side effects
    /// beyond an anomaly log when the grand total has to be clamped.
    ///
    /// # Errors
    ///
    /// Returns a [`PricingError`] on money arithmetic failure.
    pub fn compute_totals(
        &self,
        cart: &Cart,
        discount: Option<&AppliedDiscount>,
        taxes: &dyn TaxRateLookup,
        shipping_rules: &ShippingRuleSet,
        destination: &Destination,
    ) -> Result<Totals, PricingError> {
        let currency = cart.currency;
        let subtotal = cart.subtotal()?;

        let discount_amount = discount.map_or(Money::zero(currency), |applied| applied.amount);
        let free_shipping = discount.is_some_and(|applied| applied.free_shipping);

        let taxable = subtotal.sub(discount_amount)?.clamp_non_negative();

        let rate = taxes.rate_for(destination, &cart.items);
        let tax = taxable.mul_decimal(rate)?.round_to_minor();

        let shipping = if free_shipping {
            Money::zero(currency)
        } else {
            shipping_rules.cost(cart.total_weight(), destination, subtotal)?
        };

        let raw_grand_total = subtotal.sub(discount_amount)?.add(tax)?.add(shipping)?;

        if raw_grand_total.is_negative() {
            warn!(
                cart = %cart.id,
                %subtotal,
                discount = %discount_amount,
                "grand total went negative; clamping to zero"
            );
        }

        let lines = allocate_line_discounts(cart, subtotal, discount_amount)?;

        Ok(Totals {
            subtotal,
            discount: discount_amount,
            tax,
            shipping,
            grand_total: raw_grand_total.clamp_non_negative(),
            lines,
        })
    }
}

/// Spread the cart discount across lines in proportion to their subtotals,
/// in minor units, giving the final line whatever remainder is left so the
/// shares always sum to the cart discount exactly.
fn allocate_line_discounts(
    cart: &Cart,
    subtotal: Money,
    discount: Money,
) -> Result<Vec<LineTotal>, MoneyError> {
    let currency = cart.currency;
    let subtotal_minor = subtotal.to_minor_units()?;
    let discount_minor = discount.to_minor_units()?;

    let mut lines = Vec::with_capacity(cart.items.len());
    let mut allocated: i64 = 0;

    for (index, item) in cart.items.iter().enumerate() {
        let line_subtotal = item.line_total()?;

        let share = if subtotal_minor == 0 || discount_minor == 0 {
            0
        } else if index == cart.items.len() - 1 {
            discount_minor - allocated
        } else {
            discount_minor * line_subtotal.to_minor_units()? / subtotal_minor
        };

        allocated += share;

        lines.push(LineTotal {
            variant: item.variant,
            quantity: item.quantity,
            unit_price: item.unit_price,
            line_subtotal,
            line_discount: Money::from_minor(share, currency),
        });
    }

    Ok(lines)
}

#[cfg(test)]
mod tests {
    use jiff::Timestamp;
    use rust_decimal::Decimal;
    use testresult::TestResult;

    use crate::{
        carts::{CartItem, CartOwner, CategoryId, CustomerId},
        catalog::{FlatTaxRate, StaticPrices},
        coupons::CouponCode,
    };

    use super::*;

    fn usd(minor: i64) -> Money {
        Money::from_minor(minor, Currency::Usd)
    }

    fn cart_with(items: &[(u32, i64)], now: Timestamp) -> Cart {
        let mut cart = Cart::new(
            CartOwner::Customer(CustomerId::new()),
            Currency::Usd,
            now,
            SignedDuration::from_secs(3600),
        );

        for &(quantity, price_minor) in items {
            cart.add_item(CartItem {
                variant: VariantId::new(),
                quantity,
                unit_price: usd(price_minor),
                priced_at: now,
                unit_weight: Decimal::ONE,
                category: CategoryId::new("general"),
            })
            .unwrap_or_else(|error| panic!("test cart item should be valid: {error}"));
        }

        cart
    }

    fn ten_percent_off(amount: Money) -> AppliedDiscount {
        AppliedDiscount {
            code: CouponCode::new("TEN"),
            amount,
            free_shipping: false,
        }
    }

    #[test]
    fn worked_example_with_ten_percent_coupon() -> TestResult {
        // Two items (10.00 x 2, 5.00 x 1) and 10% off: subtotal 25.00,
        // discount 2.50, tax at 8% on 22.50, flat 4.99 shipping.
        let now = Timestamp::now();
        let cart = cart_with(&[(2, 10_00), (1, 5_00)], now);
        let calculator = CartCalculator::new(SignedDuration::from_secs(300), 0);

        let totals = calculator.compute_totals(
            &cart,
            Some(&ten_percent_off(usd(2_50))),
            &FlatTaxRate(Decimal::new(8, 2)),
            &ShippingRuleSet::FlatRate(usd(4_99)),
            &Destination::new("US"),
        )?;

        assert_eq!(totals.subtotal, usd(25_00));
        assert_eq!(totals.discount, usd(2_50));
        assert_eq!(totals.tax, usd(1_80));
        assert_eq!(totals.shipping, usd(4_99));
        assert_eq!(totals.grand_total, usd(29_29));

        Ok(())
    }

    #[test]
    fn compute_totals_is_idempotent() -> TestResult {
        let now = Timestamp::now();
        let cart = cart_with(&[(3, 7_33), (2, 12_99)], now);
        let calculator = CartCalculator::new(SignedDuration::from_secs(300), 0);
        let taxes = FlatTaxRate(Decimal::new(725, 4));
        let rules = ShippingRuleSet::FreeAboveThreshold {
            threshold: usd(50_00),
            base: usd(9_99),
        };
        let destination = Destination::new("US");
        let discount = ten_percent_off(usd(4_80));

        let first =
            calculator.compute_totals(&cart, Some(&discount), &taxes, &rules, &destination)?;
        let second =
            calculator.compute_totals(&cart, Some(&discount), &taxes, &rules, &destination)?;

        assert_eq!(first, second);

        Ok(())
    }

    #[test]
    fn negative_grand_total_is_clamped_to_zero() -> TestResult {
        let now = Timestamp::now();
        let cart = cart_with(&[(1, 10_00)], now);
        let calculator = CartCalculator::new(SignedDuration::from_secs(300), 0);

        // An over-large discount fed in directly; the calculator must clamp,
        // not go negative.
        let totals = calculator.compute_totals(
            &cart,
            Some(&ten_percent_off(usd(15_00))),
            &FlatTaxRate(Decimal::ZERO),
            &ShippingRuleSet::FlatRate(usd(0)),
            &Destination::new("US"),
        )?;

        assert_eq!(totals.grand_total, usd(0));

        Ok(())
    }

    #[test]
    fn free_shipping_discount_zeroes_shipping() -> TestResult {
        let now = Timestamp::now();
        let cart = cart_with(&[(1, 10_00)], now);
        let calculator = CartCalculator::new(SignedDuration::from_secs(300), 0);

        let discount = AppliedDiscount {
            code: CouponCode::new("SHIPFREE"),
            amount: usd(0),
            free_shipping: true,
        };

        let totals = calculator.compute_totals(
            &cart,
            Some(&discount),
            &FlatTaxRate(Decimal::ZERO),
            &ShippingRuleSet::FlatRate(usd(9_99)),
            &Destination::new("US"),
        )?;

        assert_eq!(totals.shipping, usd(0));
        assert_eq!(totals.grand_total, usd(10_00));

        Ok(())
    }

    #[test]
    fn line_discounts_sum_exactly_to_the_cart_discount() -> TestResult {
        let now = Timestamp::now();
        // Three odd-priced lines that do not divide evenly.
        let cart = cart_with(&[(1, 3_33), (1, 3_33), (1, 3_35)], now);
        let calculator = CartCalculator::new(SignedDuration::from_secs(300), 0);

        let totals = calculator.compute_totals(
            &cart,
            Some(&ten_percent_off(usd(1_00))),
            &FlatTaxRate(Decimal::ZERO),
            &ShippingRuleSet::FlatRate(usd(0)),
            &Destination::new("US"),
        )?;

        let allocated = totals
            .lines
            .iter()
            .map(|line| line.line_discount.to_minor_units())
            .sum::<Result<i64, _>>()?;

        assert_eq!(allocated, 1_00);

        Ok(())
    }

    #[tokio::test]
    async fn stale_prices_are_rechecked_and_drift_is_reported() -> TestResult {
        let now = Timestamp::now();
        let priced_at = now.saturating_sub(SignedDuration::from_secs(600))?;

        let mut cart = cart_with(&[], now);
        let variant = VariantId::new();
        cart.add_item(CartItem {
            variant,
            quantity: 1,
            unit_price: usd(10_00),
            priced_at,
            unit_weight: Decimal::ONE,
            category: CategoryId::new("general"),
        })?;

        let mut prices = StaticPrices::new();
        prices.insert(variant, usd(12_00), 10);

        let calculator = CartCalculator::new(SignedDuration::from_secs(300), 0);
        let changes = calculator.verify_prices(&cart, &prices, now).await?;

        assert_eq!(changes.len(), 1);
        assert_eq!(
            changes.first(),
            Some(&PriceChange {
                variant,
                quantity: 1,
                quoted: usd(10_00),
                current: usd(12_00),
            })
        );

        Ok(())
    }

    #[tokio::test]
    async fn fresh_snapshots_are_trusted_without_lookups() -> TestResult {
        let now = Timestamp::now();
        let cart = cart_with(&[(1, 10_00)], now);

        // An empty catalog: any lookup would error, proving none happened.
        let prices = StaticPrices::new();

        let calculator = CartCalculator::new(SignedDuration::from_secs(300), 0);
        let changes = calculator.verify_prices(&cart, &prices, now).await?;

        assert!(changes.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn drift_within_tolerance_is_not_reported() -> TestResult {
        let now = Timestamp::now();
        let priced_at = now.saturating_sub(SignedDuration::from_secs(600))?;

        let mut cart = cart_with(&[], now);
        let variant = VariantId::new();
        cart.add_item(CartItem {
            variant,
            quantity: 1,
            unit_price: usd(10_00),
            priced_at,
            unit_weight: Decimal::ONE,
            category: CategoryId::new("general"),
        })?;

        let mut prices = StaticPrices::new();
        prices.insert(variant, usd(10_05), 10);

        let calculator = CartCalculator::new(SignedDuration::from_secs(300), 10);
        let changes = calculator.verify_prices(&cart, &prices, now).await?;

        assert!(changes.is_empty());

        Ok(())
    }
}
