//! Coupons
//!
//! Coupon validation is split from coupon consumption: [`CouponEngine::validate`]
//! is read-only and can run any number of times, while
//! [`CouponEngine::apply_and_commit`] spends one slot of the usage cap and only
//! runs as part of a checkout commit. The usage counter is a versioned record;
//! racing commits are resolved by compare-and-swap, never by a lock.

use std::sync::Arc;

use decimal_percentage::Percentage;
use jiff::Timestamp;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    carts::{Cart, CartOwner, CategoryId},
    config::RetryPolicy,
    money::{Money, MoneyError},
    orders::OrderId,
    store::{CouponStore, StoreError, Version},
};

/// A coupon code as customers type it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CouponCode(String);

impl CouponCode {
    /// Wrap a code.
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    /// The code text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CouponCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a coupon takes off the cart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DiscountKind {
    /// A percentage of the cart subtotal, in percent points (10 = 10% off).
    Percentage {
        /// Percent points.
        percent: Decimal,
    },

    /// A fixed amount off the cart subtotal.
    FixedAmount {
        /// Amount off.
        amount: Money,
    },

    /// Shipping is waived; the merchandise total is untouched.
    FreeShipping,
}

/// A discount code with its eligibility rules and usage accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coupon {
    /// Unique code.
    pub code: CouponCode,

    /// What the coupon takes off.
    pub kind: DiscountKind,

    /// Minimum cart subtotal before the coupon applies.
    pub minimum_subtotal: Option<Money>,

    /// When restricted, at least one cart line must be in one of these
    /// categories.
    pub eligible_categories: Option<Vec<CategoryId>>,

    /// Times a single user may apply this coupon.
    pub per_user_cap: u32,

    /// Times the coupon may be applied across all users; `None` = unlimited.
    pub global_cap: Option<u32>,

    /// Upper bound on the discount amount, whatever the kind computes.
    pub maximum_discount: Option<Money>,

    /// Start of the validity window; `None` = no lower bound.
    pub valid_from: Option<Timestamp>,

    /// End of the validity window; `None` = no upper bound.
    pub valid_until: Option<Timestamp>,

    /// Deactivated coupons fail validation regardless of the window.
    pub active: bool,

    /// Successful applications so far. Never exceeds `global_cap`.
    pub usage_count: u32,

    /// Optimistic-concurrency version of this record.
    pub version: Version,
}

/// Coupon status, projected from the record and the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CouponStatus {
    /// Valid for use right now (caps permitting).
    Active,

    /// Switched off by an operator.
    Inactive,

    /// Past its validity window.
    Expired,

    /// Global cap fully consumed.
    Exhausted,
}

/// Why a coupon could not be applied.
#[derive(Debug, Error, PartialEq)]
pub enum CouponError {
    /// No coupon exists for the code.
    #[error("coupon code {0} is unknown")]
    UnknownCode(CouponCode),

    /// The coupon is inactive or outside its validity window.
    #[error("coupon {0} is not currently valid")]
    ExpiredCoupon(CouponCode),

    /// The cart subtotal is below the coupon's minimum.
    #[error("cart subtotal {subtotal} is below the minimum {minimum} for coupon {code}")]
    MinimumNotMet {
        /// The coupon.
        code: CouponCode,
        /// The cart subtotal at validation time.
        subtotal: Money,
        /// The required minimum.
        minimum: Money,
    },

    /// The coupon is restricted to categories the cart has no line in.
    #[error("no cart line is in an eligible category for coupon {0}")]
    NotEligibleCategory(CouponCode),

    /// The per-user or global usage cap is already consumed.
    #[error("coupon {0} has reached its usage cap")]
    CapExceeded(CouponCode),

    /// The usage counter kept losing version races.
    #[error("coupon {0} usage counter is contended")]
    Contended(CouponCode),

    /// Discount arithmetic failed.
    #[error(transparent)]
    Money(#[from] MoneyError),

    /// The coupon store failed.
    #[error("coupon storage error")]
    Storage(#[source] StoreError),
}

/// The outcome of validating a coupon against a cart: a locked-in amount,
/// not a promise to re-derive one later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedDiscount {
    /// The validated coupon code.
    pub code: CouponCode,

    /// Amount off the merchandise total.
    pub amount: Money,

    /// Whether shipping is waived.
    pub free_shipping: bool,
}

/// One successful application of a coupon, for per-user accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouponUsage {
    /// The coupon.
    pub code: CouponCode,

    /// Who used it.
    pub owner: CartOwner,

    /// The order it was used on.
    pub order: OrderId,

    /// The discount that was granted.
    pub discount: Money,

    /// When it was committed.
    pub used_at: Timestamp,
}

impl Coupon {
    /// Project the coupon's current status.
    pub fn status(&self, now: Timestamp) -> CouponStatus {
        if !self.active {
            return CouponStatus::Inactive;
        }

        if self.valid_until.is_some_and(|until| now > until) {
            return CouponStatus::Expired;
        }

        if self.global_cap.is_some_and(|cap| self.usage_count >= cap) {
            return CouponStatus::Exhausted;
        }

        CouponStatus::Active
    }

    /// Whether `now` falls inside the validity window.
    pub fn window_contains(&self, now: Timestamp) -> bool {
        !self.valid_from.is_some_and(|from| now < from)
            && !self.valid_until.is_some_and(|until| now > until)
    }

    /// Run the eligibility checks in order, short-circuiting on the first
    /// failure: active, window, minimum, category, per-user cap, global cap.
    ///
    /// # Errors
    ///
    /// Returns the first failed check as a [`CouponError`].
    pub fn check_eligibility(
        &self,
        subtotal: Money,
        cart_categories: &[&CategoryId],
        user_usage: u32,
        now: Timestamp,
    ) -> Result<(), CouponError> {
        if !self.active || !self.window_contains(now) {
            return Err(CouponError::ExpiredCoupon(self.code.clone()));
        }

        if let Some(minimum) = self.minimum_subtotal {
            if subtotal.amount() < minimum.amount() {
                return Err(CouponError::MinimumNotMet {
                    code: self.code.clone(),
                    subtotal,
                    minimum,
                });
            }
        }

        if let Some(eligible) = &self.eligible_categories {
            let any_eligible = cart_categories
                .iter()
                .any(|category| eligible.contains(category));

            if !any_eligible {
                return Err(CouponError::NotEligibleCategory(self.code.clone()));
            }
        }

        if user_usage >= self.per_user_cap {
            return Err(CouponError::CapExceeded(self.code.clone()));
        }

        if self.global_cap.is_some_and(|cap| self.usage_count >= cap) {
            return Err(CouponError::CapExceeded(self.code.clone()));
        }

        Ok(())
    }

    /// The discount amount for a given subtotal, clamped by the maximum
    /// discount and by the subtotal itself (a coupon never pays the customer).
    ///
    /// # Errors
    ///
    /// Returns a [`MoneyError`] on arithmetic failure.
    pub fn discount_amount(&self, subtotal: Money) -> Result<Money, MoneyError> {
        let raw = match &self.kind {
            DiscountKind::Percentage { percent } => {
                let fraction = Percentage::from(percent / Decimal::ONE_HUNDRED);
                Money::from_decimal(fraction * subtotal.amount(), subtotal.currency())
                    .round_to_minor()
            }
            DiscountKind::FixedAmount { amount } => *amount,
            DiscountKind::FreeShipping => Money::zero(subtotal.currency()),
        };

        let capped = match self.maximum_discount {
            Some(max) => raw.min(max)?,
            None => raw,
        };

        capped.min(subtotal)
    }

    /// Whether this coupon waives shipping.
    pub fn waives_shipping(&self) -> bool {
        matches!(self.kind, DiscountKind::FreeShipping)
    }
}

/// Validates coupons against carts and commits usage as part of checkout.
#[derive(Debug, Clone)]
pub struct CouponEngine<S> {
    store: Arc<S>,
    retry: RetryPolicy,
}

impl<S: CouponStore> CouponEngine<S> {
    /// Build an engine over a coupon store.
    pub fn new(store: Arc<S>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Validate a coupon against a cart snapshot without consuming usage.
    ///
    /// # Errors
    ///
    /// Returns a [`CouponError`] naming the first failed check.
    #[tracing::instrument(name = "coupons.validate", skip(self, cart), fields(code = %code), err)]
    pub async fn validate(
        &self,
        code: &CouponCode,
        cart: &Cart,
        subtotal: Money,
        now: Timestamp,
    ) -> Result<AppliedDiscount, CouponError> {
        let coupon = self.load(code).await?;

        let user_usage = self
            .store
            .user_usage_count(code, &cart.owner)
            .await
            .map_err(CouponError::Storage)?;

        let categories: Vec<&CategoryId> = cart.items.iter().map(|line| &line.category).collect();

        coupon.check_eligibility(subtotal, &categories, user_usage, now)?;

        let amount = coupon.discount_amount(subtotal)?;

        debug!(code = %code, %amount, "coupon validated");

        Ok(AppliedDiscount {
            code: code.clone(),
            amount,
            free_shipping: coupon.waives_shipping(),
        })
    }

    /// Consume one usage slot as part of a checkout commit. The cap is
    /// re-checked under the version check, so racing commits for the last
    /// slot resolve to exactly one winner.
    ///
    /// # Errors
    ///
    /// Returns [`CouponError::CapExceeded`] when the last slot was taken by a
    /// concurrent checkout, [`CouponError::Contended`] when retries run out.
    #[tracing::instrument(
        name = "coupons.apply_and_commit",
        skip(self, owner, discount),
        fields(code = %code, order = %order),
        err
    )]
    pub async fn apply_and_commit(
        &self,
        code: &CouponCode,
        order: OrderId,
        owner: &CartOwner,
        discount: Money,
        now: Timestamp,
    ) -> Result<(), CouponError> {
        for attempt in 1..=self.retry.max_attempts {
            let coupon = self.load(code).await?;

            if coupon.global_cap.is_some_and(|cap| coupon.usage_count >= cap) {
                return Err(CouponError::CapExceeded(code.clone()));
            }

            let expected = coupon.version;
            let mut next = coupon;
            next.usage_count += 1;
            next.version = expected.next();

            match self.store.put_coupon(expected, next).await {
                Ok(()) => {
                    self.store
                        .record_usage(CouponUsage {
                            code: code.clone(),
                            owner: owner.clone(),
                            order,
                            discount,
                            used_at: now,
                        })
                        .await
                        .map_err(CouponError::Storage)?;

                    return Ok(());
                }
                Err(StoreError::VersionMismatch) => {
                    tokio::time::sleep(self.retry.delay(attempt)).await;
                }
                Err(error) => return Err(CouponError::Storage(error)),
            }
        }

        Err(CouponError::Contended(code.clone()))
    }

    /// Compensating action: give back a usage slot consumed by a checkout
    /// that subsequently failed.
    ///
    /// # Errors
    ///
    /// Returns a [`CouponError`] if the counter cannot be written back.
    #[tracing::instrument(name = "coupons.release_usage", skip(self), fields(code = %code, order = %order), err)]
    pub async fn release_usage(&self, code: &CouponCode, order: OrderId) -> Result<(), CouponError> {
        for attempt in 1..=self.retry.max_attempts {
            let coupon = self.load(code).await?;

            if coupon.usage_count == 0 {
                warn!(code = %code, "release requested but usage counter is already zero");
                break;
            }

            let expected = coupon.version;
            let mut next = coupon;
            next.usage_count -= 1;
            next.version = expected.next();

            match self.store.put_coupon(expected, next).await {
                Ok(()) => break,
                Err(StoreError::VersionMismatch) => {
                    tokio::time::sleep(self.retry.delay(attempt)).await;
                }
                Err(error) => return Err(CouponError::Storage(error)),
            }
        }

        self.store
            .delete_usage(code, order)
            .await
            .map_err(CouponError::Storage)
    }

    async fn load(&self, code: &CouponCode) -> Result<Coupon, CouponError> {
        self.store.coupon(code).await.map_err(|error| match error {
            StoreError::NotFound => CouponError::UnknownCode(code.clone()),
            other => CouponError::Storage(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use jiff::SignedDuration;

    use crate::money::Currency;

    use super::*;

    fn usd(minor: i64) -> Money {
        Money::from_minor(minor, Currency::Usd)
    }

    fn ten_percent() -> Coupon {
        Coupon {
            code: CouponCode::new("TEN"),
            kind: DiscountKind::Percentage {
                percent: Decimal::from(10),
            },
            minimum_subtotal: None,
            eligible_categories: None,
            per_user_cap: 1,
            global_cap: None,
            maximum_discount: None,
            valid_from: None,
            valid_until: None,
            active: true,
            usage_count: 0,
            version: Version::initial(),
        }
    }

    #[test]
    fn percentage_discount_rounds_to_minor_units() {
        let coupon = ten_percent();

        assert_eq!(coupon.discount_amount(usd(25_00)), Ok(usd(2_50)));
    }

    #[test]
    fn fixed_discount_never_exceeds_subtotal() {
        let mut coupon = ten_percent();
        coupon.kind = DiscountKind::FixedAmount { amount: usd(30_00) };

        assert_eq!(coupon.discount_amount(usd(25_00)), Ok(usd(25_00)));
    }

    #[test]
    fn maximum_discount_caps_the_amount() {
        let mut coupon = ten_percent();
        coupon.maximum_discount = Some(usd(1_00));

        assert_eq!(coupon.discount_amount(usd(25_00)), Ok(usd(1_00)));
    }

    #[test]
    fn inactive_coupon_fails_before_other_checks() {
        let mut coupon = ten_percent();
        coupon.active = false;
        // Even with a minimum the subtotal misses, the active check fires first.
        coupon.minimum_subtotal = Some(usd(100_00));

        let result = coupon.check_eligibility(usd(1_00), &[], 0, Timestamp::now());

        assert_eq!(result, Err(CouponError::ExpiredCoupon(coupon.code.clone())));
    }

    #[test]
    fn window_check_precedes_minimum_check() {
        let now = Timestamp::now();
        let mut coupon = ten_percent();
        coupon.valid_until = Some(now.saturating_sub(SignedDuration::from_secs(60)).unwrap_or(Timestamp::MIN));
        coupon.minimum_subtotal = Some(usd(100_00));

        let result = coupon.check_eligibility(usd(1_00), &[], 0, now);

        assert_eq!(result, Err(CouponError::ExpiredCoupon(coupon.code.clone())));
    }

    #[test]
    fn minimum_not_met_names_both_amounts() {
        let mut coupon = ten_percent();
        coupon.minimum_subtotal = Some(usd(50_00));

        let result = coupon.check_eligibility(usd(25_00), &[], 0, Timestamp::now());

        assert_eq!(
            result,
            Err(CouponError::MinimumNotMet {
                code: coupon.code.clone(),
                subtotal: usd(25_00),
                minimum: usd(50_00),
            })
        );
    }

    #[test]
    fn category_restriction_requires_one_eligible_line() {
        let mut coupon = ten_percent();
        coupon.eligible_categories = Some(vec![CategoryId::new("books")]);

        let toys = CategoryId::new("toys");
        let books = CategoryId::new("books");

        let miss = coupon.check_eligibility(usd(25_00), &[&toys], 0, Timestamp::now());
        assert_eq!(miss, Err(CouponError::NotEligibleCategory(coupon.code.clone())));

        let hit = coupon.check_eligibility(usd(25_00), &[&toys, &books], 0, Timestamp::now());
        assert_eq!(hit, Ok(()));
    }

    #[test]
    fn per_user_cap_fires_before_global_cap() {
        let mut coupon = ten_percent();
        coupon.per_user_cap = 2;
        coupon.global_cap = Some(10);
        coupon.usage_count = 10;

        // User already at their cap; either check yields CapExceeded.
        let result = coupon.check_eligibility(usd(25_00), &[], 2, Timestamp::now());

        assert_eq!(result, Err(CouponError::CapExceeded(coupon.code.clone())));
    }

    #[test]
    fn status_projects_record_and_clock() {
        let now = Timestamp::now();
        let mut coupon = ten_percent();

        assert_eq!(coupon.status(now), CouponStatus::Active);

        coupon.global_cap = Some(1);
        coupon.usage_count = 1;
        assert_eq!(coupon.status(now), CouponStatus::Exhausted);

        coupon.valid_until = Some(now.saturating_sub(SignedDuration::from_secs(1)).unwrap_or(Timestamp::MIN));
        assert_eq!(coupon.status(now), CouponStatus::Expired);

        coupon.active = false;
        assert_eq!(coupon.status(now), CouponStatus::Inactive);
    }
}
