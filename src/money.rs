//! Money
//!
//! Fixed-point monetary amounts. Every arithmetic operation is fallible:
//! mixing currencies or overflowing the decimal range returns a
//! [`MoneyError`] instead of silently producing a wrong amount.

use std::fmt;

use rust_decimal::{Decimal, RoundingStrategy, prelude::ToPrimitive};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from money arithmetic.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoneyError {
    /// Two amounts in different currencies were combined.
    #[error("currency mismatch: {left} vs {right}")]
    CurrencyMismatch {
        /// Currency of the left-hand operand.
        left: &'static str,
        /// Currency of the right-hand operand.
        right: &'static str,
    },

    /// The amount fell outside the representable decimal range.
    #[error("amount out of range")]
    AmountOutOfRange,
}

/// ISO 4217 currencies the engine prices in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
    /// United States dollar.
    Usd,
    /// Euro.
    Eur,
    /// Pound sterling.
    Gbp,
    /// Japanese yen.
    Jpy,
}

impl Currency {
    /// The ISO alpha code.
    pub fn code(self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
            Currency::Gbp => "GBP",
            Currency::Jpy => "JPY",
        }
    }

    /// Number of minor-unit digits (2 for cents, 0 for yen).
    pub fn exponent(self) -> u32 {
        match self {
            Currency::Usd | Currency::Eur | Currency::Gbp => 2,
            Currency::Jpy => 0,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A monetary amount in a single currency.
///
/// Intermediate results (tax, percentage discounts) may carry more precision
/// than the currency's minor unit; [`Money::round_to_minor`] brings an amount
/// back onto the minor-unit grid using round-half-even.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    amount: Decimal,
    currency: Currency,
}

impl Money {
    /// An amount of zero.
    pub fn zero(currency: Currency) -> Self {
        Self {
            amount: Decimal::ZERO,
            currency,
        }
    }

    /// Build from minor units (e.g. 1050 => 10.50 USD).
    pub fn from_minor(minor: i64, currency: Currency) -> Self {
        Self {
            amount: Decimal::new(minor, currency.exponent()),
            currency,
        }
    }

    /// Build from whole major units (e.g. 10 => 10.00 USD).
    pub fn from_major(major: i64, currency: Currency) -> Self {
        Self {
            amount: Decimal::from(major),
            currency,
        }
    }

    /// Build from a raw decimal amount in major units.
    pub fn from_decimal(amount: Decimal, currency: Currency) -> Self {
        Self { amount, currency }
    }

    /// The decimal amount in major units.
    pub fn amount(&self) -> Decimal {
        self.amount
    }

    /// The currency of this amount.
    pub fn currency(&self) -> Currency {
        self.currency
    }

    /// Whether the amount is exactly zero.
    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }

    /// Whether the amount is below zero.
    pub fn is_negative(&self) -> bool {
        self.amount.is_sign_negative() && !self.amount.is_zero()
    }

    /// Add another amount of the same currency.
    ///
    /// # Errors
    ///
    /// Returns a [`MoneyError`] on currency mismatch or overflow.
    pub fn add(self, other: Money) -> Result<Money, MoneyError> {
        self.check_currency(other)?;

        let amount = self
            .amount
            .checked_add(other.amount)
            .ok_or(MoneyError::AmountOutOfRange)?;

        Ok(Self { amount, ..self })
    }

    /// Subtract another amount of the same currency.
    ///
    /// # Errors
    ///
    /// Returns a [`MoneyError`] on currency mismatch or overflow.
    pub fn sub(self, other: Money) -> Result<Money, MoneyError> {
        self.check_currency(other)?;

        let amount = self
            .amount
            .checked_sub(other.amount)
            .ok_or(MoneyError::AmountOutOfRange)?;

        Ok(Self { amount, ..self })
    }

    /// Scale by a decimal factor (e.g. a tax rate).
    ///
    /// # Errors
    ///
    /// Returns [`MoneyError::AmountOutOfRange`] on overflow.
    pub fn mul_decimal(self, factor: Decimal) -> Result<Money, MoneyError> {
        let amount = self
            .amount
            .checked_mul(factor)
            .ok_or(MoneyError::AmountOutOfRange)?;

        Ok(Self { amount, ..self })
    }

    /// Scale by an item quantity.
    ///
    /// # Errors
    ///
    /// Returns [`MoneyError::AmountOutOfRange`] on overflow.
    pub fn mul_quantity(self, quantity: u32) -> Result<Money, MoneyError> {
        self.mul_decimal(Decimal::from(quantity))
    }

    /// Round to the currency's minor unit using round-half-even.
    pub fn round_to_minor(self) -> Money {
        let amount = self
            .amount
            .round_dp_with_strategy(self.currency.exponent(), RoundingStrategy::MidpointNearestEven);

        Self { amount, ..self }
    }

    /// The amount expressed in minor units, rounded half-even first.
    ///
    /// # Errors
    ///
    /// Returns [`MoneyError::AmountOutOfRange`] if the scaled value does not
    /// fit in an `i64`.
    pub fn to_minor_units(&self) -> Result<i64, MoneyError> {
        let scale = Decimal::from(10_i64.pow(self.currency.exponent()));

        self.round_to_minor()
            .amount
            .checked_mul(scale)
            .and_then(|scaled| scaled.to_i64())
            .ok_or(MoneyError::AmountOutOfRange)
    }

    /// The smaller of two amounts in the same currency.
    ///
    /// # Errors
    ///
    /// Returns a [`MoneyError`] on currency mismatch.
    pub fn min(self, other: Money) -> Result<Money, MoneyError> {
        self.check_currency(other)?;

        Ok(if self.amount <= other.amount {
            self
        } else {
            other
        })
    }

    /// Clamp a negative amount to zero.
    pub fn clamp_non_negative(self) -> Money {
        if self.is_negative() {
            Self::zero(self.currency)
        } else {
            self
        }
    }

    fn check_currency(self, other: Money) -> Result<(), MoneyError> {
        if self.currency == other.currency {
            Ok(())
        } else {
            Err(MoneyError::CurrencyMismatch {
                left: self.currency.code(),
                right: other.currency.code(),
            })
        }
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.round_to_minor().amount, self.currency)
    }
}
