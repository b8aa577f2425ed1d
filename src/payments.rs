//! Payment collaborator
//!
//! The engine records authorization and refund outcomes; it never speaks a
//! gateway protocol itself. Failures carry the collaborator's detail and
//! leave the order in its pre-call state.

use async_trait::async_trait;
use mockall::automock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{money::Money, orders::Order};

/// Errors reported by the payment collaborator.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PaymentError {
    /// The gateway declined the authorization.
    #[error("payment declined: {0}")]
    Declined(String),

    /// The gateway refused the refund.
    #[error("refund rejected: {0}")]
    RefundRejected(String),

    /// The gateway could not be reached or answered with an error.
    #[error("payment collaborator unavailable: {0}")]
    Unavailable(String),
}

/// Opaque token identifying an authorization at the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReference(String);

impl PaymentReference {
    /// Wrap a gateway reference.
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    /// The reference text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the reference carries no token.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Opaque token identifying a refund at the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundReference(String);

impl RefundReference {
    /// Wrap a gateway reference.
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    /// The reference text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The external payment collaborator.
#[automock]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Authorize payment for an order with the customer's payment token.
    async fn authorize(
        &self,
        order: &Order,
        payment_token: &str,
    ) -> Result<PaymentReference, PaymentError>;

    /// Refund an amount against a previously authorized order.
    async fn refund(&self, order: &Order, amount: Money) -> Result<RefundReference, PaymentError>;
}
