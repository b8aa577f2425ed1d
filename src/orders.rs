//! Orders
//!
//! An order is the immutable result of a checkout: item lines and totals are
//! frozen at creation, and the only mutation ever allowed is a state
//! transition drawn from an explicit allow-list. Every transition appends to
//! the order's history; the history is the audit trail and can be replayed
//! to reconstruct the current state.

use jiff::Timestamp;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    carts::{CartOwner, CategoryId, VariantId},
    coupons::CouponCode,
    ids::TypedUuid,
    inventory::ReservationId,
    money::Money,
    payments::PaymentReference,
    pricing::Totals,
    store::Version,
};

/// Order identifier.
pub type OrderId = TypedUuid<Order>;

/// Carrier tracking reference, supplied by the fulfillment collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingReference(String);

impl TrackingReference {
    /// Wrap a carrier reference.
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

/// Human-facing order number, e.g. `ORD-20260806-4821`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderNumber(String);

impl OrderNumber {
    /// Generate a number from the order date plus a random suffix.
    pub fn generate(now: Timestamp) -> Self {
        let suffix: u16 = rand::thread_rng().gen_range(1000..=9999);

        Self(format!("ORD-{}-{suffix}", now.strftime("%Y%m%d")))
    }

    /// The number text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OrderNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who performed a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Actor {
    /// The customer who placed the order.
    Customer,

    /// An operator acting through the admin surface.
    Admin,

    /// The engine itself or an automated job.
    System,
}

/// The states an order moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderState {
    /// Created by checkout; inventory is reserved, nothing is paid.
    Pending,

    /// Payment has been initiated with the collaborator.
    AwaitingPayment,

    /// Payment authorized; a payment reference is on file.
    Paid,

    /// Picking and packing.
    Fulfilling,

    /// Handed to the carrier; a tracking reference is on file.
    Shipped,

    /// Received by the customer. End of the success path.
    Delivered,

    /// Abandoned before fulfillment; stock went back, money (if taken) went
    /// back.
    Cancelled,

    /// Money returned after payment; reachable up to and including delivery.
    Refunded,
}

impl OrderState {
    /// Whether `next` is a legal successor of this state. This table is the
    /// single authority; nothing else decides legality.
    pub fn allows(self, next: OrderState) -> bool {
        use OrderState::{
            AwaitingPayment, Cancelled, Delivered, Fulfilling, Paid, Pending, Refunded, Shipped,
        };

        matches!(
            (self, next),
            (Pending, AwaitingPayment | Cancelled)
                | (AwaitingPayment, Paid | Cancelled)
                | (Paid, Fulfilling | Cancelled | Refunded)
                | (Fulfilling, Shipped | Refunded)
                | (Shipped, Delivered | Refunded)
                | (Delivered, Refunded)
        )
    }

    /// Whether no further transition is possible from this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderState::Cancelled | OrderState::Refunded)
    }

    /// Replay a transition history from the initial `Pending` state and
    /// return the resulting state, verifying every step against the
    /// allow-list.
    ///
    /// # Errors
    ///
    /// Returns [`OrderError::CorruptHistory`] if the chain does not link up,
    /// or [`OrderError::InvalidTransition`] if a recorded step is illegal.
    pub fn replay(history: &[StateChange]) -> Result<OrderState, OrderError> {
        let mut state = OrderState::Pending;

        for (index, change) in history.iter().enumerate() {
            if change.from != state {
                return Err(OrderError::CorruptHistory { at: index });
            }

            if !state.allows(change.to) {
                return Err(OrderError::InvalidTransition {
                    from: state,
                    to: change.to,
                });
            }

            state = change.to;
        }

        Ok(state)
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OrderState::Pending => "pending",
            OrderState::AwaitingPayment => "awaiting_payment",
            OrderState::Paid => "paid",
            OrderState::Fulfilling => "fulfilling",
            OrderState::Shipped => "shipped",
            OrderState::Delivered => "delivered",
            OrderState::Cancelled => "cancelled",
            OrderState::Refunded => "refunded",
        };

        f.write_str(name)
    }
}

/// One entry of an order's append-only transition history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    /// State before the transition.
    pub from: OrderState,

    /// State after the transition.
    pub to: OrderState,

    /// When the transition happened.
    pub at: Timestamp,

    /// Who triggered it.
    pub actor: Actor,

    /// Free-text reason, e.g. a cancellation note.
    pub reason: Option<String>,
}

/// Errors from the order state machine.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OrderError {
    /// The requested transition is not in the allow-list.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        /// The order's current state.
        from: OrderState,
        /// The requested state.
        to: OrderState,
    },

    /// A transition into `Paid` needs a non-empty payment reference.
    #[error("transition to paid requires a payment reference")]
    MissingPaymentReference,

    /// A transition into `Shipped` needs a non-empty tracking reference.
    #[error("transition to shipped requires a tracking reference")]
    MissingTrackingReference,

    /// A stored history does not replay into a consistent state.
    #[error("order history is corrupt at entry {at}")]
    CorruptHistory {
        /// Index of the first entry that does not link up.
        at: usize,
    },
}

/// Everything a transition needs besides the target state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionContext {
    /// Who triggered the transition.
    pub actor: Actor,

    /// When it happened.
    pub at: Timestamp,

    /// Optional free-text reason.
    pub reason: Option<String>,

    /// Required when transitioning into `Paid`.
    pub payment_reference: Option<PaymentReference>,

    /// Required when transitioning into `Shipped`.
    pub tracking_reference: Option<TrackingReference>,
}

impl TransitionContext {
    /// A context with just an actor and a timestamp.
    pub fn new(actor: Actor, at: Timestamp) -> Self {
        Self {
            actor,
            at,
            reason: None,
            payment_reference: None,
            tracking_reference: None,
        }
    }

    /// Attach a reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attach the payment reference for a transition into `Paid`.
    #[must_use]
    pub fn with_payment_reference(mut self, reference: PaymentReference) -> Self {
        self.payment_reference = Some(reference);
        self
    }

    /// Attach the tracking reference for a transition into `Shipped`.
    #[must_use]
    pub fn with_tracking_reference(mut self, reference: TrackingReference) -> Self {
        self.tracking_reference = Some(reference);
        self
    }
}

/// An immutable copy of a cart line at the moment it was charged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    /// The product variant.
    pub variant: VariantId,

    /// Units charged.
    pub quantity: u32,

    /// Unit price actually charged.
    pub unit_price: Money,

    /// Share of the cart discount allocated to this line. Display data, not
    /// authoritative.
    pub line_discount: Money,

    /// Line total before discount allocation.
    pub line_total: Money,

    /// Category at time of purchase.
    pub category: CategoryId,
}

/// A placed order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Order identifier.
    pub id: OrderId,

    /// Human-facing order number.
    pub number: OrderNumber,

    /// Who placed it.
    pub owner: CartOwner,

    /// Frozen item lines. Never modified after creation.
    pub items: Vec<OrderItem>,

    /// Frozen totals as charged. Recomputed only for audit, never to change
    /// what was charged.
    pub totals: Totals,

    /// Coupon consumed by this order, if any.
    pub coupon: Option<CouponCode>,

    /// The inventory reservation backing this order.
    pub reservation: ReservationId,

    /// Current state. Mutated only through [`Order::transition`].
    pub state: OrderState,

    /// Append-only transition history.
    pub history: Vec<StateChange>,

    /// Gateway reference once payment is authorized.
    pub payment_reference: Option<PaymentReference>,

    /// Carrier reference once shipped.
    pub tracking_reference: Option<TrackingReference>,

    /// Optimistic-concurrency version of this record.
    pub version: Version,

    /// When checkout created the order.
    pub created_at: Timestamp,
}

impl Order {
    /// Create an order in `Pending` with frozen lines and totals. The
    /// identifier is allocated by the caller because the inventory
    /// reservation names it before the order record exists.
    pub fn new(
        id: OrderId,
        owner: CartOwner,
        items: Vec<OrderItem>,
        totals: Totals,
        coupon: Option<CouponCode>,
        reservation: ReservationId,
        now: Timestamp,
    ) -> Self {
        Self {
            id,
            number: OrderNumber::generate(now),
            owner,
            items,
            totals,
            coupon,
            reservation,
            state: OrderState::Pending,
            history: Vec::new(),
            payment_reference: None,
            tracking_reference: None,
            version: Version::initial(),
            created_at: now,
        }
    }

    /// Apply a transition, validating it against the allow-list and the
    /// per-state guards, and append it to the history.
    ///
    /// # Errors
    ///
    /// Returns an [`OrderError`] for an illegal transition or a missing
    /// reference. The order is untouched on error.
    pub fn transition(&mut self, to: OrderState, ctx: TransitionContext) -> Result<(), OrderError> {
        if !self.state.allows(to) {
            return Err(OrderError::InvalidTransition {
                from: self.state,
                to,
            });
        }

        if to == OrderState::Paid {
            match &ctx.payment_reference {
                Some(reference) if !reference.is_empty() => {}
                _ => return Err(OrderError::MissingPaymentReference),
            }
        }

        if to == OrderState::Shipped {
            match &ctx.tracking_reference {
                Some(reference) if !reference.is_empty() => {}
                _ => return Err(OrderError::MissingTrackingReference),
            }
        }

        if let Some(reference) = ctx.payment_reference {
            self.payment_reference = Some(reference);
        }

        if let Some(reference) = ctx.tracking_reference {
            self.tracking_reference = Some(reference);
        }

        self.history.push(StateChange {
            from: self.state,
            to,
            at: ctx.at,
            actor: ctx.actor,
            reason: ctx.reason,
        });

        self.state = to;

        Ok(())
    }

    /// Whether cancellation is still possible from the current state.
    pub fn can_be_cancelled(&self) -> bool {
        self.state.allows(OrderState::Cancelled)
    }

    /// Whether a refund is still possible from the current state.
    pub fn can_be_refunded(&self) -> bool {
        self.state.allows(OrderState::Refunded)
    }

    /// Total units across all lines.
    pub fn item_count(&self) -> u64 {
        self.items.iter().map(|line| u64::from(line.quantity)).sum()
    }
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;

    use crate::{
        carts::CustomerId,
        money::{Currency, Money},
    };

    use super::*;

    const ALL_STATES: [OrderState; 8] = [
        OrderState::Pending,
        OrderState::AwaitingPayment,
        OrderState::Paid,
        OrderState::Fulfilling,
        OrderState::Shipped,
        OrderState::Delivered,
        OrderState::Cancelled,
        OrderState::Refunded,
    ];

    fn order() -> Order {
        Order::new(
            OrderId::new(),
            CartOwner::Customer(CustomerId::new()),
            Vec::new(),
            Totals::empty(Currency::Usd),
            None,
            ReservationId::new(),
            Timestamp::now(),
        )
    }

    fn ctx() -> TransitionContext {
        TransitionContext::new(Actor::System, Timestamp::now())
    }

    #[test]
    fn allow_list_matches_the_lifecycle() {
        use OrderState::{
            AwaitingPayment, Cancelled, Delivered, Fulfilling, Paid, Pending, Refunded, Shipped,
        };

        let legal = [
            (Pending, AwaitingPayment),
            (Pending, Cancelled),
            (AwaitingPayment, Paid),
            (AwaitingPayment, Cancelled),
            (Paid, Fulfilling),
            (Paid, Cancelled),
            (Paid, Refunded),
            (Fulfilling, Shipped),
            (Fulfilling, Refunded),
            (Shipped, Delivered),
            (Shipped, Refunded),
            (Delivered, Refunded),
        ];

        for from in ALL_STATES {
            for to in ALL_STATES {
                let expected = legal.contains(&(from, to));
                assert_eq!(
                    from.allows(to),
                    expected,
                    "allow({from}, {to}) should be {expected}"
                );
            }
        }
    }

    #[test]
    fn delivered_to_pending_is_rejected() {
        let mut order = order();
        order.state = OrderState::Delivered;

        let result = order.transition(OrderState::Pending, ctx());

        assert_eq!(
            result,
            Err(OrderError::InvalidTransition {
                from: OrderState::Delivered,
                to: OrderState::Pending,
            })
        );
        assert_eq!(order.state, OrderState::Delivered, "state never clamps");
        assert!(order.history.is_empty(), "failed transitions leave no trace");
    }

    #[test]
    fn paid_requires_payment_reference() {
        let mut order = order();
        order.state = OrderState::AwaitingPayment;

        let missing = order.transition(OrderState::Paid, ctx());
        assert_eq!(missing, Err(OrderError::MissingPaymentReference));

        let empty = order.transition(
            OrderState::Paid,
            ctx().with_payment_reference(PaymentReference::new("")),
        );
        assert_eq!(empty, Err(OrderError::MissingPaymentReference));

        let ok = order.transition(
            OrderState::Paid,
            ctx().with_payment_reference(PaymentReference::new("auth-123")),
        );
        assert_eq!(ok, Ok(()));
        assert_eq!(
            order.payment_reference,
            Some(PaymentReference::new("auth-123"))
        );
    }

    #[test]
    fn shipped_requires_tracking_reference() {
        let mut order = order();
        order.state = OrderState::Fulfilling;

        let missing = order.transition(OrderState::Shipped, ctx());
        assert_eq!(missing, Err(OrderError::MissingTrackingReference));

        let ok = order.transition(
            OrderState::Shipped,
            ctx().with_tracking_reference(TrackingReference::new("1Z999")),
        );
        assert_eq!(ok, Ok(()));
    }

    #[test]
    fn history_appends_and_replays() -> TestResult {
        let mut order = order();

        order.transition(OrderState::AwaitingPayment, ctx())?;
        order.transition(
            OrderState::Paid,
            ctx().with_payment_reference(PaymentReference::new("auth-1")),
        )?;
        order.transition(OrderState::Cancelled, ctx().with_reason("customer request"))?;

        assert_eq!(order.history.len(), 3);
        assert_eq!(OrderState::replay(&order.history)?, OrderState::Cancelled);
        assert_eq!(
            order.history.last().and_then(|change| change.reason.as_deref()),
            Some("customer request")
        );

        Ok(())
    }

    #[test]
    fn replay_rejects_broken_chains() {
        let now = Timestamp::now();
        let history = [
            StateChange {
                from: OrderState::Pending,
                to: OrderState::AwaitingPayment,
                at: now,
                actor: Actor::System,
                reason: None,
            },
            StateChange {
                // Does not link to the previous entry's `to`.
                from: OrderState::Paid,
                to: OrderState::Fulfilling,
                at: now,
                actor: Actor::System,
                reason: None,
            },
        ];

        assert_eq!(
            OrderState::replay(&history),
            Err(OrderError::CorruptHistory { at: 1 })
        );
    }

    #[test]
    fn terminal_states_allow_nothing() {
        for to in ALL_STATES {
            assert!(!OrderState::Cancelled.allows(to), "cancelled -> {to}");
            assert!(!OrderState::Refunded.allows(to), "refunded -> {to}");
        }
    }

    #[test]
    fn order_number_embeds_the_date() {
        let number = OrderNumber::generate(Timestamp::UNIX_EPOCH);

        assert!(
            number.as_str().starts_with("ORD-19700101-"),
            "got {number}"
        );
    }

    #[test]
    fn line_items_never_change_after_creation() -> TestResult {
        let mut order = order();
        order.items.push(OrderItem {
            variant: VariantId::new(),
            quantity: 2,
            unit_price: Money::from_minor(10_00, Currency::Usd),
            line_discount: Money::zero(Currency::Usd),
            line_total: Money::from_minor(20_00, Currency::Usd),
            category: CategoryId::new("general"),
        });
        let frozen = order.items.clone();

        order.transition(OrderState::AwaitingPayment, ctx())?;
        order.transition(OrderState::Cancelled, ctx())?;

        assert_eq!(order.items, frozen, "transitions leave lines untouched");

        Ok(())
    }
}
