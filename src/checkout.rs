//! Checkout
//!
//! [`CheckoutOrchestrator::checkout`] turns a cart into an order with
//! all-or-nothing semantics: price verification and coupon validation run
//! before inventory is touched (reservations are the most expensive thing to
//! roll back), and every failure after the reservation compensates — the
//! coupon slot goes back, the stock goes back, no order record survives.
//! The expiry sweep exists as a crash safety net, never as the happy path.
//!
//! The order-lifecycle operations (payment, fulfillment, cancellation,
//! refund) live here too: they are the only writers of order state, and
//! every write is version-checked because an admin and a fulfillment job can
//! race on the same order.

use std::sync::Arc;

use jiff::Timestamp;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    carts::{Cart, CartId, CartStatus},
    catalog::{Destination, PriceSource, ShippingRuleSet, TaxRateLookup},
    config::CheckoutConfig,
    coupons::{AppliedDiscount, CouponEngine, CouponError},
    inventory::{InventoryError, Reservation, ReservationLine, ReservationManager},
    orders::{
        Actor, Order, OrderError, OrderId, OrderItem, OrderState, TrackingReference,
        TransitionContext,
    },
    payments::{PaymentError, PaymentGateway},
    pricing::{CartCalculator, PriceChange, PricingError},
    store::{CheckoutStore, StoreError},
};

/// Broad failure classes, for callers that decide retry/correct/abort
/// behaviour without matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Malformed or stale input; the caller corrects and retries.
    Validation,

    /// Lost a version race; safe to retry as-is.
    Conflict,

    /// A capped resource ran out; the caller picks different items or
    /// coupons.
    Resource,

    /// An illegal state transition; a caller or race bug, not retryable.
    State,

    /// A collaborator failed; the order is unchanged.
    External,

    /// The storage boundary failed.
    Storage,
}

/// Why a checkout or lifecycle operation failed.
#[derive(Debug, Error)]
pub enum CheckoutError {
    /// No cart exists for the identifier.
    #[error("cart {0} not found")]
    UnknownCart(CartId),

    /// The cart has no items.
    #[error("cart {0} is empty")]
    EmptyCart(CartId),

    /// The cart is past its expiry.
    #[error("cart {0} has expired")]
    CartExpired(CartId),

    /// The cart was already converted or abandoned.
    #[error("cart {cart} is {status:?}, not active")]
    CartNotActive {
        /// The cart.
        cart: CartId,
        /// Its current status.
        status: CartStatus,
    },

    /// Catalog prices moved since the customer last saw them; the caller
    /// must re-confirm before anything is charged.
    #[error("{} price(s) changed since they were quoted", .0.len())]
    PriceChanged(Vec<PriceChange>),

    /// No order exists for the identifier.
    #[error("order {0} not found")]
    UnknownOrder(OrderId),

    /// The order lost a version race to another actor.
    #[error("order {0} is being modified concurrently")]
    OrderContended(OrderId),

    /// Coupon validation or commit failed.
    #[error(transparent)]
    Coupon(#[from] CouponError),

    /// Inventory reservation failed.
    #[error(transparent)]
    Inventory(#[from] InventoryError),

    /// An order state transition was rejected.
    #[error(transparent)]
    Order(#[from] OrderError),

    /// Totals computation failed.
    #[error(transparent)]
    Pricing(#[from] PricingError),

    /// The payment collaborator failed; the order is in its pre-call state.
    #[error("payment collaborator failed")]
    Payment(#[source] PaymentError),

    /// The storage boundary failed.
    #[error("storage error")]
    Storage(#[source] StoreError),
}

impl CheckoutError {
    /// The broad failure class this error belongs to.
    pub fn class(&self) -> FailureClass {
        match self {
            CheckoutError::UnknownCart(_)
            | CheckoutError::EmptyCart(_)
            | CheckoutError::CartExpired(_)
            | CheckoutError::CartNotActive { .. }
            | CheckoutError::PriceChanged(_)
            | CheckoutError::UnknownOrder(_) => FailureClass::Validation,

            CheckoutError::Pricing(error) => match error {
                PricingError::Catalog(_) => FailureClass::External,
                PricingError::Money(_) => FailureClass::Validation,
            },

            CheckoutError::OrderContended(_) => FailureClass::Conflict,

            CheckoutError::Coupon(error) => match error {
                CouponError::CapExceeded(_) => FailureClass::Resource,
                CouponError::Contended(_) => FailureClass::Conflict,
                CouponError::Storage(_) => FailureClass::Storage,
                _ => FailureClass::Validation,
            },

            CheckoutError::Inventory(error) => match error {
                InventoryError::Contended(_) => FailureClass::Conflict,
                InventoryError::Storage(_) => FailureClass::Storage,
                _ => FailureClass::Resource,
            },

            CheckoutError::Order(_) => FailureClass::State,
            CheckoutError::Payment(_) => FailureClass::External,
            CheckoutError::Storage(_) => FailureClass::Storage,
        }
    }
}

/// Composes the calculator, coupon engine, reservation manager, and order
/// state machine into the place-order operation and the order lifecycle.
pub struct CheckoutOrchestrator<S> {
    store: Arc<S>,
    calculator: CartCalculator,
    coupons: CouponEngine<S>,
    inventory: ReservationManager<S>,
    prices: Arc<dyn PriceSource>,
    taxes: Arc<dyn TaxRateLookup>,
    shipping: ShippingRuleSet,
    payments: Arc<dyn PaymentGateway>,
    config: CheckoutConfig,
}

impl<S> std::fmt::Debug for CheckoutOrchestrator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckoutOrchestrator")
            .field("shipping", &self.shipping)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S: CheckoutStore> CheckoutOrchestrator<S> {
    /// Wire up an orchestrator over a store and the external collaborators.
    pub fn new(
        store: Arc<S>,
        prices: Arc<dyn PriceSource>,
        taxes: Arc<dyn TaxRateLookup>,
        shipping: ShippingRuleSet,
        payments: Arc<dyn PaymentGateway>,
        config: CheckoutConfig,
    ) -> Self {
        Self {
            calculator: CartCalculator::from_config(&config),
            coupons: CouponEngine::new(Arc::clone(&store), config.counter_retry),
            inventory: ReservationManager::new(
                Arc::clone(&store),
                config.reservation_ttl,
                config.reserve_retry,
            ),
            store,
            prices,
            taxes,
            shipping,
            payments,
            config,
        }
    }

    /// The reservation manager, for wiring the external expiry sweeper.
    pub fn reservations(&self) -> &ReservationManager<S> {
        &self.inventory
    }

    /// Place an order from a cart.
    ///
    /// Steps run strictly in order: load and screen the cart, verify catalog
    /// prices, validate the coupon, compute totals, reserve stock, then
    /// commit (consume the coupon slot, confirm the reservation, create the
    /// order in `Pending`, mark the cart converted). Any failure after the
    /// reservation releases it before returning.
    ///
    /// # Errors
    ///
    /// See [`CheckoutError`]; inventory failures (`InsufficientStock`,
    /// `Contended`) propagate verbatim.
    #[tracing::instrument(
        name = "checkout.place_order",
        skip(self, destination),
        fields(cart = %cart_id),
        err
    )]
    pub async fn checkout(
        &self,
        cart_id: CartId,
        destination: &Destination,
        now: Timestamp,
    ) -> Result<Order, CheckoutError> {
        let cart = self.load_cart(cart_id).await?;

        if cart.is_empty() {
            return Err(CheckoutError::EmptyCart(cart_id));
        }

        if cart.is_expired(now) {
            return Err(CheckoutError::CartExpired(cart_id));
        }

        if cart.status != CartStatus::Active {
            return Err(CheckoutError::CartNotActive {
                cart: cart_id,
                status: cart.status,
            });
        }

        let changes = self
            .calculator
            .verify_prices(&cart, self.prices.as_ref(), now)
            .await?;

        if !changes.is_empty() {
            return Err(CheckoutError::PriceChanged(changes));
        }

        let subtotal = cart.subtotal().map_err(PricingError::from)?;

        let discount = match &cart.coupon {
            Some(code) => Some(self.coupons.validate(code, &cart, subtotal, now).await?),
            None => None,
        };

        let totals = self.calculator.compute_totals(
            &cart,
            discount.as_ref(),
            self.taxes.as_ref(),
            &self.shipping,
            destination,
        )?;

        let lines: Vec<ReservationLine> = cart
            .items
            .iter()
            .map(|item| ReservationLine {
                variant: item.variant,
                quantity: item.quantity,
            })
            .collect();

        let order_id = OrderId::new();
        let reservation = self.inventory.reserve(order_id, &lines, now).await?;

        self.commit(cart, order_id, reservation, discount, totals, now)
            .await
    }

    /// The commit phase: coupon slot, reservation confirmation, and order
    /// creation must all land or all compensate.
    async fn commit(
        &self,
        cart: Cart,
        order_id: OrderId,
        reservation: Reservation,
        discount: Option<AppliedDiscount>,
        totals: crate::pricing::Totals,
        now: Timestamp,
    ) -> Result<Order, CheckoutError> {
        if let Some(applied) = &discount {
            let committed = self
                .coupons
                .apply_and_commit(&applied.code, order_id, &cart.owner, applied.amount, now)
                .await;

            if let Err(error) = committed {
                self.abort_reservation(reservation.id).await;
                return Err(error.into());
            }
        }

        if let Err(error) = self.inventory.confirm(reservation.id, now).await {
            self.refund_coupon_slot(&discount, order_id).await;
            self.abort_reservation(reservation.id).await;
            return Err(error.into());
        }

        let items: Vec<OrderItem> = cart
            .items
            .iter()
            .zip(totals.lines.iter())
            .map(|(item, line)| OrderItem {
                variant: item.variant,
                quantity: item.quantity,
                unit_price: item.unit_price,
                line_discount: line.line_discount,
                line_total: line.line_subtotal,
                category: item.category.clone(),
            })
            .collect();

        let order = Order::new(
            order_id,
            cart.owner.clone(),
            items,
            totals,
            cart.coupon.clone(),
            reservation.id,
            now,
        );

        if let Err(error) = self.store.insert_order(order.clone()).await {
            self.refund_coupon_slot(&discount, order_id).await;
            self.abort_reservation(reservation.id).await;
            return Err(CheckoutError::Storage(error));
        }

        let mut converted = cart;
        converted.mark_converted();

        if let Err(error) = self.store.put_cart(converted).await {
            // The order exists; a stale cart status is worth a log line, not
            // a failed checkout.
            warn!(order = %order.id, %error, "failed to mark cart converted");
        }

        info!(
            order = %order.id,
            number = %order.number,
            grand_total = %order.totals.grand_total,
            "order placed"
        );

        Ok(order)
    }

    /// Move a pending order into `AwaitingPayment`.
    ///
    /// # Errors
    ///
    /// Returns a [`CheckoutError`] if the transition is illegal or the order
    /// cannot be written back.
    pub async fn begin_payment(
        &self,
        id: OrderId,
        actor: Actor,
        now: Timestamp,
    ) -> Result<Order, CheckoutError> {
        self.apply_transition(id, |order| {
            order.transition(
                OrderState::AwaitingPayment,
                TransitionContext::new(actor, now),
            )
        })
        .await
    }

    /// Authorize payment through the collaborator and record the outcome.
    /// On collaborator failure the order keeps its pre-call state.
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError::Payment`] with the collaborator's detail, or
    /// a state error if the order cannot accept payment.
    #[tracing::instrument(name = "checkout.record_payment", skip(self, payment_token), fields(order = %id), err)]
    pub async fn record_payment(
        &self,
        id: OrderId,
        payment_token: &str,
        now: Timestamp,
    ) -> Result<Order, CheckoutError> {
        let mut order = self.load_order(id).await?;

        if !order.state.allows(OrderState::Paid) {
            return Err(OrderError::InvalidTransition {
                from: order.state,
                to: OrderState::Paid,
            }
            .into());
        }

        let reference = self
            .payments
            .authorize(&order, payment_token)
            .await
            .map_err(CheckoutError::Payment)?;

        order.transition(
            OrderState::Paid,
            TransitionContext::new(Actor::Customer, now).with_payment_reference(reference),
        )?;

        self.commit_order(order).await
    }

    /// Move a paid order into `Fulfilling`.
    ///
    /// # Errors
    ///
    /// Returns a [`CheckoutError`] if the transition is illegal or the order
    /// cannot be written back.
    pub async fn mark_fulfilling(
        &self,
        id: OrderId,
        actor: Actor,
        now: Timestamp,
    ) -> Result<Order, CheckoutError> {
        self.apply_transition(id, |order| {
            order.transition(OrderState::Fulfilling, TransitionContext::new(actor, now))
        })
        .await
    }

    /// Record the carrier hand-off with the tracking reference supplied by
    /// the fulfillment collaborator.
    ///
    /// # Errors
    ///
    /// Returns a [`CheckoutError`] if the transition is illegal, the
    /// reference is empty, or the order cannot be written back.
    pub async fn mark_shipped(
        &self,
        id: OrderId,
        tracking: TrackingReference,
        actor: Actor,
        now: Timestamp,
    ) -> Result<Order, CheckoutError> {
        self.apply_transition(id, move |order| {
            order.transition(
                OrderState::Shipped,
                TransitionContext::new(actor, now).with_tracking_reference(tracking.clone()),
            )
        })
        .await
    }

    /// Record delivery.
    ///
    /// # Errors
    ///
    /// Returns a [`CheckoutError`] if the transition is illegal or the order
    /// cannot be written back.
    pub async fn mark_delivered(
        &self,
        id: OrderId,
        actor: Actor,
        now: Timestamp,
    ) -> Result<Order, CheckoutError> {
        self.apply_transition(id, |order| {
            order.transition(OrderState::Delivered, TransitionContext::new(actor, now))
        })
        .await
    }

    /// Cancel an order. Refunds first when the order was paid (the external
    /// call happens before any state changes), then commits the transition,
    /// then restocks the reservation.
    ///
    /// # Errors
    ///
    /// Returns a [`CheckoutError`]; on [`CheckoutError::Payment`] the order
    /// is untouched.
    #[tracing::instrument(name = "checkout.cancel", skip(self, reason), fields(order = %id), err)]
    pub async fn cancel(
        &self,
        id: OrderId,
        actor: Actor,
        reason: Option<String>,
        now: Timestamp,
    ) -> Result<Order, CheckoutError> {
        let mut order = self.load_order(id).await?;

        if !order.state.allows(OrderState::Cancelled) {
            return Err(OrderError::InvalidTransition {
                from: order.state,
                to: OrderState::Cancelled,
            }
            .into());
        }

        if order.state == OrderState::Paid {
            self.payments
                .refund(&order, order.totals.grand_total)
                .await
                .map_err(CheckoutError::Payment)?;
        }

        let mut ctx = TransitionContext::new(actor, now);
        if let Some(reason) = reason {
            ctx = ctx.with_reason(reason);
        }

        order.transition(OrderState::Cancelled, ctx)?;

        let order = self.commit_order(order).await?;

        // Compensating restock; release is idempotent, and the sweep cannot
        // touch a confirmed reservation, so this is the only restock path.
        self.inventory.release(order.reservation).await?;

        info!(order = %order.id, "order cancelled");

        Ok(order)
    }

    /// Refund an order after payment. Goods that already shipped are not
    /// restocked; returns are a fulfillment concern.
    ///
    /// # Errors
    ///
    /// Returns a [`CheckoutError`]; on [`CheckoutError::Payment`] the order
    /// is untouched.
    #[tracing::instrument(name = "checkout.refund", skip(self, reason), fields(order = %id), err)]
    pub async fn refund(
        &self,
        id: OrderId,
        actor: Actor,
        reason: Option<String>,
        now: Timestamp,
    ) -> Result<Order, CheckoutError> {
        let mut order = self.load_order(id).await?;

        if !order.state.allows(OrderState::Refunded) {
            return Err(OrderError::InvalidTransition {
                from: order.state,
                to: OrderState::Refunded,
            }
            .into());
        }

        self.payments
            .refund(&order, order.totals.grand_total)
            .await
            .map_err(CheckoutError::Payment)?;

        let mut ctx = TransitionContext::new(actor, now);
        if let Some(reason) = reason {
            ctx = ctx.with_reason(reason);
        }

        order.transition(OrderState::Refunded, ctx)?;

        let order = self.commit_order(order).await?;

        info!(order = %order.id, "order refunded");

        Ok(order)
    }

    /// Load-mutate-write an order with bounded retries on version races.
    /// Used for transitions with no external side effects, where replaying
    /// the mutation against a fresh read is always safe.
    async fn apply_transition<F>(&self, id: OrderId, mutate: F) -> Result<Order, CheckoutError>
    where
        F: Fn(&mut Order) -> Result<(), OrderError>,
    {
        for attempt in 1..=self.config.counter_retry.max_attempts {
            let mut order = self.load_order(id).await?;

            mutate(&mut order)?;

            let expected = order.version;
            order.version = expected.next();

            match self.store.put_order(expected, order.clone()).await {
                Ok(()) => return Ok(order),
                Err(StoreError::VersionMismatch) => {
                    tokio::time::sleep(self.config.counter_retry.delay(attempt)).await;
                }
                Err(error) => return Err(CheckoutError::Storage(error)),
            }
        }

        Err(CheckoutError::OrderContended(id))
    }

    /// Single-shot version-checked write for transitions that already spent
    /// an external side effect (refund, authorization). A lost race surfaces
    /// as [`CheckoutError::OrderContended`] instead of silently replaying.
    async fn commit_order(&self, mut order: Order) -> Result<Order, CheckoutError> {
        let expected = order.version;
        order.version = expected.next();

        match self.store.put_order(expected, order.clone()).await {
            Ok(()) => Ok(order),
            Err(StoreError::VersionMismatch) => {
                warn!(order = %order.id, "order transition lost a version race after a collaborator call");
                Err(CheckoutError::OrderContended(order.id))
            }
            Err(error) => Err(CheckoutError::Storage(error)),
        }
    }

    async fn refund_coupon_slot(&self, discount: &Option<AppliedDiscount>, order: OrderId) {
        if let Some(applied) = discount {
            if let Err(error) = self.coupons.release_usage(&applied.code, order).await {
                warn!(code = %applied.code, %error, "failed to return coupon usage slot");
            }
        }
    }

    async fn abort_reservation(&self, id: crate::inventory::ReservationId) {
        if let Err(error) = self.inventory.release(id).await {
            // The TTL sweep is the safety net for exactly this case.
            warn!(reservation = %id, %error, "failed to release reservation after aborted checkout");
        }
    }

    async fn load_cart(&self, id: CartId) -> Result<Cart, CheckoutError> {
        self.store.cart(id).await.map_err(|error| match error {
            StoreError::NotFound => CheckoutError::UnknownCart(id),
            other => CheckoutError::Storage(other),
        })
    }

    async fn load_order(&self, id: OrderId) -> Result<Order, CheckoutError> {
        self.store.order(id).await.map_err(|error| match error {
            StoreError::NotFound => CheckoutError::UnknownOrder(id),
            other => CheckoutError::Storage(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use jiff::SignedDuration;
    use rust_decimal::Decimal;

    use crate::{
        carts::{CartItem, CartOwner, CategoryId, CustomerId, VariantId},
        catalog::{FlatTaxRate, StaticPrices},
        inventory::InventoryRecord,
        money::{Currency, Money},
        payments::MockPaymentGateway,
        store::{CartStore, InventoryStore, MemoryStore},
    };

    use super::*;

    fn usd(minor: i64) -> Money {
        Money::from_minor(minor, Currency::Usd)
    }

    async fn orchestrator_with_cart(
        items: &[(VariantId, u32, i64)],
        stock: &[(VariantId, u32)],
        now: Timestamp,
    ) -> (CheckoutOrchestrator<MemoryStore>, CartId) {
        let store = Arc::new(MemoryStore::new());
        let mut prices = StaticPrices::new();

        let mut cart = Cart::new(
            CartOwner::Customer(CustomerId::new()),
            Currency::Usd,
            now,
            SignedDuration::from_secs(3600),
        );

        for &(variant, quantity, price_minor) in items {
            cart.add_item(CartItem {
                variant,
                quantity,
                unit_price: usd(price_minor),
                priced_at: now,
                unit_weight: Decimal::ONE,
                category: CategoryId::new("general"),
            })
            .unwrap_or_else(|error| panic!("test cart item should be valid: {error}"));

            prices.insert(variant, usd(price_minor), 100);
        }

        for &(variant, available) in stock {
            store
                .insert_inventory(InventoryRecord::new(variant, available))
                .await
                .unwrap_or_else(|error| panic!("seeding inventory should succeed: {error}"));
        }

        let cart_id = cart.id;
        store
            .insert_cart(cart)
            .await
            .unwrap_or_else(|error| panic!("seeding cart should succeed: {error}"));

        let orchestrator = CheckoutOrchestrator::new(
            store,
            Arc::new(prices),
            Arc::new(FlatTaxRate(Decimal::ZERO)),
            ShippingRuleSet::FlatRate(usd(0)),
            Arc::new(MockPaymentGateway::new()),
            CheckoutConfig::default(),
        );

        (orchestrator, cart_id)
    }

    #[tokio::test]
    async fn empty_cart_is_rejected() {
        let now = Timestamp::now();
        let (orchestrator, cart_id) = orchestrator_with_cart(&[], &[], now).await;

        let result = orchestrator
            .checkout(cart_id, &Destination::new("US"), now)
            .await;

        assert!(
            matches!(result, Err(CheckoutError::EmptyCart(id)) if id == cart_id),
            "expected EmptyCart, got {result:?}"
        );
    }

    #[tokio::test]
    async fn expired_cart_is_rejected() {
        let now = Timestamp::now();
        let variant = VariantId::new();
        let (orchestrator, cart_id) =
            orchestrator_with_cart(&[(variant, 1, 10_00)], &[(variant, 5)], now).await;

        let later = now.saturating_add(SignedDuration::from_secs(7200)).unwrap_or(Timestamp::MAX);
        let result = orchestrator
            .checkout(cart_id, &Destination::new("US"), later)
            .await;

        assert!(
            matches!(result, Err(CheckoutError::CartExpired(id)) if id == cart_id),
            "expected CartExpired, got {result:?}"
        );
    }

    #[tokio::test]
    async fn unknown_cart_is_rejected() {
        let now = Timestamp::now();
        let (orchestrator, _) = orchestrator_with_cart(&[], &[], now).await;
        let missing = CartId::new();

        let result = orchestrator
            .checkout(missing, &Destination::new("US"), now)
            .await;

        assert!(
            matches!(result, Err(CheckoutError::UnknownCart(id)) if id == missing),
            "expected UnknownCart, got {result:?}"
        );
    }

    #[test]
    fn error_classes_map_to_the_taxonomy() {
        let cart = CartId::new();

        assert_eq!(
            CheckoutError::EmptyCart(cart).class(),
            FailureClass::Validation
        );
        assert_eq!(
            CheckoutError::Inventory(InventoryError::Contended(VariantId::new())).class(),
            FailureClass::Conflict
        );
        assert_eq!(
            CheckoutError::Inventory(InventoryError::InsufficientStock {
                variant: VariantId::new(),
                requested: 2,
                available: 1,
            })
            .class(),
            FailureClass::Resource
        );
        assert_eq!(
            CheckoutError::Order(OrderError::InvalidTransition {
                from: OrderState::Delivered,
                to: OrderState::Pending,
            })
            .class(),
            FailureClass::State
        );
        assert_eq!(
            CheckoutError::Payment(PaymentError::Declined("card".into())).class(),
            FailureClass::External
        );
    }
}
