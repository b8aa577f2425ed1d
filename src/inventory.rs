//! Inventory
//!
//! Stock is never guarded by a lock. Every [`InventoryRecord`] carries a
//! version; a write only lands if it names the version it read, and losers
//! of that race re-read and retry with jittered backoff. Reservations move
//! quantity from `available` to `reserved` all-or-nothing across their
//! lines, and hold it for a fixed TTL until confirmed or released.

use std::sync::Arc;

use jiff::{SignedDuration, Timestamp};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    carts::VariantId,
    config::RetryPolicy,
    ids::TypedUuid,
    orders::OrderId,
    store::{InventoryStore, StoreError, Version},
};

/// Reservation identifier.
pub type ReservationId = TypedUuid<Reservation>;

/// Stock bookkeeping for one product variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRecord {
    /// The product variant.
    pub variant: VariantId,

    /// Units free to sell.
    pub available: u32,

    /// Units held by reservations (pending or confirmed).
    pub reserved: u32,

    /// Incremented on every mutation; writes must name the version they read.
    pub version: Version,
}

impl InventoryRecord {
    /// A fresh record with everything available.
    pub fn new(variant: VariantId, available: u32) -> Self {
        Self {
            variant,
            available,
            reserved: 0,
            version: Version::initial(),
        }
    }
}

/// One line of a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationLine {
    /// The product variant held.
    pub variant: VariantId,

    /// Units held.
    pub quantity: u32,
}

/// Reservation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    /// Holding stock, waiting for the checkout to commit.
    Pending,

    /// The checkout committed; the hold backs a live order.
    Confirmed,

    /// Stock went back, either by rollback, cancellation, or the expiry
    /// sweep.
    Released,
}

/// A TTL-bound hold on stock for one checkout attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Reservation identifier.
    pub id: ReservationId,

    /// The (provisional) order this hold is for.
    pub order: OrderId,

    /// Held quantities per variant.
    pub lines: Vec<ReservationLine>,

    /// Lifecycle status.
    pub status: ReservationStatus,

    /// When the hold was taken.
    pub created_at: Timestamp,

    /// When the sweep may reclaim an unconfirmed hold.
    pub expires_at: Timestamp,

    /// Version check for status flips: the owning checkout and the expiry
    /// sweep can race on the same hold, and only one of them may win.
    pub version: Version,
}

impl Reservation {
    /// Whether the hold is past its TTL.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now > self.expires_at
    }
}

/// Errors from reservation operations.
#[derive(Debug, Error, PartialEq)]
pub enum InventoryError {
    /// No inventory record exists for a requested variant.
    #[error("variant {0} has no inventory record")]
    UnknownVariant(VariantId),

    /// A variant cannot cover the requested quantity.
    #[error("insufficient stock for variant {variant}: requested {requested}, available {available}")]
    InsufficientStock {
        /// The first unsatisfiable variant.
        variant: VariantId,
        /// Units requested.
        requested: u32,
        /// Units actually available.
        available: u32,
    },

    /// Version races kept winning; the caller should retry the checkout.
    #[error("inventory for variant {0} is contended")]
    Contended(VariantId),

    /// The reservation passed its TTL (or was already swept) before
    /// confirmation.
    #[error("reservation {0} has expired")]
    ReservationExpired(ReservationId),

    /// No reservation exists for the identifier.
    #[error("reservation {0} not found")]
    UnknownReservation(ReservationId),

    /// The inventory store failed.
    #[error("inventory storage error")]
    Storage(#[source] StoreError),
}

/// Takes, confirms, and releases TTL-bound stock holds with optimistic
/// concurrency control.
#[derive(Debug, Clone)]
pub struct ReservationManager<S> {
    store: Arc<S>,
    ttl: SignedDuration,
    retry: RetryPolicy,
}

impl<S: InventoryStore> ReservationManager<S> {
    /// Build a manager over an inventory store.
    pub fn new(store: Arc<S>, ttl: SignedDuration, retry: RetryPolicy) -> Self {
        Self { store, ttl, retry }
    }

    /// Atomically hold stock for every line, or hold nothing.
    ///
    /// Lines are reserved one record at a time with version-checked writes;
    /// if any line cannot be satisfied, every line already taken by this
    /// call is returned before the error surfaces.
    ///
    /// # Errors
    ///
    /// - [`InventoryError::InsufficientStock`] naming the first variant that
    ///   cannot cover its quantity.
    /// - [`InventoryError::Contended`] when a record keeps losing version
    ///   races past the retry budget.
    #[tracing::instrument(name = "inventory.reserve", skip(self, lines), fields(order = %order), err)]
    pub async fn reserve(
        &self,
        order: OrderId,
        lines: &[ReservationLine],
        now: Timestamp,
    ) -> Result<Reservation, InventoryError> {
        let mut taken: SmallVec<[ReservationLine; 4]> = SmallVec::new();

        for line in lines {
            if let Err(error) = self.reserve_line(*line).await {
                self.unwind(&taken).await;
                return Err(error);
            }

            taken.push(*line);
        }

        let reservation = Reservation {
            id: ReservationId::new(),
            order,
            lines: lines.to_vec(),
            status: ReservationStatus::Pending,
            created_at: now,
            expires_at: now.saturating_add(self.ttl).unwrap_or(Timestamp::MAX),
            version: Version::initial(),
        };

        if let Err(error) = self.store.insert_reservation(reservation.clone()).await {
            self.unwind(&taken).await;
            return Err(InventoryError::Storage(error));
        }

        debug!(reservation = %reservation.id, lines = lines.len(), "stock reserved");

        Ok(reservation)
    }

    /// Make a pending hold permanent. Idempotent: confirming a confirmed
    /// reservation is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::ReservationExpired`] for an expired or
    /// already-released reservation, forcing the caller to restart checkout.
    #[tracing::instrument(name = "inventory.confirm", skip(self), fields(reservation = %id), err)]
    pub async fn confirm(&self, id: ReservationId, now: Timestamp) -> Result<(), InventoryError> {
        for attempt in 1..=self.retry.max_attempts {
            let mut reservation = self.load(id).await?;

            match reservation.status {
                ReservationStatus::Confirmed => return Ok(()),
                ReservationStatus::Released => {
                    return Err(InventoryError::ReservationExpired(id));
                }
                ReservationStatus::Pending => {
                    if reservation.is_expired(now) {
                        return Err(InventoryError::ReservationExpired(id));
                    }

                    let expected = reservation.version;
                    reservation.status = ReservationStatus::Confirmed;
                    reservation.version = expected.next();

                    match self.store.put_reservation(expected, reservation).await {
                        Ok(()) => return Ok(()),
                        // The sweep (or a racing caller) moved the status;
                        // re-read and decide from the fresh record.
                        Err(StoreError::VersionMismatch) => {
                            tokio::time::sleep(self.retry.delay(attempt)).await;
                        }
                        Err(error) => return Err(InventoryError::Storage(error)),
                    }
                }
            }
        }

        Err(InventoryError::ReservationExpired(id))
    }

    /// Return a hold's quantities to `available`. A no-op when already
    /// released. Works on confirmed holds too: that is the compensating
    /// restock path for order cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::Storage`] if the reservation cannot be
    /// written back.
    #[tracing::instrument(name = "inventory.release", skip(self), fields(reservation = %id), err)]
    pub async fn release(&self, id: ReservationId) -> Result<(), InventoryError> {
        for attempt in 1..=self.retry.max_attempts {
            let mut reservation = self.load(id).await?;

            if reservation.status == ReservationStatus::Released {
                return Ok(());
            }

            let expected = reservation.version;
            let lines = reservation.lines.clone();
            reservation.status = ReservationStatus::Released;
            reservation.version = expected.next();

            // Flip the status before touching stock: whoever wins this write
            // is the only party that restocks, so a racing sweep and an
            // explicit rollback can never both return the same quantities.
            match self.store.put_reservation(expected, reservation).await {
                Ok(()) => {
                    self.unwind(&lines).await;
                    return Ok(());
                }
                Err(StoreError::VersionMismatch) => {
                    tokio::time::sleep(self.retry.delay(attempt)).await;
                }
                Err(error) => return Err(InventoryError::Storage(error)),
            }
        }

        Err(InventoryError::Storage(StoreError::VersionMismatch))
    }

    /// Pending reservations past their TTL, for the external sweeper.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::Storage`] if the store cannot be read.
    pub async fn find_expired(&self, now: Timestamp) -> Result<Vec<Reservation>, InventoryError> {
        self.store
            .expired_reservations(now)
            .await
            .map_err(InventoryError::Storage)
    }

    /// Release every expired, unconfirmed reservation. Returns how many were
    /// swept.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::Storage`] if the store cannot be read.
    #[tracing::instrument(name = "inventory.release_expired", skip(self), err)]
    pub async fn release_expired(&self, now: Timestamp) -> Result<usize, InventoryError> {
        let expired = self.find_expired(now).await?;
        let count = expired.len();

        for reservation in expired {
            self.release(reservation.id).await?;
        }

        if count > 0 {
            debug!(count, "swept expired reservations");
        }

        Ok(count)
    }

    /// Reserve one line with bounded read-check-write retries.
    async fn reserve_line(&self, line: ReservationLine) -> Result<(), InventoryError> {
        for attempt in 1..=self.retry.max_attempts {
            let record = self.read_record(line.variant).await?;

            if record.available < line.quantity {
                return Err(InventoryError::InsufficientStock {
                    variant: line.variant,
                    requested: line.quantity,
                    available: record.available,
                });
            }

            let expected = record.version;
            let next = InventoryRecord {
                available: record.available - line.quantity,
                reserved: record.reserved + line.quantity,
                version: expected.next(),
                ..record
            };

            match self.store.put_inventory(expected, next).await {
                Ok(()) => return Ok(()),
                Err(StoreError::VersionMismatch) => {
                    tokio::time::sleep(self.retry.delay(attempt)).await;
                }
                Err(error) => return Err(InventoryError::Storage(error)),
            }
        }

        Err(InventoryError::Contended(line.variant))
    }

    /// Put quantities back. Must not give up on a version race: a lost
    /// unwind would leak held stock until the sweep, so this loops until the
    /// write lands and only logs if a record has vanished.
    async fn unwind(&self, lines: &[ReservationLine]) {
        for line in lines {
            loop {
                let record = match self.read_record(line.variant).await {
                    Ok(record) => record,
                    Err(error) => {
                        warn!(variant = %line.variant, %error, "unwind skipped a line");
                        break;
                    }
                };

                let expected = record.version;
                let next = InventoryRecord {
                    available: record.available + line.quantity,
                    reserved: record.reserved.saturating_sub(line.quantity),
                    version: expected.next(),
                    ..record
                };

                match self.store.put_inventory(expected, next).await {
                    Ok(()) => break,
                    Err(StoreError::VersionMismatch) => {
                        tokio::time::sleep(self.retry.delay(1)).await;
                    }
                    Err(error) => {
                        warn!(variant = %line.variant, %error, "unwind skipped a line");
                        break;
                    }
                }
            }
        }
    }

    async fn read_record(&self, variant: VariantId) -> Result<InventoryRecord, InventoryError> {
        self.store
            .inventory(variant)
            .await
            .map_err(|error| match error {
                StoreError::NotFound => InventoryError::UnknownVariant(variant),
                other => InventoryError::Storage(other),
            })
    }

    async fn load(&self, id: ReservationId) -> Result<Reservation, InventoryError> {
        self.store
            .reservation(id)
            .await
            .map_err(|error| match error {
                StoreError::NotFound => InventoryError::UnknownReservation(id),
                other => InventoryError::Storage(other),
            })
    }
}
