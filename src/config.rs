//! Engine configuration
//!
//! Every tunable the engine depends on lives here with a documented default,
//! so deployments change behaviour through configuration instead of edits.

use std::time::Duration;

use jiff::SignedDuration;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// What happens when a coupon is attached to a cart that already has one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StackingPolicy {
    /// The new coupon replaces the old one (last write wins). The default:
    /// coupons do not stack.
    #[default]
    ReplaceExisting,

    /// Attaching a second coupon is rejected until the first is removed.
    RejectAdditional,
}

/// Bounded retry with jittered linear backoff, used wherever a
/// version-checked write can lose a race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts before giving up and reporting contention.
    pub max_attempts: u32,

    /// Base delay; attempt `n` waits roughly `n * base` plus jitter.
    pub backoff_base: Duration,
}

impl RetryPolicy {
    /// Delay before the next attempt, with random jitter so competing
    /// retriers spread out instead of colliding again in lockstep.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.backoff_base.saturating_mul(attempt);
        let jitter_cap = self.backoff_base.as_millis().min(u128::from(u64::MAX));
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_cap as u64)
        };

        base.saturating_add(Duration::from_millis(jitter))
    }
}

/// Checkout engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutConfig {
    /// Unit-price snapshots older than this are re-checked against the
    /// catalog at checkout. Default: 5 minutes.
    pub price_staleness: SignedDuration,

    /// A re-checked price may drift from its snapshot by at most this many
    /// minor units before checkout reports the change. Default: 0 (any
    /// difference is reported).
    pub price_tolerance_minor: i64,

    /// How long a reservation holds stock before the sweep may reclaim it.
    /// Default: 15 minutes.
    pub reservation_ttl: SignedDuration,

    /// How long an untouched cart stays valid. Default: 30 days.
    pub cart_ttl: SignedDuration,

    /// Coupon stacking behaviour. Default: replace the existing coupon.
    pub coupon_stacking: StackingPolicy,

    /// Retry policy for inventory reservation writes.
    pub reserve_retry: RetryPolicy,

    /// Retry policy for coupon usage and order state counters.
    pub counter_retry: RetryPolicy,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            price_staleness: SignedDuration::from_secs(5 * 60),
            price_tolerance_minor: 0,
            reservation_ttl: SignedDuration::from_secs(15 * 60),
            cart_ttl: SignedDuration::from_secs(30 * 24 * 60 * 60),
            coupon_stacking: StackingPolicy::default(),
            reserve_retry: RetryPolicy {
                max_attempts: 8,
                backoff_base: Duration::from_millis(10),
            },
            counter_retry: RetryPolicy {
                max_attempts: 8,
                backoff_base: Duration::from_millis(5),
            },
        }
    }
}
