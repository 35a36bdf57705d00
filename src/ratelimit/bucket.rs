//! Token bucket configuration, persisted state and the refill step.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TollgateError};

/// Default refill rate in tokens per second.
pub const DEFAULT_RATE: f64 = 10.0;
/// Default bucket capacity.
pub const DEFAULT_CAPACITY: i64 = 20;
/// Default idle expiration of a bucket record.
pub const DEFAULT_IDLE_EXPIRATION: Duration = Duration::from_secs(3600);
/// Longest accepted idle expiration, one year.
pub const MAX_IDLE_EXPIRATION: Duration = Duration::from_secs(365 * 24 * 3600);

/// Immutable parameters of a token bucket.
///
/// Values are validated on construction, so a `BucketConfig` held by a
/// limiter is always usable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    rate: f64,
    capacity: i64,
    idle_expiration: Duration,
}

impl BucketConfig {
    /// Create a validated bucket configuration.
    ///
    /// `rate` must be finite and positive, `capacity` at least 1 and
    /// `idle_expiration` between one millisecond and [`MAX_IDLE_EXPIRATION`].
    pub fn new(rate: f64, capacity: i64, idle_expiration: Duration) -> Result<Self> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(TollgateError::InvalidArgument(format!(
                "rate must be a positive number, got {}",
                rate
            )));
        }

        if capacity < 1 {
            return Err(TollgateError::InvalidArgument(format!(
                "capacity must be >= 1, got {}",
                capacity
            )));
        }

        if idle_expiration.as_millis() == 0 {
            return Err(TollgateError::InvalidArgument(
                "idle expiration must be at least 1ms".to_string(),
            ));
        }

        if idle_expiration > MAX_IDLE_EXPIRATION {
            return Err(TollgateError::InvalidArgument(format!(
                "idle expiration must be at most {}s, got {}s",
                MAX_IDLE_EXPIRATION.as_secs(),
                idle_expiration.as_secs()
            )));
        }

        Ok(Self {
            rate,
            capacity,
            idle_expiration,
        })
    }

    /// Tokens added per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Maximum number of tokens the bucket holds.
    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    /// Store-side TTL refreshed after every write.
    pub fn idle_expiration(&self) -> Duration {
        self.idle_expiration
    }

    /// Idle expiration in whole milliseconds, as handed to the store.
    pub fn idle_expiration_millis(&self) -> u64 {
        u64::try_from(self.idle_expiration.as_millis()).unwrap_or(u64::MAX)
    }
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            rate: DEFAULT_RATE,
            capacity: DEFAULT_CAPACITY,
            idle_expiration: DEFAULT_IDLE_EXPIRATION,
        }
    }
}

/// Persisted state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketRecord {
    /// Available tokens, always within `[0, capacity]`.
    pub tokens: f64,
    /// Epoch milliseconds of the last computation of `tokens`.
    pub last_refill_at_millis: i64,
}

impl BucketRecord {
    /// A full bucket as seen on first access.
    pub fn fresh(capacity: i64, now_millis: i64) -> Self {
        Self {
            tokens: capacity as f64,
            last_refill_at_millis: now_millis,
        }
    }

    /// Tokens available at `now_millis`, capped at `capacity`.
    ///
    /// A clock that went backwards adds nothing.
    pub fn refilled(&self, rate: f64, capacity: i64, now_millis: i64) -> f64 {
        let elapsed_secs = (now_millis - self.last_refill_at_millis).max(0) as f64 / 1000.0;
        (self.tokens + elapsed_secs * rate).min(capacity as f64)
    }
}

/// Result of one refill-then-consume step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Consumption {
    /// Whether the requested tokens were taken.
    pub granted: bool,
    /// Balance after the step.
    pub tokens: f64,
    /// Whether the step must be written back. False only for `requested == 0`.
    pub persist: bool,
}

/// Lazily refill `record` up to `now_millis` and try to take `requested` tokens.
///
/// A missing record is a full bucket. Denials still report `persist`, so the
/// refill baseline moves forward on every call that asks for tokens.
/// This is the in-process twin of the store script in `store::script`.
pub fn refill_and_consume(
    record: Option<&BucketRecord>,
    rate: f64,
    capacity: i64,
    now_millis: i64,
    requested: i64,
) -> Consumption {
    let current = record
        .copied()
        .unwrap_or_else(|| BucketRecord::fresh(capacity, now_millis));
    let refilled = current.refilled(rate, capacity, now_millis);

    if requested == 0 {
        return Consumption {
            granted: true,
            tokens: refilled,
            persist: false,
        };
    }

    let requested = requested as f64;
    if refilled >= requested {
        Consumption {
            granted: true,
            tokens: refilled - requested,
            persist: true,
        }
    } else {
        Consumption {
            granted: false,
            tokens: refilled,
            persist: true,
        }
    }
}
