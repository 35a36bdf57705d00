//! In-process bucket store.
//!
//! Runs the same refill step as the Redis script while holding the
//! map shard lock for the key, which makes each step atomic for every task
//! in the process. Useful for single-node deployments and for tests.
//!
//! Expired records are swept from the map at most once per sweep interval,
//! piggybacking on `execute`, so idle keys do not pile up.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{Result, TollgateError};
use crate::ratelimit::{
    refill_and_consume, BucketRecord, BucketRequest, Clock, ReplyValue, SystemClock,
};

use super::BucketStore;

/// Default pause between two sweeps of expired records.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Wire shape the memory store answers with.
///
/// Mirrors the encodings a real store has been seen to produce, so callers
/// can exercise the codec against each of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyEncoding {
    /// `[0|1, "<tokens>"]`, the canonical script reply.
    #[default]
    Flag,
    /// `[true|false, <double>]`, as seen over RESP3.
    Boolean,
    /// `[<granted count>|0, <truncated integer>]`, the legacy integer reply.
    Count,
}

impl ReplyEncoding {
    fn encode(&self, granted: bool, requested: i64, tokens: f64) -> ReplyValue {
        let (granted, remaining) = match self {
            ReplyEncoding::Flag => (
                ReplyValue::Int(i64::from(granted)),
                ReplyValue::Text(tokens.to_string()),
            ),
            ReplyEncoding::Boolean => (ReplyValue::Bool(granted), ReplyValue::Double(tokens)),
            ReplyEncoding::Count => {
                let count = if granted { requested.max(1) } else { 0 };
                (ReplyValue::Int(count), ReplyValue::Int(tokens.trunc() as i64))
            }
        };
        ReplyValue::Array(vec![granted, remaining])
    }
}

#[derive(Debug, Clone, Copy)]
struct StoredBucket {
    record: BucketRecord,
    expires_at_millis: i64,
}

impl StoredBucket {
    fn is_live(&self, now_millis: i64) -> bool {
        self.expires_at_millis > now_millis
    }
}

/// Bucket store living in process memory.
#[derive(Debug)]
pub struct MemoryStore {
    buckets: DashMap<String, StoredBucket>,
    encoding: ReplyEncoding,
    clock: Arc<dyn Clock>,
    sweep_interval_millis: i64,
    next_sweep_at_millis: AtomicI64,
    closed: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store using the system clock for expiry.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create an empty store whose TTLs run on `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let sweep_interval_millis = duration_millis(DEFAULT_SWEEP_INTERVAL);
        let next_sweep_at_millis = clock.now_millis().saturating_add(sweep_interval_millis);

        Self {
            buckets: DashMap::new(),
            encoding: ReplyEncoding::default(),
            clock,
            sweep_interval_millis,
            next_sweep_at_millis: AtomicI64::new(next_sweep_at_millis),
            closed: AtomicBool::new(false),
        }
    }

    /// Sweep expired records at most once per `interval`.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_millis = duration_millis(interval).max(1);
        let next = self
            .clock
            .now_millis()
            .saturating_add(self.sweep_interval_millis);
        self.next_sweep_at_millis = AtomicI64::new(next);
        self
    }

    /// Answer with the given wire encoding.
    pub fn with_encoding(mut self, encoding: ReplyEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Number of records held, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drop every expired record. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.is_live(now));
        before.saturating_sub(self.buckets.len())
    }

    /// Purge expired records if the sweep interval has elapsed.
    ///
    /// Only the caller that wins the deadline swap sweeps. Must not run while
    /// an entry guard is held.
    fn maybe_sweep(&self, now_millis: i64) {
        let due = self.next_sweep_at_millis.load(Ordering::Acquire);
        if now_millis < due {
            return;
        }

        let next = now_millis.saturating_add(self.sweep_interval_millis);
        if self
            .next_sweep_at_millis
            .compare_exchange(due, next, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let removed = self.purge_expired();
        if removed > 0 {
            debug!(removed = removed, remaining = self.buckets.len(), "Swept expired buckets");
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TollgateError::StoreUnavailable(
                "memory store is closed".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BucketStore for MemoryStore {
    async fn execute(&self, request: &BucketRequest) -> Result<ReplyValue> {
        self.ensure_open()?;

        let store_now = self.clock.now_millis();
        let ttl = i64::try_from(request.ttl_millis).unwrap_or(i64::MAX);

        self.maybe_sweep(store_now);

        // The entry guard holds the shard lock until the step is written back
        let step = match self.buckets.entry(request.key.clone()) {
            Entry::Occupied(mut occupied) => {
                let live = occupied.get().is_live(store_now);
                let record = live.then(|| occupied.get().record);
                let step = refill_and_consume(
                    record.as_ref(),
                    request.rate,
                    request.capacity,
                    request.now_millis,
                    request.requested,
                );

                if step.persist {
                    occupied.insert(StoredBucket {
                        record: BucketRecord {
                            tokens: step.tokens,
                            last_refill_at_millis: request.now_millis,
                        },
                        expires_at_millis: store_now.saturating_add(ttl),
                    });
                } else if !live {
                    occupied.remove();
                }
                step
            }
            Entry::Vacant(vacant) => {
                let step = refill_and_consume(
                    None,
                    request.rate,
                    request.capacity,
                    request.now_millis,
                    request.requested,
                );

                if step.persist {
                    vacant.insert(StoredBucket {
                        record: BucketRecord {
                            tokens: step.tokens,
                            last_refill_at_millis: request.now_millis,
                        },
                        expires_at_millis: store_now.saturating_add(ttl),
                    });
                }
                step
            }
        };

        trace!(
            key = %request.key,
            granted = step.granted,
            tokens = step.tokens,
            "Memory store step"
        );

        Ok(self
            .encoding
            .encode(step.granted, request.requested, step.tokens))
    }

    async fn fetch(&self, key: &str) -> Result<Option<BucketRecord>> {
        self.ensure_open()?;

        let now = self.clock.now_millis();
        Ok(self
            .buckets
            .get(key)
            .filter(|bucket| bucket.is_live(now))
            .map(|bucket| bucket.record))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.ensure_open()?;

        let now = self.clock.now_millis();
        Ok(self
            .buckets
            .remove(key)
            .map(|(_, bucket)| bucket.is_live(now))
            .unwrap_or(false))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
