//! Token bucket limiter over a shared atomic-execution store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, trace};

use crate::error::{Result, TollgateError};
use crate::store::BucketStore;

use super::bucket::{BucketConfig, BucketRecord};
use super::clock::{Clock, SystemClock};
use super::codec::BucketCodec;

/// Outcome of a successful limiter call.
///
/// A denial is a normal outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the requested tokens were granted
    pub allowed: bool,
    /// Tokens left in the bucket, truncated toward zero
    pub remaining: i64,
}

/// A token bucket rate limiter whose state lives in a shared store.
///
/// The limiter keeps no bucket state of its own and takes no locks: every
/// call is a single atomic round trip to the store, which linearizes
/// concurrent callers on the same key, whichever process they run in.
pub struct TokenBucketLimiter {
    /// The store running the bucket script
    store: Arc<dyn BucketStore>,
    /// Bucket parameters shared by every key of this limiter
    config: BucketConfig,
    /// Key and reply translation
    codec: BucketCodec,
    /// Time source, read once per call
    clock: Arc<dyn Clock>,
    closed: AtomicBool,
}

impl std::fmt::Debug for TokenBucketLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketLimiter")
            .field("store", &self.store)
            .field("config", &self.config)
            .field("codec", &self.codec)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl TokenBucketLimiter {
    /// Create a limiter over `store` with the default key prefix and the
    /// system clock.
    pub fn new(store: Arc<dyn BucketStore>, config: BucketConfig) -> Self {
        Self {
            store,
            config,
            codec: BucketCodec::default(),
            clock: Arc::new(SystemClock::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Use a different codec, typically to change the key prefix.
    pub fn with_codec(mut self, codec: BucketCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Use a different time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The bucket parameters.
    pub fn config(&self) -> &BucketConfig {
        &self.config
    }

    /// The codec in use.
    pub fn codec(&self) -> &BucketCodec {
        &self.codec
    }

    /// Try to take one token for `key`.
    pub async fn allow(&self, key: &str) -> Result<Decision> {
        self.allow_n(key, 1).await
    }

    /// Try to take `n` tokens for `key`.
    ///
    /// `n == 0` reports the current balance without touching stored state.
    /// Asking for more than the capacity is always denied.
    ///
    /// # Errors
    /// - `InvalidArgument` for a negative `n` or an empty key, before any
    ///   round trip.
    /// - `StoreUnavailable` when the store cannot be reached in time or the
    ///   limiter is closed.
    /// - `Protocol` when the store reply cannot be decoded.
    pub async fn allow_n(&self, key: &str, n: i64) -> Result<Decision> {
        if n < 0 {
            return Err(TollgateError::InvalidArgument(format!(
                "token count must be >= 0, got {}",
                n
            )));
        }
        validate_key(key)?;
        self.ensure_open()?;

        let now = self.clock.now_millis();
        let request = self.codec.encode(key, &self.config, now, n);

        trace!(
            key = %key,
            n = n,
            now = now,
            "Checking token bucket"
        );

        let reply = self.store.execute(&request).await?;
        let outcome = self.codec.decode(&reply, self.config.capacity())?;

        // A zero-token check is a read and always passes
        let decision = Decision {
            allowed: n == 0 || outcome.granted,
            remaining: outcome.remaining(),
        };

        if !decision.allowed {
            debug!(
                key = %key,
                n = n,
                remaining = decision.remaining,
                "Token bucket exhausted"
            );
        }

        Ok(decision)
    }

    /// Current balance of `key` without consuming or writing anything.
    pub async fn remaining(&self, key: &str) -> Result<i64> {
        Ok(self.allow_n(key, 0).await?.remaining)
    }

    /// The persisted record of `key`, as last written.
    ///
    /// No refill is applied. `None` means the bucket is fresh or expired.
    pub async fn record(&self, key: &str) -> Result<Option<BucketRecord>> {
        validate_key(key)?;
        self.ensure_open()?;

        self.store.fetch(&self.codec.store_key(key)).await
    }

    /// Delete the state of `key`, returning the bucket to full capacity.
    ///
    /// Returns whether a record existed.
    pub async fn reset(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        self.ensure_open()?;

        let existed = self.store.delete(&self.codec.store_key(key)).await?;
        debug!(key = %key, existed = existed, "Reset token bucket");
        Ok(existed)
    }

    /// Close the limiter and release the store's client resources.
    ///
    /// Stored buckets are kept. Closing twice is a no-op, and every call made
    /// after closing fails with `StoreUnavailable`. Limiters sharing the same
    /// store lose it too.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.store.close().await
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(TollgateError::StoreUnavailable(
                "limiter is closed".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl super::backend::RateLimiter for TokenBucketLimiter {
    async fn allow_n(&self, key: &str, n: i64) -> Result<Decision> {
        self.allow_n(key, n).await
    }

    async fn close(&self) -> Result<()> {
        self.close().await
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(TollgateError::InvalidArgument(
            "rate limit key must not be empty".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{BucketRequest, ManualClock, RateLimiter, ReplyValue};
    use crate::store::{MemoryStore, ReplyEncoding};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const HOUR: Duration = Duration::from_secs(3600);

    fn create_limiter(rate: f64, capacity: i64) -> (TokenBucketLimiter, ManualClock, Arc<MemoryStore>) {
        create_limiter_with(rate, capacity, HOUR, ReplyEncoding::Flag)
    }

    fn create_limiter_with(
        rate: f64,
        capacity: i64,
        idle_expiration: Duration,
        encoding: ReplyEncoding,
    ) -> (TokenBucketLimiter, ManualClock, Arc<MemoryStore>) {
        let clock = ManualClock::new(1_700_000_000_000);
        let store = Arc::new(
            MemoryStore::with_clock(Arc::new(clock.clone())).with_encoding(encoding),
        );
        let config = BucketConfig::new(rate, capacity, idle_expiration).unwrap();
        let limiter = TokenBucketLimiter::new(store.clone(), config)
            .with_clock(Arc::new(clock.clone()));
        (limiter, clock, store)
    }

    /// Store that answers every script call with a canned result.
    #[derive(Debug)]
    struct CannedStore {
        reply: Option<ReplyValue>,
        calls: AtomicUsize,
    }

    impl CannedStore {
        fn replying(reply: ReplyValue) -> Self {
            Self {
                reply: Some(reply),
                calls: AtomicUsize::new(0),
            }
        }

        fn unreachable() -> Self {
            Self {
                reply: None,
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BucketStore for CannedStore {
        async fn execute(&self, _request: &BucketRequest) -> Result<ReplyValue> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone().ok_or_else(|| {
                TollgateError::StoreUnavailable("connection refused".to_string())
            })
        }

        async fn fetch(&self, _key: &str) -> Result<Option<BucketRecord>> {
            Ok(None)
        }

        async fn delete(&self, _key: &str) -> Result<bool> {
            Ok(false)
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_burst_then_refill() {
        let (limiter, clock, _store) = create_limiter(10.0, 5);

        for expected in [4, 3, 2, 1, 0] {
            let decision = limiter.allow("user:42:api").await.unwrap();
            assert_eq!(decision, Decision { allowed: true, remaining: expected });
        }

        // 6th request at the same instant is denied
        let decision = limiter.allow("user:42:api").await.unwrap();
        assert_eq!(decision, Decision { allowed: false, remaining: 0 });

        // 200ms at 10/sec refills 2 tokens
        clock.advance(Duration::from_millis(200));
        let decision = limiter.allow("user:42:api").await.unwrap();
        assert_eq!(decision, Decision { allowed: true, remaining: 1 });
    }

    #[tokio::test]
    async fn test_allow_n_insufficient_leaves_balance() {
        let (limiter, _clock, _store) = create_limiter(10.0, 10);

        let decision = limiter.allow_n("test_key_n", 3).await.unwrap();
        assert_eq!(decision, Decision { allowed: true, remaining: 7 });

        let decision = limiter.allow_n("test_key_n", 8).await.unwrap();
        assert_eq!(decision, Decision { allowed: false, remaining: 7 });
    }

    #[tokio::test]
    async fn test_immediate_burst_matches_capacity() {
        let (limiter, _clock, _store) = create_limiter(1.0, 20);

        let mut granted = 0;
        for _ in 0..21 {
            if limiter.allow("burst").await.unwrap().allowed {
                granted += 1;
            }
        }
        assert_eq!(granted, 20);
    }

    #[tokio::test]
    async fn test_remaining_stays_within_capacity() {
        let (limiter, clock, _store) = create_limiter(7.5, 6);

        for i in 0..200i64 {
            let decision = limiter.allow_n("bounded", i % 4).await.unwrap();
            assert!(
                (0..=6).contains(&decision.remaining),
                "remaining {} out of bounds at step {}",
                decision.remaining,
                i
            );
            clock.advance(Duration::from_millis(((i * 37) % 300) as u64));
        }
    }

    #[tokio::test]
    async fn test_refill_is_monotonic_and_capped() {
        let (limiter, clock, _store) = create_limiter(10.0, 5);

        limiter.allow_n("mono", 5).await.unwrap();

        let mut previous = limiter.remaining("mono").await.unwrap();
        for _ in 0..10 {
            clock.advance(Duration::from_millis(150));
            let current = limiter.remaining("mono").await.unwrap();
            assert!(current >= previous);
            assert!(current <= 5);
            previous = current;
        }
        assert_eq!(previous, 5);
    }

    #[tokio::test]
    async fn test_zero_tokens_is_a_pure_read() {
        let (limiter, clock, store) = create_limiter(10.0, 10);

        // Fresh key: full balance, nothing created
        let decision = limiter.allow_n("fresh", 0).await.unwrap();
        assert_eq!(decision, Decision { allowed: true, remaining: 10 });
        assert!(store.is_empty());

        limiter.allow_n("k", 3).await.unwrap();
        let before = limiter.record("k").await.unwrap();

        clock.advance(Duration::from_millis(100));
        let decision = limiter.allow_n("k", 0).await.unwrap();
        assert_eq!(decision, Decision { allowed: true, remaining: 8 });
        assert_eq!(limiter.record("k").await.unwrap(), before);

        // The next real call sees what it would have seen without the read
        let decision = limiter.allow("k").await.unwrap();
        assert_eq!(decision, Decision { allowed: true, remaining: 7 });
    }

    #[tokio::test]
    async fn test_denial_advances_baseline() {
        let (limiter, clock, _store) = create_limiter(1.0, 10);

        limiter.allow_n("deny", 10).await.unwrap();

        clock.advance(Duration::from_millis(500));
        let first = limiter.allow_n("deny", 2).await.unwrap();
        assert!(!first.allowed);

        let record = limiter.record("deny").await.unwrap().unwrap();
        assert_eq!(record.last_refill_at_millis, 1_700_000_000_500);
        assert_eq!(record.tokens, 0.5);

        let second = limiter.allow_n("deny", 5).await.unwrap();
        assert!(!second.allowed);
        assert!(second.remaining >= first.remaining);
        assert_eq!(limiter.record("deny").await.unwrap().unwrap().tokens, 0.5);

        clock.advance(Duration::from_millis(500));
        let decision = limiter.allow("deny").await.unwrap();
        assert_eq!(decision, Decision { allowed: true, remaining: 0 });
    }

    #[tokio::test]
    async fn test_fractional_balance_is_not_rounded_up() {
        let (limiter, clock, _store) = create_limiter(1.0, 2);

        limiter.allow_n("frac", 2).await.unwrap();

        // 0.9 tokens is not enough for 1
        clock.advance(Duration::from_millis(900));
        let decision = limiter.allow("frac").await.unwrap();
        assert_eq!(decision, Decision { allowed: false, remaining: 0 });

        clock.advance(Duration::from_millis(100));
        let decision = limiter.allow("frac").await.unwrap();
        assert_eq!(decision, Decision { allowed: true, remaining: 0 });
    }

    #[tokio::test]
    async fn test_request_above_capacity_always_denied() {
        let (limiter, clock, _store) = create_limiter(100.0, 5);

        clock.advance(Duration::from_secs(60));
        let decision = limiter.allow_n("big", 6).await.unwrap();
        assert_eq!(decision, Decision { allowed: false, remaining: 5 });
    }

    #[tokio::test]
    async fn test_idle_bucket_resets_to_capacity() {
        let (limiter, clock, store) =
            create_limiter_with(0.1, 5, Duration::from_secs(2), ReplyEncoding::Flag);

        for _ in 0..3 {
            assert!(limiter.allow("test_expiration").await.unwrap().allowed);
        }

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.purge_expired(), 1);

        let decision = limiter.allow("test_expiration").await.unwrap();
        assert_eq!(decision, Decision { allowed: true, remaining: 4 });
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (limiter, _clock, _store) = create_limiter(1.0, 2);

        limiter.allow_n("a", 2).await.unwrap();
        assert!(!limiter.allow("a").await.unwrap().allowed);

        let decision = limiter.allow("b").await.unwrap();
        assert_eq!(decision, Decision { allowed: true, remaining: 1 });
    }

    #[tokio::test]
    async fn test_every_reply_encoding_decides_alike() {
        for encoding in [ReplyEncoding::Flag, ReplyEncoding::Boolean, ReplyEncoding::Count] {
            let (limiter, clock, _store) = create_limiter_with(10.0, 5, HOUR, encoding);

            let mut decisions = Vec::new();
            for _ in 0..6 {
                decisions.push(limiter.allow("enc").await.unwrap());
            }
            clock.advance(Duration::from_millis(200));
            decisions.push(limiter.allow("enc").await.unwrap());

            let allowed: Vec<bool> = decisions.iter().map(|d| d.allowed).collect();
            let remaining: Vec<i64> = decisions.iter().map(|d| d.remaining).collect();
            assert_eq!(allowed, vec![true, true, true, true, true, false, true], "{:?}", encoding);
            assert_eq!(remaining, vec![4, 3, 2, 1, 0, 0, 1], "{:?}", encoding);
        }
    }

    #[tokio::test]
    async fn test_invalid_arguments_never_reach_store() {
        let store = Arc::new(CannedStore::unreachable());
        let limiter = TokenBucketLimiter::new(store.clone(), BucketConfig::default());

        let err = limiter.allow_n("k", -1).await.unwrap_err();
        assert!(err.is_invalid_argument());

        let err = limiter.allow("").await.unwrap_err();
        assert!(err.is_invalid_argument());

        assert_eq!(store.calls(), 0);
    }

    #[tokio::test]
    async fn test_store_failure_is_reported() {
        let store = Arc::new(CannedStore::unreachable());
        let limiter = TokenBucketLimiter::new(store.clone(), BucketConfig::default());

        let err = limiter.allow("k").await.unwrap_err();
        assert!(err.is_store_unavailable());
        // Exactly one attempt, no retries
        assert_eq!(store.calls(), 1);
    }

    #[tokio::test]
    async fn test_malformed_reply_is_protocol_error() {
        let replies = [
            ReplyValue::Array(vec![ReplyValue::Int(1)]),
            ReplyValue::Text("OK".to_string()),
            ReplyValue::Array(vec![ReplyValue::Text("yes".to_string()), ReplyValue::Int(1)]),
            ReplyValue::Array(vec![ReplyValue::Int(1), ReplyValue::Int(100)]),
        ];

        for reply in replies {
            let store = Arc::new(CannedStore::replying(reply.clone()));
            let limiter = TokenBucketLimiter::new(store, BucketConfig::default());

            let err = limiter.allow("k").await.unwrap_err();
            assert!(err.is_protocol(), "reply {:?} gave {:?}", reply, err);
        }
    }

    #[tokio::test]
    async fn test_reset_restores_capacity() {
        let (limiter, _clock, _store) = create_limiter(1.0, 3);

        limiter.allow_n("r", 3).await.unwrap();
        assert!(limiter.reset("r").await.unwrap());
        assert!(!limiter.reset("r").await.unwrap());

        assert_eq!(limiter.remaining("r").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let (limiter, _clock, _store) = create_limiter(1.0, 3);

        limiter.close().await.unwrap();
        limiter.close().await.unwrap();
        assert!(limiter.is_closed());

        let err = limiter.allow("k").await.unwrap_err();
        assert!(err.is_store_unavailable());
    }

    #[tokio::test]
    async fn test_usable_as_trait_object() {
        let (limiter, _clock, _store) = create_limiter(1.0, 2);
        let limiter: Arc<dyn RateLimiter> = Arc::new(limiter);

        assert_eq!(
            limiter.allow("dyn").await.unwrap(),
            Decision { allowed: true, remaining: 1 }
        );
        assert_eq!(
            limiter.allow_n("dyn", 2).await.unwrap(),
            Decision { allowed: false, remaining: 1 }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_budget() {
        let (limiter, _clock, _store) = create_limiter(1.0, 20);
        let limiter = Arc::new(limiter);

        let tasks: Vec<_> = (0..100)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.allow("shared").await.unwrap().allowed })
            })
            .collect();

        let results = futures::future::join_all(tasks).await;
        let granted = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();

        assert_eq!(granted, 20);
    }
}
