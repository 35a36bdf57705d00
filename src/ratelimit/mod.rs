//! Token bucket rate limiting: bucket model, codec and limiter.

mod backend;
mod bucket;
mod clock;
mod codec;
mod limiter;

pub use backend::RateLimiter;
pub use bucket::{
    refill_and_consume, BucketConfig, BucketRecord, Consumption, DEFAULT_CAPACITY,
    DEFAULT_IDLE_EXPIRATION, DEFAULT_RATE, MAX_IDLE_EXPIRATION,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{
    BucketCodec, BucketRequest, ReplyValue, ScriptOutcome, DEFAULT_KEY_PREFIX,
    REFILLED_AT_FIELD, TOKENS_FIELD,
};
pub use limiter::{Decision, TokenBucketLimiter};
