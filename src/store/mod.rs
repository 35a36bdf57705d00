//! Atomic-execution stores holding bucket state.
//!
//! A store must run the whole read-refill-consume-write step for one key
//! without interleaving other operations on that key, and must support a
//! per-key TTL. The limiter relies on nothing else.

mod memory;
mod redis_store;
mod script;

use async_trait::async_trait;
use std::fmt::Debug;

use crate::error::Result;
use crate::ratelimit::{BucketRecord, BucketRequest, ReplyValue};

pub use memory::{MemoryStore, ReplyEncoding, DEFAULT_SWEEP_INTERVAL};
pub use redis_store::{RedisStore, RedisStoreConfig};
pub use script::TOKEN_BUCKET_SCRIPT;

/// Trait for stores that can run the bucket step atomically.
///
/// Keys passed to a store are already prefixed by the codec.
#[async_trait]
pub trait BucketStore: Send + Sync + Debug {
    /// Run the refill-then-consume step for `request.key` as one atomic unit
    /// and return the raw positional reply.
    async fn execute(&self, request: &BucketRequest) -> Result<ReplyValue>;

    /// Read the persisted record without refilling it.
    async fn fetch(&self, key: &str) -> Result<Option<BucketRecord>>;

    /// Delete a bucket record. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Release client resources. Bucket state is left in place.
    async fn close(&self) -> Result<()>;
}
