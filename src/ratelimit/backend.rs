//! Rate limiter trait for abstracting over limiter implementations.

use async_trait::async_trait;

use crate::error::Result;

use super::limiter::Decision;

/// Trait for rate limiter implementations.
///
/// Lets callers such as middleware hold any limiter behind
/// `Arc<dyn RateLimiter>`.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Try to take one token for `key`.
    async fn allow(&self, key: &str) -> Result<Decision> {
        self.allow_n(key, 1).await
    }

    /// Try to take `n` tokens for `key`.
    async fn allow_n(&self, key: &str, n: i64) -> Result<Decision>;

    /// Release client resources. Bucket state is left in the store.
    async fn close(&self) -> Result<()>;
}
