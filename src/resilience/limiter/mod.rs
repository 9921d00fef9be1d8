// Rate limiting backends
// A single async interface with a process-local and a distributed implementation

//! # Rate Limiters
//!
//! Every backend implements [`RateLimiter`]:
//!
//! - [`MemoryRateLimiter`]: fixed window per key, held in a sharded map and
//!   swept by a background task
//! - [`DistributedRateLimiter`]: sliding window kept in an external ordered-set
//!   store through a [`SlidingWindowStore`], so several processes share one
//!   budget per key
//!
//! Keys are opaque strings. The HTTP middleware derives them from the client
//! identity (see [`crate::resilience::client_ip`]).
//!
//! ## Cancellation
//!
//! Implementations check the [`Context`] before doing any work and race
//! backend I/O against [`Context::done`]. A fired context always yields
//! [`LimiterError::Canceled`].

use async_trait::async_trait;

use crate::context::{Context, ContextError};

pub mod distributed;
pub mod memory;

pub use distributed::{
    DistributedRateLimiter, LocalSlidingWindowStore, RedisSlidingWindowStore, SlidingWindowStore,
};
pub use memory::MemoryRateLimiter;

#[derive(Debug, thiserror::Error)]
pub enum LimiterError {
    #[error("rate limiter call canceled: {0}")]
    Canceled(#[from] ContextError),

    #[error("rate limiter backend error: {0}")]
    Backend(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Admission interface shared by every backend
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Record one request for `key` and report whether it is within the limit
    async fn allow(&self, ctx: &Context, key: &str) -> Result<bool, LimiterError>;

    /// Forget everything recorded for `key`
    async fn reset(&self, ctx: &Context, key: &str) -> Result<(), LimiterError>;
}
