// Process-local fixed window rate limiter

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{LimiterError, RateLimiter};
use crate::context::Context;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    count: u64,
    window_start: Instant,
}

/// Fixed window counter per key.
///
/// Buckets live in a [`DashMap`], so decisions for one key are serialized by
/// its shard lock. A sweeper task removes buckets whose window has expired;
/// it is started on construction when a tokio runtime is available and runs
/// until [`MemoryRateLimiter::stop`] or drop.
#[derive(Debug)]
pub struct MemoryRateLimiter {
    limit: u64,
    window: Duration,
    buckets: Arc<DashMap<String, Bucket>>,
    shutdown: CancellationToken,
}

impl MemoryRateLimiter {
    pub fn new(limit: u64, window: Duration) -> Self {
        let limiter = Self {
            limit,
            window,
            buckets: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
        };
        limiter.spawn_sweeper();
        limiter
    }

    fn spawn_sweeper(&self) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("no tokio runtime, in-memory rate limiter sweeper not started");
                return;
            }
        };

        let buckets = self.buckets.clone();
        let shutdown = self.shutdown.clone();
        let window = self.window;
        handle.spawn(async move {
            let mut ticker = tokio::time::interval(window);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let now = Instant::now();
                        let before = buckets.len();
                        buckets.retain(|_, bucket| now.saturating_duration_since(bucket.window_start) < window);
                        let removed = before.saturating_sub(buckets.len());
                        if removed > 0 {
                            debug!(removed, "swept expired rate limit buckets");
                        }
                    }
                }
            }
            debug!("rate limiter sweeper stopped");
        });
    }

    /// Stop the sweeper. Safe to call more than once.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    fn admit(&self, key: &str, now: Instant) -> bool {
        let mut bucket = self.buckets.entry(key.to_string()).or_insert(Bucket {
            count: 0,
            window_start: now,
        });

        if bucket.count == 0 || now.saturating_duration_since(bucket.window_start) >= self.window {
            bucket.count = 1;
            bucket.window_start = now;
            true
        } else if bucket.count < self.limit {
            bucket.count += 1;
            true
        } else {
            false
        }
    }
}

impl Drop for MemoryRateLimiter {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn allow(&self, ctx: &Context, key: &str) -> Result<bool, LimiterError> {
        ctx.check()?;
        Ok(self.admit(key, Instant::now()))
    }

    async fn reset(&self, ctx: &Context, key: &str) -> Result<(), LimiterError> {
        ctx.check()?;
        self.buckets.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextError;

    #[tokio::test(start_paused = true)]
    async fn test_fixed_window_admission() {
        let limiter = MemoryRateLimiter::new(3, Duration::from_secs(1));
        let ctx = Context::background();

        for _ in 0..3 {
            assert!(limiter.allow(&ctx, "client").await.unwrap());
        }
        assert!(!limiter.allow(&ctx, "client").await.unwrap());
        assert!(limiter.allow(&ctx, "other").await.unwrap());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.allow(&ctx, "client").await.unwrap());
    }

    #[tokio::test]
    async fn test_reset_clears_key() {
        let limiter = MemoryRateLimiter::new(1, Duration::from_secs(60));
        let ctx = Context::background();

        assert!(limiter.allow(&ctx, "k").await.unwrap());
        assert!(!limiter.allow(&ctx, "k").await.unwrap());
        limiter.reset(&ctx, "k").await.unwrap();
        assert!(limiter.allow(&ctx, "k").await.unwrap());
    }

    #[tokio::test]
    async fn test_canceled_context() {
        let limiter = MemoryRateLimiter::new(10, Duration::from_secs(60));
        let ctx = Context::background();
        ctx.cancel();

        let err = limiter.allow(&ctx, "k").await.unwrap_err();
        assert!(matches!(err, LimiterError::Canceled(ContextError::Canceled)));
        assert!(limiter.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_removes_expired_buckets() {
        let limiter = MemoryRateLimiter::new(10, Duration::from_millis(100));
        let ctx = Context::background();
        limiter.allow(&ctx, "a").await.unwrap();
        limiter.allow(&ctx, "b").await.unwrap();
        assert_eq!(limiter.len(), 2);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(limiter.is_empty());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let limiter = MemoryRateLimiter::new(1, Duration::from_secs(1));
        limiter.stop();
        limiter.stop();
        assert!(limiter.is_stopped());

        // admission keeps working without the sweeper
        assert!(limiter.allow(&Context::background(), "k").await.unwrap());
    }
}
