// Distributed sliding window rate limiter
// Admission state lives in an ordered-set store shared by every instance

//! # Distributed Sliding Window
//!
//! Each key maps to an ordered set of request timestamps (nanoseconds since
//! the Unix epoch). One admission is a single atomic unit on the store:
//!
//! 1. remove members scored at or before `now - window`
//! 2. count what is left
//! 3. if the count is below the limit, insert `now` and admit
//! 4. refresh the key TTL
//!
//! Because the four steps run as one unit, instances in different processes
//! sharing a store never admit more than `limit` requests per window for a key.
//!
//! ## Stores
//!
//! - [`RedisSlidingWindowStore`]: runs the unit as a Lua script on Redis
//!   sorted sets (`ZREMRANGEBYSCORE`, `ZCARD`, `ZADD`, `PEXPIRE`)
//! - [`LocalSlidingWindowStore`]: the same algorithm under one mutex, for
//!   single-node deployments and tests
//!
//! ## Backend failures
//!
//! Store errors are returned to the caller unchanged. The HTTP middleware
//! decides what to do with them (see `RateLimitOptions::fail_open`).

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::{LimiterError, RateLimiter};
use crate::context::Context;

pub const DEFAULT_KEY_PREFIX: &str = "ratelimit:";

const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local member = ARGV[4]
local ttl = tonumber(ARGV[5])

redis.call('ZREMRANGEBYSCORE', key, 0, now - window)
local count = redis.call('ZCARD', key)
local allowed = 0
if count < limit then
    redis.call('ZADD', key, now, member)
    allowed = 1
end
redis.call('PEXPIRE', key, ttl)
return allowed
"#;

/// One admission request against a sliding window
#[derive(Debug, Clone)]
pub struct WindowRequest<'a> {
    pub key: &'a str,
    pub now_ns: i64,
    pub window: Duration,
    pub limit: u64,
    /// Unique member recorded for this request
    pub member: &'a str,
    pub ttl: Duration,
}

/// Ordered-set store able to run a sliding window admission atomically
#[async_trait]
pub trait SlidingWindowStore: Send + Sync {
    async fn acquire(&self, request: WindowRequest<'_>) -> Result<bool, LimiterError>;

    async fn remove(&self, key: &str) -> Result<(), LimiterError>;
}

/// Redis backed store
#[derive(Clone)]
pub struct RedisSlidingWindowStore {
    connection: redis::aio::ConnectionManager,
    script: Arc<redis::Script>,
}

impl RedisSlidingWindowStore {
    pub async fn connect(url: &str) -> Result<Self, LimiterError> {
        let client = redis::Client::open(url)?;
        let connection = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self {
            connection,
            script: Arc::new(redis::Script::new(SLIDING_WINDOW_SCRIPT)),
        })
    }
}

#[async_trait]
impl SlidingWindowStore for RedisSlidingWindowStore {
    async fn acquire(&self, request: WindowRequest<'_>) -> Result<bool, LimiterError> {
        let mut connection = self.connection.clone();
        let allowed: i64 = self
            .script
            .key(request.key)
            .arg(request.now_ns)
            .arg(request.window.as_nanos() as i64)
            .arg(request.limit)
            .arg(request.member)
            .arg(request.ttl.as_millis() as i64)
            .invoke_async(&mut connection)
            .await?;
        Ok(allowed == 1)
    }

    async fn remove(&self, key: &str) -> Result<(), LimiterError> {
        let mut connection = self.connection.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut connection)
            .await?;
        Ok(())
    }
}

#[derive(Debug)]
struct WindowSet {
    members: BTreeSet<(i64, String)>,
    expires_at: Instant,
}

/// In-process store with the same atomicity as the Redis script
#[derive(Debug, Default)]
pub struct LocalSlidingWindowStore {
    sets: Mutex<HashMap<String, WindowSet>>,
}

impl LocalSlidingWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live members under `key`
    pub fn cardinality(&self, key: &str) -> usize {
        let now = Instant::now();
        self.sets
            .lock()
            .get(key)
            .filter(|set| set.expires_at > now)
            .map(|set| set.members.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl SlidingWindowStore for LocalSlidingWindowStore {
    async fn acquire(&self, request: WindowRequest<'_>) -> Result<bool, LimiterError> {
        let now = Instant::now();
        let mut sets = self.sets.lock();

        if sets.get(request.key).map_or(false, |set| set.expires_at <= now) {
            sets.remove(request.key);
        }
        let set = sets
            .entry(request.key.to_string())
            .or_insert_with(|| WindowSet {
                members: BTreeSet::new(),
                expires_at: now + request.ttl,
            });

        let cutoff = request.now_ns.saturating_sub(request.window.as_nanos() as i64);
        set.members.retain(|(score, _)| *score > cutoff);

        let allowed = (set.members.len() as u64) < request.limit;
        if allowed {
            set.members
                .insert((request.now_ns, request.member.to_string()));
        }
        set.expires_at = now + request.ttl;
        Ok(allowed)
    }

    async fn remove(&self, key: &str) -> Result<(), LimiterError> {
        self.sets.lock().remove(key);
        Ok(())
    }
}

/// Sliding window limiter over a shared [`SlidingWindowStore`]
#[derive(Clone)]
pub struct DistributedRateLimiter {
    store: Arc<dyn SlidingWindowStore>,
    limit: u64,
    window: Duration,
    prefix: String,
}

impl DistributedRateLimiter {
    pub fn new(store: Arc<dyn SlidingWindowStore>, limit: u64, window: Duration) -> Self {
        Self {
            store,
            limit,
            window,
            prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn store_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn now_ns() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or_default()
    }
}

#[async_trait]
impl RateLimiter for DistributedRateLimiter {
    async fn allow(&self, ctx: &Context, key: &str) -> Result<bool, LimiterError> {
        ctx.check()?;

        let store_key = self.store_key(key);
        let now_ns = Self::now_ns();
        let member = format!("{}-{}", now_ns, Uuid::new_v4());
        let request = WindowRequest {
            key: &store_key,
            now_ns,
            window: self.window,
            limit: self.limit,
            member: &member,
            ttl: self.window * 2,
        };

        let allowed = tokio::select! {
            biased;
            reason = ctx.done() => return Err(LimiterError::Canceled(reason)),
            result = self.store.acquire(request) => result?,
        };
        debug!(key = %store_key, allowed, "sliding window decision");
        Ok(allowed)
    }

    async fn reset(&self, ctx: &Context, key: &str) -> Result<(), LimiterError> {
        ctx.check()?;
        let store_key = self.store_key(key);
        tokio::select! {
            biased;
            reason = ctx.done() => Err(LimiterError::Canceled(reason)),
            result = self.store.remove(&store_key) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(store: Arc<dyn SlidingWindowStore>, limit: u64, window: Duration) -> DistributedRateLimiter {
        DistributedRateLimiter::new(store, limit, window)
    }

    #[tokio::test]
    async fn test_three_instances_share_one_budget() {
        let store: Arc<dyn SlidingWindowStore> = Arc::new(LocalSlidingWindowStore::new());
        let instances: Vec<_> = (0..3)
            .map(|_| Arc::new(limiter(store.clone(), 100, Duration::from_secs(60))))
            .collect();

        let mut handles = Vec::new();
        for instance in &instances {
            for _ in 0..50 {
                let instance = instance.clone();
                handles.push(tokio::spawn(async move {
                    instance
                        .allow(&Context::background(), "shared-client")
                        .await
                        .unwrap()
                }));
            }
        }

        let mut admits = 0;
        let mut denials = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admits += 1;
            } else {
                denials += 1;
            }
        }
        assert_eq!(admits, 100);
        assert_eq!(denials, 50);
    }

    #[tokio::test]
    async fn test_window_slides() {
        let store = Arc::new(LocalSlidingWindowStore::new());
        let limiter = limiter(store.clone(), 2, Duration::from_millis(50));
        let ctx = Context::background();

        assert!(limiter.allow(&ctx, "k").await.unwrap());
        assert!(limiter.allow(&ctx, "k").await.unwrap());
        assert!(!limiter.allow(&ctx, "k").await.unwrap());
        assert_eq!(store.cardinality("ratelimit:k"), 2);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(limiter.allow(&ctx, "k").await.unwrap());
    }

    #[tokio::test]
    async fn test_reset_and_prefix() {
        let store = Arc::new(LocalSlidingWindowStore::new());
        let limiter = limiter(store.clone(), 1, Duration::from_secs(60)).with_prefix("rl:");
        let ctx = Context::background();

        assert!(limiter.allow(&ctx, "k").await.unwrap());
        assert_eq!(store.cardinality("rl:k"), 1);
        limiter.reset(&ctx, "k").await.unwrap();
        assert_eq!(store.cardinality("rl:k"), 0);
        assert!(limiter.allow(&ctx, "k").await.unwrap());
    }

    #[tokio::test]
    async fn test_canceled_context_skips_store() {
        let store = Arc::new(LocalSlidingWindowStore::new());
        let limiter = limiter(store.clone(), 1, Duration::from_secs(60));
        let ctx = Context::background();
        ctx.cancel();

        assert!(matches!(
            limiter.allow(&ctx, "k").await,
            Err(LimiterError::Canceled(_))
        ));
        assert_eq!(store.cardinality("ratelimit:k"), 0);
    }

    // Needs a live server: REDIS_URL=redis://127.0.0.1/ cargo test -- --ignored
    #[tokio::test]
    #[ignore]
    async fn test_redis_store_shares_one_budget() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
        let store: Arc<dyn SlidingWindowStore> = Arc::new(RedisSlidingWindowStore::connect(&url).await.unwrap());
        let window = Duration::from_secs(60);
        let client_key = format!("redis-test-{}", Uuid::new_v4());

        let instances: Vec<_> = (0..3)
            .map(|_| Arc::new(limiter(store.clone(), 100, window)))
            .collect();
        let mut handles = Vec::new();
        for instance in &instances {
            for _ in 0..50 {
                let instance = instance.clone();
                let client_key = client_key.clone();
                handles.push(tokio::spawn(async move {
                    instance.allow(&Context::background(), &client_key).await.unwrap()
                }));
            }
        }

        let mut admits = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admits += 1;
            }
        }
        assert_eq!(admits, 100);

        let store_key = format!("{}{}", DEFAULT_KEY_PREFIX, client_key);
        let mut connection = redis::Client::open(url.as_str())
            .unwrap()
            .get_multiplexed_async_connection()
            .await
            .unwrap();
        let members: i64 = redis::cmd("ZCARD")
            .arg(&store_key)
            .query_async(&mut connection)
            .await
            .unwrap();
        assert_eq!(members, 100);
        let pttl: i64 = redis::cmd("PTTL")
            .arg(&store_key)
            .query_async(&mut connection)
            .await
            .unwrap();
        assert!(pttl > 0 && pttl <= (window * 2).as_millis() as i64);

        instances[0].reset(&Context::background(), &client_key).await.unwrap();
        let exists: i64 = redis::cmd("EXISTS")
            .arg(&store_key)
            .query_async(&mut connection)
            .await
            .unwrap();
        assert_eq!(exists, 0);
        assert!(instances[1].allow(&Context::background(), &client_key).await.unwrap());
        instances[1].reset(&Context::background(), &client_key).await.unwrap();
    }

    struct BrokenStore;

    #[async_trait]
    impl SlidingWindowStore for BrokenStore {
        async fn acquire(&self, _request: WindowRequest<'_>) -> Result<bool, LimiterError> {
            Err(LimiterError::Backend("connection refused".into()))
        }

        async fn remove(&self, _key: &str) -> Result<(), LimiterError> {
            Err(LimiterError::Backend("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_backend_error_is_returned() {
        let limiter = limiter(Arc::new(BrokenStore), 1, Duration::from_secs(1));
        let err = limiter.allow(&Context::background(), "k").await.unwrap_err();
        assert!(matches!(err, LimiterError::Backend(_)));
    }
}
