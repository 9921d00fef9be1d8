// Resilience primitives independent of HTTP
// The middleware module adapts these to axum

pub mod breaker;
pub mod client_ip;
pub mod limiter;

pub use breaker::{BreakerPolicy, BreakerState, CallError, CircuitBreaker, Permit, Rejection};
pub use client_ip::{strip_port, ClientIdentity, ProxyRule};
pub use limiter::{
    DistributedRateLimiter, LimiterError, LocalSlidingWindowStore, MemoryRateLimiter, RateLimiter,
    RedisSlidingWindowStore, SlidingWindowStore,
};

#[cfg(test)]
mod breaker_tests;
