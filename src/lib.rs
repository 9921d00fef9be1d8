// Bulwark - resilience middleware and a composable execution framework
// Circuit breaking, rate limiting, timeouts and panic isolation for axum services,
// plus Runnables, Agents, Chains and lifecycle management

//! # Bulwark
//!
//! This is the library root. It declares the modules and re-exports the types
//! most applications need.
//!
//! ## Core Components
//!
//! ### HTTP resilience ([`middleware`], [`resilience`])
//! An axum middleware stack applied in a fixed order:
//! body limit → recovery → timeout → rate limit → circuit breaker → handler.
//!
//! - [`CircuitBreaker`]: three-state breaker with probe admission
//! - [`RateLimiter`]: fixed window in memory, sliding window over Redis
//! - [`ClientIdentity`]: trusted-proxy aware client addressing
//! - [`ResilienceStack`]: builds and installs the layers from [`Settings`]
//!
//! ### Execution framework ([`runnable`], [`agent`], [`chain`])
//! A generic [`Runnable`] with invoke, stream and batch. Every call into user
//! code goes through a panic shim that turns unwinding into an [`AgentError`]
//! with code `internal` and a captured stack trace.
//!
//! - [`RunnableFunc`], [`RunnablePipe`], [`RunnableSequence`]: composition
//! - [`Generator`]: pull-based lazy sequences with early termination
//! - [`Agent`], [`ChainableAgent`]: named runnables over [`AgentInput`]
//! - [`BaseChain`]: ordered steps with skip/only/stop-on-error options
//! - [`PluginRegistry`]: dynamic boundary with typed adapters
//!
//! ### Lifecycle ([`lifecycle`])
//! [`LifecycleManager`] starts components in dependency order (ties by
//! priority), stops them in exact reverse, and aggregates health concurrently.
//!
//! ## Error Types
//!
//! - [`BulwarkError`]: configuration and setup failures for the crate
//! - [`AgentError`]: structured errors of the execution framework
//! - [`ContextError`]: cancellation and deadline expiry
//!
//! ## Rust Learning Notes:
//!
//! ### Re-exports
//! `pub use` lets users write `bulwark::CircuitBreaker` instead of
//! `bulwark::resilience::breaker::CircuitBreaker`. The module paths stay
//! available for less common items.
//!
//! ### Error enums with thiserror
//! `#[derive(thiserror::Error)]` writes the `Display` and `Error` impls.
//! `#[from]` adds `From` conversions so `?` converts lower-level errors.

pub mod agent;
pub mod chain;
pub mod config;
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod middleware;
pub mod resilience;
pub mod runnable;

pub use agent::{Agent, AgentInput, AgentOutput, AgentStatus, BaseAgent, ChainableAgent};
pub use chain::{BaseChain, Chain, ChainInput, ChainOptions, ChainOutput, ChainStatus, Step};
pub use config::Settings;
pub use context::{Context, ContextError};
pub use error::{AgentError, ErrorCode};
pub use lifecycle::{HealthState, HealthStatus, Lifecycle, LifecycleManager, LifecycleState};
pub use middleware::{ErrorEnvelope, PathMatcher, ResilienceStack};
pub use resilience::{
    BreakerPolicy, BreakerState, CircuitBreaker, ClientIdentity, DistributedRateLimiter,
    LimiterError, MemoryRateLimiter, RateLimiter,
};
pub use runnable::generator::Generator;
pub use runnable::plugin::{DynamicRunnable, DynamicValue, PluginRegistry};
pub use runnable::{
    Callback, Runnable, RunnableConfig, RunnableExt, RunnableFunc, RunnablePipe,
    RunnableSequence, StreamChunk,
};

/// Crate-level error for configuration and setup
#[derive(Debug, thiserror::Error)]
pub enum BulwarkError {
    #[error("Invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error("Rate limiter error: {0}")]
    Limiter(#[from] LimiterError),

    #[error("Execution error: {0}")]
    Agent(#[from] AgentError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BulwarkError>;
