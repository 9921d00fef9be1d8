// Component lifecycle: init, start, stop and health
// The Lifecycle trait plus the state and health vocabulary shared with the manager

//! # Lifecycle
//!
//! Long-lived components (stores, servers, background workers) implement
//! [`Lifecycle`] and are registered with a [`LifecycleManager`], which drives
//! them through
//!
//! ```text
//! Uninitialized → Initialized → Starting → Running → Stopping → Stopped
//! ```
//!
//! with any step able to land in `Failed`.
//!
//! ## Rust Learning Notes:
//!
//! ### Default trait methods
//! Every method of [`Lifecycle`] has a default, so a component only writes
//! the phases it cares about. [`FunctionalLifecycle`] goes one step further
//! and builds a component from closures.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::context::Context;
use crate::error::AgentError;

pub mod manager;

pub use manager::LifecycleManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Uninitialized,
    Initialized,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Initialized => "initialized",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub state: HealthState,
    pub message: String,
    pub details: HashMap<String, Value>,
    pub last_checked: DateTime<Utc>,
    pub component_name: String,
}

impl HealthStatus {
    fn with_state(state: HealthState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
            details: HashMap::new(),
            last_checked: Utc::now(),
            component_name: String::new(),
        }
    }

    pub fn healthy() -> Self {
        Self::with_state(HealthState::Healthy, "")
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with_state(HealthState::Degraded, message)
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with_state(HealthState::Unhealthy, message)
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.state == HealthState::Healthy
    }
}

/// A component managed by [`LifecycleManager`]
#[async_trait]
pub trait Lifecycle: Send + Sync {
    async fn init(&self, _ctx: &Context, _config: Option<&Value>) -> Result<(), AgentError> {
        Ok(())
    }

    async fn start(&self, _ctx: &Context) -> Result<(), AgentError> {
        Ok(())
    }

    async fn stop(&self, _ctx: &Context) -> Result<(), AgentError> {
        Ok(())
    }

    async fn health_check(&self, _ctx: &Context) -> HealthStatus {
        HealthStatus::healthy()
    }

    /// Names of components that must start before this one
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }
}

type InitFn = Arc<dyn Fn(Context, Option<Value>) -> BoxFuture<'static, Result<(), AgentError>> + Send + Sync>;
type PhaseFn = Arc<dyn Fn(Context) -> BoxFuture<'static, Result<(), AgentError>> + Send + Sync>;
type HealthFn = Arc<dyn Fn(Context) -> BoxFuture<'static, HealthStatus> + Send + Sync>;

/// A [`Lifecycle`] assembled from closures; missing phases succeed
#[derive(Clone, Default)]
pub struct FunctionalLifecycle {
    name: String,
    init: Option<InitFn>,
    start: Option<PhaseFn>,
    stop: Option<PhaseFn>,
    health: Option<HealthFn>,
    dependencies: Vec<String>,
}

impl FunctionalLifecycle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn on_init<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Context, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), AgentError>> + Send + 'static,
    {
        self.init = Some(Arc::new(move |ctx, config| Box::pin(f(ctx, config))));
        self
    }

    pub fn on_start<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), AgentError>> + Send + 'static,
    {
        self.start = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
        self
    }

    pub fn on_stop<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), AgentError>> + Send + 'static,
    {
        self.stop = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
        self
    }

    pub fn on_health<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HealthStatus> + Send + 'static,
    {
        self.health = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
        self
    }

    pub fn depends_on<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = names.into_iter().map(Into::into).collect();
        self
    }
}

impl fmt::Debug for FunctionalLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionalLifecycle")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

#[async_trait]
impl Lifecycle for FunctionalLifecycle {
    async fn init(&self, ctx: &Context, config: Option<&Value>) -> Result<(), AgentError> {
        match &self.init {
            Some(init) => init(ctx.clone(), config.cloned()).await,
            None => Ok(()),
        }
    }

    async fn start(&self, ctx: &Context) -> Result<(), AgentError> {
        match &self.start {
            Some(start) => start(ctx.clone()).await,
            None => Ok(()),
        }
    }

    async fn stop(&self, ctx: &Context) -> Result<(), AgentError> {
        match &self.stop {
            Some(stop) => stop(ctx.clone()).await,
            None => Ok(()),
        }
    }

    async fn health_check(&self, ctx: &Context) -> HealthStatus {
        match &self.health {
            Some(health) => health(ctx.clone()).await,
            None => HealthStatus::healthy(),
        }
    }

    fn dependencies(&self) -> Vec<String> {
        self.dependencies.clone()
    }
}

#[cfg(test)]
mod tests;
