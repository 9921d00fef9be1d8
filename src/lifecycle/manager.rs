// Dependency-ordered startup and reverse-ordered shutdown for registered components
use futures::stream::{FuturesUnordered, StreamExt};
use lazy_static::lazy_static;
use parking_lot::RwLock;
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{HealthStatus, Lifecycle, LifecycleState};
use crate::config::LifecycleSettings;
use crate::context::Context;
use crate::error::{AgentError, ErrorCode};
use crate::runnable::panic::safe_invoke;

const COMPONENT: &str = "lifecycle_manager";

lazy_static! {
    static ref GLOBAL_MANAGER: LifecycleManager = LifecycleManager::default();
}

struct ComponentEntry {
    component: Arc<dyn Lifecycle>,
    priority: i32,
    state: LifecycleState,
    config: Option<Value>,
    dependencies: Vec<String>,
}

#[derive(Clone, Copy)]
enum Phase {
    Init,
    Start,
    Stop,
}

impl Phase {
    fn operation(self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Start => "start",
            Phase::Stop => "stop",
        }
    }

    /// State a component must be in for this phase to touch it
    fn from_state(self) -> LifecycleState {
        match self {
            Phase::Init => LifecycleState::Uninitialized,
            Phase::Start => LifecycleState::Initialized,
            Phase::Stop => LifecycleState::Running,
        }
    }

    fn transient_state(self) -> Option<LifecycleState> {
        match self {
            Phase::Init => None,
            Phase::Start => Some(LifecycleState::Starting),
            Phase::Stop => Some(LifecycleState::Stopping),
        }
    }

    fn done_state(self) -> LifecycleState {
        match self {
            Phase::Init => LifecycleState::Initialized,
            Phase::Start => LifecycleState::Running,
            Phase::Stop => LifecycleState::Stopped,
        }
    }

    fn failure(self) -> (ErrorCode, &'static str) {
        match self {
            Phase::Init => (ErrorCode::AgentConfig, "component initialization failed"),
            Phase::Start => (ErrorCode::AgentExecution, "component start failed"),
            Phase::Stop => (ErrorCode::AgentExecution, "component stop failed"),
        }
    }
}

/// Registry and driver for [`Lifecycle`] components.
///
/// Start order is a topological sort of the dependency graph with ties
/// broken by ascending `(priority, name)`. Stop order is the exact reverse.
/// A dependency on a name that is not registered is ignored.
pub struct LifecycleManager {
    components: RwLock<HashMap<String, ComponentEntry>>,
    settings: LifecycleSettings,
    shutdown: CancellationToken,
    done: CancellationToken,
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new(LifecycleSettings::default())
    }
}

impl LifecycleManager {
    pub fn new(settings: LifecycleSettings) -> Self {
        Self {
            components: RwLock::new(HashMap::new()),
            settings,
            shutdown: CancellationToken::new(),
            done: CancellationToken::new(),
        }
    }

    /// Process-wide manager created on first use
    pub fn global() -> &'static LifecycleManager {
        &GLOBAL_MANAGER
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    pub fn register(&self, name: impl Into<String>, component: Arc<dyn Lifecycle>, priority: i32) -> Result<(), AgentError> {
        self.insert(name.into(), component, priority, None, Vec::new())
    }

    pub fn register_with_config(
        &self,
        name: impl Into<String>,
        component: Arc<dyn Lifecycle>,
        priority: i32,
        config: Value,
    ) -> Result<(), AgentError> {
        self.insert(name.into(), component, priority, Some(config), Vec::new())
    }

    /// Register with dependencies in addition to those the component declares
    pub fn register_with_dependencies<I, S>(
        &self,
        name: impl Into<String>,
        component: Arc<dyn Lifecycle>,
        priority: i32,
        dependencies: I,
    ) -> Result<(), AgentError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let dependencies = dependencies.into_iter().map(Into::into).collect();
        self.insert(name.into(), component, priority, None, dependencies)
    }

    fn insert(
        &self,
        name: String,
        component: Arc<dyn Lifecycle>,
        priority: i32,
        config: Option<Value>,
        mut dependencies: Vec<String>,
    ) -> Result<(), AgentError> {
        for declared in component.dependencies() {
            if !dependencies.contains(&declared) {
                dependencies.push(declared);
            }
        }

        let mut components = self.components.write();
        if components.contains_key(&name) {
            return Err(AgentError::already_exists(format!("component {}", name))
                .with_component(COMPONENT)
                .with_operation("register")
                .with_context("name", name));
        }

        debug!(component = %name, priority, ?dependencies, "component registered");
        components.insert(
            name,
            ComponentEntry {
                component,
                priority,
                state: LifecycleState::Uninitialized,
                config,
                dependencies,
            },
        );
        Ok(())
    }

    /// Remove a component that is not running
    pub fn unregister(&self, name: &str) -> Result<(), AgentError> {
        let mut components = self.components.write();
        let state = match components.get(name) {
            Some(entry) => entry.state,
            None => return Err(not_found(name, "unregister")),
        };

        if state == LifecycleState::Running {
            return Err(AgentError::new(ErrorCode::AgentExecution, "cannot unregister running component")
                .with_component(COMPONENT)
                .with_operation("unregister")
                .with_context("name", name)
                .with_context("state", state.to_string()));
        }

        components.remove(name);
        Ok(())
    }

    pub fn state_of(&self, name: &str) -> Result<LifecycleState, AgentError> {
        self.components
            .read()
            .get(name)
            .map(|entry| entry.state)
            .ok_or_else(|| not_found(name, "get_state"))
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.components.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Effective start order: dependencies first, then ascending `(priority, name)`
    pub fn start_order(&self) -> Result<Vec<String>, AgentError> {
        let components = self.components.read();

        let mut in_degree: HashMap<&str, usize> = HashMap::with_capacity(components.len());
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for (name, entry) in components.iter() {
            let mut degree = 0;
            for dependency in entry.dependencies.iter().collect::<BTreeSet<_>>() {
                if components.contains_key(dependency.as_str()) {
                    degree += 1;
                    dependents.entry(dependency.as_str()).or_default().push(name.as_str());
                } else {
                    debug!(component = %name, dependency = %dependency, "ignoring unregistered dependency");
                }
            }
            in_degree.insert(name.as_str(), degree);
        }

        let mut ready: BinaryHeap<Reverse<(i32, &str)>> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| Reverse((components[*name].priority, *name)))
            .collect();

        let mut order = Vec::with_capacity(components.len());
        while let Some(Reverse((_, name))) = ready.pop() {
            order.push(name.to_string());
            for dependent in dependents.get(name).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse((components[*dependent].priority, *dependent)));
                    }
                }
            }
        }

        if order.len() != components.len() {
            let mut cyclic: Vec<&str> = in_degree
                .iter()
                .filter(|(_, degree)| **degree > 0)
                .map(|(name, _)| *name)
                .collect();
            cyclic.sort_unstable();
            return Err(AgentError::new(ErrorCode::DependencyCycle, "circular dependency detected")
                .with_component(COMPONENT)
                .with_operation("resolve_dependencies")
                .with_context("components", cyclic));
        }
        Ok(order)
    }

    /// Initialize every uninitialized component in start order
    pub async fn init_all(&self, ctx: &Context) -> Result<(), AgentError> {
        let order = self.start_order()?;
        self.run_phase(ctx, Phase::Init, order, self.settings.init_timeout()).await
    }

    /// Start every initialized component in start order.
    ///
    /// A dependency cycle is reported before anything starts.
    pub async fn start_all(&self, ctx: &Context) -> Result<(), AgentError> {
        let order = self.start_order()?;
        self.run_phase(ctx, Phase::Start, order, self.settings.start_timeout()).await
    }

    /// Stop running components in reverse start order, then mark the manager done.
    ///
    /// Every running component gets a stop attempt; the last failure is returned.
    pub async fn stop_all(&self, ctx: &Context) -> Result<(), AgentError> {
        let mut order = self.start_order().unwrap_or_else(|err| {
            warn!(error = %err, "stopping by priority, dependency order unavailable");
            self.priority_order()
        });
        order.reverse();

        let mut last_error = None;
        for name in order {
            if let Err(err) = self.run_one(ctx, Phase::Stop, &name, self.settings.stop_timeout()).await {
                warn!(component = %name, error = %err, "component failed to stop");
                last_error = Some(err);
            }
        }

        self.done.cancel();
        info!("all components stopped");
        last_error.map_or(Ok(()), Err)
    }

    fn priority_order(&self) -> Vec<String> {
        let components = self.components.read();
        let mut entries: Vec<(i32, &str)> = components
            .iter()
            .map(|(name, entry)| (entry.priority, name.as_str()))
            .collect();
        entries.sort_unstable();
        entries.into_iter().map(|(_, name)| name.to_string()).collect()
    }

    async fn run_phase(&self, ctx: &Context, phase: Phase, order: Vec<String>, timeout: Duration) -> Result<(), AgentError> {
        for name in order {
            ctx.check()?;
            if let Err(err) = self.run_one(ctx, phase, &name, timeout).await {
                if !self.settings.continue_on_error {
                    return Err(err);
                }
                warn!(component = %name, phase = phase.operation(), error = %err, "continuing after component failure");
            }
        }
        Ok(())
    }

    /// Drive one component through `phase` if it is in the matching state
    async fn run_one(&self, ctx: &Context, phase: Phase, name: &str, timeout: Duration) -> Result<(), AgentError> {
        let (component, config) = {
            let mut components = self.components.write();
            let entry = match components.get_mut(name) {
                Some(entry) if entry.state == phase.from_state() => entry,
                _ => return Ok(()),
            };
            if let Some(state) = phase.transient_state() {
                entry.state = state;
            }
            (entry.component.clone(), entry.config.clone())
        };

        let step_ctx = ctx.with_timeout(timeout);
        let outcome = match phase {
            Phase::Init => safe_invoke(&step_ctx, name, "init", component.init(&step_ctx, config.as_ref())).await,
            Phase::Start => safe_invoke(&step_ctx, name, "start", component.start(&step_ctx)).await,
            Phase::Stop => safe_invoke(&step_ctx, name, "stop", component.stop(&step_ctx)).await,
        };
        step_ctx.cancel();

        let state = match &outcome {
            Ok(()) => phase.done_state(),
            Err(_) => LifecycleState::Failed,
        };
        if let Some(entry) = self.components.write().get_mut(name) {
            entry.state = state;
        }
        info!(component = %name, %state, "component {}", phase.operation());

        outcome.map_err(|err| {
            let (code, message) = phase.failure();
            AgentError::wrap(err, code, message)
                .with_component(COMPONENT)
                .with_operation(phase.operation())
                .with_context("name", name)
        })
    }

    /// Check every component concurrently; a panicking check reports unhealthy.
    ///
    /// When `ctx` ends first the outstanding checks are aborted and reported
    /// unhealthy, next to the statuses already collected.
    pub async fn health_check_all(&self, ctx: &Context) -> HashMap<String, HealthStatus> {
        let components: Vec<(String, Arc<dyn Lifecycle>)> = self
            .components
            .read()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.component.clone()))
            .collect();

        let mut report = HashMap::with_capacity(components.len());
        let mut outstanding = HashMap::with_capacity(components.len());
        let mut pending: FuturesUnordered<_> = components
            .into_iter()
            .map(|(name, component)| {
                let ctx = ctx.clone();
                let handle = tokio::spawn({
                    let name = name.clone();
                    async move {
                        let checked = safe_invoke(&ctx, &name, "health_check", async {
                            Ok(component.health_check(&ctx).await)
                        })
                        .await;
                        match checked {
                            Ok(status) => status,
                            Err(err) => panicked_status(&err),
                        }
                    }
                });
                outstanding.insert(name.clone(), handle.abort_handle());
                async move {
                    let status = match handle.await {
                        Ok(status) => status,
                        Err(join_err) => HealthStatus::unhealthy(format!("health check aborted: {}", join_err)),
                    };
                    (name, status)
                }
            })
            .collect();

        loop {
            tokio::select! {
                biased;
                next = pending.next() => match next {
                    Some((name, status)) => {
                        outstanding.remove(&name);
                        report.insert(name, status);
                    }
                    None => break,
                },
                reason = ctx.done() => {
                    for (name, abort) in outstanding.drain() {
                        abort.abort();
                        warn!(component = %name, error = %reason, "health check canceled");
                        report.insert(name, HealthStatus::unhealthy(format!("health check canceled: {}", reason)));
                    }
                    break;
                }
            }
        }

        for (name, status) in report.iter_mut() {
            status.component_name.clone_from(name);
        }
        report
    }

    /// Ask the process to shut down; idempotent
    pub fn signal_shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("shutdown signalled");
        }
        self.shutdown.cancel();
    }

    /// Token cancelled by [`signal_shutdown`](Self::signal_shutdown)
    pub fn shutdown_signal(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Wait until `stop_all` has completed or `ctx` ends
    pub async fn wait_for_shutdown(&self, ctx: &Context) -> Result<(), AgentError> {
        tokio::select! {
            _ = self.done.cancelled() => Ok(()),
            reason = ctx.done() => Err(AgentError::from(reason).with_component(COMPONENT).with_operation("wait_for_shutdown")),
        }
    }
}

fn not_found(name: &str, operation: &str) -> AgentError {
    AgentError::not_found(format!("component {}", name))
        .with_component(COMPONENT)
        .with_operation(operation)
        .with_context("name", name)
}

fn panicked_status(err: &AgentError) -> HealthStatus {
    let mut status = HealthStatus::unhealthy(format!("health check panicked: {}", err.message));
    for key in ["panic_value", "stack_trace"] {
        if let Some(value) = err.context_value(key) {
            status.details.insert(key.to_string(), value.clone());
        }
    }
    status
}

impl fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let states: Vec<(String, LifecycleState)> = self
            .components
            .read()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.state))
            .collect();
        f.debug_struct("LifecycleManager")
            .field("components", &states)
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish()
    }
}
