// Agents: named runnables over AgentInput
// BaseAgent wraps a handler, ChainableAgent runs agents in order with pooled inputs

//! # Agents
//!
//! An [`Agent`] is a [`Runnable`] from `Arc<AgentInput>` to [`AgentOutput`]
//! with a name, a description and a list of capabilities.
//!
//! - [`BaseAgent`] runs a handler closure under the panic shim and fires the
//!   configured callbacks. Without a handler it answers `not_implemented`.
//! - [`ChainableAgent`] runs a list of agents in order. Between two agents it
//!   takes an [`AgentInput`] from a pool, copies the task fields forward and
//!   fills its context from the previous output's metadata.
//! - [`AgentExecutor`] adds a timeout and retries around any agent.
//!
//! ## Rust Learning Notes:
//!
//! ### Shared input with interior mutability
//! Agents receive `Arc<AgentInput>`, so one input can be read by several
//! tasks. The context map sits behind a `parking_lot::RwLock`, which is what
//! lets `set_context(&self, ..)` work through a shared reference.
//!
//! ### Getting a pooled value back out of an Arc
//! `Arc::try_unwrap` returns the inner value only when no other clone is
//! alive. `ChainableAgent` uses it to return inputs to the pool; an input an
//! agent decided to keep simply is not recycled.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::context::Context;
use crate::error::{AgentError, ErrorCode};
use crate::runnable::callback::{notify_end, notify_error, notify_start};
use crate::runnable::panic::safe_invoke;
use crate::runnable::{Configurable, Runnable, RunnableConfig};

pub mod pool;

pub use pool::{ObjectPool, Poolable};

/// Context maps larger than this are reallocated instead of cleared
pub const MAX_CONTEXT_MAP_SIZE: usize = 1000;

const INPUT_POOL_CAPACITY: usize = 64;

pub trait Agent: Runnable<Arc<AgentInput>, AgentOutput> {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn capabilities(&self) -> &[String];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentOptions {
    pub temperature: f64,
    pub max_tokens: u32,
    pub model: String,
    pub enable_tools: bool,
    pub allowed_tools: Vec<String>,
    pub max_tool_calls: u32,
    pub enable_memory: bool,
    pub load_history: bool,
    pub save_to_memory: bool,
    pub max_history_length: u32,
    pub timeout_ms: u64,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 2000,
            model: String::new(),
            enable_tools: true,
            allowed_tools: Vec::new(),
            max_tool_calls: 5,
            enable_memory: false,
            load_history: false,
            save_to_memory: false,
            max_history_length: 10,
            timeout_ms: 60_000,
        }
    }
}

/// Input handed to an agent
#[derive(Serialize, Deserialize)]
pub struct AgentInput {
    pub task: String,
    pub instruction: String,
    #[serde(serialize_with = "serialize_locked", deserialize_with = "deserialize_locked")]
    context: RwLock<HashMap<String, Value>>,
    pub options: AgentOptions,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
}

fn serialize_locked<S: Serializer>(map: &RwLock<HashMap<String, Value>>, serializer: S) -> Result<S::Ok, S::Error> {
    map.read().serialize(serializer)
}

fn deserialize_locked<'de, D: Deserializer<'de>>(deserializer: D) -> Result<RwLock<HashMap<String, Value>>, D::Error> {
    HashMap::deserialize(deserializer).map(RwLock::new)
}

impl Default for AgentInput {
    fn default() -> Self {
        Self {
            task: String::new(),
            instruction: String::new(),
            context: RwLock::new(HashMap::new()),
            options: AgentOptions::default(),
            session_id: String::new(),
            timestamp: Utc::now(),
        }
    }
}

impl AgentInput {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Self::default()
        }
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_options(mut self, options: AgentOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_context(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.write().insert(key.into(), value.into());
        self
    }

    pub fn get_context(&self, key: &str) -> Option<Value> {
        self.context.read().get(key).cloned()
    }

    pub fn set_context(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.context.write().insert(key.into(), value.into());
    }

    pub fn delete_context(&self, key: &str) -> Option<Value> {
        self.context.write().remove(key)
    }

    /// Visit entries until `f` returns false
    pub fn range_context<F>(&self, mut f: F)
    where
        F: FnMut(&str, &Value) -> bool,
    {
        for (key, value) in self.context.read().iter() {
            if !f(key, value) {
                break;
            }
        }
    }

    pub fn copy_context(&self, dst: &mut HashMap<String, Value>) {
        dst.extend(
            self.context
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
    }

    pub fn context_len(&self) -> usize {
        self.context.read().len()
    }

    /// Hold the read lock across several lookups
    pub fn read_context(&self) -> RwLockReadGuard<'_, HashMap<String, Value>> {
        self.context.read()
    }

    /// Hold the write lock across several updates
    pub fn write_context(&self) -> RwLockWriteGuard<'_, HashMap<String, Value>> {
        self.context.write()
    }

    /// Lock-free access when the input is exclusively owned
    pub fn context_mut(&mut self) -> &mut HashMap<String, Value> {
        self.context.get_mut()
    }

    /// Deep copy, including the context map
    pub fn clone_input(&self) -> Self {
        Self {
            task: self.task.clone(),
            instruction: self.instruction.clone(),
            context: RwLock::new(self.context.read().clone()),
            options: self.options.clone(),
            session_id: self.session_id.clone(),
            timestamp: self.timestamp,
        }
    }
}

impl Clone for AgentInput {
    fn clone(&self) -> Self {
        self.clone_input()
    }
}

impl fmt::Debug for AgentInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentInput")
            .field("task", &self.task)
            .field("instruction", &self.instruction)
            .field("context", &*self.context.read())
            .field("options", &self.options)
            .field("session_id", &self.session_id)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

impl Poolable for AgentInput {
    fn reset(&mut self) {
        self.task.clear();
        self.instruction.clear();
        self.session_id.clear();
        self.options = AgentOptions::default();
        let context = self.context.get_mut();
        if context.len() > MAX_CONTEXT_MAP_SIZE {
            *context = HashMap::new();
        } else {
            context.clear();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Success,
    Failed,
    Partial,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStep {
    pub step: u32,
    pub action: String,
    pub description: String,
    pub result: String,
    pub duration: Duration,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentToolCall {
    pub tool_name: String,
    pub input: HashMap<String, Value>,
    pub output: Value,
    pub duration: Duration,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub result: Value,
    pub status: AgentStatus,
    pub message: String,
    pub steps: Vec<AgentStep>,
    pub tool_calls: Vec<AgentToolCall>,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
    pub metadata: HashMap<String, Value>,
}

impl AgentOutput {
    fn with_status(status: AgentStatus, result: Value, message: String) -> Self {
        Self {
            result,
            status,
            message,
            steps: Vec::new(),
            tool_calls: Vec::new(),
            latency: Duration::ZERO,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn success(result: impl Into<Value>) -> Self {
        Self::with_status(AgentStatus::Success, result.into(), String::new())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::with_status(AgentStatus::Failed, Value::Null, message.into())
    }

    pub fn partial(result: impl Into<Value>, message: impl Into<String>) -> Self {
        Self::with_status(AgentStatus::Partial, result.into(), message.into())
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_step(mut self, step: AgentStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == AgentStatus::Success
    }
}

type AgentHandler =
    Arc<dyn Fn(Context, Arc<AgentInput>) -> BoxFuture<'static, Result<AgentOutput, AgentError>> + Send + Sync>;

/// An agent defined by a handler closure
#[derive(Clone)]
pub struct BaseAgent {
    name: String,
    description: String,
    capabilities: Vec<String>,
    handler: Option<AgentHandler>,
    config: RunnableConfig,
}

impl BaseAgent {
    pub fn new<I, S>(name: impl Into<String>, description: impl Into<String>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            description: description.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            handler: None,
            config: RunnableConfig::default(),
        }
    }

    pub fn with_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Context, Arc<AgentInput>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<AgentOutput, AgentError>> + Send + 'static,
    {
        self.handler = Some(Arc::new(move |ctx, input| Box::pin(handler(ctx, input))));
        self
    }
}

impl fmt::Debug for BaseAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseAgent")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

impl Configurable for BaseAgent {
    fn config(&self) -> &RunnableConfig {
        &self.config
    }

    fn with_config(&self, config: RunnableConfig) -> Self {
        Self {
            config,
            ..self.clone()
        }
    }
}

#[async_trait]
impl Runnable<Arc<AgentInput>, AgentOutput> for BaseAgent {
    async fn invoke(&self, ctx: &Context, input: Arc<AgentInput>) -> Result<AgentOutput, AgentError> {
        let started = Instant::now();
        let callbacks = &self.config.callbacks;
        notify_start(callbacks, ctx, &self.name, &input);

        let result = match &self.handler {
            Some(handler) => {
                let handler = handler.clone();
                let call_ctx = ctx.clone();
                safe_invoke(ctx, &self.name, "invoke", async move { handler(call_ctx, input).await })
                    .await
                    .map(|mut output| {
                        output.latency = started.elapsed();
                        output
                    })
            }
            None => Err(AgentError::new(
                ErrorCode::NotImplemented,
                "invoke must be provided by the concrete agent",
            )
            .with_component(self.name.clone())
            .with_operation("invoke")),
        };

        match &result {
            Ok(output) => notify_end(callbacks, ctx, &self.name, output),
            Err(err) => notify_error(callbacks, ctx, &self.name, err),
        }
        result
    }

    fn max_concurrency(&self) -> usize {
        self.config.concurrency()
    }
}

impl Agent for BaseAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn capabilities(&self) -> &[String] {
        &self.capabilities
    }
}

/// Runs agents in order, feeding each one's metadata to the next
pub struct ChainableAgent {
    name: String,
    description: String,
    capabilities: Vec<String>,
    agents: RwLock<Vec<Arc<dyn Agent>>>,
    pool: ObjectPool<AgentInput>,
}

impl ChainableAgent {
    pub fn new(name: impl Into<String>, description: impl Into<String>, agents: Vec<Arc<dyn Agent>>) -> Self {
        let mut capabilities = vec!["chaining".to_string()];
        for agent in &agents {
            capabilities.extend(agent.capabilities().iter().cloned());
        }
        Self {
            name: name.into(),
            description: description.into(),
            capabilities,
            agents: RwLock::new(agents),
            pool: ObjectPool::new(INPUT_POOL_CAPACITY),
        }
    }

    pub fn push(&self, agent: Arc<dyn Agent>) {
        self.agents.write().push(agent);
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    /// Inputs idle in the pool, for inspection
    pub fn pooled_inputs(&self) -> usize {
        self.pool.idle()
    }

    fn recycle(&self, input: Arc<AgentInput>) {
        match Arc::try_unwrap(input) {
            Ok(input) => self.pool.put(input),
            Err(_) => debug!(chain = %self.name, "pooled input retained by an agent"),
        }
    }

    fn next_input(&self, previous: &AgentInput, output: &AgentOutput) -> AgentInput {
        let mut next = self.pool.get();
        next.task.clone_from(&previous.task);
        next.instruction.clone_from(&previous.instruction);
        next.options.clone_from(&previous.options);
        next.session_id.clone_from(&previous.session_id);
        next.timestamp = Utc::now();
        next.context_mut()
            .extend(output.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        next
    }
}

impl fmt::Debug for ChainableAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainableAgent")
            .field("name", &self.name)
            .field("agents", &self.len())
            .field("pool", &self.pool)
            .finish()
    }
}

#[async_trait]
impl Runnable<Arc<AgentInput>, AgentOutput> for ChainableAgent {
    async fn invoke(&self, ctx: &Context, input: Arc<AgentInput>) -> Result<AgentOutput, AgentError> {
        let agents = self.agents.read().clone();
        if agents.is_empty() {
            return Ok(AgentOutput::success(Value::Null).with_message("no agents in chain"));
        }

        let last = agents.len() - 1;
        let mut current = input;
        let mut pooled = false;

        for (index, agent) in agents.iter().enumerate() {
            let outcome = match ctx.check() {
                Ok(()) => safe_invoke(ctx, agent.name(), "invoke", agent.invoke(ctx, current.clone())).await,
                Err(reason) => Err(reason.into()),
            };

            let output = match outcome {
                Ok(output) => output,
                Err(err) => {
                    if pooled {
                        self.recycle(current);
                    }
                    warn!(chain = %self.name, agent = %agent.name(), index, error = %err, "agent in chain failed");
                    return Err(err.at_stage(&self.name, index));
                }
            };

            if index == last {
                if pooled {
                    self.recycle(current);
                }
                return Ok(output);
            }

            let next = Arc::new(self.next_input(&current, &output));
            let previous = std::mem::replace(&mut current, next);
            if pooled {
                self.recycle(previous);
            }
            pooled = true;
        }

        Err(AgentError::internal("agent chain ended without output").with_component(self.name.clone()))
    }
}

impl Agent for ChainableAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn capabilities(&self) -> &[String] {
        &self.capabilities
    }
}

/// Timeout and retry policy around a single agent
#[derive(Clone)]
pub struct AgentExecutor {
    agent: Arc<dyn Agent>,
    max_retries: u32,
    timeout: Option<Duration>,
    stop_on_error: bool,
}

impl AgentExecutor {
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self {
            agent,
            max_retries: 0,
            timeout: None,
            stop_on_error: true,
        }
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// When set (the default) the first failure is returned without retrying
    pub fn with_stop_on_error(mut self, stop: bool) -> Self {
        self.stop_on_error = stop;
        self
    }

    pub async fn execute(&self, ctx: &Context, input: Arc<AgentInput>) -> Result<AgentOutput, AgentError> {
        let ctx = match self.timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx.clone(),
        };

        let attempts = self.max_retries + 1;
        let mut last_error = None;
        for attempt in 0..attempts {
            match self.agent.invoke(&ctx, input.clone()).await {
                Ok(output) => return Ok(output),
                Err(err) => {
                    if self.stop_on_error {
                        return Err(err);
                    }
                    if let Some(reason) = ctx.err() {
                        return Err(AgentError::from(reason).with_component(self.agent.name().to_string()));
                    }
                    debug!(agent = %self.agent.name(), attempt, error = %err, "agent attempt failed");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| AgentError::internal("agent executor made no attempts")))
    }
}

impl fmt::Debug for AgentExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentExecutor")
            .field("agent", &self.agent.name())
            .field("max_retries", &self.max_retries)
            .field("timeout", &self.timeout)
            .field("stop_on_error", &self.stop_on_error)
            .finish()
    }
}
