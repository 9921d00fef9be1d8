// Chains: ordered steps over JSON values
// BaseChain runs Steps in order with skip/only selection, stop-on-error and a wall-clock timeout

//! # Chains
//!
//! A [`Chain`] is a [`Runnable`] from [`ChainInput`] to [`ChainOutput`] that
//! feeds the data of one [`Step`] into the next.
//!
//! [`ChainOptions`] control a single run:
//! - `stop_on_error` aborts on the first failing step (status `failed`);
//!   otherwise the failure is recorded, the previous data flows on and the
//!   final status is `partial`
//! - `skip_steps` and `only_steps` select steps by 1-based number; a
//!   non-empty `only_steps` wins over `skip_steps`
//! - `timeout` bounds the whole run, not each step
//!
//! ## Rust Learning Notes:
//!
//! ### One engine, three entry points
//! `run`, `invoke` and `stream` all drive the same private `execute`.
//! `stream` hands it the sending half of a channel so it can publish a
//! snapshot after each step, and runs it on a spawned task. That is why
//! [`BaseChain`] is cheap to clone: its steps are shared through `Arc`.
//!
//! ### Racing a step against the deadline
//! `tokio::select!` polls the step and `ctx.done()` together. When the
//! deadline fires first, the step future is dropped, which cancels it at its
//! next await point.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::StreamExt;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::agent::{ObjectPool, Poolable};
use crate::context::Context;
use crate::error::AgentError;
use crate::runnable::callback::{notify_end, notify_error, notify_start};
use crate::runnable::panic::safe_invoke;
use crate::runnable::{ChunkStream, Configurable, Runnable, RunnableConfig, StreamChunk};

/// Default wall-clock budget for a chain run
pub const DEFAULT_CHAIN_TIMEOUT: Duration = Duration::from_secs(60);

const CHAIN_POOL_CAPACITY: usize = 64;

lazy_static! {
    static ref CHAIN_INPUTS: ObjectPool<ChainInput> = ObjectPool::new(CHAIN_POOL_CAPACITY);
    static ref CHAIN_OUTPUTS: ObjectPool<ChainOutput> = ObjectPool::new(CHAIN_POOL_CAPACITY);
}

/// Take a reset [`ChainInput`] from the shared pool
pub fn get_chain_input() -> ChainInput {
    CHAIN_INPUTS.get()
}

pub fn put_chain_input(input: ChainInput) {
    CHAIN_INPUTS.put(input);
}

/// Take a reset [`ChainOutput`] from the shared pool
pub fn get_chain_output() -> ChainOutput {
    CHAIN_OUTPUTS.get()
}

pub fn put_chain_output(output: ChainOutput) {
    CHAIN_OUTPUTS.put(output);
}

/// A single unit of work in a chain
#[async_trait]
pub trait Step: Send + Sync {
    async fn execute(&self, ctx: &Context, input: Value) -> Result<Value, AgentError>;

    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }
}

type StepFn = Arc<dyn Fn(Context, Value) -> BoxFuture<'static, Result<Value, AgentError>> + Send + Sync>;

/// A named [`Step`] backed by an async closure
#[derive(Clone)]
pub struct FuncStep {
    name: String,
    description: String,
    func: StepFn,
}

impl FuncStep {
    pub fn new<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Context, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, AgentError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: String::new(),
            func: Arc::new(move |ctx, input| Box::pin(func(ctx, input))),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

impl fmt::Debug for FuncStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FuncStep").field("name", &self.name).finish()
    }
}

#[async_trait]
impl Step for FuncStep {
    async fn execute(&self, ctx: &Context, input: Value) -> Result<Value, AgentError> {
        (self.func)(ctx.clone(), input).await
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainOptions {
    pub stop_on_error: bool,
    /// Budget for the whole run; `None` or zero means no deadline
    pub timeout: Option<Duration>,
    /// Reserved: steps always run sequentially
    pub parallel: bool,
    pub skip_steps: Vec<usize>,
    pub only_steps: Vec<usize>,
    pub extra: HashMap<String, Value>,
}

impl Default for ChainOptions {
    fn default() -> Self {
        Self {
            stop_on_error: true,
            timeout: Some(DEFAULT_CHAIN_TIMEOUT),
            parallel: false,
            skip_steps: Vec::new(),
            only_steps: Vec::new(),
            extra: HashMap::new(),
        }
    }
}

impl ChainOptions {
    pub fn with_stop_on_error(mut self, stop: bool) -> Self {
        self.stop_on_error = stop;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn without_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    pub fn with_skip_steps(mut self, steps: impl IntoIterator<Item = usize>) -> Self {
        self.skip_steps = steps.into_iter().collect();
        self
    }

    pub fn with_only_steps(mut self, steps: impl IntoIterator<Item = usize>) -> Self {
        self.only_steps = steps.into_iter().collect();
        self
    }

    /// Whether the 1-based step `number` is left out of this run
    pub fn should_skip(&self, number: usize) -> bool {
        if !self.only_steps.is_empty() {
            return !self.only_steps.contains(&number);
        }
        self.skip_steps.contains(&number)
    }

    fn deadline(&self) -> Option<Duration> {
        self.timeout.filter(|timeout| !timeout.is_zero())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainInput {
    pub data: Value,
    /// Variables shared by the caller and the steps' closures
    pub vars: HashMap<String, Value>,
    pub options: ChainOptions,
}

impl Default for ChainInput {
    fn default() -> Self {
        Self {
            data: Value::Null,
            vars: HashMap::new(),
            options: ChainOptions::default(),
        }
    }
}

impl ChainInput {
    pub fn new(data: impl Into<Value>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    pub fn with_options(mut self, options: ChainOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }
}

impl Poolable for ChainInput {
    fn reset(&mut self) {
        self.data = Value::Null;
        self.vars.clear();
        let mut extra = std::mem::take(&mut self.options.extra);
        extra.clear();
        self.options = ChainOptions {
            extra,
            ..ChainOptions::default()
        };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainStatus {
    Success,
    Failed,
    Partial,
}

impl fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChainStatus::Success => "success",
            ChainStatus::Failed => "failed",
            ChainStatus::Partial => "partial",
        };
        f.write_str(name)
    }
}

/// Record of one step in a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub step_number: usize,
    pub step_name: String,
    pub description: String,
    pub input: Value,
    pub output: Value,
    pub duration: Duration,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub skipped: bool,
}

impl StepExecution {
    fn skipped(number: usize, name: &str) -> Self {
        Self {
            step_number: number,
            step_name: name.to_string(),
            description: String::new(),
            input: Value::Null,
            output: Value::Null,
            duration: Duration::ZERO,
            success: false,
            error: None,
            skipped: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainOutput {
    pub data: Value,
    pub steps_executed: Vec<StepExecution>,
    pub total_latency: Duration,
    pub status: ChainStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub metadata: HashMap<String, Value>,
}

impl Default for ChainOutput {
    fn default() -> Self {
        Self {
            data: Value::Null,
            steps_executed: Vec::new(),
            total_latency: Duration::ZERO,
            status: ChainStatus::Success,
            error: None,
            metadata: HashMap::new(),
        }
    }
}

impl ChainOutput {
    pub fn is_success(&self) -> bool {
        self.status == ChainStatus::Success
    }

    /// Executions that actually ran
    pub fn executed(&self) -> impl Iterator<Item = &StepExecution> {
        self.steps_executed.iter().filter(|execution| !execution.skipped)
    }
}

impl Poolable for ChainOutput {
    fn reset(&mut self) {
        self.data = Value::Null;
        self.steps_executed.clear();
        self.total_latency = Duration::ZERO;
        self.status = ChainStatus::Success;
        self.error = None;
        self.metadata.clear();
    }
}

pub trait Chain: Runnable<ChainInput, ChainOutput> {
    fn name(&self) -> &str;

    /// Number of steps
    fn steps(&self) -> usize;
}

/// Runs a fixed list of steps in order
#[derive(Clone)]
pub struct BaseChain {
    name: String,
    steps: Vec<Arc<dyn Step>>,
    config: RunnableConfig,
}

impl BaseChain {
    pub fn new(name: impl Into<String>, steps: Vec<Arc<dyn Step>>) -> Self {
        Self {
            name: name.into(),
            steps,
            config: RunnableConfig::default(),
        }
    }

    /// Append a step, returning the extended chain
    pub fn with_step(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    /// Run the chain and always return its output.
    ///
    /// Failures are reported through [`ChainOutput::status`] and
    /// [`ChainOutput::error`]; use `invoke` to get them as an `Err`.
    pub async fn run(&self, ctx: &Context, input: ChainInput) -> ChainOutput {
        self.execute(ctx, input, None).await.0
    }

    async fn execute(
        &self,
        ctx: &Context,
        input: ChainInput,
        snapshots: Option<&mpsc::Sender<StreamChunk<ChainOutput>>>,
    ) -> (ChainOutput, Option<AgentError>) {
        let started = Instant::now();
        let callbacks = &self.config.callbacks;
        notify_start(callbacks, ctx, &self.name, &input);

        let ChainInput { data, options, .. } = input;
        let run_ctx = match options.deadline() {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx.clone(),
        };

        let mut output = get_chain_output();
        let mut current = data;
        let mut failure = None;
        let mut publish = snapshots.is_some();
        let last = self.steps.len().saturating_sub(1);

        for (index, step) in self.steps.iter().enumerate() {
            let number = index + 1;

            if options.should_skip(number) {
                output.steps_executed.push(StepExecution::skipped(number, step.name()));
            } else {
                let step_started = Instant::now();
                let result = match run_ctx.check() {
                    Err(reason) => Err(AgentError::from(reason)),
                    Ok(()) => {
                        let call = safe_invoke(&run_ctx, step.name(), "execute", step.execute(&run_ctx, current.clone()));
                        tokio::select! {
                            biased;
                            result = call => result,
                            reason = run_ctx.done() => Err(AgentError::from(reason)),
                        }
                    }
                };

                let mut execution = StepExecution {
                    step_number: number,
                    step_name: step.name().to_string(),
                    description: step.description().to_string(),
                    input: current.clone(),
                    output: Value::Null,
                    duration: step_started.elapsed(),
                    success: result.is_ok(),
                    error: None,
                    skipped: false,
                };

                match result {
                    Ok(value) => {
                        execution.output = value.clone();
                        current = value;
                        output.steps_executed.push(execution);
                    }
                    Err(err) => {
                        execution.error = Some(err.to_string());
                        output.steps_executed.push(execution);
                        warn!(chain = %self.name, step = number, error = %err, "chain step failed");

                        // an expired deadline ends the run whatever stop_on_error says
                        if options.stop_on_error || run_ctx.is_done() {
                            output.status = ChainStatus::Failed;
                            failure = Some(err.at_stage(&self.name, index).with_context("step", number));
                            break;
                        }
                        output.status = ChainStatus::Partial;
                    }
                }
            }

            let tx = match snapshots {
                Some(tx) if publish && index != last => tx,
                _ => continue,
            };
            let snapshot = ChainOutput {
                data: current.clone(),
                total_latency: started.elapsed(),
                ..output.clone()
            };
            if tx.send(StreamChunk::data(snapshot)).await.is_err() {
                debug!(chain = %self.name, "stream receiver dropped, finishing without snapshots");
                publish = false;
            }
        }

        output.data = current;
        output.total_latency = started.elapsed();
        match &failure {
            Some(err) => {
                output.error = Some(err.to_string());
                notify_error(callbacks, ctx, &self.name, err);
            }
            None => notify_end(callbacks, ctx, &self.name, &output),
        }
        (output, failure)
    }
}

impl fmt::Debug for BaseChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let steps: Vec<&str> = self.steps.iter().map(|step| step.name()).collect();
        f.debug_struct("BaseChain")
            .field("name", &self.name)
            .field("steps", &steps)
            .finish()
    }
}

impl Configurable for BaseChain {
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
impl Runnable<ChainInput, ChainOutput> for BaseChain {
    async fn invoke(&self, ctx: &Context, input: ChainInput) -> Result<ChainOutput, AgentError> {
        match self.execute(ctx, input, None).await {
            (_, Some(err)) => Err(err),
            (output, None) => Ok(output),
        }
    }

    /// One chunk per step carrying the output so far; the last chunk is `done`
    async fn stream(&self, ctx: &Context, input: ChainInput) -> Result<ChunkStream<ChainOutput>, AgentError> {
        let (tx, rx) = mpsc::channel(16);
        let chain = self.clone();
        let ctx = ctx.clone();

        tokio::spawn(async move {
            let (output, failure) = chain.execute(&ctx, input, Some(&tx)).await;
            let last = StreamChunk {
                data: Some(output),
                error: failure,
                done: true,
            };
            if tx.send(last).await.is_err() {
                debug!(chain = %chain.name, "stream receiver dropped before the final chunk");
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    fn max_concurrency(&self) -> usize {
        self.config.concurrency()
    }
}

impl Chain for BaseChain {
    fn name(&self) -> &str {
        &self.name
    }

    fn steps(&self) -> usize {
        self.steps.len()
    }
}

#[cfg(test)]
mod tests;
