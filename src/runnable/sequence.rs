// Left-to-right composition of JSON-valued runnables
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use super::callback::{notify_end, notify_error, notify_start};
use super::panic::{safe_invoke, safe_stream};
use super::{once_stream, until_done, ChunkStream, Configurable, Runnable, RunnableConfig, StreamChunk};
use crate::context::Context;
use crate::error::AgentError;

const COMPONENT: &str = "runnable_sequence";

pub type ValueRunnable = Arc<dyn Runnable<Value, Value>>;

/// `r0 | r1 | ... | rn` over [`Value`].
///
/// An empty sequence returns its input unchanged. A failing step stops the
/// sequence; the error names the zero-based step index.
#[derive(Clone, Default)]
pub struct RunnableSequence {
    steps: Vec<ValueRunnable>,
    config: RunnableConfig,
}

impl RunnableSequence {
    pub fn new<S>(steps: S) -> Self
    where
        S: IntoIterator<Item = ValueRunnable>,
    {
        Self {
            steps: steps.into_iter().collect(),
            config: RunnableConfig::default(),
        }
    }

    /// A new sequence with `step` appended
    pub fn then(&self, step: ValueRunnable) -> Self {
        let mut next = self.clone();
        next.steps.push(step);
        next
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    async fn run_steps(&self, ctx: &Context, steps: &[ValueRunnable], input: Value) -> Result<Value, AgentError> {
        let mut current = input;
        for (index, step) in steps.iter().enumerate() {
            ctx.check()
                .map_err(|err| AgentError::from(err).at_stage(COMPONENT, index))?;
            current = safe_invoke(ctx, COMPONENT, "invoke", step.invoke(ctx, current))
                .await
                .map_err(|err| err.at_stage(COMPONENT, index))?;
        }
        Ok(current)
    }
}

impl fmt::Debug for RunnableSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnableSequence")
            .field("steps", &self.steps.len())
            .field("config", &self.config)
            .finish()
    }
}

impl Configurable for RunnableSequence {
    fn config(&self) -> &RunnableConfig {
        &self.config
    }

    fn with_config(&self, config: RunnableConfig) -> Self {
        Self {
            steps: self.steps.clone(),
            config,
        }
    }
}

#[async_trait]
impl Runnable<Value, Value> for RunnableSequence {
    async fn invoke(&self, ctx: &Context, input: Value) -> Result<Value, AgentError> {
        let callbacks = &self.config.callbacks;
        notify_start(callbacks, ctx, COMPONENT, &input);

        let result = self.run_steps(ctx, &self.steps, input).await;

        match &result {
            Ok(output) => notify_end(callbacks, ctx, COMPONENT, output),
            Err(err) => notify_error(callbacks, ctx, COMPONENT, err),
        }
        result
    }

    async fn stream(&self, ctx: &Context, input: Value) -> Result<ChunkStream<Value>, AgentError> {
        let Some((last, head)) = self.steps.split_last() else {
            return Ok(once_stream(StreamChunk::last(input)));
        };

        let current = match self.run_steps(ctx, head, input).await {
            Ok(value) => value,
            Err(err) => return Ok(once_stream(StreamChunk::failed(err))),
        };

        let index = head.len();
        match safe_invoke(ctx, COMPONENT, "stream", last.stream(ctx, current)).await {
            Ok(chunks) => Ok(until_done(safe_stream(ctx, COMPONENT, chunks))),
            Err(err) => Ok(once_stream(StreamChunk::failed(err.at_stage(COMPONENT, index)))),
        }
    }

    async fn batch(&self, ctx: &Context, inputs: Vec<Value>) -> Result<Vec<Value>, AgentError> {
        let mut current = inputs;
        for (index, step) in self.steps.iter().enumerate() {
            current = step
                .batch(ctx, current)
                .await
                .map_err(|err| err.at_stage(COMPONENT, index).with_operation("batch"))?;
        }
        Ok(current)
    }
}
