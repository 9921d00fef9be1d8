// Two-stage composition: first's output feeds second
use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

use super::callback::{notify_end, notify_error, notify_start};
use super::panic::{safe_invoke, safe_stream};
use super::{once_stream, until_done, ChunkStream, Configurable, Runnable, RunnableConfig, StreamChunk};
use crate::context::Context;
use crate::error::AgentError;

const COMPONENT: &str = "runnable_pipe";

/// `first | second`.
///
/// Each stage runs under the panic shim. A failure is annotated with the
/// stage index (0 for `first`, 1 for `second`) and keeps the stage's code.
/// Streaming invokes `first` to completion and streams `second`.
pub struct RunnablePipe<I, M, O> {
    first: Arc<dyn Runnable<I, M>>,
    second: Arc<dyn Runnable<M, O>>,
    config: RunnableConfig,
}

impl<I, M, O> RunnablePipe<I, M, O>
where
    I: Send + 'static,
    M: Send + 'static,
    O: Send + 'static,
{
    pub fn new(first: Arc<dyn Runnable<I, M>>, second: Arc<dyn Runnable<M, O>>) -> Self {
        Self {
            first,
            second,
            config: RunnableConfig::default(),
        }
    }

    async fn run_first(&self, ctx: &Context, input: I) -> Result<M, AgentError> {
        safe_invoke(ctx, COMPONENT, "invoke", self.first.invoke(ctx, input))
            .await
            .map_err(|err| err.at_stage(COMPONENT, 0))
    }
}

impl<I, M, O> Clone for RunnablePipe<I, M, O> {
    fn clone(&self) -> Self {
        Self {
            first: self.first.clone(),
            second: self.second.clone(),
            config: self.config.clone(),
        }
    }
}

impl<I, M, O> fmt::Debug for RunnablePipe<I, M, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnablePipe").field("config", &self.config).finish()
    }
}

impl<I, M, O> Configurable for RunnablePipe<I, M, O> {
    fn config(&self) -> &RunnableConfig {
        &self.config
    }

    fn with_config(&self, config: RunnableConfig) -> Self {
        Self {
            first: self.first.clone(),
            second: self.second.clone(),
            config,
        }
    }
}

#[async_trait]
impl<I, M, O> Runnable<I, O> for RunnablePipe<I, M, O>
where
    I: Send + 'static,
    M: Send + 'static,
    O: Send + 'static,
{
    async fn invoke(&self, ctx: &Context, input: I) -> Result<O, AgentError> {
        let callbacks = &self.config.callbacks;
        notify_start(callbacks, ctx, COMPONENT, &input as &dyn Any);

        let result = match self.run_first(ctx, input).await {
            Ok(middle) => safe_invoke(ctx, COMPONENT, "invoke", self.second.invoke(ctx, middle))
                .await
                .map_err(|err| err.at_stage(COMPONENT, 1)),
            Err(err) => Err(err),
        };

        match &result {
            Ok(output) => notify_end(callbacks, ctx, COMPONENT, output as &dyn Any),
            Err(err) => notify_error(callbacks, ctx, COMPONENT, err),
        }
        result
    }

    async fn stream(&self, ctx: &Context, input: I) -> Result<ChunkStream<O>, AgentError> {
        let middle = match self.run_first(ctx, input).await {
            Ok(middle) => middle,
            Err(err) => return Ok(once_stream(StreamChunk::failed(err))),
        };

        match safe_invoke(ctx, COMPONENT, "stream", self.second.stream(ctx, middle)).await {
            Ok(chunks) => Ok(until_done(safe_stream(ctx, COMPONENT, chunks))),
            Err(err) => Ok(once_stream(StreamChunk::failed(err.at_stage(COMPONENT, 1)))),
        }
    }

    async fn batch(&self, ctx: &Context, inputs: Vec<I>) -> Result<Vec<O>, AgentError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let middles = self
            .first
            .batch(ctx, inputs)
            .await
            .map_err(|err| err.at_stage(COMPONENT, 0).with_operation("batch"))?;
        self.second
            .batch(ctx, middles)
            .await
            .map_err(|err| err.at_stage(COMPONENT, 1).with_operation("batch"))
    }
}
