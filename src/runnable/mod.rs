// Generic execution abstraction
// A Runnable can be invoked once, streamed, batched and composed

//! # Runnable
//!
//! [`Runnable<I, O>`] is the one abstraction agents, chains and plugins
//! share. Every implementation gets three ways to run:
//!
//! - `invoke`: one input, one output
//! - `stream`: one input, a finite stream of [`StreamChunk`]s whose last
//!   chunk has `done = true`
//! - `batch`: many inputs run concurrently under a concurrency bound, with
//!   output order matching input order
//!
//! Only `invoke` is required. `stream` and `batch` have default
//! implementations built on it.
//!
//! Composition lives in the submodules:
//!
//! - [`RunnableFunc`] turns an async closure into a runnable with callbacks
//! - [`RunnablePipe`] feeds one runnable's output into another
//! - [`RunnableSequence`] chains any number of JSON-valued runnables
//! - [`generator::Generator`] is the lazy pull form of a stream
//! - [`plugin`] bridges typed runnables and a dynamic boundary
//!
//! Calls into user code go through [`panic::safe_invoke`], so a panicking
//! stage surfaces as an `internal` [`AgentError`] rather than killing the
//! task.
//!
//! ## Rust Learning Notes:
//!
//! ### Generic traits as objects
//! `Runnable<I, O>` has no generic methods, so `dyn Runnable<I, O>` is a
//! valid trait object. Composites store `Arc<dyn Runnable<..>>` and can hold
//! stages of different concrete types.
//!
//! ### Extension traits
//! `pipe` needs `Self: Sized` to move `self` into an `Arc`, which would make
//! `Runnable` unusable as a trait object if it lived on the trait. It lives on
//! [`RunnableExt`] instead, implemented for every sized runnable.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, FuturesUnordered};
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::context::Context;
use crate::error::AgentError;
use self::panic::safe_invoke;

pub mod callback;
pub mod func;
pub mod generator;
pub mod panic;
pub mod pipe;
pub mod plugin;
pub mod sequence;

pub use callback::{Callback, LoggingCallback};
pub use func::RunnableFunc;
pub use pipe::RunnablePipe;
pub use sequence::RunnableSequence;

/// Concurrency bound for `batch` when none is configured
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

/// Stream returned by [`Runnable::stream`]
pub type ChunkStream<O> = BoxStream<'static, StreamChunk<O>>;

/// One element of a streamed result
#[derive(Debug)]
pub struct StreamChunk<T> {
    pub data: Option<T>,
    pub error: Option<AgentError>,
    /// Set on the final chunk; nothing follows it
    pub done: bool,
}

impl<T> StreamChunk<T> {
    pub fn data(data: T) -> Self {
        Self {
            data: Some(data),
            error: None,
            done: false,
        }
    }

    pub fn last(data: T) -> Self {
        Self {
            data: Some(data),
            error: None,
            done: true,
        }
    }

    /// A final chunk with no payload
    pub fn end() -> Self {
        Self {
            data: None,
            error: None,
            done: true,
        }
    }

    pub fn failed(error: AgentError) -> Self {
        Self {
            data: None,
            error: Some(error),
            done: true,
        }
    }

    pub fn into_result(self) -> Option<Result<T, AgentError>> {
        match (self.data, self.error) {
            (_, Some(error)) => Some(Err(error)),
            (Some(data), None) => Some(Ok(data)),
            (None, None) => None,
        }
    }
}

/// A stream of exactly one final chunk
pub fn once_stream<T: Send + 'static>(chunk: StreamChunk<T>) -> ChunkStream<T> {
    stream::iter(std::iter::once(chunk)).boxed()
}

/// Stop a chunk stream right after its first `done` chunk
pub fn until_done<T: Send + 'static>(chunks: ChunkStream<T>) -> ChunkStream<T> {
    chunks
        .scan(false, |finished, chunk| {
            if *finished {
                return futures::future::ready(None);
            }
            *finished = chunk.done;
            futures::future::ready(Some(chunk))
        })
        .boxed()
}

/// Per-instance configuration shared by the composites
#[derive(Clone, Default)]
pub struct RunnableConfig {
    pub callbacks: Vec<Arc<dyn Callback>>,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, Value>,
    /// Zero means [`DEFAULT_MAX_CONCURRENCY`]
    pub max_concurrency: usize,
}

impl RunnableConfig {
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn concurrency(&self) -> usize {
        if self.max_concurrency == 0 {
            DEFAULT_MAX_CONCURRENCY
        } else {
            self.max_concurrency
        }
    }
}

impl fmt::Debug for RunnableConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnableConfig")
            .field("callbacks", &self.callbacks.len())
            .field("tags", &self.tags)
            .field("metadata", &self.metadata)
            .field("max_concurrency", &self.max_concurrency)
            .finish()
    }
}

#[async_trait]
pub trait Runnable<I, O>: Send + Sync
where
    I: Send + 'static,
    O: Send + 'static,
{
    async fn invoke(&self, ctx: &Context, input: I) -> Result<O, AgentError>;

    /// Default: a single `done` chunk carrying the `invoke` result
    async fn stream(&self, ctx: &Context, input: I) -> Result<ChunkStream<O>, AgentError> {
        let chunk = match self.invoke(ctx, input).await {
            Ok(output) => StreamChunk::last(output),
            Err(err) => StreamChunk::failed(err),
        };
        Ok(once_stream(chunk))
    }

    /// Run every input through `invoke`, at most [`max_concurrency`](Self::max_concurrency) at a time
    async fn batch(&self, ctx: &Context, inputs: Vec<I>) -> Result<Vec<O>, AgentError> {
        batch_invoke(self, ctx, inputs, self.max_concurrency()).await
    }

    /// Bound used by the default `batch`; configured runnables report their own
    fn max_concurrency(&self) -> usize {
        DEFAULT_MAX_CONCURRENCY
    }
}

#[async_trait]
impl<I, O, R> Runnable<I, O> for Arc<R>
where
    I: Send + 'static,
    O: Send + 'static,
    R: Runnable<I, O> + ?Sized,
{
    async fn invoke(&self, ctx: &Context, input: I) -> Result<O, AgentError> {
        (**self).invoke(ctx, input).await
    }

    async fn stream(&self, ctx: &Context, input: I) -> Result<ChunkStream<O>, AgentError> {
        (**self).stream(ctx, input).await
    }

    async fn batch(&self, ctx: &Context, inputs: Vec<I>) -> Result<Vec<O>, AgentError> {
        (**self).batch(ctx, inputs).await
    }

    fn max_concurrency(&self) -> usize {
        (**self).max_concurrency()
    }
}

/// Run `invoke` for every input with at most `max_concurrency` in flight.
///
/// Each invocation runs under the panic shim, so a panicking `invoke` fails
/// its own slot. All started invocations are drained before returning. The error of the
/// lowest failing index is returned. A cancelled `ctx` stops collection
/// immediately with its error.
pub async fn batch_invoke<R, I, O>(
    runnable: &R,
    ctx: &Context,
    inputs: Vec<I>,
    max_concurrency: usize,
) -> Result<Vec<O>, AgentError>
where
    R: Runnable<I, O> + ?Sized,
    I: Send + 'static,
    O: Send + 'static,
{
    if inputs.is_empty() {
        return Ok(Vec::new());
    }
    ctx.check()?;

    let semaphore = Semaphore::new(max_concurrency.max(1));
    let total = inputs.len();
    let mut pending: FuturesUnordered<_> = inputs
        .into_iter()
        .enumerate()
        .map(|(index, input)| {
            let semaphore = &semaphore;
            async move {
                let result = match semaphore.acquire().await {
                    Ok(_permit) => safe_invoke(ctx, "runnable", "batch", runnable.invoke(ctx, input)).await,
                    Err(_) => Err(AgentError::internal("batch semaphore closed")),
                };
                (index, result)
            }
        })
        .collect();

    let mut slots: Vec<Option<O>> = (0..total).map(|_| None).collect();
    let mut first_error: Option<(usize, AgentError)> = None;

    loop {
        tokio::select! {
            biased;
            reason = ctx.done() => {
                return Err(AgentError::from(reason).with_operation("batch"));
            }
            next = pending.next() => match next {
                Some((index, Ok(output))) => slots[index] = Some(output),
                Some((index, Err(err))) => {
                    if first_error.as_ref().map_or(true, |(seen, _)| index < *seen) {
                        first_error = Some((index, err));
                    }
                }
                None => break,
            }
        }
    }

    if let Some((index, err)) = first_error {
        return Err(err.with_context("batch_index", index));
    }
    slots
        .into_iter()
        .map(|slot| slot.ok_or_else(|| AgentError::internal("batch result missing")))
        .collect()
}

/// Instances whose configuration is replaced by copying
pub trait Configurable: Sized {
    fn config(&self) -> &RunnableConfig;

    /// A copy of `self` with `config` in place of the current one
    fn with_config(&self, config: RunnableConfig) -> Self;

    /// A copy of `self` with `callbacks` appended
    fn with_callbacks<C>(&self, callbacks: C) -> Self
    where
        C: IntoIterator<Item = Arc<dyn Callback>>,
    {
        let mut config = self.config().clone();
        config.callbacks.extend(callbacks);
        self.with_config(config)
    }
}

pub trait RunnableExt<I, O>: Runnable<I, O> + Sized + 'static
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Feed this runnable's output into `next`
    fn pipe<P, N>(self, next: N) -> RunnablePipe<I, O, P>
    where
        P: Send + 'static,
        N: Runnable<O, P> + 'static,
    {
        RunnablePipe::new(Arc::new(self), Arc::new(next))
    }
}

impl<I, O, R> RunnableExt<I, O> for R
where
    I: Send + 'static,
    O: Send + 'static,
    R: Runnable<I, O> + 'static,
{
}
