// Pull-based lazy sequences with early termination
// The producer calls `yield`; a `false` return tells it to stop

//! # Generator
//!
//! A [`Generator<T>`] is a producer function handed a `yield` callback:
//!
//! ```text
//! yield(Ok(value)) -> bool   keep going?
//! yield(Err(error)) -> bool
//! ```
//!
//! When `yield` returns `false` the producer must return without producing
//! anything else. The combinators [`Generator::take`], [`Generator::filter`],
//! [`Generator::map`] and [`Generator::collect`] are lazy: nothing runs until
//! the outermost generator is run, and each one stops at the first error.
//!
//! [`Generator::from_stream`] and [`Generator::into_stream`] convert to and
//! from the chunk streams returned by [`Runnable::stream`](super::Runnable::stream).
//!
//! ```rust
//! use bulwark::Generator;
//!
//! let evens = Generator::from_iter(1..)
//!     .filter(|n: &u64| n % 2 == 0)
//!     .map(|n| n * 10)
//!     .take(3)
//!     .collect()
//!     .unwrap();
//! assert_eq!(evens, vec![20, 40, 60]);
//! ```
//!
//! ## Rust Learning Notes:
//!
//! ### Internal iteration
//! `Iterator` is external: the consumer pulls with `next()`. A generator is
//! internal: the producer pushes into a callback. Infinite producers such as
//! `from_iter(1..)` are fine because `take` returns `false` once satisfied.
//!
//! ### `&mut dyn FnMut`
//! The yield callback is passed as a trait object so one producer type works
//! with every consumer closure without extra generic parameters.

use futures::{Stream, StreamExt};
use std::fmt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::panic::safe_call;
use super::{ChunkStream, StreamChunk};
use crate::context::Context;
use crate::error::AgentError;

/// The callback a producer pushes items into
pub type Yield<'a, T> = &'a mut dyn FnMut(Result<T, AgentError>) -> bool;

type Producer<T> = Box<dyn for<'a> FnOnce(Yield<'a, T>) + Send>;

const STREAM_BUFFER: usize = 16;

pub struct Generator<T> {
    produce: Producer<T>,
}

impl<T> fmt::Debug for Generator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generator").finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Generator<T> {
    pub fn new<F>(produce: F) -> Self
    where
        F: for<'a> FnOnce(Yield<'a, T>) + Send + 'static,
    {
        Self {
            produce: Box::new(produce),
        }
    }

    pub fn from_iter<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        let items = items.into_iter();
        Self::new(move |yield_item| {
            for item in items {
                if !yield_item(Ok(item)) {
                    return;
                }
            }
        })
    }

    pub fn from_results<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Result<T, AgentError>>,
        I::IntoIter: Send + 'static,
    {
        let items = items.into_iter();
        Self::new(move |yield_item| {
            for item in items {
                if !yield_item(item) {
                    return;
                }
            }
        })
    }

    /// Drive a chunk stream from synchronous code.
    ///
    /// Each chunk is awaited with `futures::executor::block_on`, so run the
    /// generator on a blocking thread when the stream needs the tokio
    /// runtime to make progress.
    pub fn from_stream<S>(chunks: S) -> Self
    where
        S: Stream<Item = StreamChunk<T>> + Send + Unpin + 'static,
    {
        Self::new(move |yield_item| {
            let mut chunks = chunks;
            while let Some(chunk) = futures::executor::block_on(chunks.next()) {
                let done = chunk.done;
                if let Some(item) = chunk.into_result() {
                    let failed = item.is_err();
                    if !yield_item(item) || failed {
                        return;
                    }
                }
                if done {
                    return;
                }
            }
        })
    }

    /// Run the producer, handing every item to `sink`
    pub fn run<F>(self, mut sink: F)
    where
        F: FnMut(Result<T, AgentError>) -> bool,
    {
        (self.produce)(&mut sink)
    }

    /// At most `n` items
    pub fn take(self, n: usize) -> Generator<T> {
        Generator::new(move |yield_item| {
            if n == 0 {
                return;
            }
            let mut taken = 0;
            self.run(|item| match item {
                Ok(value) => {
                    taken += 1;
                    yield_item(Ok(value)) && taken < n
                }
                Err(err) => {
                    yield_item(Err(err));
                    false
                }
            })
        })
    }

    pub fn filter<P>(self, mut predicate: P) -> Generator<T>
    where
        P: FnMut(&T) -> bool + Send + 'static,
    {
        Generator::new(move |yield_item| {
            self.run(|item| match item {
                Ok(value) if predicate(&value) => yield_item(Ok(value)),
                Ok(_) => true,
                Err(err) => {
                    yield_item(Err(err));
                    false
                }
            })
        })
    }

    pub fn map<U, F>(self, mut f: F) -> Generator<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        Generator::new(move |yield_item| {
            self.run(|item| match item {
                Ok(value) => yield_item(Ok(f(value))),
                Err(err) => {
                    yield_item(Err(err));
                    false
                }
            })
        })
    }

    /// Every item, or the first error
    pub fn collect(self) -> Result<Vec<T>, AgentError> {
        let mut items = Vec::new();
        let mut failure = None;
        self.run(|item| match item {
            Ok(value) => {
                items.push(value);
                true
            }
            Err(err) => {
                failure = Some(err);
                false
            }
        });
        match failure {
            Some(err) => Err(err),
            None => Ok(items),
        }
    }

    /// Run the producer on a blocking thread and expose it as a chunk stream.
    ///
    /// Production stops when the receiver is dropped or `ctx` is done. A
    /// panicking producer ends the stream with an `internal` error chunk.
    /// Must be called from within a tokio runtime.
    pub fn into_stream(self, ctx: &Context) -> ChunkStream<T> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let ctx = ctx.clone();

        tokio::task::spawn_blocking(move || {
            let mut ended = false;
            let outcome = safe_call(&ctx, "generator", "stream", || {
                self.run(|item| {
                    if let Some(reason) = ctx.err() {
                        ended = true;
                        let _ = tx.blocking_send(StreamChunk::failed(reason.into()));
                        return false;
                    }
                    let chunk = match item {
                        Ok(value) => StreamChunk::data(value),
                        Err(err) => StreamChunk::failed(err),
                    };
                    ended = chunk.done;
                    tx.blocking_send(chunk).is_ok() && !ended
                });
                Ok(())
            });

            let last = match outcome {
                Err(err) => Some(StreamChunk::failed(err)),
                Ok(()) if !ended => Some(StreamChunk::end()),
                Ok(()) => None,
            };
            if let Some(chunk) = last {
                let _ = tx.blocking_send(chunk);
            }
        });

        ReceiverStream::new(rx).boxed()
    }
}
