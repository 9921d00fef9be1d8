// Panic isolation for calls into user and plugin code
// Unwinding is converted into an AgentError with code `internal` and a stack trace

//! # Panic Shim
//!
//! [`safe_invoke`] (async) and [`safe_call`] (sync) run a piece of user code
//! and turn a panic into an [`AgentError`] instead of tearing down the task.
//! The conversion is pluggable through the process-wide
//! [`PanicHandlerRegistry`]:
//!
//! - a [`PanicHandler`] builds the error (default: [`DefaultPanicHandler`])
//! - an optional [`PanicMetricsCollector`] counts panics
//! - a [`PanicLogger`] records them (default: `tracing::error!`)
//!
//! ## Rust Learning Notes:
//!
//! ### catch_unwind
//! `std::panic::catch_unwind` stops an unwinding panic at a boundary and
//! hands back the payload as `Box<dyn Any + Send>`. For futures,
//! `futures::FutureExt::catch_unwind` does the same for every poll.
//! Both require `UnwindSafe`; `AssertUnwindSafe` states that the caller does
//! not observe broken invariants afterwards, which holds here because the
//! panicking value is dropped with the error.
//!
//! ### Panic payloads
//! `panic!("literal")` carries a `&'static str`, `panic!("{}", x)` carries a
//! `String`. Anything else (`std::panic::panic_any`) is reported as
//! "unknown panic".

use futures::{stream::BoxStream, FutureExt, StreamExt};
use lazy_static::lazy_static;
use parking_lot::RwLock;
use std::any::Any;
use std::backtrace::Backtrace;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

use super::StreamChunk;
use crate::context::Context;
use crate::error::AgentError;

/// Best-effort text of a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Converts a recovered panic into the error returned to the caller
pub trait PanicHandler: Send + Sync {
    fn handle_panic(
        &self,
        ctx: &Context,
        component: &str,
        operation: &str,
        panic_value: &str,
        stack: &str,
    ) -> AgentError;
}

pub trait PanicMetricsCollector: Send + Sync {
    fn record_panic(&self, component: &str, operation: &str, panic_value: &str);
}

pub trait PanicLogger: Send + Sync {
    fn log_panic(&self, ctx: &Context, component: &str, operation: &str, panic_value: &str, stack: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPanicHandler;

impl PanicHandler for DefaultPanicHandler {
    fn handle_panic(
        &self,
        _ctx: &Context,
        component: &str,
        operation: &str,
        panic_value: &str,
        stack: &str,
    ) -> AgentError {
        AgentError::internal(format!("panic recovered: {}", panic_value))
            .with_component(component)
            .with_operation(operation)
            .with_context("panic_value", panic_value)
            .with_context("stack_trace", stack)
            .with_stack(stack)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPanicLogger;

impl PanicLogger for TracingPanicLogger {
    fn log_panic(&self, _ctx: &Context, component: &str, operation: &str, panic_value: &str, stack: &str) {
        error!(
            component = %component,
            operation = %operation,
            panic = %panic_value,
            stack = %stack,
            "panic recovered"
        );
    }
}

struct PanicHooks {
    handler: Arc<dyn PanicHandler>,
    metrics: Option<Arc<dyn PanicMetricsCollector>>,
    logger: Arc<dyn PanicLogger>,
}

impl Default for PanicHooks {
    fn default() -> Self {
        Self {
            handler: Arc::new(DefaultPanicHandler),
            metrics: None,
            logger: Arc::new(TracingPanicLogger),
        }
    }
}

/// Process-wide panic hooks
pub struct PanicHandlerRegistry {
    hooks: RwLock<PanicHooks>,
}

lazy_static! {
    static ref REGISTRY: PanicHandlerRegistry = PanicHandlerRegistry {
        hooks: RwLock::new(PanicHooks::default()),
    };
}

impl PanicHandlerRegistry {
    pub fn global() -> &'static PanicHandlerRegistry {
        &REGISTRY
    }

    pub fn set_handler(&self, handler: Arc<dyn PanicHandler>) {
        self.hooks.write().handler = handler;
    }

    pub fn set_metrics(&self, metrics: Option<Arc<dyn PanicMetricsCollector>>) {
        self.hooks.write().metrics = metrics;
    }

    pub fn set_logger(&self, logger: Arc<dyn PanicLogger>) {
        self.hooks.write().logger = logger;
    }

    /// Back to the default handler and logger, without metrics
    pub fn reset(&self) {
        *self.hooks.write() = PanicHooks::default();
    }

    /// Run every hook for one recovered panic and build the error
    pub fn recover(
        &self,
        ctx: &Context,
        component: &str,
        operation: &str,
        payload: Box<dyn Any + Send>,
    ) -> AgentError {
        let panic_value = panic_message(payload.as_ref());
        let stack = Backtrace::force_capture().to_string();

        // clone out so user hooks never run under the lock
        let (handler, metrics, logger) = {
            let hooks = self.hooks.read();
            (hooks.handler.clone(), hooks.metrics.clone(), hooks.logger.clone())
        };

        if let Some(metrics) = metrics {
            metrics.record_panic(component, operation, &panic_value);
        }
        logger.log_panic(ctx, component, operation, &panic_value, &stack);
        handler.handle_panic(ctx, component, operation, &panic_value, &stack)
    }
}

/// Await `fut`, converting a panic into an `internal` [`AgentError`]
pub async fn safe_invoke<F, T>(
    ctx: &Context,
    component: &str,
    operation: &str,
    fut: F,
) -> Result<T, AgentError>
where
    F: Future<Output = Result<T, AgentError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(PanicHandlerRegistry::global().recover(ctx, component, operation, payload)),
    }
}

/// Synchronous counterpart of [`safe_invoke`]
pub fn safe_call<F, T>(ctx: &Context, component: &str, operation: &str, f: F) -> Result<T, AgentError>
where
    F: FnOnce() -> Result<T, AgentError>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(PanicHandlerRegistry::global().recover(ctx, component, operation, payload)),
    }
}

/// Wrap a chunk stream so a panic while polling becomes a final error chunk
pub fn safe_stream<T>(
    ctx: &Context,
    component: &str,
    stream: BoxStream<'static, StreamChunk<T>>,
) -> BoxStream<'static, StreamChunk<T>>
where
    T: Send + 'static,
{
    let ctx = ctx.clone();
    let component = component.to_string();
    AssertUnwindSafe(stream)
        .catch_unwind()
        .map(move |polled| match polled {
            Ok(chunk) => chunk,
            Err(payload) => StreamChunk::failed(
                PanicHandlerRegistry::global().recover(&ctx, &component, "stream", payload),
            ),
        })
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_panic_message_payloads() {
        let literal = catch_unwind(|| panic!("literal")).unwrap_err();
        assert_eq!(panic_message(literal.as_ref()), "literal");

        let formatted = catch_unwind(|| panic!("value {}", 7)).unwrap_err();
        assert_eq!(panic_message(formatted.as_ref()), "value 7");

        let other = catch_unwind(|| std::panic::panic_any(42_u8)).unwrap_err();
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }

    #[test]
    fn test_safe_call_converts_panic() {
        let ctx = Context::background();
        let result: Result<u32, AgentError> = safe_call(&ctx, "parser", "invoke", || {
            let values: Vec<u32> = Vec::new();
            Ok(values[1])
        });

        let err = result.unwrap_err();
        assert_eq!(err.code, ErrorCode::Internal);
        assert_eq!(err.component.as_deref(), Some("parser"));
        assert_eq!(err.operation.as_deref(), Some("invoke"));
        assert!(err.stack_trace().is_some());
        let value = err.context_value("panic_value").unwrap().as_str().unwrap();
        assert!(value.contains("index out of bounds"));
    }

    #[test]
    fn test_safe_call_passes_results_through() {
        let ctx = Context::background();
        assert_eq!(safe_call(&ctx, "c", "op", || Ok(5)).unwrap(), 5);

        let err = safe_call::<_, ()>(&ctx, "c", "op", || {
            Err(AgentError::new(ErrorCode::InvalidInput, "bad"))
        })
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
    }

    #[tokio::test]
    async fn test_safe_invoke_converts_panic() {
        let ctx = Context::background();
        let err = safe_invoke(&ctx, "plugin", "invoke", async {
            tokio::task::yield_now().await;
            if ctx.err().is_none() {
                panic!("plugin exploded");
            }
            Ok(())
        })
        .await
        .unwrap_err();

        assert_eq!(err.code, ErrorCode::Internal);
        assert!(err.message.contains("plugin exploded"));
    }

    #[tokio::test]
    async fn test_safe_stream_ends_with_error_chunk() {
        let ctx = Context::background();
        let source = futures::stream::iter(0..3)
            .map(|i| {
                if i == 1 {
                    panic!("bad chunk");
                }
                StreamChunk::data(i)
            })
            .boxed();

        let chunks: Vec<_> = safe_stream(&ctx, "source", source).collect().await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].data, Some(0));
        assert!(chunks[1].done);
        assert_eq!(chunks[1].error.as_ref().unwrap().code, ErrorCode::Internal);
    }

    struct CountingMetrics(AtomicUsize);

    impl PanicMetricsCollector for CountingMetrics {
        fn record_panic(&self, component: &str, _operation: &str, _panic_value: &str) {
            if component == "metrics-probe" {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn test_registry_metrics_hook() {
        let metrics = Arc::new(CountingMetrics(AtomicUsize::new(0)));
        let registry = PanicHandlerRegistry::global();
        registry.set_metrics(Some(metrics.clone()));

        let ctx = Context::background();
        let _ = safe_call::<_, ()>(&ctx, "metrics-probe", "invoke", || panic!("counted"));
        registry.set_metrics(None);

        assert_eq!(metrics.0.load(Ordering::SeqCst), 1);
    }
}
