// Invocation callbacks
use std::any::Any;
use std::sync::Arc;
use tracing::{debug, warn};

use super::panic::safe_call;
use crate::context::Context;
use crate::error::AgentError;

/// Observer of a runnable's invocations.
///
/// Payloads arrive as `&dyn Any`; a callback that knows the concrete input or
/// output type can `downcast_ref` it. A returned error is logged and never
/// fails the invocation.
pub trait Callback: Send + Sync {
    fn on_start(&self, _ctx: &Context, _component: &str, _input: &dyn Any) -> Result<(), AgentError> {
        Ok(())
    }

    fn on_end(&self, _ctx: &Context, _component: &str, _output: &dyn Any) -> Result<(), AgentError> {
        Ok(())
    }

    fn on_error(&self, _ctx: &Context, _component: &str, _error: &AgentError) -> Result<(), AgentError> {
        Ok(())
    }
}

/// Logs every event at debug level, errors at warn
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingCallback;

impl Callback for LoggingCallback {
    fn on_start(&self, _ctx: &Context, component: &str, _input: &dyn Any) -> Result<(), AgentError> {
        debug!(component = %component, "invocation started");
        Ok(())
    }

    fn on_end(&self, _ctx: &Context, component: &str, _output: &dyn Any) -> Result<(), AgentError> {
        debug!(component = %component, "invocation finished");
        Ok(())
    }

    fn on_error(&self, _ctx: &Context, component: &str, error: &AgentError) -> Result<(), AgentError> {
        warn!(component = %component, error = %error, "invocation failed");
        Ok(())
    }
}

fn report(component: &str, event: &str, result: Result<(), AgentError>) {
    if let Err(err) = result {
        warn!(component = %component, event = %event, error = %err, "callback failed");
    }
}

pub(crate) fn notify_start(callbacks: &[Arc<dyn Callback>], ctx: &Context, component: &str, input: &dyn Any) {
    for callback in callbacks {
        let result = safe_call(ctx, component, "on_start", || callback.on_start(ctx, component, input));
        report(component, "on_start", result);
    }
}

pub(crate) fn notify_end(callbacks: &[Arc<dyn Callback>], ctx: &Context, component: &str, output: &dyn Any) {
    for callback in callbacks {
        let result = safe_call(ctx, component, "on_end", || callback.on_end(ctx, component, output));
        report(component, "on_end", result);
    }
}

pub(crate) fn notify_error(callbacks: &[Arc<dyn Callback>], ctx: &Context, component: &str, error: &AgentError) {
    for callback in callbacks {
        let result = safe_call(ctx, component, "on_error", || callback.on_error(ctx, component, error));
        report(component, "on_error", result);
    }
}
