// Structured errors for the execution framework
// Every runnable, agent, chain, plugin and lifecycle failure is an AgentError

//! # Structured Execution Errors
//!
//! [`AgentError`] is the single error type that flows through runnables,
//! agents, chains, the plugin boundary and the lifecycle manager. It carries
//! enough structure for callers to branch on a failure without parsing text:
//!
//! - **code**: a machine-readable [`ErrorCode`] (`internal`, `type_mismatch`, ...)
//! - **component / operation**: where the failure happened
//! - **context**: free-form JSON details (stage index, panic value, type names)
//! - **cause**: the wrapped lower-level error, exposed through `source()`
//! - **stack**: a captured stack trace, set for recovered panics
//!
//! ## Rust Learning Notes:
//!
//! ### Builder-style construction
//! Errors are values. The `with_*` methods take `self` by value and return it,
//! so an error can be built in one expression:
//!
//! ```rust
//! use bulwark::{AgentError, ErrorCode};
//!
//! let err = AgentError::new(ErrorCode::InvalidInput, "task must not be empty")
//!     .with_component("summarizer")
//!     .with_operation("invoke")
//!     .with_context("field", "task");
//! assert_eq!(err.code, ErrorCode::InvalidInput);
//! ```
//!
//! ### Error chains
//! `std::error::Error::source` returns the wrapped cause. Use [`AgentError::chain`]
//! to walk every structured error in the chain.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;

use crate::context::ContextError;

/// Machine-readable classification of an [`AgentError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// A recovered panic or an invariant violation
    Internal,
    AgentExecution,
    AgentConfig,
    ChainExecution,
    InvalidInput,
    InvalidOutput,
    InvalidConfig,
    NotImplemented,
    NotFound,
    AlreadyExists,
    TypeMismatch,
    DependencyCycle,
    StreamRead,
    ContextCanceled,
    ContextTimeout,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Internal => "internal",
            ErrorCode::AgentExecution => "agent_execution",
            ErrorCode::AgentConfig => "agent_config",
            ErrorCode::ChainExecution => "chain_execution",
            ErrorCode::InvalidInput => "invalid_input",
            ErrorCode::InvalidOutput => "invalid_output",
            ErrorCode::InvalidConfig => "invalid_config",
            ErrorCode::NotImplemented => "not_implemented",
            ErrorCode::NotFound => "not_found",
            ErrorCode::AlreadyExists => "already_exists",
            ErrorCode::TypeMismatch => "type_mismatch",
            ErrorCode::DependencyCycle => "dependency_cycle",
            ErrorCode::StreamRead => "stream_read",
            ErrorCode::ContextCanceled => "context_canceled",
            ErrorCode::ContextTimeout => "context_timeout",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Structured error produced by the execution framework
pub struct AgentError {
    pub code: ErrorCode,
    pub message: String,
    pub component: Option<String>,
    pub operation: Option<String>,
    pub context: BTreeMap<String, Value>,
    pub stack: Option<String>,
    cause: Option<BoxError>,
}

impl AgentError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            component: None,
            operation: None,
            context: BTreeMap::new(),
            stack: None,
            cause: None,
        }
    }

    /// Wrap a lower-level error under a new code and message
    pub fn wrap<E>(cause: E, code: ErrorCode, message: impl Into<String>) -> Self
    where
        E: Into<BoxError>,
    {
        let mut err = Self::new(code, message);
        err.cause = Some(cause.into());
        err
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        let what = what.into();
        Self::new(ErrorCode::NotFound, format!("{} not found", what)).with_context("name", what)
    }

    pub fn already_exists(what: impl Into<String>) -> Self {
        let what = what.into();
        Self::new(ErrorCode::AlreadyExists, format!("{} already exists", what))
            .with_context("name", what)
    }

    pub fn type_mismatch(expected: &str, actual: &str) -> Self {
        Self::new(
            ErrorCode::TypeMismatch,
            format!("type mismatch: expected {}, got {}", expected, actual),
        )
        .with_context("expected", expected)
        .with_context("actual", actual)
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Annotate a failure of one stage of a composite runnable.
    ///
    /// The stage error becomes the cause and its code is kept, so a panic in
    /// stage 1 still surfaces as `internal` with `index = 1`.
    pub fn at_stage(self, component: &str, index: usize) -> Self {
        let code = self.code;
        let message = format!("{} stage {} failed: {}", component, index, self.message);
        AgentError::wrap(self, code, message)
            .with_component(component)
            .with_operation("invoke")
            .with_context("index", index)
    }

    pub fn is(&self, code: ErrorCode) -> bool {
        self.chain().any(|e| e.code == code)
    }

    /// Every structured error in the cause chain, starting with `self`
    pub fn chain(&self) -> impl Iterator<Item = &AgentError> + '_ {
        let mut next: Option<&AgentError> = Some(self);
        std::iter::from_fn(move || {
            let current = next?;
            next = current
                .cause
                .as_deref()
                .and_then(|c| c.downcast_ref::<AgentError>());
            Some(current)
        })
    }

    /// The first stack trace found along the cause chain
    pub fn stack_trace(&self) -> Option<&str> {
        self.chain().find_map(|e| e.stack.as_deref())
    }

    /// The first value for `key` found along the cause chain
    pub fn context_value(&self, key: &str) -> Option<&Value> {
        self.chain().find_map(|e| e.context.get(key))
    }
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.code)?;
        if let Some(component) = &self.component {
            write!(f, " {}", component)?;
            if let Some(operation) = &self.operation {
                write!(f, ".{}", operation)?;
            }
            f.write_str(":")?;
        }
        write!(f, " {}", self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl fmt::Debug for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentError")
            .field("code", &self.code)
            .field("message", &self.message)
            .field("component", &self.component)
            .field("operation", &self.operation)
            .field("context", &self.context)
            .field("has_stack", &self.stack.is_some())
            .field("cause", &self.cause)
            .finish()
    }
}

impl StdError for AgentError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn StdError + 'static))
    }
}

impl From<ContextError> for AgentError {
    fn from(err: ContextError) -> Self {
        let code = match err {
            ContextError::Canceled => ErrorCode::ContextCanceled,
            ContextError::DeadlineExceeded => ErrorCode::ContextTimeout,
        };
        AgentError::wrap(err, code, err.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::wrap(err, ErrorCode::InvalidInput, "json conversion failed")
    }
}
