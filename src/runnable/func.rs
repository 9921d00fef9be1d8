// A Runnable backed by an async closure
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use super::callback::{notify_end, notify_error, notify_start};
use super::panic::safe_invoke;
use super::{Configurable, Runnable, RunnableConfig};
use crate::context::Context;
use crate::error::AgentError;

type BoxedFn<I, O> = Arc<dyn Fn(Context, I) -> BoxFuture<'static, Result<O, AgentError>> + Send + Sync>;

/// Wraps a plain async function as a [`Runnable`].
///
/// `invoke` fires `on_start`, runs the function under the panic shim, then
/// fires `on_error` or `on_end`.
///
/// ```rust
/// use bulwark::{Context, Runnable, RunnableFunc};
///
/// # tokio_test::block_on(async {
/// let double = RunnableFunc::new(|_ctx: Context, n: i64| async move { Ok(n * 2) });
/// assert_eq!(double.invoke(&Context::background(), 21).await.unwrap(), 42);
/// # });
/// ```
pub struct RunnableFunc<I, O> {
    name: String,
    func: BoxedFn<I, O>,
    config: RunnableConfig,
}

impl<I, O> RunnableFunc<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(Context, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, AgentError>> + Send + 'static,
    {
        Self {
            name: "runnable_func".to_string(),
            func: Arc::new(move |ctx, input| Box::pin(func(ctx, input))),
            config: RunnableConfig::default(),
        }
    }

    /// Name reported to callbacks and in panic errors
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<I, O> Clone for RunnableFunc<I, O> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            func: self.func.clone(),
            config: self.config.clone(),
        }
    }
}

impl<I, O> fmt::Debug for RunnableFunc<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnableFunc")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}

impl<I, O> Configurable for RunnableFunc<I, O> {
    fn config(&self) -> &RunnableConfig {
        &self.config
    }

    fn with_config(&self, config: RunnableConfig) -> Self {
        Self {
            name: self.name.clone(),
            func: self.func.clone(),
            config,
        }
    }
}

#[async_trait]
impl<I, O> Runnable<I, O> for RunnableFunc<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    async fn invoke(&self, ctx: &Context, input: I) -> Result<O, AgentError> {
        let callbacks = &self.config.callbacks;
        notify_start(callbacks, ctx, &self.name, &input as &dyn Any);

        let func = self.func.clone();
        let call_ctx = ctx.clone();
        let result = safe_invoke(ctx, &self.name, "invoke", async move {
            func(call_ctx, input).await
        })
        .await;

        match &result {
            Ok(output) => notify_end(callbacks, ctx, &self.name, output as &dyn Any),
            Err(err) => notify_error(callbacks, ctx, &self.name, err),
        }
        result
    }

    fn max_concurrency(&self) -> usize {
        self.config.concurrency()
    }
}
