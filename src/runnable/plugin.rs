// Dynamic plugin boundary
// Typed runnables cross it as DynamicValue and come back through adapters

//! # Plugins
//!
//! Plugins are registered and looked up by name, so their types are not
//! known at compile time. This module provides two layers:
//!
//! 1. [`DynamicRunnable`]: invoke, stream and batch over [`DynamicValue`]
//! 2. adapters in both directions: [`TypedToDynamic`] exposes a typed
//!    [`Runnable`] dynamically, [`DynamicToTyped`] gives a dynamic plugin a
//!    typed face again
//!
//! Converting a [`DynamicValue`] to a concrete type tries a direct downcast
//! first and falls back to a JSON round-trip. When neither works the error
//! has code `type_mismatch` and carries the expected and actual type names.
//!
//! ```rust
//! use bulwark::runnable::plugin::{PluginRegistry, PluginMetadata};
//! use bulwark::{Context, Runnable, RunnableFunc};
//!
//! # tokio_test::block_on(async {
//! let registry = PluginRegistry::new();
//! let upper = RunnableFunc::new(|_ctx: Context, s: String| async move { Ok(s.to_uppercase()) });
//! registry.register_typed("upper", upper, None).unwrap();
//!
//! let plugin = registry.get_typed::<String, String>("upper").unwrap();
//! let out = plugin.invoke(&Context::background(), "hi".to_string()).await.unwrap();
//! assert_eq!(out, "HI");
//! # });
//! ```
//!
//! ## Rust Learning Notes:
//!
//! ### `Any` and `TypeId`
//! `Box<dyn Any + Send>` can hold any `'static` value and be downcast back
//! with `downcast::<T>()`. `TypeId::of::<T>()` identifies a type at runtime,
//! which is how `get_typed` checks a plugin's signature before adapting it.

use async_trait::async_trait;
use futures::StreamExt;
use lazy_static::lazy_static;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::info;

use super::panic::safe_invoke;
use super::{until_done, ChunkStream, Runnable, StreamChunk};
use crate::context::Context;
use crate::error::{AgentError, ErrorCode};

const COMPONENT: &str = "plugin_registry";

/// A value of any type crossing the plugin boundary
pub struct DynamicValue {
    value: Box<dyn Any + Send>,
    type_name: &'static str,
    json: Option<Value>,
}

impl DynamicValue {
    /// Wrap a value that is only reachable by downcasting
    pub fn new<T: Any + Send>(value: T) -> Self {
        Self {
            value: Box::new(value),
            type_name: type_name::<T>(),
            json: None,
        }
    }

    /// Wrap a value and keep its JSON projection for conversion to other types
    pub fn serializable<T: Any + Send + Serialize>(value: T) -> Self {
        let json = serde_json::to_value(&value).ok();
        Self {
            value: Box::new(value),
            type_name: type_name::<T>(),
            json,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// The JSON form, when the value was created serializable or is a `Value`
    pub fn to_json(&self) -> Option<Value> {
        self.json
            .clone()
            .or_else(|| self.value.downcast_ref::<Value>().cloned())
    }

    /// Convert to `T`: downcast, then JSON round-trip, else `type_mismatch`
    pub fn convert<T: Any + DeserializeOwned>(self) -> Result<T, AgentError> {
        let Self {
            value,
            type_name: actual,
            json,
        } = self;

        let value = match value.downcast::<T>() {
            Ok(typed) => return Ok(*typed),
            Err(value) => value,
        };

        let json = json.or_else(|| value.downcast_ref::<Value>().cloned());
        match json {
            Some(json) => serde_json::from_value::<T>(json).map_err(|err| {
                AgentError::wrap(
                    err,
                    ErrorCode::TypeMismatch,
                    format!("cannot convert {} to {}", actual, type_name::<T>()),
                )
                .with_context("expected", type_name::<T>())
                .with_context("actual", actual)
            }),
            None => Err(AgentError::type_mismatch(type_name::<T>(), actual)),
        }
    }
}

impl fmt::Debug for DynamicValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicValue")
            .field("type_name", &self.type_name)
            .field("json", &self.json)
            .finish()
    }
}

impl From<Value> for DynamicValue {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

/// Runtime description of a plugin's signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    pub name: String,
    pub description: String,
    pub input_type: &'static str,
    pub output_type: &'static str,
    /// `None` when the plugin accepts anything convertible
    pub input_type_id: Option<TypeId>,
    pub output_type_id: Option<TypeId>,
}

impl TypeInfo {
    pub fn of<I: Any, O: Any>(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            input_type: type_name::<I>(),
            output_type: type_name::<O>(),
            input_type_id: Some(TypeId::of::<I>()),
            output_type_id: Some(TypeId::of::<O>()),
        }
    }

    /// A signature that is checked only when values are converted
    pub fn untyped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            input_type: "any",
            output_type: "any",
            input_type_id: None,
            output_type_id: None,
        }
    }
}

#[async_trait]
pub trait DynamicRunnable: Send + Sync {
    async fn invoke_dynamic(&self, ctx: &Context, input: DynamicValue) -> Result<DynamicValue, AgentError>;

    async fn stream_dynamic(
        &self,
        ctx: &Context,
        input: DynamicValue,
    ) -> Result<ChunkStream<DynamicValue>, AgentError>;

    async fn batch_dynamic(
        &self,
        ctx: &Context,
        inputs: Vec<DynamicValue>,
    ) -> Result<Vec<DynamicValue>, AgentError>;

    fn type_info(&self) -> TypeInfo;
}

/// Exposes a typed [`Runnable`] as a [`DynamicRunnable`]
pub struct TypedToDynamic<I, O> {
    inner: Arc<dyn Runnable<I, O>>,
    name: String,
}

impl<I, O> TypedToDynamic<I, O>
where
    I: Any + Send + DeserializeOwned,
    O: Any + Send + Serialize,
{
    pub fn new(inner: Arc<dyn Runnable<I, O>>, name: impl Into<String>) -> Self {
        Self {
            inner,
            name: name.into(),
        }
    }

    fn input(&self, input: DynamicValue, operation: &str) -> Result<I, AgentError> {
        input
            .convert::<I>()
            .map_err(|err| err.with_component(self.name.clone()).with_operation(operation))
    }
}

#[async_trait]
impl<I, O> DynamicRunnable for TypedToDynamic<I, O>
where
    I: Any + Send + DeserializeOwned,
    O: Any + Send + Serialize,
{
    async fn invoke_dynamic(&self, ctx: &Context, input: DynamicValue) -> Result<DynamicValue, AgentError> {
        let typed = self.input(input, "invoke")?;
        let output = safe_invoke(ctx, &self.name, "invoke", self.inner.invoke(ctx, typed)).await?;
        Ok(DynamicValue::serializable(output))
    }

    async fn stream_dynamic(
        &self,
        ctx: &Context,
        input: DynamicValue,
    ) -> Result<ChunkStream<DynamicValue>, AgentError> {
        let typed = self.input(input, "stream")?;
        let chunks = safe_invoke(ctx, &self.name, "stream", self.inner.stream(ctx, typed)).await?;
        Ok(chunks
            .map(|chunk| StreamChunk {
                data: chunk.data.map(DynamicValue::serializable),
                error: chunk.error,
                done: chunk.done,
            })
            .boxed())
    }

    async fn batch_dynamic(
        &self,
        ctx: &Context,
        inputs: Vec<DynamicValue>,
    ) -> Result<Vec<DynamicValue>, AgentError> {
        let mut typed = Vec::with_capacity(inputs.len());
        for (index, input) in inputs.into_iter().enumerate() {
            typed.push(self.input(input, "batch").map_err(|err| err.with_context("index", index))?);
        }
        let outputs = safe_invoke(ctx, &self.name, "batch", self.inner.batch(ctx, typed)).await?;
        Ok(outputs.into_iter().map(DynamicValue::serializable).collect())
    }

    fn type_info(&self) -> TypeInfo {
        TypeInfo::of::<I, O>(self.name.clone())
    }
}

/// Gives a [`DynamicRunnable`] a typed [`Runnable`] interface
pub struct DynamicToTyped<I, O> {
    inner: Arc<dyn DynamicRunnable>,
    _types: PhantomData<fn(I) -> O>,
}

impl<I, O> DynamicToTyped<I, O> {
    pub fn new(inner: Arc<dyn DynamicRunnable>) -> Self {
        Self {
            inner,
            _types: PhantomData,
        }
    }
}

impl<I, O> Clone for DynamicToTyped<I, O> {
    fn clone(&self) -> Self {
        Self::new(self.inner.clone())
    }
}

impl<I, O> fmt::Debug for DynamicToTyped<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicToTyped")
            .field("plugin", &self.inner.type_info().name)
            .finish()
    }
}

#[async_trait]
impl<I, O> Runnable<I, O> for DynamicToTyped<I, O>
where
    I: Any + Send + Serialize,
    O: Any + Send + DeserializeOwned,
{
    async fn invoke(&self, ctx: &Context, input: I) -> Result<O, AgentError> {
        let name = self.inner.type_info().name;
        let output = safe_invoke(
            ctx,
            &name,
            "invoke",
            self.inner.invoke_dynamic(ctx, DynamicValue::serializable(input)),
        )
        .await?;
        output.convert::<O>()
    }

    async fn stream(&self, ctx: &Context, input: I) -> Result<ChunkStream<O>, AgentError> {
        let name = self.inner.type_info().name;
        let chunks = safe_invoke(
            ctx,
            &name,
            "stream",
            self.inner.stream_dynamic(ctx, DynamicValue::serializable(input)),
        )
        .await?;

        let typed = chunks
            .map(|chunk| match chunk.data.map(DynamicValue::convert::<O>) {
                Some(Err(err)) => StreamChunk::failed(err),
                data => StreamChunk {
                    data: data.and_then(Result::ok),
                    error: chunk.error,
                    done: chunk.done,
                },
            })
            .boxed();
        Ok(until_done(typed))
    }

    async fn batch(&self, ctx: &Context, inputs: Vec<I>) -> Result<Vec<O>, AgentError> {
        let name = self.inner.type_info().name;
        let dynamic = inputs.into_iter().map(DynamicValue::serializable).collect();
        let outputs = safe_invoke(ctx, &name, "batch", self.inner.batch_dynamic(ctx, dynamic)).await?;
        outputs.into_iter().map(DynamicValue::convert::<O>).collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginMetadata {
    pub name: String,
    pub version: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(skip)]
    pub type_info: Option<TypeInfo>,
}

struct PluginEntry {
    plugin: Arc<dyn DynamicRunnable>,
    metadata: PluginMetadata,
}

/// Named plugins behind a read-write lock
#[derive(Default)]
pub struct PluginRegistry {
    plugins: RwLock<HashMap<String, PluginEntry>>,
}

lazy_static! {
    static ref GLOBAL_PLUGINS: PluginRegistry = PluginRegistry::new();
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> &'static PluginRegistry {
        &GLOBAL_PLUGINS
    }

    pub fn register(
        &self,
        name: &str,
        plugin: Arc<dyn DynamicRunnable>,
        metadata: Option<PluginMetadata>,
    ) -> Result<(), AgentError> {
        let mut plugins = self.plugins.write();
        if plugins.contains_key(name) {
            return Err(AgentError::already_exists(format!("plugin {}", name))
                .with_component(COMPONENT)
                .with_operation("register"));
        }

        let mut metadata = metadata.unwrap_or_default();
        metadata.name = name.to_string();
        metadata.type_info = Some(plugin.type_info());
        plugins.insert(name.to_string(), PluginEntry { plugin, metadata });
        info!(plugin = %name, "plugin registered");
        Ok(())
    }

    /// Register a typed runnable through [`TypedToDynamic`]
    pub fn register_typed<I, O, R>(
        &self,
        name: &str,
        runnable: R,
        metadata: Option<PluginMetadata>,
    ) -> Result<(), AgentError>
    where
        I: Any + Send + DeserializeOwned,
        O: Any + Send + Serialize,
        R: Runnable<I, O> + 'static,
    {
        let adapter = TypedToDynamic::new(Arc::new(runnable), name);
        self.register(name, Arc::new(adapter), metadata)
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn DynamicRunnable>, AgentError> {
        self.plugins
            .read()
            .get(name)
            .map(|entry| entry.plugin.clone())
            .ok_or_else(|| {
                AgentError::not_found(format!("plugin {}", name))
                    .with_component(COMPONENT)
                    .with_operation("get")
            })
    }

    /// Look up a plugin and adapt it to `Runnable<I, O>`.
    ///
    /// A plugin that declares its types must declare exactly `I` and `O`.
    pub fn get_typed<I, O>(&self, name: &str) -> Result<DynamicToTyped<I, O>, AgentError>
    where
        I: Any + Send + Serialize,
        O: Any + Send + DeserializeOwned,
    {
        let plugin = self.get(name)?;
        let info = plugin.type_info();

        let checks = [
            ("input", info.input_type_id, TypeId::of::<I>(), type_name::<I>(), info.input_type),
            ("output", info.output_type_id, TypeId::of::<O>(), type_name::<O>(), info.output_type),
        ];
        for (side, declared, wanted, expected, actual) in checks {
            if declared.map_or(false, |declared| declared != wanted) {
                return Err(AgentError::type_mismatch(expected, actual)
                    .with_component(COMPONENT)
                    .with_operation("get_typed")
                    .with_context("side", side)
                    .with_context("name", name));
            }
        }
        Ok(DynamicToTyped::new(plugin))
    }

    pub fn unregister(&self, name: &str) -> Result<(), AgentError> {
        match self.plugins.write().remove(name) {
            Some(_) => {
                info!(plugin = %name, "plugin unregistered");
                Ok(())
            }
            None => Err(AgentError::not_found(format!("plugin {}", name))
                .with_component(COMPONENT)
                .with_operation("unregister")),
        }
    }

    /// Registered names, sorted
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn metadata(&self, name: &str) -> Result<PluginMetadata, AgentError> {
        self.plugins
            .read()
            .get(name)
            .map(|entry| entry.metadata.clone())
            .ok_or_else(|| {
                AgentError::not_found(format!("plugin {}", name))
                    .with_component(COMPONENT)
                    .with_operation("metadata")
            })
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry").field("plugins", &self.list()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runnable::RunnableFunc;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u32,
        amount: f64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Receipt {
        order_id: u32,
        total: f64,
    }

    fn checkout() -> RunnableFunc<Order, Receipt> {
        RunnableFunc::new(|_ctx: Context, order: Order| async move {
            Ok(Receipt {
                order_id: order.id,
                total: order.amount * 1.5,
            })
        })
    }

    #[test]
    fn test_convert_downcast_then_json() {
        let direct = DynamicValue::new(7_u64);
        assert_eq!(direct.convert::<u64>().unwrap(), 7);

        let order = DynamicValue::serializable(Order { id: 1, amount: 2.0 });
        let as_json: Value = order.convert().unwrap();
        assert_eq!(as_json, json!({"id": 1, "amount": 2.0}));

        let from_json = DynamicValue::from(json!({"id": 9, "amount": 1.0}));
        assert_eq!(from_json.convert::<Order>().unwrap(), Order { id: 9, amount: 1.0 });
    }

    #[test]
    fn test_convert_mismatch_names_types() {
        let err = DynamicValue::new(std::time::Duration::from_secs(1))
            .convert::<String>()
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::TypeMismatch);
        assert_eq!(err.context_value("expected").unwrap(), &json!(type_name::<String>()));
        assert!(err.context_value("actual").unwrap().as_str().unwrap().contains("Duration"));

        let err = DynamicValue::from(json!("not an order")).convert::<Order>().unwrap_err();
        assert_eq!(err.code, ErrorCode::TypeMismatch);
    }

    #[tokio::test]
    async fn test_registry_round_trip() {
        let registry = PluginRegistry::new();
        registry.register_typed("checkout", checkout(), None).unwrap();

        let typed = registry.get_typed::<Order, Receipt>("checkout").unwrap();
        let ctx = Context::background();
        let receipt = typed.invoke(&ctx, Order { id: 3, amount: 10.0 }).await.unwrap();
        assert_eq!(receipt, Receipt { order_id: 3, total: 15.0 });

        let batch = typed
            .batch(&ctx, vec![Order { id: 1, amount: 1.0 }, Order { id: 2, amount: 2.0 }])
            .await
            .unwrap();
        assert_eq!(batch.iter().map(|r| r.order_id).collect::<Vec<_>>(), vec![1, 2]);

        let dynamic = registry.get("checkout").unwrap();
        let out = dynamic
            .invoke_dynamic(&ctx, json!({"id": 4, "amount": 2.0}).into())
            .await
            .unwrap();
        assert_eq!(out.convert::<Receipt>().unwrap().total, 3.0);
    }

    #[tokio::test]
    async fn test_registry_errors() {
        let registry = PluginRegistry::new();
        registry.register_typed("checkout", checkout(), None).unwrap();

        let dup = registry.register_typed("checkout", checkout(), None).unwrap_err();
        assert_eq!(dup.code, ErrorCode::AlreadyExists);

        let mismatch = registry.get_typed::<String, Receipt>("checkout").unwrap_err();
        assert_eq!(mismatch.code, ErrorCode::TypeMismatch);

        assert_eq!(registry.get("missing").err().unwrap().code, ErrorCode::NotFound);
        assert_eq!(registry.list(), vec!["checkout".to_string()]);
        assert_eq!(
            registry.metadata("checkout").unwrap().type_info.unwrap().input_type,
            type_name::<Order>()
        );

        registry.unregister("checkout").unwrap();
        assert!(registry.list().is_empty());
        assert_eq!(registry.unregister("checkout").unwrap_err().code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_dynamic_input_mismatch() {
        let registry = PluginRegistry::new();
        registry.register_typed("checkout", checkout(), None).unwrap();

        let err = registry
            .get("checkout")
            .unwrap()
            .invoke_dynamic(&Context::background(), DynamicValue::new(5_u8))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::TypeMismatch);
        assert_eq!(err.component.as_deref(), Some("checkout"));
    }

    #[tokio::test]
    async fn test_stream_through_adapters() {
        let registry = PluginRegistry::new();
        registry.register_typed("checkout", checkout(), None).unwrap();
        let typed = registry.get_typed::<Order, Receipt>("checkout").unwrap();

        let chunks: Vec<_> = typed
            .stream(&Context::background(), Order { id: 5, amount: 4.0 })
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].done);
        assert_eq!(chunks[0].data.as_ref().unwrap().order_id, 5);
    }
}
