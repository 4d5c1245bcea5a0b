use std::any::Any;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{ConfigurationError, SchemaError, ToolError};
use crate::schema::{SchemaGenerator, ToolDescriptor};

/// A callable the model can request by name.
#[async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> &ToolDescriptor;

    /// Run the tool with arguments already validated against
    /// [`Tool::descriptor`]. The returned text is handed back to the model.
    async fn invoke(&self, args: Value) -> Result<String, ToolError>;
}

/// Wraps an async function of one typed argument struct.
///
/// The descriptor is derived from `A` when the tool is created, so a bad
/// signature fails at registration instead of at call time.
pub struct FunctionTool<A, F> {
    descriptor: ToolDescriptor,
    func: F,
    _args: PhantomData<fn(A)>,
}

impl<A, F, Fut, R, E> FunctionTool<A, F>
where
    A: DeserializeOwned + JsonSchema,
    F: Fn(A) -> Fut + Send + Sync,
    Fut: Future<Output = Result<R, E>> + Send,
    R: Serialize,
    E: fmt::Display,
{
    pub fn new(
        name: impl AsRef<str>,
        description: impl AsRef<str>,
        func: F,
    ) -> Result<Self, SchemaError> {
        let descriptor = SchemaGenerator::describe::<A>(name.as_ref(), description.as_ref())?;
        Ok(Self {
            descriptor,
            func,
            _args: PhantomData,
        })
    }
}

impl<A, F> fmt::Debug for FunctionTool<A, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionTool")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<A, F, Fut, R, E> Tool for FunctionTool<A, F>
where
    A: DeserializeOwned + JsonSchema + Send,
    F: Fn(A) -> Fut + Send + Sync,
    Fut: Future<Output = Result<R, E>> + Send,
    R: Serialize + Send,
    E: fmt::Display + Send,
{
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, args: Value) -> Result<String, ToolError> {
        let name = self.descriptor.name.as_str();
        let parsed: A =
            serde_json::from_value(args).map_err(|err| ToolError::invalid(name, err.to_string()))?;

        let future = std::panic::catch_unwind(AssertUnwindSafe(|| (self.func)(parsed)))
            .map_err(|panic| ToolError::execution(name, panic_message(panic.as_ref())))?;

        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(Ok(output)) => render_output(name, &output),
            Ok(Err(err)) => Err(ToolError::execution(name, err.to_string())),
            Err(panic) => Err(ToolError::execution(name, panic_message(panic.as_ref()))),
        }
    }
}

fn render_output<R: Serialize>(tool: &str, output: &R) -> Result<String, ToolError> {
    match serde_json::to_value(output) {
        Ok(Value::String(text)) => Ok(text),
        Ok(value) => Ok(value.to_string()),
        Err(err) => Err(ToolError::execution(
            tool,
            format!("result could not be serialized: {err}"),
        )),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown cause".to_string());
    format!("panicked: {detail}")
}

/// Insertion-ordered set of tools keyed by name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: IndexMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), ConfigurationError> {
        let name = tool.descriptor().name.clone();
        if self.tools.contains_key(&name) {
            return Err(ConfigurationError::new(format!(
                "tool `{name}` is registered twice"
            )));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools
            .values()
            .map(|tool| tool.descriptor().clone())
            .collect()
    }

    /// Resolve, validate and run one call. `timeout` bounds the tool itself.
    pub async fn invoke(
        &self,
        name: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> Result<String, ToolError> {
        let tool = self.tools.get(name).ok_or_else(|| ToolError::NotFound {
            name: name.to_string(),
        })?;
        let args = tool.descriptor().validate_arguments(args)?;
        match timeout {
            Some(limit) => tokio::time::timeout(limit, tool.invoke(args))
                .await
                .map_err(|_| ToolError::execution(name, format!("timed out after {limit:?}")))?,
            None => tool.invoke(args).await,
        }
    }
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.tools.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize, JsonSchema)]
    struct ForecastArgs {
        city: String,
        #[serde(default = "default_days")]
        days: i64,
    }

    fn default_days() -> i64 {
        3
    }

    fn forecast_tool() -> Arc<dyn Tool> {
        let tool = FunctionTool::new(
            "forecast",
            "Weather forecast for a city",
            |args: ForecastArgs| async move {
                if args.city.is_empty() {
                    return Err("city is empty".to_string());
                }
                Ok(format!("{} days of sun in {}", args.days, args.city))
            },
        )
        .unwrap();
        Arc::new(tool)
    }

    #[derive(Deserialize, JsonSchema)]
    struct Empty {}

    #[tokio::test]
    async fn invokes_with_defaults_applied() {
        let mut registry = ToolRegistry::new();
        registry.register(forecast_tool()).unwrap();

        let out = registry
            .invoke("forecast", json!({ "city": "Oslo" }), None)
            .await
            .unwrap();
        assert_eq!(out, "3 days of sun in Oslo");

        let out = registry
            .invoke("forecast", json!(r#"{"city":"Rome","days":"2"}"#), None)
            .await
            .unwrap();
        assert_eq!(out, "2 days of sun in Rome");
    }

    #[tokio::test]
    async fn reports_missing_tool_and_bad_arguments() {
        let mut registry = ToolRegistry::new();
        registry.register(forecast_tool()).unwrap();

        let err = registry.invoke("nope", json!({}), None).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound { .. }));

        let err = registry
            .invoke("forecast", json!({ "days": 1 }), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }

    #[tokio::test]
    async fn tool_errors_and_panics_become_execution_errors() {
        let mut registry = ToolRegistry::new();
        registry.register(forecast_tool()).unwrap();
        registry
            .register(Arc::new(
                FunctionTool::new("explode", "Always panics", |_: Empty| async move {
                    if true {
                        panic!("boom");
                    }
                    Ok::<_, String>(json!({}))
                })
                .unwrap(),
            ))
            .unwrap();

        let err = registry
            .invoke("forecast", json!({ "city": "" }), None)
            .await
            .unwrap_err();
        assert_eq!(err, ToolError::execution("forecast", "city is empty"));

        let err = registry.invoke("explode", json!({}), None).await.unwrap_err();
        match err {
            ToolError::Execution { reason, .. } => assert!(reason.contains("boom")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn tool_timeout_is_an_execution_error() {
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(
                FunctionTool::new("slow", "Sleeps", |_: Empty| async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok::<_, String>("done")
                })
                .unwrap(),
            ))
            .unwrap();

        let err = registry
            .invoke("slow", json!({}), Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn structured_results_render_as_json() {
        let tool = FunctionTool::new("sum", "Adds numbers", |args: SumArgs| async move {
            Ok::<_, String>(json!({ "total": args.values.iter().sum::<i64>() }))
        })
        .unwrap();
        let out = tool.invoke(json!({ "values": [1, 2, 3] })).await.unwrap();
        assert_eq!(out, r#"{"total":6}"#);
    }

    #[derive(Deserialize, JsonSchema)]
    struct SumArgs {
        values: Vec<i64>,
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(forecast_tool()).unwrap();
        let err = registry.register(forecast_tool()).unwrap_err();
        assert!(err.to_string().contains("forecast"));
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["forecast"]);
    }
}
