use crate::protocol::models::{FunctionCall, ToolDeclaration, ToolResponse};
use crate::{Error, Result};
use futures::FutureExt as _;
use schemars::JsonSchema;
use schemars::schema::RootSchema;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

type ToolHandler = Arc<dyn Fn(Value) -> BoxFuture<Result<Value>> + Send + Sync>;

#[derive(Clone, Debug)]
pub struct ToolDefinition {
    pub name: String,
    pub description: Option<String>,
    pub schema: RootSchema,
}

/// One invocation requested by the service.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

impl From<FunctionCall> for ToolCall {
    fn from(call: FunctionCall) -> Self {
        Self { id: call.id, name: call.name, args: call.args }
    }
}

/// The single answer to a [`ToolCall`] with the same id.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolResult {
    pub id: String,
    pub name: String,
    pub payload: Value,
}

impl ToolResult {
    fn error(call: ToolCall, message: impl Into<String>) -> Self {
        Self {
            id: call.id,
            name: call.name,
            payload: json!({ "error": message.into() }),
        }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.payload.get("error").is_some()
    }
}

impl From<ToolResult> for ToolResponse {
    fn from(result: ToolResult) -> Self {
        Self { id: result.id, name: result.name, payload: result.payload }
    }
}

/// Maps tool names to async handlers and answers every invocation.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    defs: Vec<ToolDefinition>,
    handlers: HashMap<String, ToolHandler>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn definitions(&self) -> &[ToolDefinition] {
        &self.defs
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn tool<TArgs, TResp, F, Fut>(&mut self, name: &str, handler: F)
    where
        TArgs: DeserializeOwned + JsonSchema + Send + 'static,
        TResp: Serialize + Send + 'static,
        F: Fn(TArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TResp>> + Send + 'static,
    {
        self.register(name, None, handler);
    }

    pub fn tool_with_description<TArgs, TResp, F, Fut>(
        &mut self,
        name: &str,
        description: impl Into<String>,
        handler: F,
    ) where
        TArgs: DeserializeOwned + JsonSchema + Send + 'static,
        TResp: Serialize + Send + 'static,
        F: Fn(TArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TResp>> + Send + 'static,
    {
        self.register(name, Some(description.into()), handler);
    }

    fn register<TArgs, TResp, F, Fut>(&mut self, name: &str, description: Option<String>, handler: F)
    where
        TArgs: DeserializeOwned + JsonSchema + Send + 'static,
        TResp: Serialize + Send + 'static,
        F: Fn(TArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TResp>> + Send + 'static,
    {
        let schema = schemars::schema_for!(TArgs);
        let name = name.to_string();
        // Re-registering a name replaces the previous handler and declaration.
        self.defs.retain(|d| d.name != name);
        self.defs.push(ToolDefinition { name: name.clone(), description, schema });

        let user_handler = Arc::new(handler);
        let handler = move |value: Value| -> BoxFuture<Result<Value>> {
            let user_handler = Arc::clone(&user_handler);
            Box::pin(async move {
                let args: TArgs = serde_json::from_value(value)
                    .map_err(|e| Error::InvalidClientEvent(format!("invalid arguments: {e}")))?;
                let resp = user_handler(args).await?;
                Ok(serde_json::to_value(resp)?)
            })
        };

        self.handlers.insert(name, Arc::new(handler));
    }

    /// Convert all registered tools into setup-message declarations.
    ///
    /// # Errors
    /// Returns an error if schema serialization fails.
    #[allow(clippy::result_large_err)]
    pub fn declarations(&self) -> Result<Vec<ToolDeclaration>> {
        self.defs
            .iter()
            .map(|def| {
                Ok(ToolDeclaration {
                    name: def.name.clone(),
                    description: def.description.clone(),
                    parameters: serde_json::to_value(&def.schema)?,
                })
            })
            .collect()
    }

    /// Run the handler for `call` and produce its result.
    ///
    /// Never fails: unknown names, bad arguments, handler errors and panics all
    /// come back as an `{"error": ...}` payload carrying the invocation id. The
    /// returned future does not borrow the registry, so it can be spawned.
    pub fn dispatch(&self, call: ToolCall) -> BoxFuture<ToolResult> {
        let Some(handler) = self.handlers.get(&call.name).cloned() else {
            tracing::warn!(tool = %call.name, id = %call.id, "Unsupported tool invocation");
            let message = format!("unsupported tool: {}", call.name);
            return Box::pin(async move { ToolResult::error(call, message) });
        };
        Box::pin(async move {
            tracing::debug!(tool = %call.name, id = %call.id, "Dispatching tool call");
            match AssertUnwindSafe(handler(call.args.clone())).catch_unwind().await {
                Ok(Ok(payload)) => ToolResult { id: call.id, name: call.name, payload },
                Ok(Err(err)) => {
                    tracing::warn!(tool = %call.name, id = %call.id, "Tool handler failed: {err}");
                    ToolResult::error(call, err.to_string())
                }
                Err(_) => {
                    tracing::error!(tool = %call.name, id = %call.id, "Tool handler panicked");
                    ToolResult::error(call, "tool handler panicked")
                }
            }
        })
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.defs.iter().map(|d| d.name.as_str()).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize, JsonSchema)]
    struct Lookup {
        query: String,
    }

    fn call(id: &str, name: &str, args: Value) -> ToolCall {
        ToolCall { id: id.to_string(), name: name.to_string(), args }
    }

    #[tokio::test]
    async fn dispatch_runs_handler_with_typed_args() {
        let mut tools = ToolRegistry::new();
        tools.tool("lookup", |args: Lookup| async move { Ok(json!({ "found": args.query })) });

        let result = tools.dispatch(call("c1", "lookup", json!({ "query": "museum" }))).await;
        assert_eq!(result.id, "c1");
        assert_eq!(result.payload, json!({ "found": "museum" }));
        assert!(!result.is_error());
    }

    #[tokio::test]
    async fn unknown_and_failing_tools_still_answer() {
        let mut tools = ToolRegistry::new();
        tools.tool("fail", |_: Value| async move {
            Err::<Value, _>(Error::InvalidClientEvent("boom".to_string()))
        });
        tools.tool("lookup", |args: Lookup| async move { Ok(args.query) });

        let unknown = tools.dispatch(call("c1", "nope", Value::Null)).await;
        assert_eq!(unknown.id, "c1");
        assert_eq!(unknown.payload, json!({ "error": "unsupported tool: nope" }));

        let failed = tools.dispatch(call("c2", "fail", Value::Null)).await;
        assert_eq!(failed.id, "c2");
        assert!(failed.is_error());

        let bad_args = tools.dispatch(call("c3", "lookup", json!({ "q": 1 }))).await;
        assert_eq!(bad_args.id, "c3");
        assert!(bad_args.is_error());
    }

    #[test]
    fn declarations_carry_schema() {
        let mut tools = ToolRegistry::new();
        tools.tool_with_description("lookup", "Find a place", |args: Lookup| async move {
            Ok(args.query)
        });
        let decls = tools.declarations().unwrap();
        assert_eq!(decls.len(), 1);
        assert_eq!(decls[0].description.as_deref(), Some("Find a place"));
        assert!(decls[0].parameters["properties"]["query"].is_object());
    }
}
