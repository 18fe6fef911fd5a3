//! Tool Registry & Dispatcher (C1).
//!
//! Single point through which every tool call flows: a declarative catalogue
//! of [`ToolMetadata`] entries, each bound to a [`ToolResolver`] that is
//! either a local in-process handler or a remote MCP-style HTTP relay.
//!
//! # Example
//!
//! ```rust
//! use roundtable_core::tool_registry::{
//!     JsonSchemaType, ToolParameter, ToolRegistry, ToolResolver,
//! };
//! use serde_json::json;
//!
//! # async fn run() {
//! let mut registry = ToolRegistry::new();
//! registry
//!     .register(
//!         "calculator",
//!         "Adds two integers",
//!         vec![
//!             ToolParameter::new("a", JsonSchemaType::Integer, "first addend", true),
//!             ToolParameter::new("b", JsonSchemaType::Integer, "second addend", true),
//!         ],
//!         ToolResolver::local(|params| {
//!             let a = params["a"].as_i64().unwrap_or(0);
//!             let b = params["b"].as_i64().unwrap_or(0);
//!             Ok(json!({ "sum": a + b }))
//!         }),
//!         false,
//!     )
//!     .unwrap();
//!
//! let result = registry
//!     .invoke("calculator", json!({"a": "2", "b": 3}))
//!     .await;
//! assert!(result.success);
//! # }
//! ```

use crate::error::ToolError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;

/// JSON-schema primitive types this registry coerces LLM-emitted string
/// arguments into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonSchemaType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

/// A single declared parameter of a tool.
#[derive(Debug, Clone)]
pub struct ToolParameter {
    pub name: String,
    pub param_type: JsonSchemaType,
    pub description: String,
    pub required: bool,
}

impl ToolParameter {
    pub fn new(
        name: impl Into<String>,
        param_type: JsonSchemaType,
        description: impl Into<String>,
        required: bool,
    ) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: description.into(),
            required,
        }
    }
}

/// Declarative description of a registered tool, independent of its resolver.
#[derive(Debug, Clone)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
    /// True for tools with observable ledger side effects
    /// (`open_long`, `open_short`, `close_position`, `hold`); capped at one
    /// execution per agent turn (§4.4).
    pub is_decision_tool: bool,
}

impl ToolMetadata {
    /// Render as an OpenAI-compatible `{type:"function", function:{...}}` schema entry.
    pub fn to_schema_json(&self) -> JsonValue {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for param in &self.parameters {
            let type_str = match param.param_type {
                JsonSchemaType::String => "string",
                JsonSchemaType::Number => "number",
                JsonSchemaType::Integer => "integer",
                JsonSchemaType::Boolean => "boolean",
                JsonSchemaType::Array => "array",
                JsonSchemaType::Object => "object",
            };
            properties.insert(
                param.name.clone(),
                serde_json::json!({
                    "type": type_str,
                    "description": param.description,
                }),
            );
            if param.required {
                required.push(JsonValue::String(param.name.clone()));
            }
        }
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": {
                    "type": "object",
                    "properties": JsonValue::Object(properties),
                    "required": required,
                }
            }
        })
    }
}

/// Uniform result shape returned by every tool invocation, success or failure.
///
/// `summary` is mandatory: it is the human-readable digest embedded into the
/// agent's follow-up synthesis prompt regardless of outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub result: JsonValue,
    pub summary: String,
    pub error: Option<String>,
}

impl ToolResult {
    pub fn success(result: JsonValue, summary: impl Into<String>) -> Self {
        Self {
            success: true,
            result,
            summary: summary.into(),
            error: None,
        }
    }

    pub fn failure(summary: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: JsonValue::Null,
            summary: summary.into(),
            error: Some(error.into()),
        }
    }
}

/// A local, in-process tool handler.
pub trait LocalHandler: Send + Sync {
    fn call(&self, params: JsonValue) -> Result<JsonValue, String>;
}

impl<F> LocalHandler for F
where
    F: Fn(JsonValue) -> Result<JsonValue, String> + Send + Sync,
{
    fn call(&self, params: JsonValue) -> Result<JsonValue, String> {
        self(params)
    }
}

/// A remote MCP-style resolver: issues `POST {server_url}/mcp/tools/{tool_name}`.
pub struct RemoteResolver {
    pub server_url: String,
    pub remote_tool_name: String,
    pub timeout_secs: u64,
}

/// Either a local handler, a remote routing descriptor, or an async local
/// handler for a tool.
pub enum ToolResolver {
    Local(Arc<dyn LocalHandler>),
    Remote(RemoteResolver),
    Async(Arc<dyn AsyncLocalHandler>),
}

impl ToolResolver {
    pub fn local<F>(f: F) -> Self
    where
        F: Fn(JsonValue) -> Result<JsonValue, String> + Send + Sync + 'static,
    {
        ToolResolver::Local(Arc::new(f))
    }

    pub fn remote(server_url: impl Into<String>, remote_tool_name: impl Into<String>) -> Self {
        ToolResolver::Remote(RemoteResolver {
            server_url: server_url.into(),
            remote_tool_name: remote_tool_name.into(),
            timeout_secs: 30,
        })
    }

    /// An in-process handler whose work is itself async (it invokes another
    /// async component — the ledger, the LLM client — rather than computing
    /// a value synchronously). `f` is wrapped so ordinary closures returning
    /// a future satisfy [`AsyncLocalHandler`] without a dedicated type.
    pub fn asynchronous<F, Fut>(f: F) -> Self
    where
        F: Fn(JsonValue) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<JsonValue, String>> + Send + 'static,
    {
        struct FnHandler<F>(F);

        #[async_trait]
        impl<F, Fut> AsyncLocalHandler for FnHandler<F>
        where
            F: Fn(JsonValue) -> Fut + Send + Sync,
            Fut: std::future::Future<Output = Result<JsonValue, String>> + Send,
        {
            async fn call(&self, params: JsonValue) -> Result<JsonValue, String> {
                (self.0)(params).await
            }
        }

        ToolResolver::Async(Arc::new(FnHandler(f)))
    }
}

struct RegisteredTool {
    metadata: ToolMetadata,
    resolver: ToolResolver,
}

/// Declarative tool catalogue and dispatcher. Not `Clone` — share via `Arc`.
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    http: reqwest::Client,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            http: reqwest::Client::new(),
        }
    }

    /// Register a new tool. Fails with [`ToolError::DuplicateTool`] if the
    /// name is already registered.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Vec<ToolParameter>,
        resolver: ToolResolver,
        is_decision_tool: bool,
    ) -> Result<(), ToolError> {
        let name = name.into();
        if self.tools.contains_key(&name) {
            return Err(ToolError::DuplicateTool(name));
        }
        self.tools.insert(
            name.clone(),
            RegisteredTool {
                metadata: ToolMetadata {
                    name,
                    description: description.into(),
                    parameters,
                    is_decision_tool,
                },
                resolver,
            },
        );
        Ok(())
    }

    /// True if `name` refers to a registered decision tool.
    pub fn is_decision_tool(&self, name: &str) -> bool {
        self.tools
            .get(name)
            .map(|t| t.metadata.is_decision_tool)
            .unwrap_or(false)
    }

    /// OpenAI-compatible schema list for a subset of tool names. Unknown
    /// names are silently skipped (callers assemble `selection` from a
    /// known-good agent tool list).
    pub fn schema(&self, selection: &[String]) -> Vec<JsonValue> {
        selection
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|t| t.metadata.to_schema_json())
            .collect()
    }

    pub fn list_tools(&self) -> Vec<ToolMetadata> {
        self.tools.values().map(|t| t.metadata.clone()).collect()
    }

    /// Metadata (not JSON schema) for a subset of tool names, in the shape an
    /// [`crate::llm_client::LlmClient`] expects to serialize itself. Unknown
    /// names are silently skipped.
    pub fn schema_metadata(&self, selection: &[String]) -> Vec<ToolMetadata> {
        selection
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|t| t.metadata.clone())
            .collect()
    }

    /// Validate, coerce, and dispatch a tool call. Never returns `Err` —
    /// every failure mode (unknown tool, schema violation, network failure,
    /// resolver error) is folded into a failed [`ToolResult`] so the caller
    /// (an agent turn) can continue without special-casing.
    pub async fn invoke(&self, name: &str, arguments: JsonValue) -> ToolResult {
        let Some(tool) = self.tools.get(name) else {
            let err = ToolError::NotFound(name.to_string());
            return ToolResult::failure(err.to_string(), err.to_string());
        };

        let coerced = match coerce_arguments(&tool.metadata, arguments) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("tool_registry: schema violation invoking '{}': {}", name, e);
                return ToolResult::failure(format!("invalid arguments: {}", e), e.to_string());
            }
        };

        match &tool.resolver {
            ToolResolver::Local(handler) => match handler.call(coerced) {
                Ok(result) => ToolResult::success(result, format!("{} executed successfully", name)),
                Err(e) => {
                    log::warn!("tool_registry: local handler for '{}' failed: {}", name, e);
                    ToolResult::failure(format!("{} failed: {}", name, e), e)
                }
            },
            ToolResolver::Remote(remote) => self.invoke_remote(remote, coerced).await,
            ToolResolver::Async(handler) => match handler.call(coerced).await {
                Ok(result) => ToolResult::success(result, format!("{} executed successfully", name)),
                Err(e) => {
                    log::warn!("tool_registry: async handler for '{}' failed: {}", name, e);
                    ToolResult::failure(format!("{} failed: {}", name, e), e)
                }
            },
        }
    }

    async fn invoke_remote(&self, remote: &RemoteResolver, params: JsonValue) -> ToolResult {
        let url = format!(
            "{}/mcp/tools/{}",
            remote.server_url.trim_end_matches('/'),
            remote.remote_tool_name
        );
        let send = self
            .http
            .post(&url)
            .json(&params)
            .timeout(std::time::Duration::from_secs(remote.timeout_secs))
            .send();

        match send.await {
            Ok(resp) => {
                let status = resp.status();
                match resp.json::<JsonValue>().await {
                    Ok(body) => {
                        let success = body
                            .get("success")
                            .and_then(|v| v.as_bool())
                            .unwrap_or(status.is_success());
                        if success {
                            ToolResult::success(
                                body.get("result").cloned().unwrap_or(JsonValue::Null),
                                format!("{} executed remotely", remote.remote_tool_name),
                            )
                        } else {
                            let err = body
                                .get("error")
                                .and_then(|v| v.as_str())
                                .unwrap_or("remote tool reported failure")
                                .to_string();
                            ToolResult::failure(err.clone(), err)
                        }
                    }
                    Err(e) => {
                        log::warn!("tool_registry: malformed remote response from {}: {}", url, e);
                        ToolResult::failure("malformed remote response".to_string(), e.to_string())
                    }
                }
            }
            Err(e) => {
                log::warn!("tool_registry: remote call to {} failed: {}", url, e);
                ToolResult::failure(format!("remote call failed: {}", e), e.to_string())
            }
        }
    }
}

/// Validate required/unknown fields and coerce string-typed scalars to their
/// declared JSON types. LLMs frequently emit `"3"` for an integer parameter —
/// this makes that tolerable instead of a hard schema failure.
fn coerce_arguments(metadata: &ToolMetadata, arguments: JsonValue) -> Result<JsonValue, ToolError> {
    let JsonValue::Object(mut map) = arguments else {
        return Err(ToolError::SchemaViolation(
            "arguments must be a JSON object".to_string(),
        ));
    };

    let known: std::collections::HashSet<&str> =
        metadata.parameters.iter().map(|p| p.name.as_str()).collect();
    for key in map.keys() {
        if !known.contains(key.as_str()) {
            return Err(ToolError::SchemaViolation(format!(
                "unknown parameter '{}'",
                key
            )));
        }
    }

    for param in &metadata.parameters {
        match map.get(&param.name) {
            None => {
                if param.required {
                    return Err(ToolError::SchemaViolation(format!(
                        "missing required parameter '{}'",
                        param.name
                    )));
                }
            }
            Some(value) => {
                let coerced = coerce_value(value, param.param_type).ok_or_else(|| {
                    ToolError::SchemaViolation(format!(
                        "parameter '{}' could not be coerced to {:?}",
                        param.name, param.param_type
                    ))
                })?;
                map.insert(param.name.clone(), coerced);
            }
        }
    }

    Ok(JsonValue::Object(map))
}

fn coerce_value(value: &JsonValue, target: JsonSchemaType) -> Option<JsonValue> {
    match (target, value) {
        (JsonSchemaType::String, JsonValue::String(_)) => Some(value.clone()),
        (JsonSchemaType::String, _) => Some(JsonValue::String(value.to_string())),
        (JsonSchemaType::Integer, JsonValue::Number(n)) if n.is_i64() || n.is_u64() => {
            Some(value.clone())
        }
        (JsonSchemaType::Integer, JsonValue::Number(n)) => {
            n.as_f64().map(|f| serde_json::json!(f.round() as i64))
        }
        (JsonSchemaType::Integer, JsonValue::String(s)) => {
            s.trim().parse::<i64>().ok().map(|i| serde_json::json!(i))
        }
        (JsonSchemaType::Number, JsonValue::Number(_)) => Some(value.clone()),
        (JsonSchemaType::Number, JsonValue::String(s)) => {
            s.trim().parse::<f64>().ok().map(|f| serde_json::json!(f))
        }
        (JsonSchemaType::Boolean, JsonValue::Bool(_)) => Some(value.clone()),
        (JsonSchemaType::Boolean, JsonValue::String(s)) => match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => Some(JsonValue::Bool(true)),
            "false" | "0" | "no" => Some(JsonValue::Bool(false)),
            _ => None,
        },
        (JsonSchemaType::Array, JsonValue::Array(_)) => Some(value.clone()),
        (JsonSchemaType::Object, JsonValue::Object(_)) => Some(value.clone()),
        _ => None,
    }
}

/// Trait object form used where a tool's local execution needs to be async
/// (document parsing, internal-knowledge lookups). Most local handlers are
/// synchronous closures via [`ToolResolver::local`]; this is the escape hatch
/// for ones that are not.
#[async_trait]
pub trait AsyncLocalHandler: Send + Sync {
    async fn call(&self, params: JsonValue) -> Result<JsonValue, String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                "open_long",
                "Opens a long position",
                vec![ToolParameter::new(
                    "leverage",
                    JsonSchemaType::Integer,
                    "leverage",
                    true,
                )],
                ToolResolver::local(|params| Ok(json!({ "leverage": params["leverage"] }))),
                true,
            )
            .unwrap();
        registry
            .register(
                "calculator",
                "adds",
                vec![
                    ToolParameter::new("a", JsonSchemaType::Integer, "a", true),
                    ToolParameter::new("b", JsonSchemaType::Integer, "b", false),
                ],
                ToolResolver::local(|params| {
                    let a = params["a"].as_i64().unwrap_or(0);
                    let b = params.get("b").and_then(|v| v.as_i64()).unwrap_or(0);
                    Ok(json!({ "sum": a + b }))
                }),
                false,
            )
            .unwrap();
        registry
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = sample_registry();
        let err = registry
            .register(
                "calculator",
                "dup",
                vec![],
                ToolResolver::local(|_| Ok(JsonValue::Null)),
                false,
            )
            .unwrap_err();
        assert!(matches!(err, ToolError::DuplicateTool(name) if name == "calculator"));
    }

    #[test]
    fn is_decision_tool_flags_correctly() {
        let registry = sample_registry();
        assert!(registry.is_decision_tool("open_long"));
        assert!(!registry.is_decision_tool("calculator"));
        assert!(!registry.is_decision_tool("nonexistent"));
    }

    #[tokio::test]
    async fn invoke_coerces_string_integer() {
        let registry = sample_registry();
        let result = registry.invoke("calculator", json!({"a": "2", "b": 3})).await;
        assert!(result.success);
        assert_eq!(result.result["sum"], 5);
    }

    #[tokio::test]
    async fn invoke_rejects_missing_required_field() {
        let registry = sample_registry();
        let result = registry.invoke("calculator", json!({"b": 3})).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("missing required parameter"));
    }

    #[tokio::test]
    async fn invoke_rejects_unknown_field() {
        let registry = sample_registry();
        let result = registry
            .invoke("calculator", json!({"a": 1, "c": 2}))
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("unknown parameter"));
    }

    #[tokio::test]
    async fn invoke_unknown_tool_fails_gracefully() {
        let registry = sample_registry();
        let result = registry.invoke("does_not_exist", json!({})).await;
        assert!(!result.success);
    }

    #[test]
    fn schema_is_openai_compatible() {
        let registry = sample_registry();
        let schema = registry.schema(&["calculator".to_string()]);
        assert_eq!(schema.len(), 1);
        assert_eq!(schema[0]["type"], "function");
        assert_eq!(schema[0]["function"]["name"], "calculator");
        assert_eq!(schema[0]["function"]["parameters"]["required"][0], "a");
    }
}
