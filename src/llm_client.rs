//! LLM Client (C2).
//!
//! A provider-agnostic chat/tool-calling client targeting a single internal
//! gateway endpoint (`{base_url}/v1/chat/completions`, OpenAI-compatible
//! wire format). Grounded in the shared-pooled-client and hand-rolled
//! request/response (de)serialization pattern used elsewhere in this
//! codebase for native tool calling, generalized with bounded timeouts and
//! exponential-backoff retry on `503` so a momentarily overloaded gateway
//! degrades gracefully instead of failing a whole agent turn.

use crate::error::LlmError;
use crate::tool_registry::ToolMetadata;
use async_trait::async_trait;
use lazy_static::lazy_static;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

lazy_static! {
    /// Shared HTTP client with persistent connection pooling, reused by every
    /// [`GatewayLlmClient`] instance so TLS sessions and DNS lookups stay warm
    /// under concurrent agent turns.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = reqwest::ClientBuilder::new()
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .timeout(Duration::from_secs(300))
        .connect_timeout(Duration::from_secs(30))
        .build()
        .expect("failed to build shared HTTP client");
}

/// Borrow the process-wide shared [`reqwest::Client`].
pub fn get_shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// Role of a message in a chat history, mirroring the OpenAI wire shape.
#[derive(Debug, Clone)]
pub enum Role {
    System,
    User,
    Assistant,
    /// A tool-result message correlating to a prior [`NativeToolCall`] by `call_id`.
    Tool { call_id: String },
}

/// A single tool call an assistant response requested.
#[derive(Debug, Clone)]
pub struct NativeToolCall {
    pub id: String,
    pub name: String,
    pub arguments: JsonValue,
}

/// A chat message, stored with `Arc<str>` content so histories clone cheaply
/// across the message bus and agent context assembly.
#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: Arc<str>,
    pub tool_calls: Vec<NativeToolCall>,
}

impl Message {
    pub fn system(content: impl Into<Arc<str>>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: vec![],
        }
    }

    pub fn user(content: impl Into<Arc<str>>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: vec![],
        }
    }

    pub fn assistant(content: impl Into<Arc<str>>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: vec![],
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<Arc<str>>) -> Self {
        Self {
            role: Role::Tool {
                call_id: call_id.into(),
            },
            content: content.into(),
            tool_calls: vec![],
        }
    }
}

/// Prompt/completion token accounting for one LLM round-trip.
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub total_tokens: usize,
}

/// Provider-agnostic client for a single chat/tool-calling gateway.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a chat request with an optional set of callable tools. Returns
    /// the assistant's reply message (content and/or native tool calls) plus
    /// its token usage.
    ///
    /// On transient failure (timeout, `503`, connection reset) this retries
    /// internally per the configured backoff schedule before surfacing
    /// [`LlmError::Unavailable`]; callers never implement their own retry
    /// loop around this method.
    async fn send(
        &self,
        messages: &[Message],
        tools: &[ToolMetadata],
    ) -> Result<(Message, TokenUsage), LlmError>;
}

/// Retry schedule for transient (`503`) failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(2),
            max_attempts: 3,
        }
    }
}

/// Client targeting a single internal LLM gateway over HTTP.
pub struct GatewayLlmClient {
    base_url: String,
    api_key: String,
    model: String,
    http: reqwest::Client,
    timeout: Duration,
    retry: RetryPolicy,
}

impl GatewayLlmClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            http: get_shared_http_client().clone(),
            timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn to_wire_messages(messages: &[Message]) -> Vec<JsonValue> {
        messages
            .iter()
            .map(|msg| match &msg.role {
                Role::System => serde_json::json!({ "role": "system", "content": msg.content.as_ref() }),
                Role::User => serde_json::json!({ "role": "user", "content": msg.content.as_ref() }),
                Role::Assistant => {
                    if msg.tool_calls.is_empty() {
                        serde_json::json!({ "role": "assistant", "content": msg.content.as_ref() })
                    } else {
                        let tool_calls: Vec<JsonValue> = msg
                            .tool_calls
                            .iter()
                            .map(|tc| {
                                serde_json::json!({
                                    "id": tc.id,
                                    "type": "function",
                                    "function": {
                                        "name": tc.name,
                                        "arguments": serde_json::to_string(&tc.arguments)
                                            .unwrap_or_else(|_| "{}".to_string()),
                                    }
                                })
                            })
                            .collect();
                        serde_json::json!({
                            "role": "assistant",
                            "content": JsonValue::Null,
                            "tool_calls": tool_calls,
                        })
                    }
                }
                Role::Tool { call_id } => serde_json::json!({
                    "role": "tool",
                    "tool_call_id": call_id,
                    "content": msg.content.as_ref(),
                }),
            })
            .collect()
    }

    fn parse_response(parsed: &JsonValue) -> Result<(Message, TokenUsage), LlmError> {
        let usage = parsed
            .get("usage")
            .map(|u| {
                let input = u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                let output = u
                    .get("completion_tokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as usize;
                TokenUsage {
                    input_tokens: input,
                    output_tokens: output,
                    total_tokens: input + output,
                }
            })
            .unwrap_or_default();

        let choice_msg = parsed
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .ok_or_else(|| LlmError::MalformedResponse("no choices in response".to_string()))?;

        let content: Arc<str> = choice_msg
            .get("content")
            .and_then(|c| c.as_str())
            .map(Arc::from)
            .unwrap_or_else(|| Arc::from(""));

        let tool_calls: Vec<NativeToolCall> = choice_msg
            .get("tool_calls")
            .and_then(|tc| tc.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|tc| {
                        let id = tc.get("id")?.as_str()?.to_string();
                        let func = tc.get("function")?;
                        let name = func.get("name")?.as_str()?.to_string();
                        let args_str = func.get("arguments")?.as_str().unwrap_or("{}");
                        let arguments: JsonValue =
                            serde_json::from_str(args_str).unwrap_or(JsonValue::Object(Default::default()));
                        Some(NativeToolCall { id, name, arguments })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok((
            Message {
                role: Role::Assistant,
                content,
                tool_calls,
            },
            usage,
        ))
    }

    async fn send_once(
        &self,
        messages: &[Message],
        tools: &[ToolMetadata],
    ) -> Result<(Message, TokenUsage), LlmError> {
        let wire_tools: Vec<JsonValue> = tools.iter().map(|t| t.to_schema_json()).collect();
        let body = serde_json::json!({
            "model": self.model,
            "messages": Self::to_wire_messages(messages),
            "tools": wire_tools,
        });
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));

        let resp = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    LlmError::Unavailable(e.to_string())
                } else {
                    LlmError::Unavailable(e.to_string())
                }
            })?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| LlmError::MalformedResponse(e.to_string()))?;

        if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            return Err(LlmError::Unavailable(format!("HTTP 503: {}", text)));
        }
        if !status.is_success() {
            log::error!("llm_client: HTTP {} from {}: {}", status, url, text);
            if status.is_client_error() {
                return Err(LlmError::PermanentFailure(format!("HTTP {}: {}", status, text)));
            }
            return Err(LlmError::Unavailable(format!("HTTP {}: {}", status, text)));
        }

        let parsed: JsonValue =
            serde_json::from_str(&text).map_err(|e| LlmError::MalformedResponse(e.to_string()))?;
        Self::parse_response(&parsed)
    }
}

#[async_trait]
impl LlmClient for GatewayLlmClient {
    async fn send(
        &self,
        messages: &[Message],
        tools: &[ToolMetadata],
    ) -> Result<(Message, TokenUsage), LlmError> {
        let mut backoff = self.retry.initial_backoff;
        let mut last_err = None;
        for attempt in 0..self.retry.max_attempts {
            match self.send_once(messages, tools).await {
                Ok(result) => return Ok(result),
                Err(LlmError::Unavailable(msg)) => {
                    log::warn!(
                        "llm_client: attempt {}/{} failed: {}",
                        attempt + 1,
                        self.retry.max_attempts,
                        msg
                    );
                    last_err = Some(LlmError::Unavailable(msg));
                    if attempt + 1 < self.retry.max_attempts {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| LlmError::Unavailable("exhausted retries".to_string())))
    }
}

/// Tracks the last-observed usage of an [`LlmClient`] for reporting without
/// threading a return value through every call site.
pub struct UsageTracker {
    slot: Mutex<Option<TokenUsage>>,
}

impl Default for UsageTracker {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }
}

impl UsageTracker {
    pub async fn record(&self, usage: TokenUsage) {
        *self.slot.lock().await = Some(usage);
    }

    pub async fn last(&self) -> Option<TokenUsage> {
        self.slot.lock().await.clone()
    }
}

impl Clone for TokenUsage {
    fn clone(&self) -> Self {
        TokenUsage {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            total_tokens: self.total_tokens,
        }
    }
}

/// Sentinel reply substituted for a failed signal-generation call so a
/// roundtable round can continue in degraded mode rather than aborting
/// outright (§4.2). Direction is conservative (`hold`) and confidence is
/// zero so downstream consensus logic never mistakes it for a real vote.
pub fn degraded_placeholder_json() -> JsonValue {
    serde_json::json!({
        "direction": "hold",
        "confidence": 0,
        "reasoning": "llm_unavailable",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool_registry::{JsonSchemaType, ToolParameter};

    fn sample_tool() -> ToolMetadata {
        ToolMetadata {
            name: "calculator".to_string(),
            description: "adds".to_string(),
            parameters: vec![ToolParameter::new("a", JsonSchemaType::Integer, "a", true)],
            is_decision_tool: false,
        }
    }

    #[test]
    fn wire_messages_serialize_roles_correctly() {
        let messages = vec![
            Message::system("be terse"),
            Message::user("hello"),
            Message::assistant("hi"),
            Message::tool_result("call_1", "42"),
        ];
        let wire = GatewayLlmClient::to_wire_messages(&messages);
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[1]["role"], "user");
        assert_eq!(wire[2]["role"], "assistant");
        assert_eq!(wire[3]["role"], "tool");
        assert_eq!(wire[3]["tool_call_id"], "call_1");
    }

    #[test]
    fn assistant_with_tool_calls_omits_content() {
        let message = Message {
            role: Role::Assistant,
            content: Arc::from(""),
            tool_calls: vec![NativeToolCall {
                id: "call_9".to_string(),
                name: "open_long".to_string(),
                arguments: serde_json::json!({"leverage": 5}),
            }],
        };
        let wire = GatewayLlmClient::to_wire_messages(std::slice::from_ref(&message));
        assert!(wire[0]["content"].is_null());
        assert_eq!(wire[0]["tool_calls"][0]["function"]["name"], "open_long");
    }

    #[test]
    fn parse_response_extracts_content_and_usage() {
        let raw = serde_json::json!({
            "choices": [{"message": {"content": "hello there"}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5}
        });
        let (message, usage) = GatewayLlmClient::parse_response(&raw).unwrap();
        assert_eq!(message.content.as_ref(), "hello there");
        assert_eq!(usage.total_tokens, 15);
    }

    #[test]
    fn parse_response_extracts_tool_calls() {
        let raw = serde_json::json!({
            "choices": [{"message": {
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "function": {"name": "open_long", "arguments": "{\"leverage\":5}"}
                }]
            }}]
        });
        let (message, _) = GatewayLlmClient::parse_response(&raw).unwrap();
        assert_eq!(message.tool_calls.len(), 1);
        assert_eq!(message.tool_calls[0].name, "open_long");
        assert_eq!(message.tool_calls[0].arguments["leverage"], 5);
    }

    #[test]
    fn parse_response_missing_choices_is_malformed() {
        let raw = serde_json::json!({});
        let err = GatewayLlmClient::parse_response(&raw).unwrap_err();
        assert!(matches!(err, LlmError::MalformedResponse(_)));
    }

    #[test]
    fn degraded_placeholder_has_zero_confidence_hold() {
        let placeholder = degraded_placeholder_json();
        assert_eq!(placeholder["direction"], "hold");
        assert_eq!(placeholder["confidence"], 0);
    }

    #[tokio::test]
    async fn usage_tracker_records_latest() {
        let tracker = UsageTracker::default();
        assert!(tracker.last().await.is_none());
        tracker
            .record(TokenUsage {
                input_tokens: 1,
                output_tokens: 2,
                total_tokens: 3,
            })
            .await;
        assert_eq!(tracker.last().await.unwrap().total_tokens, 3);
    }

    #[test]
    fn tool_schema_passthrough_matches_registry_shape() {
        let tool = sample_tool();
        let schema = tool.to_schema_json();
        assert_eq!(schema["function"]["name"], "calculator");
    }
}
