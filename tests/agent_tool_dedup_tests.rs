//! At most one decision tool executes per agent turn, even when the LLM
//! response requests more than one in the same call.

use async_trait::async_trait;
use roundtable_core::error::LlmError;
use roundtable_core::llm_client::{Message, NativeToolCall, Role, TokenUsage};
use roundtable_core::tool_registry::{
    JsonSchemaType, ToolMetadata, ToolParameter, ToolRegistry, ToolResolver,
};
use roundtable_core::{Agent, MessageBus};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// On its first call, asks for two decision tools at once; on the follow-up
/// synthesis call, replies with plain text and no tool calls.
struct ToolCallLlmClient {
    call_count: AtomicU32,
}

#[async_trait]
impl roundtable_core::LlmClient for ToolCallLlmClient {
    async fn send(
        &self,
        _messages: &[Message],
        _tools: &[ToolMetadata],
    ) -> Result<(Message, TokenUsage), LlmError> {
        let call = self.call_count.fetch_add(1, Ordering::SeqCst);
        if call == 0 {
            Ok((
                Message {
                    role: Role::Assistant,
                    content: Arc::from(""),
                    tool_calls: vec![
                        NativeToolCall {
                            id: "call_1".to_string(),
                            name: "open_long".to_string(),
                            arguments: serde_json::json!({"leverage": 5}),
                        },
                        NativeToolCall {
                            id: "call_2".to_string(),
                            name: "close_position".to_string(),
                            arguments: serde_json::json!({}),
                        },
                    ],
                },
                TokenUsage::default(),
            ))
        } else {
            Ok((
                Message::assistant("Executed open_long; the duplicate decision tool was ignored."),
                TokenUsage::default(),
            ))
        }
    }
}

#[tokio::test]
async fn at_most_one_decision_tool_executes_per_turn() {
    let open_long_hits = Arc::new(AtomicU32::new(0));
    let close_position_hits = Arc::new(AtomicU32::new(0));

    let mut registry = ToolRegistry::new();
    {
        let hits = open_long_hits.clone();
        registry
            .register(
                "open_long",
                "Opens a long position",
                vec![ToolParameter::new("leverage", JsonSchemaType::Integer, "leverage", true)],
                ToolResolver::local(move |params| {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(serde_json::json!({ "leverage": params["leverage"] }))
                }),
                true,
            )
            .unwrap();
    }
    {
        let hits = close_position_hits.clone();
        registry
            .register(
                "close_position",
                "Closes the open position",
                vec![],
                ToolResolver::local(move |_params| {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(serde_json::json!({}))
                }),
                true,
            )
            .unwrap();
    }

    let mut agent = Agent::new(
        "leader-1",
        "Leader",
        Arc::new(ToolCallLlmClient {
            call_count: AtomicU32::new(0),
        }),
        Arc::new(registry),
    )
    .with_tools(vec!["open_long".to_string(), "close_position".to_string()]);

    let bus = MessageBus::new(1000);
    let output = agent
        .take_turn(&bus, None, &[], "Decide on a position.", false, 0.0, 0.0)
        .await
        .unwrap();

    assert_eq!(open_long_hits.load(Ordering::SeqCst), 1);
    assert_eq!(close_position_hits.load(Ordering::SeqCst), 0);
    assert_eq!(output.messages.len(), 1);
}
