//! Agent (C4).
//!
//! A single deliberation participant. Built via a fluent builder rather than
//! per-role structs, following the teacher's `Agent::new(...).with_role(...)`
//! shape; the unit of execution is a **turn**, which assembles context from
//! the message bus, calls the LLM (optionally with tools), executes at most
//! one decision tool, and publishes a final message.

use crate::error::AgentError;
use crate::event::{AgentEvent, EventHandler};
use crate::llm_client::{self, LlmClient, Message as LlmMessage, Role as LlmRole};
use crate::memory::AgentMemory;
use crate::message_bus::{BusMessage, MessageBus, MessageKind};
use crate::tool_registry::{ToolMetadata, ToolRegistry, ToolResult};
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// Lifecycle status of an agent across a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Idle,
    Thinking,
    ToolUsing,
    Speaking,
    Error,
}

/// A parsed trading vote, tolerant of free-form LLM output.
#[derive(Debug, Clone, PartialEq)]
pub struct VoteRecord {
    pub direction: String,
    pub confidence: u8,
    pub leverage: u32,
    pub take_profit_percent: f64,
    pub stop_loss_percent: f64,
}

impl VoteRecord {
    pub fn default_with(take_profit_percent: f64, stop_loss_percent: f64) -> Self {
        Self {
            direction: "hold".to_string(),
            confidence: 0,
            leverage: 1,
            take_profit_percent,
            stop_loss_percent,
        }
    }
}

/// Outcome of one agent turn.
pub struct TurnOutput {
    pub messages: Vec<BusMessage>,
    pub vote: Option<VoteRecord>,
    pub status: AgentStatus,
    /// Name and result of the single decision tool dispatched this turn, if
    /// the response requested one (§4.4's at-most-one-per-turn dedup).
    pub decision_tool: Option<(String, ToolResult)>,
}

/// Fluent builder for an [`Agent`], mirroring the teacher's
/// `Agent::new(id, name).with_role(...)` construction style.
pub struct Agent {
    id: String,
    name: String,
    role_prompt: String,
    tool_names: Vec<String>,
    memory: Option<Arc<AgentMemory>>,
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
    events: Arc<dyn EventHandler>,
    status: AgentStatus,
}

impl Agent {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        llm: Arc<dyn LlmClient>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role_prompt: String::new(),
            tool_names: Vec::new(),
            memory: None,
            llm,
            tools,
            events: Arc::new(crate::event::NoopEventHandler),
            status: AgentStatus::Idle,
        }
    }

    pub fn with_role(mut self, role_prompt: impl Into<String>) -> Self {
        self.role_prompt = role_prompt.into();
        self
    }

    pub fn with_tools(mut self, tool_names: Vec<String>) -> Self {
        self.tool_names = tool_names;
        self
    }

    pub fn with_memory(mut self, memory: Arc<AgentMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = events;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> AgentStatus {
        self.status
    }

    pub fn memory(&self) -> Option<&Arc<AgentMemory>> {
        self.memory.as_ref()
    }

    /// A fresh, stateless copy sharing the tool registry, LLM client, and
    /// memory handle by reference, for DD's TDD/MDD parallel fan-out. Avoids
    /// re-cloning accumulated turn state, mirroring the teacher's
    /// `Agent::fork`.
    pub fn fork(&self, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role_prompt: self.role_prompt.clone(),
            tool_names: self.tool_names.clone(),
            memory: self.memory.clone(),
            llm: self.llm.clone(),
            tools: self.tools.clone(),
            events: self.events.clone(),
            status: AgentStatus::Idle,
        }
    }

    fn memory_summary(&self) -> String {
        self.memory
            .as_ref()
            .map(|m| m.prompt_summary())
            .unwrap_or_default()
    }

    fn assemble_context(
        &self,
        position_context_summary: Option<&str>,
        bus_excerpt: &[BusMessage],
        instruction: &str,
    ) -> Vec<LlmMessage> {
        let mut system_prompt = self.role_prompt.clone();
        if let Some(pos) = position_context_summary {
            system_prompt.push_str("\n\n");
            system_prompt.push_str(pos);
        }
        let memory_summary = self.memory_summary();
        if !memory_summary.is_empty() {
            system_prompt.push_str("\n\n");
            system_prompt.push_str(&memory_summary);
        }

        let mut messages = vec![LlmMessage::system(system_prompt)];
        for bus_message in bus_excerpt {
            let rendered = format!("[{}] {}", bus_message.sender, bus_message.content);
            if bus_message.sender == self.id {
                messages.push(LlmMessage::assistant(rendered));
            } else {
                messages.push(LlmMessage::user(rendered));
            }
        }
        messages.push(LlmMessage::user(instruction.to_string()));
        messages
    }

    fn resolved_tools(&self) -> Vec<ToolMetadata> {
        self.tools.schema_metadata(&self.tool_names)
    }

    /// Run one turn: context assembly, LLM call, optional tool execution with
    /// decision-tool de-duplication, follow-up synthesis, message emission.
    pub async fn take_turn(
        &mut self,
        bus: &MessageBus,
        position_context_summary: Option<&str>,
        bus_excerpt: &[BusMessage],
        instruction: &str,
        is_signal_turn: bool,
        tp_default: f64,
        sl_default: f64,
    ) -> Result<TurnOutput, AgentError> {
        self.status = AgentStatus::Thinking;
        self.events
            .on_agent_event(&AgentEvent::TurnStarted {
                agent_id: self.id.clone(),
                agent_name: self.name.clone(),
            })
            .await;

        let context = self.assemble_context(position_context_summary, bus_excerpt, instruction);
        let tools = self.resolved_tools();

        self.events
            .on_agent_event(&AgentEvent::LLMCallStarted {
                agent_id: self.id.clone(),
                agent_name: self.name.clone(),
                iteration: 0,
            })
            .await;

        let (response, _usage) = match self.llm.send(&context, &tools).await {
            Ok(r) => r,
            Err(e) => {
                self.status = AgentStatus::Error;
                self.events
                    .on_agent_event(&AgentEvent::TurnFailed {
                        agent_id: self.id.clone(),
                        agent_name: self.name.clone(),
                        error: e.to_string(),
                    })
                    .await;
                let placeholder = llm_client::degraded_placeholder_json();
                let message = bus
                    .publish(
                        self.id.clone(),
                        None,
                        MessageKind::Information,
                        placeholder.to_string(),
                    )
                    .await;
                let vote = is_signal_turn
                    .then(|| VoteRecord::default_with(tp_default, sl_default));
                return Ok(TurnOutput {
                    messages: vec![message],
                    vote,
                    status: AgentStatus::Error,
                    decision_tool: None,
                });
            }
        };

        self.events
            .on_agent_event(&AgentEvent::LLMCallCompleted {
                agent_id: self.id.clone(),
                agent_name: self.name.clone(),
                iteration: 0,
                response_length: response.content.len(),
            })
            .await;

        let (final_text, decision_tool) = if response.tool_calls.is_empty() {
            (response.content.to_string(), None)
        } else {
            self.status = AgentStatus::ToolUsing;
            self.execute_tools_and_synthesize(&context, &response).await
        };

        self.status = AgentStatus::Speaking;
        let kind = if is_signal_turn {
            MessageKind::Proposal
        } else {
            MessageKind::Information
        };
        let message = bus
            .publish(self.id.clone(), None, kind, final_text.clone())
            .await;

        let vote = if is_signal_turn {
            Some(parse_vote_record(&final_text, tp_default, sl_default))
        } else {
            None
        };

        self.events
            .on_agent_event(&AgentEvent::TurnCompleted {
                agent_id: self.id.clone(),
                agent_name: self.name.clone(),
                tool_calls_made: response.tool_calls.len(),
                response_length: final_text.len(),
            })
            .await;

        self.status = AgentStatus::Idle;
        Ok(TurnOutput {
            messages: vec![message],
            vote,
            status: AgentStatus::Idle,
            decision_tool,
        })
    }

    async fn execute_tools_and_synthesize(
        &self,
        context: &[LlmMessage],
        response: &LlmMessage,
    ) -> (String, Option<(String, ToolResult)>) {
        let mut decision_tool_used = false;
        let mut decision_result: Option<(String, ToolResult)> = None;
        let mut result_messages = Vec::new();

        for call in &response.tool_calls {
            let is_decision = self.tools.is_decision_tool(&call.name);
            if is_decision && decision_tool_used {
                self.events
                    .on_agent_event(&AgentEvent::DecisionToolDeduplicated {
                        agent_id: self.id.clone(),
                        agent_name: self.name.clone(),
                        tool_name: call.name.clone(),
                    })
                    .await;
                log::warn!(
                    "agent {}: dropped duplicate decision tool '{}' in same turn",
                    self.id,
                    call.name
                );
                continue;
            }
            if is_decision {
                decision_tool_used = true;
            }

            self.events
                .on_agent_event(&AgentEvent::ToolCallDetected {
                    agent_id: self.id.clone(),
                    agent_name: self.name.clone(),
                    tool_name: call.name.clone(),
                    parameters: call.arguments.clone(),
                })
                .await;

            let result = self.tools.invoke(&call.name, call.arguments.clone()).await;

            self.events
                .on_agent_event(&AgentEvent::ToolExecutionCompleted {
                    agent_id: self.id.clone(),
                    agent_name: self.name.clone(),
                    tool_name: call.name.clone(),
                    success: result.success,
                    error: result.error.clone(),
                })
                .await;

            if is_decision {
                decision_result = Some((call.name.clone(), result.clone()));
            }
            result_messages.push(LlmMessage::tool_result(call.id.clone(), result.summary.clone()));
        }

        let mut follow_up = context.to_vec();
        follow_up.push(LlmMessage {
            role: LlmRole::Assistant,
            content: response.content.clone(),
            tool_calls: response.tool_calls.clone(),
        });
        follow_up.extend(result_messages);
        follow_up.push(LlmMessage::user(
            "Do not call any tools; summarize the results as your final answer.",
        ));

        match self.llm.send(&follow_up, &[]).await {
            Ok((synthesis, _)) => (strip_tool_markers(&synthesis.content), decision_result),
            Err(e) => {
                log::warn!("agent {}: follow-up synthesis failed: {}", self.id, e);
                ("unable to synthesize tool results".to_string(), decision_result)
            }
        }
    }
}

/// Strips leftover fenced tool-call-looking blocks from a synthesis reply, as
/// defense in depth against a model re-emitting call syntax in free text.
fn strip_tool_markers(text: &str) -> String {
    text.replace("```tool_call", "")
        .replace("```", "")
        .trim()
        .to_string()
}

/// Extracts a [`VoteRecord`] from free-form agent output: first attempts
/// tolerant JSON extraction (fenced code blocks, surrounding prose), then
/// falls back to direction-word and confidence-number pattern matching.
pub fn parse_vote_record(text: &str, tp_default: f64, sl_default: f64) -> VoteRecord {
    if let Some(value) = extract_json_object(text) {
        return vote_from_json(&value, tp_default, sl_default);
    }
    vote_from_text(text, tp_default, sl_default)
}

/// Tolerant JSON extraction shared with the reflection pipeline (C9): first
/// a fenced ```json block, then a bare `{...}` span, then the whole text.
pub(crate) fn extract_json_object(text: &str) -> Option<JsonValue> {
    let candidates: Vec<&str> = if let Some(start) = text.find("```") {
        let rest = &text[start + 3..];
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        match rest.find("```") {
            Some(end) => vec![&rest[..end]],
            None => vec![text],
        }
    } else {
        vec![text]
    };

    for candidate in candidates {
        if let Ok(value) = serde_json::from_str::<JsonValue>(candidate.trim()) {
            return Some(value);
        }
        if let (Some(start), Some(end)) = (candidate.find('{'), candidate.rfind('}')) {
            if end > start {
                if let Ok(value) = serde_json::from_str::<JsonValue>(&candidate[start..=end]) {
                    return Some(value);
                }
            }
        }
    }
    None
}

fn vote_from_json(value: &JsonValue, tp_default: f64, sl_default: f64) -> VoteRecord {
    let direction = value
        .get("direction")
        .and_then(|v| v.as_str())
        .map(normalize_direction)
        .unwrap_or_else(|| "hold".to_string());
    let confidence = value
        .get("confidence")
        .and_then(|v| v.as_u64())
        .map(|v| v.min(100) as u8)
        .unwrap_or(0);
    let leverage = value
        .get("leverage")
        .and_then(|v| v.as_u64())
        .map(|v| v.max(1) as u32)
        .unwrap_or(1);
    let take_profit_percent = value
        .get("tp_percent")
        .or_else(|| value.get("take_profit_percent"))
        .and_then(|v| v.as_f64())
        .unwrap_or(tp_default);
    let stop_loss_percent = value
        .get("sl_percent")
        .or_else(|| value.get("stop_loss_percent"))
        .and_then(|v| v.as_f64())
        .unwrap_or(sl_default);

    VoteRecord {
        direction,
        confidence,
        leverage,
        take_profit_percent,
        stop_loss_percent,
    }
}

fn vote_from_text(text: &str, tp_default: f64, sl_default: f64) -> VoteRecord {
    let lower = text.to_lowercase();
    let direction = if contains_any(&lower, &["做多", "buy", "bullish", "long"]) {
        "long".to_string()
    } else if contains_any(&lower, &["做空", "sell", "bearish", "short"]) {
        "short".to_string()
    } else {
        "hold".to_string()
    };

    let confidence = extract_number_after(&lower, &["confidence", "信心度"])
        .map(|n| n.clamp(0, 100) as u8)
        .unwrap_or(0);

    VoteRecord {
        direction,
        confidence,
        leverage: 1,
        take_profit_percent: tp_default,
        stop_loss_percent: sl_default,
    }
}

fn normalize_direction(raw: &str) -> String {
    let lower = raw.to_lowercase();
    if contains_any(&lower, &["做多", "buy", "bullish", "long"]) {
        "long".to_string()
    } else if contains_any(&lower, &["做空", "sell", "bearish", "short"]) {
        "short".to_string()
    } else {
        "hold".to_string()
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

fn extract_number_after(text: &str, keywords: &[&str]) -> Option<i64> {
    for keyword in keywords {
        if let Some(pos) = text.find(keyword) {
            let rest = &text[pos + keyword.len()..];
            let digits: String = rest
                .chars()
                .skip_while(|c| !c.is_ascii_digit())
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if let Ok(n) = digits.parse::<i64>() {
                return Some(n);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_vote_record_from_fenced_json() {
        let text = "Here is my vote:\n```json\n{\"direction\":\"long\",\"confidence\":85}\n```\nThanks.";
        let vote = parse_vote_record(text, 5.0, 2.0);
        assert_eq!(vote.direction, "long");
        assert_eq!(vote.confidence, 85);
        assert_eq!(vote.take_profit_percent, 5.0);
    }

    #[test]
    fn parse_vote_record_from_bare_json() {
        let text = "{\"direction\":\"short\",\"confidence\":60,\"leverage\":3}";
        let vote = parse_vote_record(text, 5.0, 2.0);
        assert_eq!(vote.direction, "short");
        assert_eq!(vote.leverage, 3);
    }

    #[test]
    fn parse_vote_record_falls_back_to_text_pattern() {
        let text = "I am bullish on this, confidence 72 out of 100.";
        let vote = parse_vote_record(text, 5.0, 2.0);
        assert_eq!(vote.direction, "long");
        assert_eq!(vote.confidence, 72);
    }

    #[test]
    fn parse_vote_record_chinese_direction_words() {
        let text = "综合来看，我认为应该做空，信心度80";
        let vote = parse_vote_record(text, 5.0, 2.0);
        assert_eq!(vote.direction, "short");
        assert_eq!(vote.confidence, 80);
    }

    #[test]
    fn parse_vote_record_defaults_to_hold_on_garbage() {
        let vote = parse_vote_record("no clear signal here", 5.0, 2.0);
        assert_eq!(vote.direction, "hold");
        assert_eq!(vote.confidence, 0);
        assert_eq!(vote.leverage, 1);
    }

    #[test]
    fn strip_tool_markers_removes_fences() {
        let stripped = strip_tool_markers("```tool_call\n{...}\n``` final answer");
        assert_eq!(stripped, "\n{...}\n final answer".trim());
    }
}
