//! Observability events for agents, the DD state machine, the roundtable
//! engine, and the scheduler.
//!
//! Mirrors the shape of a callback-based event system: a single
//! [`EventHandler`] trait with default no-op methods, shared via
//! `Arc<dyn EventHandler>` across every component that emits events. Override
//! only what you care about.

use crate::ledger::TradeOutcome;
use async_trait::async_trait;

/// Events emitted by an [`crate::agent::Agent`] during a turn.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A turn started.
    TurnStarted { agent_id: String, agent_name: String },
    /// A turn completed, successfully or not.
    TurnCompleted {
        agent_id: String,
        agent_name: String,
        tool_calls_made: usize,
        response_length: usize,
    },
    /// An LLM round-trip started inside a turn.
    LLMCallStarted {
        agent_id: String,
        agent_name: String,
        iteration: usize,
    },
    /// An LLM round-trip completed.
    LLMCallCompleted {
        agent_id: String,
        agent_name: String,
        iteration: usize,
        response_length: usize,
    },
    /// A tool call was detected in the LLM's response.
    ToolCallDetected {
        agent_id: String,
        agent_name: String,
        tool_name: String,
        parameters: serde_json::Value,
    },
    /// A decision-tool call was dropped because one was already executed
    /// this turn (C4 de-duplication rule).
    DecisionToolDeduplicated {
        agent_id: String,
        agent_name: String,
        tool_name: String,
    },
    /// A tool call finished.
    ToolExecutionCompleted {
        agent_id: String,
        agent_name: String,
        tool_name: String,
        success: bool,
        error: Option<String>,
    },
    /// The agent transitioned to the `error` status after an unrecoverable
    /// failure inside a turn.
    TurnFailed {
        agent_id: String,
        agent_name: String,
        error: String,
    },
}

/// Events emitted by the DD state machine (C5).
#[derive(Debug, Clone)]
pub enum DdEvent {
    /// A step transitioned status (enter, progress tick, or exit). Carries a
    /// snapshot of the full in-flight steps array alongside the one that
    /// transitioned, so a subscriber attaching mid-run can reconstruct
    /// complete DD progress state from this event alone.
    StepTransitioned {
        session_id: String,
        step: String,
        status: String,
        progress: u8,
        all_steps: Vec<crate::dd::Step>,
    },
    /// The machine suspended awaiting human-in-the-loop input.
    HitlRequired { session_id: String },
    /// The machine resumed after a HITL signal.
    SessionResumed { session_id: String },
    /// The session reached a terminal state.
    SessionTerminated { session_id: String, status: String },
}

/// Events emitted by the roundtable meeting engine (C6).
#[derive(Debug, Clone)]
pub enum OrchestrationEvent {
    RunStarted {
        session_id: String,
        mode: String,
        agent_count: usize,
    },
    RunCompleted {
        session_id: String,
        rounds: usize,
        is_complete: bool,
    },
    RoundStarted { session_id: String, round: usize },
    RoundCompleted { session_id: String, round: usize },
    AgentSelected {
        session_id: String,
        agent_id: String,
        reason: String,
    },
    AgentResponded {
        session_id: String,
        agent_id: String,
        response_length: usize,
    },
    AgentFailed {
        session_id: String,
        agent_id: String,
        error: String,
    },
    ConsensusChecked {
        session_id: String,
        round: usize,
        direction: Option<String>,
        converged: bool,
    },
}

/// Events emitted by the scheduler (C8).
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    CycleStarted {
        cycle: u64,
        reason: &'static str,
    },
    CycleCompleted {
        cycle: u64,
        outcome: String,
        next_start_in_secs: u64,
    },
}

/// Events emitted by the memory/reflection pipeline (C9).
#[derive(Debug, Clone)]
pub enum MemoryEvent {
    ReflectionApplied {
        agent_id: String,
        outcome: TradeOutcome,
    },
    ReflectionFailed { agent_id: String, reason: String },
}

/// Receives events from every component. All methods default to a no-op, so
/// implementors only override the events they care about.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_agent_event(&self, _event: &AgentEvent) {}
    async fn on_dd_event(&self, _event: &DdEvent) {}
    async fn on_orchestration_event(&self, _event: &OrchestrationEvent) {}
    async fn on_scheduler_event(&self, _event: &SchedulerEvent) {}
    async fn on_memory_event(&self, _event: &MemoryEvent) {}
}

/// An [`EventHandler`] that does nothing; the default when no observer is wired up.
pub struct NoopEventHandler;

#[async_trait]
impl EventHandler for NoopEventHandler {}
