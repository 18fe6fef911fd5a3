//! Crate-wide error taxonomy.
//!
//! Each component family owns a plain error enum (`ToolError`, `LlmError`,
//! `AgentError`, `DdError`, `RoundtableError`, `LedgerError`), following the
//! per-module error enum convention of the surrounding codebase rather than a
//! single monolithic error type. Every variant also tags a [`ErrorKind`] from
//! the error-handling taxonomy so callers that only care about retry/skip
//! policy can match on `kind()` without knowing which component raised it.

use std::fmt;

/// High-level error taxonomy a caller can dispatch retry/containment policy on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// LLM 503, tool-service 5xx, network timeout.
    TransientRemote,
    /// 4xx from an upstream (bad schema, invalid API key).
    PermanentRemote,
    /// Invalid tool arguments, malformed LLM JSON output.
    SchemaViolation,
    /// A precondition for an action did not hold (e.g. no headroom to add).
    PreconditionFailure,
    /// Session or cycle cancellation.
    Cancelled,
    /// Assertion/invariant violation.
    Internal,
}

/// Top-level error every component-specific error can be converted into.
#[derive(Debug)]
pub struct CoreError {
    kind: ErrorKind,
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Errors from the tool registry and dispatcher (C1).
#[derive(Debug, Clone)]
pub enum ToolError {
    /// `Register` was called with a name already present in the registry.
    DuplicateTool(String),
    /// Invocation arguments failed schema validation (missing required field,
    /// unknown field, or type coercion failure).
    SchemaViolation(String),
    /// No tool is registered under this name.
    NotFound(String),
    /// The resolver (local handler or remote HTTP call) failed.
    ExecutionFailed(String),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::DuplicateTool(name) => write!(f, "tool '{}' already registered", name),
            ToolError::SchemaViolation(msg) => write!(f, "schema violation: {}", msg),
            ToolError::NotFound(name) => write!(f, "tool '{}' not found", name),
            ToolError::ExecutionFailed(msg) => write!(f, "tool execution failed: {}", msg),
        }
    }
}

impl std::error::Error for ToolError {}

impl From<ToolError> for CoreError {
    fn from(e: ToolError) -> Self {
        let kind = match &e {
            ToolError::DuplicateTool(_) => ErrorKind::Internal,
            ToolError::SchemaViolation(_) => ErrorKind::SchemaViolation,
            ToolError::NotFound(_) => ErrorKind::Internal,
            ToolError::ExecutionFailed(_) => ErrorKind::TransientRemote,
        };
        CoreError::new(kind, e.to_string())
    }
}

/// Errors from the LLM client (C2).
#[derive(Debug, Clone)]
pub enum LlmError {
    /// The gateway could not be reached, or every retry attempt failed.
    Unavailable(String),
    /// A non-retryable 4xx response from the gateway.
    PermanentFailure(String),
    /// The gateway returned a body this client could not parse.
    MalformedResponse(String),
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::Unavailable(msg) => write!(f, "LLMUnavailable: {}", msg),
            LlmError::PermanentFailure(msg) => write!(f, "permanent LLM failure: {}", msg),
            LlmError::MalformedResponse(msg) => write!(f, "malformed LLM response: {}", msg),
        }
    }
}

impl std::error::Error for LlmError {}

impl From<LlmError> for CoreError {
    fn from(e: LlmError) -> Self {
        let kind = match &e {
            LlmError::Unavailable(_) => ErrorKind::TransientRemote,
            LlmError::PermanentFailure(_) => ErrorKind::PermanentRemote,
            LlmError::MalformedResponse(_) => ErrorKind::SchemaViolation,
        };
        CoreError::new(kind, e.to_string())
    }
}

/// Errors surfaced from an agent turn. Per the containment policy these never
/// propagate past the turn boundary — the turn catches them and emits an
/// information-kind message instead.
#[derive(Debug, Clone)]
pub enum AgentError {
    Llm(String),
    Tool(String),
    VoteParse(String),
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::Llm(msg) => write!(f, "agent LLM error: {}", msg),
            AgentError::Tool(msg) => write!(f, "agent tool error: {}", msg),
            AgentError::VoteParse(msg) => write!(f, "agent vote-parse error: {}", msg),
        }
    }
}

impl std::error::Error for AgentError {}

impl From<AgentError> for CoreError {
    fn from(e: AgentError) -> Self {
        let kind = match &e {
            AgentError::Llm(_) => ErrorKind::TransientRemote,
            AgentError::Tool(_) => ErrorKind::TransientRemote,
            AgentError::VoteParse(_) => ErrorKind::SchemaViolation,
        };
        CoreError::new(kind, e.to_string())
    }
}

/// Errors from the DD state machine (C5).
#[derive(Debug, Clone)]
pub enum DdError {
    StepFailed { step: &'static str, reason: String },
    MalformedResume(String),
    Cancelled,
}

impl fmt::Display for DdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DdError::StepFailed { step, reason } => {
                write!(f, "step {} failed: {}", step, reason)
            }
            DdError::MalformedResume(msg) => write!(f, "malformed HITL resume: {}", msg),
            DdError::Cancelled => write!(f, "cancelled_during_hitl"),
        }
    }
}

impl std::error::Error for DdError {}

impl From<DdError> for CoreError {
    fn from(e: DdError) -> Self {
        let kind = match &e {
            DdError::StepFailed { .. } => ErrorKind::Internal,
            DdError::MalformedResume(_) => ErrorKind::SchemaViolation,
            DdError::Cancelled => ErrorKind::Cancelled,
        };
        CoreError::new(kind, e.to_string())
    }
}

/// Errors from the roundtable meeting engine (C6).
#[derive(Debug, Clone)]
pub enum RoundtableError {
    NoAgents,
    AgentNotFound(String),
    ExecutionFailed(String),
    /// A constructed [`crate::roundtable::TradingSignal`] violated one of its
    /// shape invariants (§8 property 3) — a 0-100 `amount_percent`, a TP/SL on
    /// the wrong side of entry, etc. Rejected loudly rather than rescaled.
    InvalidSignal(String),
}

impl fmt::Display for RoundtableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoundtableError::NoAgents => write!(f, "roundtable has no agents configured"),
            RoundtableError::AgentNotFound(id) => write!(f, "agent '{}' not found", id),
            RoundtableError::ExecutionFailed(msg) => write!(f, "execution failed: {}", msg),
            RoundtableError::InvalidSignal(msg) => write!(f, "invalid trading signal: {}", msg),
        }
    }
}

impl std::error::Error for RoundtableError {}

impl From<RoundtableError> for CoreError {
    fn from(e: RoundtableError) -> Self {
        let kind = match &e {
            RoundtableError::NoAgents => ErrorKind::Internal,
            RoundtableError::AgentNotFound(_) => ErrorKind::Internal,
            RoundtableError::ExecutionFailed(_) => ErrorKind::TransientRemote,
            RoundtableError::InvalidSignal(_) => ErrorKind::SchemaViolation,
        };
        CoreError::new(kind, e.to_string())
    }
}

/// Errors from the paper trader ledger contract (C7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// A position-opening call arrived while a position already exists.
    AlreadyHasPosition,
    /// No position exists to close.
    NoPosition,
    /// The requested operation violates a precondition (e.g. no headroom).
    PreconditionFailure(String),
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::AlreadyHasPosition => write!(f, "AlreadyHasPosition"),
            LedgerError::NoPosition => write!(f, "no open position"),
            LedgerError::PreconditionFailure(msg) => write!(f, "precondition failure: {}", msg),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<LedgerError> for CoreError {
    fn from(e: LedgerError) -> Self {
        let kind = match &e {
            LedgerError::AlreadyHasPosition => ErrorKind::PreconditionFailure,
            LedgerError::NoPosition => ErrorKind::PreconditionFailure,
            LedgerError::PreconditionFailure(_) => ErrorKind::PreconditionFailure,
        };
        CoreError::new(kind, e.to_string())
    }
}
