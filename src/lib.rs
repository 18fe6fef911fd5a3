//! `roundtable-core`: the deliberation and decision orchestration core for
//! an automated due-diligence and trading platform.
//!
//! Two orchestrators share the same agent/tool/memory substrate:
//!
//! - [`dd`] — a linear due-diligence state machine that walks a project
//!   through a fixed step sequence, pausing for human-in-the-loop review.
//! - [`roundtable`] — a bounded-round multi-agent debate engine that either
//!   produces an analysis memo or, in trading mode, dispatches a validated
//!   [`roundtable::TradingSignal`] against the [`ledger`].
//!
//! The supporting components ([`tool_registry`], [`llm_client`],
//! [`message_bus`], [`agent`], [`memory`], [`scheduler`], [`session`]) are
//! shared by both orchestrators.

pub mod agent;
pub mod config;
pub mod dd;
pub mod error;
pub mod event;
pub mod ledger;
pub mod llm_client;
pub mod memory;
pub mod message_bus;
pub mod roundtable;
pub mod scheduler;
pub mod session;
pub mod tool_registry;

pub use agent::{Agent, AgentStatus, TurnOutput, VoteRecord};
pub use config::OrchestratorConfig;
pub use dd::{DdState, DdStateMachine};
pub use error::{CoreError, ErrorKind};
pub use event::{EventHandler, NoopEventHandler};
pub use ledger::{PaperTraderLedger, Position, PositionContext, PositionSide, TradeOutcome};
pub use llm_client::{GatewayLlmClient, LlmClient, Message, Role};
pub use memory::AgentMemory;
pub use message_bus::{BusMessage, MessageBus, MessageKind};
pub use roundtable::{MeetingOutcome, RoundtableEngine, RoundtableMode, TradingSignal, VoteAggregate};
pub use scheduler::{CycleOutcome, CycleRunner, Scheduler};
pub use session::{Session, SessionKind, SessionRegistry};
pub use tool_registry::{ToolMetadata, ToolRegistry, ToolResult};
