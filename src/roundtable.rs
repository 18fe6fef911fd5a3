//! Roundtable Meeting Engine (C6).
//!
//! Drives a roster of agents across a bounded number of rounds through five
//! ordered phases: market analysis, signal generation, risk review,
//! consensus, and (trading mode only) execution. Mode is a constructor-time
//! enum rather than a boolean flag threaded through every method, following
//! the teacher's `OrchestrationMode` shape.

use crate::agent::{Agent, TurnOutput, VoteRecord};
use crate::config::OrchestratorConfig;
use crate::error::RoundtableError;
use crate::event::{EventHandler, OrchestrationEvent};
use crate::ledger::{PaperTraderLedger, Position, PositionContext, TradeOutcome};
use crate::message_bus::{HistoryFilter, MessageBus, MessageKind};
use crate::tool_registry::{JsonSchemaType, ToolParameter, ToolRegistry, ToolResolver};
use std::collections::HashMap;
use std::sync::Arc;

/// Analysis mode stops after the leader's consensus synthesis; trading mode
/// proceeds to an execution phase guarded by the trade lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundtableMode {
    Analysis,
    Trading,
}

/// Outcome of one roundtable run.
#[derive(Debug, Clone)]
pub enum MeetingOutcome {
    Memo { synthesis: String },
    TradeExecuted { tool_name: String, detail: String },
    Hold { reason: String },
    RoundCapReached { forced_synthesis: String },
}

/// Aggregated votes from the signal-generation phase.
#[derive(Debug, Clone, Default)]
pub struct VoteAggregate {
    pub votes: Vec<(String, VoteRecord)>,
}

impl VoteAggregate {
    /// Consensus direction iff at least `ceil(N/2)+1` analysts agree.
    pub fn consensus_direction(&self) -> Option<String> {
        if self.votes.is_empty() {
            return None;
        }
        let mut counts = std::collections::HashMap::new();
        for (_, vote) in &self.votes {
            *counts.entry(vote.direction.clone()).or_insert(0usize) += 1;
        }
        let n = self.votes.len();
        let threshold = (n + 1) / 2 + 1;
        counts
            .into_iter()
            .find(|(_, count)| *count >= threshold)
            .map(|(direction, _)| direction)
    }

    /// Mean confidence across every vote, regardless of direction, gating
    /// whether the leader is even allowed to act on the consensus.
    pub fn mean_confidence(&self) -> f64 {
        if self.votes.is_empty() {
            return 0.0;
        }
        self.votes.iter().map(|(_, v)| v.confidence as f64).sum::<f64>() / self.votes.len() as f64
    }

    /// Mean take-profit/stop-loss percent among votes agreeing with `direction`.
    fn mean_tp_sl_for(&self, direction: &str) -> (f64, f64) {
        let matching: Vec<&VoteRecord> = self
            .votes
            .iter()
            .filter(|(_, v)| v.direction == direction)
            .map(|(_, v)| v)
            .collect();
        if matching.is_empty() {
            return (5.0, 2.0);
        }
        let n = matching.len() as f64;
        let tp = matching.iter().map(|v| v.take_profit_percent).sum::<f64>() / n;
        let sl = matching.iter().map(|v| v.stop_loss_percent).sum::<f64>() / n;
        (tp, sl)
    }

    /// Per-agent direction map, the consensus record a [`TradingSignal`] carries.
    pub fn consensus_map(&self) -> HashMap<String, String> {
        self.votes
            .iter()
            .map(|(agent_id, v)| (agent_id.clone(), v.direction.clone()))
            .collect()
    }
}

/// The risk-assessor's verdict after reviewing the vote aggregate.
#[derive(Debug, Clone)]
pub struct RiskReview {
    pub summary: String,
    pub objection: bool,
}

/// A validated, fully-shaped trading decision, built from the vote aggregate
/// and [`OrchestratorConfig`] at the execution phase boundary. Constructing
/// one is the single point where a malformed signal (an out-of-range
/// `amount_percent`, a take-profit/stop-loss on the wrong side of entry) is
/// rejected loudly rather than silently clamped or rescaled.
#[derive(Debug, Clone)]
pub struct TradingSignal {
    pub direction: String,
    pub symbol: String,
    pub leverage: u32,
    /// Fraction of available balance to commit, in `(0.0, 1.0]` — not a 0-100 percent.
    pub amount_percent: f64,
    pub entry_price: f64,
    pub take_profit_price: f64,
    pub stop_loss_price: f64,
    pub confidence: u8,
    pub reasoning: String,
    pub consensus: HashMap<String, String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl TradingSignal {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        direction: impl Into<String>,
        symbol: impl Into<String>,
        leverage: u32,
        amount_percent: f64,
        entry_price: f64,
        take_profit_price: f64,
        stop_loss_price: f64,
        confidence: u8,
        reasoning: impl Into<String>,
        consensus: HashMap<String, String>,
    ) -> Result<Self, RoundtableError> {
        let direction = direction.into();
        if direction != "long" && direction != "short" {
            return Err(RoundtableError::InvalidSignal(format!(
                "direction must be 'long' or 'short', got '{}'",
                direction
            )));
        }
        if !(amount_percent > 0.0 && amount_percent <= 1.0) {
            return Err(RoundtableError::InvalidSignal(format!(
                "amount_percent must be a fraction in (0.0, 1.0], got {}",
                amount_percent
            )));
        }
        let sides_ok = match direction.as_str() {
            "long" => take_profit_price > entry_price && entry_price > stop_loss_price,
            "short" => take_profit_price < entry_price && entry_price < stop_loss_price,
            _ => unreachable!(),
        };
        if !sides_ok {
            return Err(RoundtableError::InvalidSignal(format!(
                "take_profit_price/stop_loss_price on the wrong side of entry for a {} \
                 (entry={}, tp={}, sl={})",
                direction, entry_price, take_profit_price, stop_loss_price
            )));
        }
        Ok(Self {
            direction,
            symbol: symbol.into(),
            leverage: leverage.max(1),
            amount_percent,
            entry_price,
            take_profit_price,
            stop_loss_price,
            confidence,
            reasoning: reasoning.into(),
            consensus,
            created_at: chrono::Utc::now(),
        })
    }

    /// Reward-to-risk ratio as the distance to take-profit divided by the
    /// distance to stop-loss, both measured from entry.
    pub fn risk_reward_ratio(&self) -> f64 {
        let reward = (self.take_profit_price - self.entry_price).abs();
        let risk = (self.entry_price - self.stop_loss_price).abs();
        if risk == 0.0 {
            f64::INFINITY
        } else {
            reward / risk
        }
    }

    fn take_profit_for(direction: &str, entry: f64, tp_percent: f64) -> f64 {
        match direction {
            "long" => entry * (1.0 + tp_percent / 100.0),
            _ => entry * (1.0 - tp_percent / 100.0),
        }
    }

    fn stop_loss_for(direction: &str, entry: f64, sl_percent: f64) -> f64 {
        match direction {
            "long" => entry * (1.0 - sl_percent / 100.0),
            _ => entry * (1.0 + sl_percent / 100.0),
        }
    }
}

/// Drives one roundtable meeting for a fixed agent roster.
pub struct RoundtableEngine {
    mode: RoundtableMode,
    max_rounds: usize,
    bus: Arc<MessageBus>,
    events: Arc<dyn EventHandler>,
    session_id: String,
    config: Arc<OrchestratorConfig>,
    /// Optional reflection pipeline (C9). When set, a successful open records
    /// each voting analyst's prediction and a successful close fires one
    /// detached reflection task per analyst with a stored prediction, per
    /// the "reflection never blocks the next cycle" resolution (§9).
    reflection: Option<Arc<crate::memory::ReflectionPipeline>>,
}

impl RoundtableEngine {
    pub fn new(
        session_id: impl Into<String>,
        mode: RoundtableMode,
        max_rounds: usize,
        bus: Arc<MessageBus>,
        events: Arc<dyn EventHandler>,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        Self {
            mode,
            max_rounds,
            bus,
            events,
            session_id: session_id.into(),
            config,
            reflection: None,
        }
    }

    pub fn with_reflection(mut self, reflection: Arc<crate::memory::ReflectionPipeline>) -> Self {
        self.reflection = Some(reflection);
        self
    }

    /// Run the full meeting: phases 1-4 always, phase 5 only in trading mode.
    /// `analysts` excludes the leader and risk assessor; `leader` takes the
    /// consensus/execution turns; `risk_assessor` takes the risk-review turn.
    pub async fn run(
        &self,
        analysts: &mut [Agent],
        risk_assessor: &mut Agent,
        leader: &mut Agent,
        ledger: Option<&PaperTraderLedger>,
    ) -> Result<MeetingOutcome, RoundtableError> {
        if analysts.is_empty() {
            return Err(RoundtableError::NoAgents);
        }

        self.events
            .on_orchestration_event(&OrchestrationEvent::RunStarted {
                session_id: self.session_id.clone(),
                mode: format!("{:?}", self.mode),
                agent_count: analysts.len() + 2,
            })
            .await;

        let mut round = 0usize;
        let position_summary = match (self.mode, &ledger) {
            (RoundtableMode::Trading, Some(ledger)) => {
                let snapshot = ledger
                    .snapshot()
                    .await
                    .map_err(|e| RoundtableError::ExecutionFailed(e.to_string()))?;
                Some(position_summary_text(&snapshot))
            }
            _ => None,
        };

        // Phase 1: market analysis.
        round += 1;
        self.begin_round(round).await;
        for agent in analysts.iter_mut() {
            self.run_agent_turn(
                agent,
                position_summary.as_deref(),
                "Share your market analysis for this cycle. Be specific and cite data.",
                false,
                0.0,
                0.0,
            )
            .await?;
        }
        self.end_round(round).await;
        if round >= self.max_rounds {
            return self.force_synthesis(leader, position_summary.as_deref()).await;
        }

        // Phase 2: signal generation.
        round += 1;
        self.begin_round(round).await;
        let mut aggregate = VoteAggregate::default();
        for agent in analysts.iter_mut() {
            let turn = self
                .run_agent_turn(
                    agent,
                    position_summary.as_deref(),
                    "Generate your trading signal as a JSON vote record with fields direction, confidence, leverage.",
                    true,
                    5.0,
                    2.0,
                )
                .await?;
            if let Some(vote) = turn.vote {
                aggregate.votes.push((agent.id().to_string(), vote));
            }
        }
        self.end_round(round).await;
        if round >= self.max_rounds {
            return self.force_synthesis(leader, position_summary.as_deref()).await;
        }

        // Phase 3: risk review.
        round += 1;
        self.begin_round(round).await;
        let risk_instruction = format!(
            "Review the aggregated votes: {:?}. Publish a risk summary, flagging an objection if warranted.",
            aggregate.votes.iter().map(|(id, v)| format!("{}:{}@{}", id, v.direction, v.confidence)).collect::<Vec<_>>()
        );
        self.run_agent_turn(risk_assessor, position_summary.as_deref(), &risk_instruction, false, 0.0, 0.0)
            .await?;
        let risk_objection = self.detect_objection(risk_assessor.id()).await;
        self.end_round(round).await;
        if round >= self.max_rounds {
            return self.force_synthesis(leader, position_summary.as_deref()).await;
        }

        // Phase 4: consensus.
        round += 1;
        self.begin_round(round).await;
        let consensus_direction = aggregate.consensus_direction();
        self.events
            .on_orchestration_event(&OrchestrationEvent::ConsensusChecked {
                session_id: self.session_id.clone(),
                round,
                direction: consensus_direction.clone(),
                converged: consensus_direction.is_some() && !risk_objection,
            })
            .await;
        let consensus_instruction = "Synthesize the analyses, votes, and risk review into a final decision. \
            If overriding majority consensus, explicitly cite the risk assessor's objection.";
        self.run_agent_turn(leader, position_summary.as_deref(), consensus_instruction, false, 0.0, 0.0)
            .await?;
        self.end_round(round).await;

        if self.mode == RoundtableMode::Analysis {
            self.events
                .on_orchestration_event(&OrchestrationEvent::RunCompleted {
                    session_id: self.session_id.clone(),
                    rounds: round,
                    is_complete: true,
                })
                .await;
            return Ok(MeetingOutcome::Memo {
                synthesis: self.last_message_from(leader.id()).await,
            });
        }

        // Phase 5: execution (trading mode only).
        round += 1;
        self.begin_round(round).await;
        let ledger = ledger.expect("trading mode requires a ledger");
        let snapshot = ledger
            .snapshot()
            .await
            .map_err(|e| RoundtableError::ExecutionFailed(e.to_string()))?;
        let execution_instruction = format!(
            "State your final decision in plain language, choosing exactly one of the \
             allowed operations: {:?}.",
            snapshot.allowed_operations()
        );
        self.run_agent_turn(
            leader,
            Some(&position_summary_text(&snapshot)),
            &execution_instruction,
            false,
            0.0,
            0.0,
        )
        .await?;
        let outcome = self.execute_decision(leader, analysts, &snapshot, ledger, &aggregate).await?;
        self.end_round(round).await;

        self.events
            .on_orchestration_event(&OrchestrationEvent::RunCompleted {
                session_id: self.session_id.clone(),
                rounds: round,
                is_complete: true,
            })
            .await;
        Ok(outcome)
    }

    async fn begin_round(&self, round: usize) {
        self.events
            .on_orchestration_event(&OrchestrationEvent::RoundStarted {
                session_id: self.session_id.clone(),
                round,
            })
            .await;
    }

    async fn end_round(&self, round: usize) {
        self.events
            .on_orchestration_event(&OrchestrationEvent::RoundCompleted {
                session_id: self.session_id.clone(),
                round,
            })
            .await;
    }

    async fn run_agent_turn(
        &self,
        agent: &mut Agent,
        position_summary: Option<&str>,
        instruction: &str,
        is_signal_turn: bool,
        tp_default: f64,
        sl_default: f64,
    ) -> Result<TurnOutput, RoundtableError> {
        self.events
            .on_orchestration_event(&OrchestrationEvent::AgentSelected {
                session_id: self.session_id.clone(),
                agent_id: agent.id().to_string(),
                reason: instruction.to_string(),
            })
            .await;
        let bus_excerpt = self.bus.recent_for(agent.id(), 50).await;
        let output = agent
            .take_turn(&self.bus, position_summary, &bus_excerpt, instruction, is_signal_turn, tp_default, sl_default)
            .await
            .map_err(|e| RoundtableError::ExecutionFailed(e.to_string()))?;
        let response_length = output.messages.iter().map(|m| m.content.len()).sum();
        self.events
            .on_orchestration_event(&OrchestrationEvent::AgentResponded {
                session_id: self.session_id.clone(),
                agent_id: agent.id().to_string(),
                response_length,
            })
            .await;
        Ok(output)
    }

    async fn detect_objection(&self, risk_assessor_id: &str) -> bool {
        let history = self
            .bus
            .history(&HistoryFilter {
                sender: Some(risk_assessor_id.to_string()),
                ..Default::default()
            })
            .await;
        history
            .last()
            .map(|m| m.kind == MessageKind::Objection || m.content.to_lowercase().contains("objection"))
            .unwrap_or(false)
    }

    async fn last_message_from(&self, sender_id: &str) -> String {
        self.bus
            .history(&HistoryFilter {
                sender: Some(sender_id.to_string()),
                ..Default::default()
            })
            .await
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }

    async fn force_synthesis(
        &self,
        leader: &mut Agent,
        position_summary: Option<&str>,
    ) -> Result<MeetingOutcome, RoundtableError> {
        log::warn!("roundtable[{}]: round cap reached, forcing leader synthesis", self.session_id);
        self.run_agent_turn(
            leader,
            position_summary,
            "Round cap reached. Synthesize everything so far into a final decision now.",
            false,
            0.0,
            0.0,
        )
        .await?;
        let synthesis = self.last_message_from(leader.id()).await;
        Ok(MeetingOutcome::RoundCapReached { forced_synthesis: synthesis })
    }

    /// Build a [`TradingSignal`] from the consensus direction and vote
    /// aggregate, deriving leverage and position size from
    /// [`OrchestratorConfig`] rather than trusting the leader's free text for
    /// anything beyond direction (§3 Trading Signal, S3 scenario).
    fn build_signal(
        &self,
        direction: &str,
        snapshot: &PositionContext,
        aggregate: &VoteAggregate,
        reasoning: String,
    ) -> Result<TradingSignal, RoundtableError> {
        let leverage = ((self.config.max_leverage as f64) * 0.6).floor().max(1.0) as u32;
        let amount_percent = self.config.max_position_percent.clamp(0.01, 1.0);
        let (tp_percent, sl_percent) = aggregate.mean_tp_sl_for(direction);
        let entry_price = snapshot.current_price;
        let take_profit_price = TradingSignal::take_profit_for(direction, entry_price, tp_percent);
        let stop_loss_price = TradingSignal::stop_loss_for(direction, entry_price, sl_percent);
        let confidence = aggregate.mean_confidence().round().clamp(0.0, 100.0) as u8;
        TradingSignal::new(
            direction,
            snapshot.symbol.clone(),
            leverage,
            amount_percent,
            entry_price,
            take_profit_price,
            stop_loss_price,
            confidence,
            reasoning,
            aggregate.consensus_map(),
        )
    }

    /// Dispatch the leader's decision-tool call against the ledger, guarded
    /// by the position context: if the chosen action is impossible given the
    /// current snapshot, substitute `hold` with a logged reason. A consensus
    /// whose mean confidence falls below `MIN_CONFIDENCE` never reaches the
    /// ledger regardless of direction.
    ///
    /// Every ledger write goes through the same dispatcher the LLM-facing
    /// tools use (C1): the engine computes its own arguments (leverage,
    /// sizing, tp/sl) and invokes the registry by name rather than calling
    /// `ledger.open_long`/`close_position`/etc. directly.
    async fn execute_decision(
        &self,
        leader: &Agent,
        analysts: &[Agent],
        snapshot: &PositionContext,
        ledger: &PaperTraderLedger,
        aggregate: &VoteAggregate,
    ) -> Result<MeetingOutcome, RoundtableError> {
        let last = self.last_message_from(leader.id()).await;
        let requested = infer_decision_tool(&last, snapshot);
        let registry = execution_registry(ledger);

        if matches!(requested.as_str(), "open_long" | "open_short") {
            if aggregate.mean_confidence() < self.config.min_confidence as f64 {
                log::info!(
                    "roundtable[{}]: mean confidence {:.1} below MIN_CONFIDENCE {}, holding",
                    self.session_id,
                    aggregate.mean_confidence(),
                    self.config.min_confidence
                );
                let _ = registry.invoke("hold", serde_json::json!({})).await;
                return Ok(MeetingOutcome::Hold { reason: "confidence below MIN_CONFIDENCE".to_string() });
            }
        }

        match requested.as_str() {
            "open_long" | "open_short" => {
                let direction = if requested == "open_long" { "long" } else { "short" };
                let signal = self.build_signal(direction, snapshot, aggregate, last.clone())?;
                let amount_usdt = snapshot.available_balance * signal.amount_percent;
                let args = serde_json::json!({
                    "leverage": signal.leverage,
                    "amount_usdt": amount_usdt,
                    "take_profit_price": signal.take_profit_price,
                    "stop_loss_price": signal.stop_loss_price,
                });
                let result = registry.invoke(&requested, args).await;
                if result.success {
                    let position: Position = serde_json::from_value(result.result)
                        .map_err(|e| RoundtableError::ExecutionFailed(e.to_string()))?;
                    self.record_predictions(analysts, aggregate, &position.trade_id).await;
                    Ok(MeetingOutcome::TradeExecuted {
                        tool_name: requested.clone(),
                        detail: format!(
                            "{} {}x leverage, {:.1}% of equity, rr={:.2}",
                            requested,
                            signal.leverage,
                            signal.amount_percent * 100.0,
                            signal.risk_reward_ratio()
                        ),
                    })
                } else {
                    hold_or_fail(&self.session_id, &requested, result.error)
                }
            }
            "close_position" => {
                let result = registry.invoke("close_position", serde_json::json!({})).await;
                if result.success {
                    let outcome: TradeOutcome = serde_json::from_value(result.result)
                        .map_err(|e| RoundtableError::ExecutionFailed(e.to_string()))?;
                    self.spawn_reflections(analysts, outcome.clone());
                    Ok(MeetingOutcome::TradeExecuted {
                        tool_name: "close_position".to_string(),
                        detail: describe_outcome(&outcome),
                    })
                } else {
                    hold_or_fail(&self.session_id, "close_position", result.error)
                }
            }
            "add_long" | "add_short" => {
                let additional_usdt = snapshot.remaining_headroom_usdt().min(
                    snapshot.available_balance * self.config.max_position_percent,
                );
                let args = serde_json::json!({ "additional_usdt": additional_usdt });
                let result = registry.invoke(&requested, args).await;
                if result.success {
                    let position: Position = serde_json::from_value(result.result)
                        .map_err(|e| RoundtableError::ExecutionFailed(e.to_string()))?;
                    Ok(MeetingOutcome::TradeExecuted {
                        tool_name: requested.clone(),
                        detail: format!("position now {:.0} USDT notional", position.amount_usdt),
                    })
                } else {
                    hold_or_fail(&self.session_id, &requested, result.error)
                }
            }
            "reverse" => {
                let direction = snapshot.direction().map(|d| d.to_string()).unwrap_or_default();
                let new_direction = if direction == "long" { "short" } else { "long" };
                let signal = self.build_signal(new_direction, snapshot, aggregate, last.clone())?;
                let args = serde_json::json!({
                    "take_profit_price": signal.take_profit_price,
                    "stop_loss_price": signal.stop_loss_price,
                });
                let result = registry.invoke("reverse", args).await;
                if result.success {
                    let (closed, opened): (TradeOutcome, Position) = serde_json::from_value(result.result)
                        .map_err(|e| RoundtableError::ExecutionFailed(e.to_string()))?;
                    self.spawn_reflections(analysts, closed.clone());
                    self.record_predictions(analysts, aggregate, &opened.trade_id).await;
                    Ok(MeetingOutcome::TradeExecuted {
                        tool_name: "reverse".to_string(),
                        detail: format!("{} then opened {:?}", describe_outcome(&closed), opened.side),
                    })
                } else {
                    hold_or_fail(&self.session_id, "reverse", result.error)
                }
            }
            _ => {
                let _ = registry.invoke("hold", serde_json::json!({})).await;
                Ok(MeetingOutcome::Hold { reason: "leader chose hold".to_string() })
            }
        }
    }

    /// Record each voting analyst's prediction for the newly opened trade
    /// (§4.9 step 1: "locate the predictions each agent emitted for the
    /// closed trade" — stored here, at open time, keyed by trade id).
    async fn record_predictions(&self, analysts: &[Agent], aggregate: &VoteAggregate, trade_id: &str) {
        for (agent_id, vote) in &aggregate.votes {
            let Some(agent) = analysts.iter().find(|a| a.id() == agent_id.as_str()) else {
                continue;
            };
            let Some(memory) = agent.memory() else {
                continue;
            };
            let prediction = crate::memory::Prediction {
                trade_id: trade_id.to_string(),
                predicted_direction: vote.direction.clone(),
                confidence: vote.confidence,
                reasoning: self.last_message_from(agent_id).await,
            };
            if let Err(e) = memory.record_prediction(trade_id, prediction) {
                log::warn!(
                    "roundtable[{}]: failed to record prediction for {}: {}",
                    self.session_id, agent_id, e
                );
            }
        }
    }

    /// Fire one detached reflection task per analyst with a memory handle and
    /// a recorded prediction for this trade. Best-effort: a slow or failing
    /// reflection LLM call never blocks the scheduler's next cycle (§9).
    fn spawn_reflections(&self, analysts: &[Agent], outcome: TradeOutcome) {
        let Some(pipeline) = self.reflection.clone() else {
            return;
        };
        for agent in analysts {
            let Some(memory) = agent.memory().cloned() else {
                continue;
            };
            let pipeline = pipeline.clone();
            let outcome = outcome.clone();
            tokio::spawn(async move {
                let trade_id = outcome.trade_id.clone();
                pipeline.reflect(&memory, &trade_id, &outcome).await;
            });
        }
    }
}

/// Build the execution-phase dispatcher (C1): every ledger write the engine
/// issues during `execute_decision` is registered here as a decision tool and
/// reached only through `ToolRegistry::invoke`, never by calling the ledger
/// directly.
fn execution_registry(ledger: &PaperTraderLedger) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    for name in ["open_long", "open_short"] {
        let ledger = ledger.clone();
        let side_is_long = name == "open_long";
        registry
            .register(
                name,
                if side_is_long { "Opens a long position" } else { "Opens a short position" },
                vec![
                    ToolParameter::new("leverage", JsonSchemaType::Integer, "leverage multiplier", true),
                    ToolParameter::new("amount_usdt", JsonSchemaType::Number, "notional size in USDT", true),
                    ToolParameter::new("take_profit_price", JsonSchemaType::Number, "take-profit price", true),
                    ToolParameter::new("stop_loss_price", JsonSchemaType::Number, "stop-loss price", true),
                ],
                ToolResolver::asynchronous(move |args| {
                    let ledger = ledger.clone();
                    async move {
                        let leverage = args["leverage"].as_u64().unwrap_or(1) as u32;
                        let amount_usdt = args["amount_usdt"].as_f64().unwrap_or(0.0);
                        let take_profit_price = args["take_profit_price"].as_f64().unwrap_or(0.0);
                        let stop_loss_price = args["stop_loss_price"].as_f64().unwrap_or(0.0);
                        let result = if side_is_long {
                            ledger.open_long(leverage, amount_usdt, take_profit_price, stop_loss_price).await
                        } else {
                            ledger.open_short(leverage, amount_usdt, take_profit_price, stop_loss_price).await
                        };
                        result
                            .map(|position| serde_json::to_value(position).unwrap())
                            .map_err(|e| e.to_string())
                    }
                }),
                true,
            )
            .unwrap();
    }

    {
        let ledger = ledger.clone();
        registry
            .register(
                "close_position",
                "Closes the open position",
                vec![],
                ToolResolver::asynchronous(move |_args| {
                    let ledger = ledger.clone();
                    async move {
                        ledger
                            .close_position()
                            .await
                            .map(|outcome| serde_json::to_value(outcome).unwrap())
                            .map_err(|e| e.to_string())
                    }
                }),
                true,
            )
            .unwrap();
    }

    for name in ["add_long", "add_short"] {
        let ledger = ledger.clone();
        registry
            .register(
                name,
                "Adds to the open position in the same direction",
                vec![ToolParameter::new(
                    "additional_usdt",
                    JsonSchemaType::Number,
                    "additional notional in USDT",
                    true,
                )],
                ToolResolver::asynchronous(move |args| {
                    let ledger = ledger.clone();
                    async move {
                        let additional_usdt = args["additional_usdt"].as_f64().unwrap_or(0.0);
                        ledger
                            .add_to_position(additional_usdt)
                            .await
                            .map(|position| serde_json::to_value(position).unwrap())
                            .map_err(|e| e.to_string())
                    }
                }),
                true,
            )
            .unwrap();
    }

    {
        let ledger = ledger.clone();
        registry
            .register(
                "reverse",
                "Closes the open position and immediately opens the opposite direction",
                vec![
                    ToolParameter::new("take_profit_price", JsonSchemaType::Number, "take-profit price", true),
                    ToolParameter::new("stop_loss_price", JsonSchemaType::Number, "stop-loss price", true),
                ],
                ToolResolver::asynchronous(move |args| {
                    let ledger = ledger.clone();
                    async move {
                        let take_profit_price = args["take_profit_price"].as_f64().unwrap_or(0.0);
                        let stop_loss_price = args["stop_loss_price"].as_f64().unwrap_or(0.0);
                        ledger
                            .reverse_position(take_profit_price, stop_loss_price)
                            .await
                            .map(|(closed, opened)| serde_json::to_value((closed, opened)).unwrap())
                            .map_err(|e| e.to_string())
                    }
                }),
                true,
            )
            .unwrap();
    }

    {
        let ledger = ledger.clone();
        registry
            .register(
                "hold",
                "Takes no action this cycle",
                vec![],
                ToolResolver::asynchronous(move |_args| {
                    let ledger = ledger.clone();
                    async move { ledger.hold().await.map(|_| serde_json::json!({})).map_err(|e| e.to_string()) }
                }),
                true,
            )
            .unwrap();
    }

    registry
}

/// Map a failed dispatcher invocation to a `Hold` outcome when the failure is
/// a known precondition rejection (position already open, nothing to close,
/// headroom exceeded), or propagate it as an execution error otherwise.
fn hold_or_fail(
    session_id: &str,
    tool_name: &str,
    error: Option<String>,
) -> Result<MeetingOutcome, RoundtableError> {
    let message = error.unwrap_or_default();
    let is_known_precondition = message.contains("AlreadyHasPosition")
        || message.contains("no open position")
        || message.contains("precondition failure");
    if is_known_precondition {
        log::warn!("roundtable[{}]: {} impossible, substituting hold: {}", session_id, tool_name, message);
        Ok(MeetingOutcome::Hold { reason: message })
    } else {
        Err(RoundtableError::ExecutionFailed(message))
    }
}

fn position_summary_text(snapshot: &PositionContext) -> String {
    match &snapshot.position {
        Some(position) => format!(
            "Position: {:?} at {:.2}, notional {:.0} USDT leverage {}x, current price {:.2}, allowed operations: {:?}",
            position.side,
            position.entry_price,
            position.amount_usdt,
            position.leverage,
            snapshot.current_price,
            snapshot.allowed_operations()
        ),
        None => format!(
            "No open position, current price {:.2}, allowed operations: {:?}",
            snapshot.current_price,
            snapshot.allowed_operations()
        ),
    }
}

fn describe_outcome(outcome: &TradeOutcome) -> String {
    format!(
        "closed {:?} at {:.2} (entry {:.2}), pnl {:.2}%",
        outcome.side, outcome.exit_price, outcome.entry_price, outcome.pnl_percent
    )
}

/// Cheap decision-tool inference from the leader's free-text execution
/// message, guarded against choosing an operation outside the allowed set.
fn infer_decision_tool(text: &str, snapshot: &PositionContext) -> String {
    let lower = text.to_lowercase();
    let allowed = snapshot.allowed_operations();
    for op in &allowed {
        if op != "hold" && lower.contains(op.as_str()) {
            return op.clone();
        }
    }
    "hold".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{FixedPriceFeed, PaperTraderLedger};

    fn vote(direction: &str, confidence: u8) -> VoteRecord {
        VoteRecord {
            direction: direction.to_string(),
            confidence,
            leverage: 1,
            take_profit_percent: 5.0,
            stop_loss_percent: 2.0,
        }
    }

    #[test]
    fn consensus_direction_requires_majority() {
        // 2-of-3 falls short of ceil(3/2)+1 = 3: all three must agree.
        let aggregate = VoteAggregate {
            votes: vec![
                ("a".to_string(), vote("long", 80)),
                ("b".to_string(), vote("long", 70)),
                ("c".to_string(), vote("short", 60)),
            ],
        };
        assert_eq!(aggregate.consensus_direction(), None);
    }

    #[test]
    fn consensus_direction_reached_when_all_three_agree() {
        let aggregate = VoteAggregate {
            votes: vec![
                ("a".to_string(), vote("long", 80)),
                ("b".to_string(), vote("long", 70)),
                ("c".to_string(), vote("long", 60)),
            ],
        };
        assert_eq!(aggregate.consensus_direction(), Some("long".to_string()));
    }

    #[test]
    fn consensus_direction_reached_with_four_of_five() {
        // ceil(5/2)+1 = 4: four agreeing out of five is enough.
        let aggregate = VoteAggregate {
            votes: vec![
                ("a".to_string(), vote("long", 80)),
                ("b".to_string(), vote("long", 70)),
                ("c".to_string(), vote("long", 60)),
                ("d".to_string(), vote("long", 55)),
                ("e".to_string(), vote("short", 90)),
            ],
        };
        assert_eq!(aggregate.consensus_direction(), Some("long".to_string()));
    }

    #[test]
    fn consensus_direction_none_when_split() {
        let aggregate = VoteAggregate {
            votes: vec![("a".to_string(), vote("long", 80)), ("b".to_string(), vote("short", 70))],
        };
        assert_eq!(aggregate.consensus_direction(), None);
    }

    #[tokio::test]
    async fn infer_decision_tool_respects_allowed_set() {
        let ledger = PaperTraderLedger::new("BTC-USDT-SWAP", 10_000.0, Arc::new(FixedPriceFeed(100.0)));
        ledger.open_long(5, 1000.0, 110.0, 90.0).await.unwrap();
        let snapshot = ledger.snapshot().await.unwrap();
        // leader text asks for open_short, which is not allowed with a position open.
        assert_eq!(infer_decision_tool("I choose open_short", &snapshot), "hold");
        assert_eq!(infer_decision_tool("I choose close_position", &snapshot), "close_position");
    }

    #[test]
    fn trading_signal_rejects_out_of_range_amount_percent() {
        let err = TradingSignal::new(
            "long",
            "BTC-USDT-SWAP",
            5,
            60.0, // clearly a 0-100 percent, not a 0-1 fraction
            100.0,
            110.0,
            90.0,
            80,
            "test",
            HashMap::new(),
        )
        .unwrap_err();
        assert!(matches!(err, RoundtableError::InvalidSignal(_)));
    }

    #[test]
    fn trading_signal_rejects_tp_sl_on_wrong_side_for_short() {
        let err = TradingSignal::new(
            "short", "BTC-USDT-SWAP", 5, 0.2, 100.0, 110.0, 90.0, 80, "test", HashMap::new(),
        )
        .unwrap_err();
        assert!(matches!(err, RoundtableError::InvalidSignal(_)));
    }

    #[test]
    fn trading_signal_accepts_well_shaped_long() {
        let signal = TradingSignal::new(
            "long", "BTC-USDT-SWAP", 5, 0.2, 100.0, 110.0, 90.0, 80, "test", HashMap::new(),
        )
        .unwrap();
        assert!(signal.risk_reward_ratio() > 0.0);
    }

    #[test]
    fn mean_confidence_averages_across_votes() {
        let aggregate = VoteAggregate {
            votes: vec![("a".to_string(), vote("long", 80)), ("b".to_string(), vote("long", 60))],
        };
        assert_eq!(aggregate.mean_confidence(), 70.0);
    }

    struct StubLlm;

    #[async_trait::async_trait]
    impl crate::llm_client::LlmClient for StubLlm {
        async fn send(
            &self,
            _messages: &[crate::llm_client::Message],
            _tools: &[crate::tool_registry::ToolMetadata],
        ) -> Result<(crate::llm_client::Message, crate::llm_client::TokenUsage), crate::error::LlmError> {
            Ok((crate::llm_client::Message::assistant("stub"), crate::llm_client::TokenUsage::default()))
        }
    }

    #[tokio::test]
    async fn record_predictions_stores_each_voting_agents_prediction() {
        let dir = tempfile::tempdir().unwrap();
        let memory = Arc::new(crate::memory::AgentMemory::open(dir.path(), "agent-a").unwrap());
        let agent = Agent::new(
            "agent-a",
            "Analyst A",
            Arc::new(StubLlm),
            Arc::new(crate::tool_registry::ToolRegistry::new()),
        )
        .with_memory(memory.clone());

        let engine = RoundtableEngine::new(
            "session-1",
            RoundtableMode::Trading,
            8,
            Arc::new(MessageBus::new(1000)),
            Arc::new(crate::event::NoopEventHandler),
            Arc::new(OrchestratorConfig::default()),
        );

        let aggregate = VoteAggregate {
            votes: vec![("agent-a".to_string(), vote("long", 77))],
        };
        engine
            .record_predictions(std::slice::from_ref(&agent), &aggregate, "trade-123")
            .await;

        let prediction = memory.prediction_for("trade-123").unwrap();
        assert_eq!(prediction.predicted_direction, "long");
        assert_eq!(prediction.confidence, 77);
    }

    #[tokio::test]
    async fn record_predictions_skips_agents_without_memory() {
        let agent = Agent::new(
            "agent-b",
            "Analyst B",
            Arc::new(StubLlm),
            Arc::new(crate::tool_registry::ToolRegistry::new()),
        );
        let engine = RoundtableEngine::new(
            "session-2",
            RoundtableMode::Trading,
            8,
            Arc::new(MessageBus::new(1000)),
            Arc::new(crate::event::NoopEventHandler),
            Arc::new(OrchestratorConfig::default()),
        );
        let aggregate = VoteAggregate {
            votes: vec![("agent-b".to_string(), vote("short", 55))],
        };
        // No memory attached: must not panic, simply does nothing.
        engine
            .record_predictions(std::slice::from_ref(&agent), &aggregate, "trade-456")
            .await;
    }
}
