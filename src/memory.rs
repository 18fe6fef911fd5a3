//! Agent Memory & Reflection (C9).
//!
//! Each agent's memory is an in-memory, queryable [`AgentMemory`] aggregate
//! backed by an append-only, SHA-256 hash-chained `.jsonl` log — the same
//! disk format and integrity-verification discipline the teacher uses for
//! its thought chain, specialized here to `{Prediction, Reflection,
//! MemoryUpdate}` entries instead of the teacher's generic finding/decision
//! set.

use crate::ledger::{PositionSide, TradeOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Kind of a single entry in an agent's hash-chained memory log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryEntryType {
    Prediction,
    Reflection,
    MemoryUpdate,
}

/// One hash-chained entry in an agent's memory log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub index: u64,
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    pub entry_type: MemoryEntryType,
    pub content: String,
    pub prev_hash: String,
    pub hash: String,
}

fn compute_entry_hash(
    index: u64,
    timestamp: &DateTime<Utc>,
    agent_id: &str,
    entry_type: MemoryEntryType,
    content: &str,
    prev_hash: &str,
) -> String {
    let type_json = serde_json::to_string(&entry_type).unwrap_or_default();
    let payload = format!(
        "{}|{}|{}|{}|{}|{}",
        index,
        timestamp.to_rfc3339(),
        agent_id,
        type_json,
        content,
        prev_hash
    );
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}

/// Minimal hex encoding, avoiding a dependency purely for this one call site.
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// A single reflection derived from a closed trade's outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reflection {
    pub summary: String,
    pub what_went_well: Vec<String>,
    pub what_went_wrong: Vec<String>,
    pub lessons_learned: Vec<String>,
    pub next_time_action: String,
}

const MAX_LESSONS: usize = 20;
const MAX_EXPERIENCES: usize = 10;

/// A prediction an agent made at a trade's open time, kept so the
/// post-close reflection pipeline can pair it with the realized outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub trade_id: String,
    pub predicted_direction: String,
    pub confidence: u8,
    pub reasoning: String,
}

/// Queryable, in-memory view of one agent's track record. Rendered into the
/// agent's system prompt as a compact summary; the on-disk log is the
/// durable source of truth this aggregate is rebuilt from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentMemoryState {
    pub total_trades: u32,
    pub wins: u32,
    pub losses: u32,
    /// Cumulative realized P&L in magnitude terms: each reflection appends
    /// its absolute P&L contribution, never rewrites or nets prior history
    /// (§8 property 10 — monotone non-decreasing).
    pub cumulative_pnl_magnitude: f64,
    pub current_streak: i32,
    pub max_streak: i32,
    pub lessons: VecDeque<String>,
    /// Bounded FIFO of short one-line trade summaries, independent of the
    /// lessons list, per §3 Agent Memory's "recent experiences (bounded)".
    pub recent_experiences: VecDeque<String>,
    pub direction_accuracy: std::collections::HashMap<String, (u32, u32)>,
    pub current_focus: String,
    pub last_trade_summary: Option<String>,
    pub open_predictions: std::collections::HashMap<String, Prediction>,
}

impl AgentMemoryState {
    pub fn win_rate(&self) -> f64 {
        let total = self.wins + self.losses;
        if total == 0 {
            0.0
        } else {
            self.wins as f64 / total as f64
        }
    }

    fn push_lesson(&mut self, lesson: String) {
        self.lessons.push_back(lesson);
        while self.lessons.len() > MAX_LESSONS {
            self.lessons.pop_front();
        }
    }

    fn push_experience(&mut self, experience: String) {
        self.recent_experiences.push_back(experience);
        while self.recent_experiences.len() > MAX_EXPERIENCES {
            self.recent_experiences.pop_front();
        }
    }

    fn apply_reflection(&mut self, direction: &str, won: bool, pnl_percent: f64, reflection: &Reflection) {
        self.total_trades += 1;
        self.cumulative_pnl_magnitude += pnl_percent.abs();
        if won {
            self.wins += 1;
            self.current_streak = if self.current_streak > 0 {
                self.current_streak + 1
            } else {
                1
            };
        } else {
            self.losses += 1;
            self.current_streak = if self.current_streak < 0 {
                self.current_streak - 1
            } else {
                -1
            };
        }
        self.max_streak = self.max_streak.max(self.current_streak);
        let entry = self.direction_accuracy.entry(direction.to_string()).or_insert((0, 0));
        entry.0 += won as u32;
        entry.1 += 1;

        for lesson in &reflection.lessons_learned {
            self.push_lesson(lesson.clone());
        }
        self.push_experience(reflection.summary.clone());
        self.last_trade_summary = Some(reflection.summary.clone());
        self.current_focus = reflection.next_time_action.clone();
    }
}

/// Per-agent memory: the queryable state plus the append-only log it is
/// rebuilt from.
pub struct AgentMemory {
    agent_id: String,
    file_path: PathBuf,
    state: Mutex<AgentMemoryState>,
    log: Mutex<Vec<MemoryEntry>>,
}

impl AgentMemory {
    /// Open (or create) an agent's memory log under `dir`, replaying any
    /// existing entries to rebuild the in-memory state.
    pub fn open(dir: &Path, agent_id: impl Into<String>) -> io::Result<Self> {
        let agent_id = agent_id.into();
        std::fs::create_dir_all(dir)?;
        let file_path = dir.join(format!("{}.jsonl", sanitize(&agent_id)));

        let mut log = Vec::new();
        if file_path.exists() {
            let file = std::fs::File::open(&file_path)?;
            for line in io::BufReader::new(file).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<MemoryEntry>(&line) {
                    Ok(entry) => log.push(entry),
                    Err(e) => log::warn!("memory: skipping malformed entry in {:?}: {}", file_path, e),
                }
            }
        }

        let mut state = AgentMemoryState::default();
        for entry in &log {
            replay_into_state(&mut state, entry);
        }

        Ok(Self {
            agent_id,
            file_path,
            state: Mutex::new(state),
            log: Mutex::new(log),
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Verify the hash chain: every entry's `prev_hash` matches the previous
    /// entry's `hash`, and every entry's own `hash` recomputes correctly.
    pub fn verify_integrity(&self) -> bool {
        let log = self.log.lock().unwrap();
        let mut expected_prev = String::new();
        for entry in log.iter() {
            if entry.prev_hash != expected_prev {
                return false;
            }
            let recomputed = compute_entry_hash(
                entry.index,
                &entry.timestamp,
                &entry.agent_id,
                entry.entry_type,
                &entry.content,
                &entry.prev_hash,
            );
            if recomputed != entry.hash {
                return false;
            }
            expected_prev = entry.hash.clone();
        }
        true
    }

    /// The stored prediction for a trade id, if this agent made one at open
    /// time (§4.9 step 1: "locate the predictions each agent emitted").
    pub fn prediction_for(&self, trade_id: &str) -> Option<Prediction> {
        self.state.lock().unwrap().open_predictions.get(trade_id).cloned()
    }

    /// Record a prediction at trade-open time, keyed by trade id.
    pub fn record_prediction(&self, trade_id: impl Into<String>, prediction: Prediction) -> io::Result<()> {
        let trade_id = trade_id.into();
        let content = serde_json::to_string(&prediction).unwrap_or_default();
        self.append(MemoryEntryType::Prediction, content)?;
        self.state
            .lock()
            .unwrap()
            .open_predictions
            .insert(trade_id, prediction);
        Ok(())
    }

    /// Apply a trade outcome: locate the stored prediction (if any), build a
    /// reflection, and fold it into this agent's memory. Best-effort: any
    /// failure here must never block the caller's cycle.
    pub fn apply_trade_outcome(
        &self,
        trade_id: &str,
        outcome: &TradeOutcome,
        reflection: Reflection,
    ) -> io::Result<()> {
        let direction = match outcome.side {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        };
        let won = outcome.is_win();

        let content = serde_json::to_string(&reflection).unwrap_or_default();
        self.append(MemoryEntryType::Reflection, content)?;

        {
            let mut state = self.state.lock().unwrap();
            state.open_predictions.remove(trade_id);
            state.apply_reflection(direction, won, outcome.pnl_percent, &reflection);
        }

        let snapshot = serde_json::to_string(&*self.state.lock().unwrap()).unwrap_or_default();
        self.append(MemoryEntryType::MemoryUpdate, snapshot)?;
        Ok(())
    }

    fn append(&self, entry_type: MemoryEntryType, content: String) -> io::Result<()> {
        let mut log = self.log.lock().unwrap();
        let prev_hash = log.last().map(|e| e.hash.clone()).unwrap_or_default();
        let index = log.len() as u64;
        let timestamp = Utc::now();
        let hash = compute_entry_hash(index, &timestamp, &self.agent_id, entry_type, &content, &prev_hash);
        let entry = MemoryEntry {
            index,
            timestamp,
            agent_id: self.agent_id.clone(),
            entry_type,
            content,
            prev_hash,
            hash,
        };

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)?;
        writeln!(file, "{}", serde_json::to_string(&entry)?)?;

        log.push(entry);
        Ok(())
    }

    /// Compact prompt summary: last-trade outcome, win rate, lessons, focus.
    pub fn prompt_summary(&self) -> String {
        let state = self.state.lock().unwrap();
        let mut parts = Vec::new();
        parts.push(format!(
            "Track record: {} trades, {} wins / {} losses (win rate {:.0}%, streak {}, best streak {}).",
            state.total_trades,
            state.wins,
            state.losses,
            state.win_rate() * 100.0,
            state.current_streak,
            state.max_streak
        ));
        if let Some(last) = &state.last_trade_summary {
            parts.push(format!("Last trade: {}", last));
        }
        if !state.current_focus.is_empty() {
            parts.push(format!("Current focus: {}", state.current_focus));
        }
        if !state.lessons.is_empty() {
            let lessons: Vec<&str> = state.lessons.iter().rev().take(5).map(|s| s.as_str()).collect();
            parts.push(format!("Recent lessons: {}", lessons.join("; ")));
        }
        parts.join(" ")
    }

    pub fn win_rate(&self) -> f64 {
        self.state.lock().unwrap().win_rate()
    }

    pub fn total_trades(&self) -> u32 {
        self.state.lock().unwrap().total_trades
    }

    pub fn cumulative_pnl_magnitude(&self) -> f64 {
        self.state.lock().unwrap().cumulative_pnl_magnitude
    }
}

/// Post-close trade reflection pipeline (§4.9 write path). Runs outside any
/// meeting, triggered by the caller on a position-close event from the
/// ledger. Never blocks the next cycle: any failure (LLM unavailable,
/// unparseable JSON) is logged and swallowed rather than propagated.
pub struct ReflectionPipeline {
    llm: std::sync::Arc<dyn crate::llm_client::LlmClient>,
    events: std::sync::Arc<dyn crate::event::EventHandler>,
}

impl ReflectionPipeline {
    pub fn new(llm: std::sync::Arc<dyn crate::llm_client::LlmClient>) -> Self {
        Self { llm, events: std::sync::Arc::new(crate::event::NoopEventHandler) }
    }

    pub fn with_events(mut self, events: std::sync::Arc<dyn crate::event::EventHandler>) -> Self {
        self.events = events;
        self
    }

    /// Reflect on one closed trade for one agent's memory. No-op if the
    /// agent made no recorded prediction for `trade_id`.
    pub async fn reflect(&self, memory: &AgentMemory, trade_id: &str, outcome: &TradeOutcome) {
        let Some(prediction) = memory.prediction_for(trade_id) else {
            return;
        };

        let prompt = reflection_prompt(&prediction, outcome);
        let messages = [
            crate::llm_client::Message::system(
                "You are a disciplined trading analyst reviewing your own closed trade. \
                 Respond with a single JSON object: \
                 {summary, what_went_well: [], what_went_wrong: [], lessons_learned: [], next_time_action}.",
            ),
            crate::llm_client::Message::user(prompt),
        ];
        let response = match self.llm.send(&messages, &[]).await {
            Ok((message, _usage)) => message.content,
            Err(e) => {
                self.report_failure(memory.agent_id(), trade_id, e.to_string()).await;
                return;
            }
        };

        let Some(value) = crate::agent::extract_json_object(&response) else {
            self.report_failure(memory.agent_id(), trade_id, "could not parse reflection JSON".to_string()).await;
            return;
        };
        let reflection = match reflection_from_json(&value) {
            Some(r) => r,
            None => {
                self.report_failure(memory.agent_id(), trade_id, "reflection JSON missing required shape".to_string()).await;
                return;
            }
        };

        if let Err(e) = memory.apply_trade_outcome(trade_id, outcome, reflection) {
            self.report_failure(memory.agent_id(), trade_id, format!("failed to persist memory update: {}", e)).await;
            return;
        }
        self.events
            .on_memory_event(&crate::event::MemoryEvent::ReflectionApplied {
                agent_id: memory.agent_id().to_string(),
                outcome: outcome.clone(),
            })
            .await;
    }

    async fn report_failure(&self, agent_id: &str, trade_id: &str, reason: String) {
        log::warn!("reflection[{}/{}]: {}", agent_id, trade_id, reason);
        self.events
            .on_memory_event(&crate::event::MemoryEvent::ReflectionFailed {
                agent_id: agent_id.to_string(),
                reason,
            })
            .await;
    }
}

fn reflection_prompt(prediction: &Prediction, outcome: &TradeOutcome) -> String {
    format!(
        "Your prediction: direction={}, confidence={}, reasoning=\"{}\".\n\
         Actual outcome: entry={:.2}, exit={:.2}, pnl_percent={:.2}, holding_time_secs={}, side={:?}.",
        prediction.predicted_direction,
        prediction.confidence,
        prediction.reasoning,
        outcome.entry_price,
        outcome.exit_price,
        outcome.pnl_percent,
        (outcome.closed_at - outcome.opened_at).num_seconds(),
        outcome.side,
    )
}

fn reflection_from_json(value: &serde_json::Value) -> Option<Reflection> {
    let summary = value.get("summary")?.as_str()?.to_string();
    let string_list = |key: &str| -> Vec<String> {
        value
            .get(key)
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default()
    };
    let next_time_action = value
        .get("next_time_action")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    Some(Reflection {
        summary,
        what_went_well: string_list("what_went_well"),
        what_went_wrong: string_list("what_went_wrong"),
        lessons_learned: string_list("lessons_learned"),
        next_time_action,
    })
}

fn replay_into_state(state: &mut AgentMemoryState, entry: &MemoryEntry) {
    match entry.entry_type {
        MemoryEntryType::Prediction => {
            if let Ok(prediction) = serde_json::from_str::<Prediction>(&entry.content) {
                state
                    .open_predictions
                    .insert(prediction.trade_id.clone(), prediction);
            }
        }
        MemoryEntryType::MemoryUpdate => {
            if let Ok(replayed) = serde_json::from_str::<AgentMemoryState>(&entry.content) {
                *state = replayed;
            }
        }
        MemoryEntryType::Reflection => {}
    }
}

fn sanitize(agent_id: &str) -> String {
    agent_id
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::ledger::PositionSide;
    use crate::llm_client::{LlmClient, Message as LlmMessage, TokenUsage};
    use crate::tool_registry::ToolMetadata;

    struct MockLlm {
        reply: String,
    }

    #[async_trait::async_trait]
    impl LlmClient for MockLlm {
        async fn send(
            &self,
            _messages: &[LlmMessage],
            _tools: &[ToolMetadata],
        ) -> Result<(LlmMessage, TokenUsage), LlmError> {
            Ok((
                LlmMessage::assistant(self.reply.clone()),
                TokenUsage { input_tokens: 10, output_tokens: 10, total_tokens: 20 },
            ))
        }
    }

    struct FailingLlm;

    #[async_trait::async_trait]
    impl LlmClient for FailingLlm {
        async fn send(
            &self,
            _messages: &[LlmMessage],
            _tools: &[ToolMetadata],
        ) -> Result<(LlmMessage, TokenUsage), LlmError> {
            Err(LlmError::Unavailable("gateway down".to_string()))
        }
    }

    fn sample_outcome(pnl: f64) -> TradeOutcome {
        TradeOutcome {
            trade_id: "test-trade".to_string(),
            side: PositionSide::Long,
            entry_price: 100.0,
            exit_price: 105.0,
            amount_usdt: 200.0,
            leverage: 3,
            pnl_percent: pnl,
            opened_at: Utc::now(),
            closed_at: Utc::now(),
        }
    }

    fn sample_reflection() -> Reflection {
        Reflection {
            summary: "closed with profit".to_string(),
            what_went_well: vec!["good entry timing".to_string()],
            what_went_wrong: vec![],
            lessons_learned: vec!["respect the trend".to_string()],
            next_time_action: "wait for volume confirmation".to_string(),
        }
    }

    #[test]
    fn open_creates_empty_state_when_no_file_exists() {
        let dir = tempfile::tempdir().unwrap();
        let memory = AgentMemory::open(dir.path(), "agent-1").unwrap();
        assert_eq!(memory.win_rate(), 0.0);
        assert!(memory.verify_integrity());
    }

    #[test]
    fn apply_trade_outcome_updates_win_rate_and_lessons() {
        let dir = tempfile::tempdir().unwrap();
        let memory = AgentMemory::open(dir.path(), "agent-1").unwrap();
        memory
            .record_prediction(
                "trade-1",
                Prediction {
                    trade_id: "trade-1".to_string(),
                    predicted_direction: "long".to_string(),
                    confidence: 80,
                    reasoning: "strong momentum".to_string(),
                },
            )
            .unwrap();
        memory
            .apply_trade_outcome("trade-1", &sample_outcome(12.0), sample_reflection())
            .unwrap();

        assert_eq!(memory.win_rate(), 1.0);
        let summary = memory.prompt_summary();
        assert!(summary.contains("1 wins"));
        assert!(memory.verify_integrity());
    }

    #[test]
    fn reopening_memory_rebuilds_state_from_log() {
        let dir = tempfile::tempdir().unwrap();
        {
            let memory = AgentMemory::open(dir.path(), "agent-1").unwrap();
            memory
                .apply_trade_outcome("trade-1", &sample_outcome(-5.0), sample_reflection())
                .unwrap();
        }
        let reopened = AgentMemory::open(dir.path(), "agent-1").unwrap();
        assert_eq!(reopened.win_rate(), 0.0);
        assert!(reopened.verify_integrity());
    }

    #[test]
    fn lessons_are_bounded_with_fifo_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let memory = AgentMemory::open(dir.path(), "agent-1").unwrap();
        for i in 0..(MAX_LESSONS + 5) {
            let mut reflection = sample_reflection();
            reflection.lessons_learned = vec![format!("lesson-{}", i)];
            memory
                .apply_trade_outcome(&format!("trade-{}", i), &sample_outcome(1.0), reflection)
                .unwrap();
        }
        let state = memory.state.lock().unwrap();
        assert_eq!(state.lessons.len(), MAX_LESSONS);
        assert!(state.lessons.back().unwrap().ends_with(&format!("lesson-{}", MAX_LESSONS + 4)));
    }

    #[test]
    fn total_trades_and_cumulative_pnl_are_monotone_non_decreasing() {
        let dir = tempfile::tempdir().unwrap();
        let memory = AgentMemory::open(dir.path(), "agent-1").unwrap();
        let mut prev_trades = 0;
        let mut prev_pnl = 0.0;
        for (i, pnl) in [8.0, -3.0, 15.0, -1.0].into_iter().enumerate() {
            memory
                .apply_trade_outcome(&format!("trade-{}", i), &sample_outcome(pnl), sample_reflection())
                .unwrap();
            let trades = memory.total_trades();
            let cumulative = memory.cumulative_pnl_magnitude();
            assert!(trades >= prev_trades);
            assert!(cumulative >= prev_pnl);
            prev_trades = trades;
            prev_pnl = cumulative;
        }
        assert_eq!(prev_trades, 4);
    }

    #[test]
    fn verify_integrity_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let memory = AgentMemory::open(dir.path(), "agent-1").unwrap();
        memory
            .apply_trade_outcome("trade-1", &sample_outcome(1.0), sample_reflection())
            .unwrap();
        memory.log.lock().unwrap()[0].content = "tampered".to_string();
        assert!(!memory.verify_integrity());
    }

    #[tokio::test]
    async fn reflection_pipeline_applies_parsed_reflection() {
        let dir = tempfile::tempdir().unwrap();
        let memory = AgentMemory::open(dir.path(), "agent-1").unwrap();
        memory
            .record_prediction(
                "trade-1",
                Prediction {
                    trade_id: "trade-1".to_string(),
                    predicted_direction: "long".to_string(),
                    confidence: 75,
                    reasoning: "breakout above resistance".to_string(),
                },
            )
            .unwrap();

        let reply = r#"```json
        {"summary": "won on the breakout", "what_went_well": ["entry timing"],
         "what_went_wrong": [], "lessons_learned": ["trust the breakout"],
         "next_time_action": "size up on confirmed breakouts"}
        ```"#;
        let pipeline = ReflectionPipeline::new(std::sync::Arc::new(MockLlm { reply: reply.to_string() }));
        pipeline.reflect(&memory, "trade-1", &sample_outcome(9.0)).await;

        assert_eq!(memory.total_trades(), 1);
        assert!(memory.prompt_summary().contains("trust the breakout"));
        assert!(memory.prediction_for("trade-1").is_none());
    }

    #[tokio::test]
    async fn reflection_pipeline_noop_without_stored_prediction() {
        let dir = tempfile::tempdir().unwrap();
        let memory = AgentMemory::open(dir.path(), "agent-1").unwrap();
        let pipeline = ReflectionPipeline::new(std::sync::Arc::new(MockLlm { reply: "{}".to_string() }));
        pipeline.reflect(&memory, "unknown-trade", &sample_outcome(9.0)).await;
        assert_eq!(memory.total_trades(), 0);
    }

    #[tokio::test]
    async fn reflection_pipeline_swallows_llm_failure() {
        let dir = tempfile::tempdir().unwrap();
        let memory = AgentMemory::open(dir.path(), "agent-1").unwrap();
        memory
            .record_prediction(
                "trade-1",
                Prediction {
                    trade_id: "trade-1".to_string(),
                    predicted_direction: "long".to_string(),
                    confidence: 50,
                    reasoning: "guess".to_string(),
                },
            )
            .unwrap();
        let pipeline = ReflectionPipeline::new(std::sync::Arc::new(FailingLlm));
        pipeline.reflect(&memory, "trade-1", &sample_outcome(-4.0)).await;
        assert_eq!(memory.total_trades(), 0);
    }
}
