//! End-to-end roundtable trading scenarios: a full meeting run against a
//! real `PaperTraderLedger`, driven by scripted LLM responses instead of a
//! live gateway.

use async_trait::async_trait;
use roundtable_core::ledger::FixedPriceFeed;
use roundtable_core::llm_client::{LlmClient, Message, TokenUsage};
use roundtable_core::tool_registry::{ToolMetadata, ToolRegistry};
use roundtable_core::{
    Agent, MeetingOutcome, MessageBus, NoopEventHandler, OrchestratorConfig, PaperTraderLedger,
    RoundtableEngine, RoundtableMode,
};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

/// Returns canned text responses in the order given, ignoring the prompt.
struct ScriptedLlmClient {
    responses: AsyncMutex<VecDeque<String>>,
}

impl ScriptedLlmClient {
    fn new(responses: &[&str]) -> Self {
        Self {
            responses: AsyncMutex::new(responses.iter().map(|s| s.to_string()).collect()),
        }
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn send(
        &self,
        _messages: &[Message],
        _tools: &[ToolMetadata],
    ) -> Result<(Message, TokenUsage), roundtable_core::error::LlmError> {
        let mut queue = self.responses.lock().await;
        let text = queue
            .pop_front()
            .unwrap_or_else(|| "no more scripted responses".to_string());
        Ok((Message::assistant(text), TokenUsage::default()))
    }
}

fn scripted_agent(id: &str, name: &str, responses: &[&str]) -> Agent {
    Agent::new(
        id,
        name,
        Arc::new(ScriptedLlmClient::new(responses)),
        Arc::new(ToolRegistry::new()),
    )
}

#[tokio::test]
async fn bullish_consensus_with_no_position_opens_long() {
    let mut analysts = vec![
        scripted_agent(
            "analyst-1",
            "Analyst One",
            &[
                "Momentum and on-chain flows both point up this cycle.",
                r#"{"direction":"long","confidence":85}"#,
            ],
        ),
        scripted_agent(
            "analyst-2",
            "Analyst Two",
            &[
                "Funding rates are healthy and spot demand is rising.",
                r#"{"direction":"long","confidence":80}"#,
            ],
        ),
        scripted_agent(
            "analyst-3",
            "Analyst Three",
            &[
                "Macro backdrop has turned supportive this week.",
                r#"{"direction":"long","confidence":90}"#,
            ],
        ),
    ];
    let mut risk_assessor = scripted_agent(
        "risk-1",
        "Risk Assessor",
        &["No concerns; sizing and leverage both look reasonable here."],
    );
    let mut leader = scripted_agent(
        "leader-1",
        "Leader",
        &[
            "The team is aligned bullish with high confidence; I'll proceed.",
            "I choose open_long given the consensus.",
        ],
    );

    let ledger = PaperTraderLedger::new("BTC-USDT-SWAP", 10_000.0, Arc::new(FixedPriceFeed(100.0)));
    let engine = RoundtableEngine::new(
        "session-s3",
        RoundtableMode::Trading,
        8,
        Arc::new(MessageBus::new(1000)),
        Arc::new(NoopEventHandler),
        Arc::new(OrchestratorConfig::default()),
    );

    let outcome = engine
        .run(&mut analysts, &mut risk_assessor, &mut leader, Some(&ledger))
        .await
        .unwrap();

    match outcome {
        MeetingOutcome::TradeExecuted { tool_name, .. } => assert_eq!(tool_name, "open_long"),
        other => panic!("expected TradeExecuted, got {:?}", other),
    }

    let snapshot = ledger.snapshot().await.unwrap();
    assert!(snapshot.has_position());
    assert_eq!(snapshot.direction(), Some("long"));
}

#[tokio::test]
async fn bearish_majority_with_existing_long_closes_position() {
    let ledger = PaperTraderLedger::new("BTC-USDT-SWAP", 10_000.0, Arc::new(FixedPriceFeed(100.0)));
    ledger.open_long(5, 1_000.0, 110.0, 90.0).await.unwrap();

    let mut analysts = vec![
        scripted_agent(
            "analyst-1",
            "Analyst One",
            &[
                "Still see some upside but momentum is fading.",
                r#"{"direction":"long","confidence":55}"#,
            ],
        ),
        scripted_agent(
            "analyst-2",
            "Analyst Two",
            &[
                "Funding has flipped negative and volume is drying up.",
                r#"{"direction":"short","confidence":75}"#,
            ],
        ),
        scripted_agent(
            "analyst-3",
            "Analyst Three",
            &[
                "On-chain outflows from exchanges have reversed to inflows.",
                r#"{"direction":"short","confidence":70}"#,
            ],
        ),
        scripted_agent(
            "analyst-4",
            "Analyst Four",
            &[
                "Macro headwinds are building into the next session.",
                r#"{"direction":"short","confidence":65}"#,
            ],
        ),
    ];
    let mut risk_assessor = scripted_agent(
        "risk-1",
        "Risk Assessor",
        &["Downside risk has increased materially; recommend exiting the open position promptly."],
    );
    let mut leader = scripted_agent(
        "leader-1",
        "Leader",
        &[
            "Majority has turned bearish; the risk assessor wants out of the existing position.",
            "I will close_position now.",
        ],
    );

    let engine = RoundtableEngine::new(
        "session-s4",
        RoundtableMode::Trading,
        8,
        Arc::new(MessageBus::new(1000)),
        Arc::new(NoopEventHandler),
        Arc::new(OrchestratorConfig::default()),
    );

    let outcome = engine
        .run(&mut analysts, &mut risk_assessor, &mut leader, Some(&ledger))
        .await
        .unwrap();

    match outcome {
        MeetingOutcome::TradeExecuted { tool_name, .. } => assert_eq!(tool_name, "close_position"),
        other => panic!("expected TradeExecuted, got {:?}", other),
    }

    let snapshot = ledger.snapshot().await.unwrap();
    assert!(!snapshot.has_position());
}
