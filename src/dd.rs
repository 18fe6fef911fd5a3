//! DD State Machine (C5).
//!
//! A strictly linear pipeline over due-diligence steps. Suspend/resume at the
//! HITL checkpoint is represented as an explicit state variant held inside
//! the session rather than a blocked task: `resume`/`cancel` are ordinary
//! method calls, never a thread parked across a human-speed wait.

use crate::error::DdError;
use crate::event::{DdEvent, EventHandler};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;

/// Status of a single DD step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Error,
    Skipped,
}

/// One entry of the session's step array (§3 Step entity).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub ordinal: u32,
    pub title: &'static str,
    pub status: StepStatus,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub progress: u8,
    pub result_summary: Option<String>,
    pub error_detail: Option<String>,
}

impl Step {
    fn pending(ordinal: u32, title: &'static str) -> Self {
        Self {
            ordinal,
            title,
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            progress: 0,
            result_summary: None,
            error_detail: None,
        }
    }
}

/// The nine-step pipeline in fixed order.
pub const STEP_TITLES: [&str; 9] = [
    "DOC_PARSE",
    "PREFERENCE_MATCH",
    "TDD",
    "MDD",
    "CROSS_CHECK",
    "QUESTION_GEN",
    "HITL",
    "REVISION",
    "COMPLETED",
];

/// Parsed project record produced by DOC_PARSE. Unknown fields are marked
/// explicitly rather than fabricated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub name: String,
    pub industry: Option<String>,
    pub stage: Option<String>,
    pub team_size: Option<u32>,
    pub funding_raised_usd: Option<f64>,
}

/// Team and market analyses produced by the TDD/MDD parallel fan-out.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub content: String,
    pub is_placeholder: bool,
}

/// One finding raised during CROSS_CHECK.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossCheckFinding {
    pub description: String,
    pub severity: &'static str,
}

/// A due-diligence question surfaced to the human reviewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdQuestion {
    pub text: String,
    pub priority: u8,
}

/// Preliminary memo assembled before HITL, and the final memo after revision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Memo {
    pub project: ProjectRecord,
    pub team_analysis: AnalysisResult,
    pub market_analysis: AnalysisResult,
    pub cross_check_findings: Vec<CrossCheckFinding>,
    pub revision_notes: Option<String>,
}

impl Memo {
    /// Transport-boundary JSON conversion; internal state stays typed, never
    /// threading `serde_json::Value` through the state machine itself.
    pub fn to_json_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Non-terminal, in-progress, and terminal states of the DD machine.
#[derive(Debug, Clone)]
pub enum DdState {
    Running { step: u32 },
    AwaitingHitl {
        preliminary_memo: Memo,
        questions: Vec<DdQuestion>,
    },
    Completed { status: &'static str, memo: Memo },
    Error { step: &'static str, reason: String },
}

/// Preference-match score and its rejection threshold (§4.5 PREFERENCE_MATCH).
#[derive(Debug, Clone, Copy)]
pub struct PreferenceMatch {
    pub industry: f64,
    pub stage: f64,
    pub size: f64,
    pub team: f64,
}

impl PreferenceMatch {
    pub fn aggregate(&self) -> f64 {
        (self.industry + self.stage + self.size + self.team) / 4.0
    }
}

/// Document-parse input: either a raw document blob or a project name to
/// drive web-search + LLM extraction.
pub enum DocInput {
    Blob(Vec<u8>),
    ProjectName(String),
}

/// Drives one due-diligence session through its linear pipeline.
pub struct DdStateMachine {
    session_id: String,
    steps: Vec<Step>,
    state: DdState,
    events: Arc<dyn EventHandler>,
    preference_threshold: f64,
}

impl DdStateMachine {
    pub fn new(session_id: impl Into<String>, events: Arc<dyn EventHandler>) -> Self {
        let steps = STEP_TITLES.iter().enumerate().map(|(i, title)| Step::pending(i as u32, title)).collect();
        Self {
            session_id: session_id.into(),
            steps,
            state: DdState::Running { step: 0 },
            events,
            preference_threshold: 0.5,
        }
    }

    pub fn with_preference_threshold(mut self, threshold: f64) -> Self {
        self.preference_threshold = threshold;
        self
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn state(&self) -> &DdState {
        &self.state
    }

    async fn transition(&mut self, ordinal: u32, status: StepStatus, progress: u8) {
        if let Some(step) = self.steps.get_mut(ordinal as usize) {
            step.status = status;
            step.progress = progress;
            match status {
                StepStatus::Running if step.started_at.is_none() => {
                    step.started_at = Some(chrono::Utc::now())
                }
                StepStatus::Success | StepStatus::Error | StepStatus::Skipped => {
                    step.completed_at = Some(chrono::Utc::now())
                }
                _ => {}
            }
        }
        let status_str = format!("{:?}", status).to_lowercase();
        self.events
            .on_dd_event(&DdEvent::StepTransitioned {
                session_id: self.session_id.clone(),
                step: STEP_TITLES[ordinal as usize].to_string(),
                status: status_str,
                progress,
                all_steps: self.steps.clone(),
            })
            .await;
    }

    fn fail_step(&mut self, ordinal: u32, reason: String) {
        if let Some(step) = self.steps.get_mut(ordinal as usize) {
            step.status = StepStatus::Error;
            step.error_detail = Some(reason.clone());
            step.completed_at = Some(chrono::Utc::now());
        }
        log::error!("dd[{}]: step {} failed: {}", self.session_id, STEP_TITLES[ordinal as usize], reason);
    }

    /// Run DOC_PARSE through QUESTION_GEN, suspending at HITL. `parse_doc`
    /// performs the actual document-parse or web-search+LLM extraction and
    /// is supplied by the caller (keeps this module free of a concrete tool
    /// dependency). `analyze_team` and `analyze_market` are driven
    /// concurrently via `tokio::join!` (§4.5 "TDD and MDD run in parallel"),
    /// so callers wire in real async agent turns rather than pre-computed
    /// results — a slow or failing analyst cannot block the other.
    pub async fn run_to_hitl<F, FFut, G, H, HFut, M, MFut, I, IFut>(
        &mut self,
        input: DocInput,
        parse_doc: F,
        preference_match: G,
        analyze_team: H,
        analyze_market: M,
        generate_questions: I,
    ) -> Result<(), DdError>
    where
        F: FnOnce(DocInput) -> FFut,
        FFut: Future<Output = Result<ProjectRecord, String>>,
        G: FnOnce(&ProjectRecord) -> PreferenceMatch,
        H: FnOnce(&ProjectRecord) -> HFut,
        HFut: Future<Output = Result<AnalysisResult, String>>,
        M: FnOnce(&ProjectRecord) -> MFut,
        MFut: Future<Output = Result<AnalysisResult, String>>,
        I: FnOnce(&ProjectRecord, &[CrossCheckFinding]) -> IFut,
        IFut: Future<Output = Vec<DdQuestion>>,
    {
        self.transition(0, StepStatus::Running, 0).await;
        let project = match parse_doc(input).await {
            Ok(p) => p,
            Err(e) => {
                self.fail_step(0, e.clone());
                self.transition(0, StepStatus::Error, 0).await;
                self.state = DdState::Error { step: "DOC_PARSE", reason: e.clone() };
                return Err(DdError::StepFailed { step: "DOC_PARSE", reason: e });
            }
        };
        self.transition(0, StepStatus::Success, 100).await;

        self.transition(1, StepStatus::Running, 0).await;
        let pref = preference_match(&project);
        self.transition(1, StepStatus::Success, 100).await;
        if pref.aggregate() < self.preference_threshold {
            let memo = Memo { project, ..Default::default() };
            self.state = DdState::Completed { status: "rejected-by-preference", memo };
            self.events
                .on_dd_event(&DdEvent::SessionTerminated {
                    session_id: self.session_id.clone(),
                    status: "rejected-by-preference".to_string(),
                })
                .await;
            return Ok(());
        }

        self.transition(2, StepStatus::Running, 0).await;
        self.transition(3, StepStatus::Running, 0).await;
        let (team_result, market_result) = tokio::join!(analyze_team(&project), analyze_market(&project));
        let team_analysis = match team_result {
            Ok(a) => {
                self.transition(2, StepStatus::Success, 100).await;
                a
            }
            Err(e) => {
                self.fail_step(2, e);
                self.transition(2, StepStatus::Error, 100).await;
                AnalysisResult { content: String::new(), is_placeholder: true }
            }
        };
        let market_analysis = match market_result {
            Ok(a) => {
                self.transition(3, StepStatus::Success, 100).await;
                a
            }
            Err(e) => {
                self.fail_step(3, e);
                self.transition(3, StepStatus::Error, 100).await;
                AnalysisResult { content: String::new(), is_placeholder: true }
            }
        };

        self.transition(4, StepStatus::Running, 0).await;
        let cross_check_findings = if team_analysis.is_placeholder && market_analysis.is_placeholder {
            Vec::new()
        } else {
            build_cross_check_findings(&team_analysis, &market_analysis)
        };
        self.transition(4, StepStatus::Success, 100).await;

        self.transition(5, StepStatus::Running, 0).await;
        let questions = generate_questions(&project, &cross_check_findings).await;
        self.transition(5, StepStatus::Success, 100).await;

        let memo = Memo {
            project,
            team_analysis,
            market_analysis,
            cross_check_findings,
            revision_notes: None,
        };

        self.transition(6, StepStatus::Running, 0).await;
        self.events
            .on_dd_event(&DdEvent::HitlRequired { session_id: self.session_id.clone() })
            .await;
        self.state = DdState::AwaitingHitl { preliminary_memo: memo, questions };
        Ok(())
    }

    /// Resume after HITL with human feedback, producing the final memo.
    pub async fn resume(&mut self, feedback: String) -> Result<(), DdError> {
        let DdState::AwaitingHitl { preliminary_memo, .. } = self.state.clone() else {
            return Err(DdError::MalformedResume("resume called outside AwaitingHitl".to_string()));
        };
        self.transition(6, StepStatus::Success, 100).await;
        self.events
            .on_dd_event(&DdEvent::SessionResumed { session_id: self.session_id.clone() })
            .await;

        self.transition(7, StepStatus::Running, 0).await;
        let mut memo = preliminary_memo;
        memo.revision_notes = Some(feedback);
        self.transition(7, StepStatus::Success, 100).await;

        self.transition(8, StepStatus::Success, 100).await;
        self.state = DdState::Completed { status: "completed", memo };
        self.events
            .on_dd_event(&DdEvent::SessionTerminated {
                session_id: self.session_id.clone(),
                status: "completed".to_string(),
            })
            .await;
        Ok(())
    }

    /// Cancel a session suspended at HITL.
    pub async fn cancel(&mut self) -> Result<(), DdError> {
        if !matches!(self.state, DdState::AwaitingHitl { .. }) {
            return Err(DdError::Cancelled);
        }
        self.state = DdState::Error { step: "HITL", reason: "cancelled_during_hitl".to_string() };
        self.events
            .on_dd_event(&DdEvent::SessionTerminated {
                session_id: self.session_id.clone(),
                status: "cancelled".to_string(),
            })
            .await;
        Ok(())
    }
}

impl Clone for DdState {
    fn clone(&self) -> Self {
        match self {
            DdState::Running { step } => DdState::Running { step: *step },
            DdState::AwaitingHitl { preliminary_memo, questions } => DdState::AwaitingHitl {
                preliminary_memo: preliminary_memo.clone(),
                questions: questions.clone(),
            },
            DdState::Completed { status, memo } => DdState::Completed { status, memo: memo.clone() },
            DdState::Error { step, reason } => DdState::Error { step, reason: reason.clone() },
        }
    }
}

fn build_cross_check_findings(team: &AnalysisResult, market: &AnalysisResult) -> Vec<CrossCheckFinding> {
    let mut findings = Vec::new();
    if team.is_placeholder {
        findings.push(CrossCheckFinding {
            description: "team analysis unavailable, cross-check limited to market signals".to_string(),
            severity: "medium",
        });
    }
    if market.is_placeholder {
        findings.push(CrossCheckFinding {
            description: "market analysis unavailable, cross-check limited to team signals".to_string(),
            severity: "medium",
        });
    }
    findings
}
