//! Scheduler (C8).
//!
//! Long-running driver for trading-mode roundtable cycles: runs once
//! immediately on startup, then waits a configurable interval computed from
//! the *actual* end time of the previous cycle before running again.
//! Implemented as a single `tokio::spawn`ed task with a `tokio::sync::Notify`
//! for cancellation and `tokio::time::timeout` enforcing a hard per-cycle
//! deadline.

use crate::event::{EventHandler, SchedulerEvent};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Outcome tag for one scheduler cycle, used in per-cycle logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    SignalEmitted,
    NoSignal,
    Error,
    CycleTimeout,
}

impl CycleOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::SignalEmitted => "signal_emitted",
            CycleOutcome::NoSignal => "no_signal",
            CycleOutcome::Error => "error",
            CycleOutcome::CycleTimeout => "cycle_timeout",
        }
    }
}

/// One trading cycle's work, supplied by the caller. Implementors run a
/// roundtable meeting in trading mode and report the outcome.
#[async_trait]
pub trait CycleRunner: Send + Sync {
    async fn run_cycle(&self, cycle: u64, reason: &'static str) -> CycleOutcome;
}

/// Guards against double-initialization; one of the two permitted
/// process-wide globals (§9).
static STARTED: AtomicBool = AtomicBool::new(false);

/// Recurring trading-cycle driver.
pub struct Scheduler {
    interval: Duration,
    cycle_timeout: Duration,
    runner: Arc<dyn CycleRunner>,
    events: Arc<dyn EventHandler>,
    cancel: Arc<Notify>,
    cycle_counter: Arc<AtomicU64>,
}

impl Scheduler {
    pub fn new(
        interval_hours: f64,
        cycle_timeout: Duration,
        runner: Arc<dyn CycleRunner>,
        events: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            interval: Duration::from_secs_f64(interval_hours * 3600.0),
            cycle_timeout,
            runner,
            events,
            cancel: Arc::new(Notify::new()),
            cycle_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start the scheduler loop as a background task. A duplicate `start()`
    /// on an already-started scheduler is a no-op with a warning.
    pub fn start(&self) -> JoinHandle<()> {
        if STARTED.swap(true, Ordering::SeqCst) {
            log::warn!("scheduler: start() called while already started; ignoring");
            return tokio::spawn(async {});
        }

        let interval = self.interval;
        let cycle_timeout = self.cycle_timeout;
        let runner = self.runner.clone();
        let events = self.events.clone();
        let cancel = self.cancel.clone();
        let cycle_counter = self.cycle_counter.clone();

        tokio::spawn(async move {
            run_loop(interval, cycle_timeout, runner, events, cancel, cycle_counter).await;
            STARTED.store(false, Ordering::SeqCst);
        })
    }

    /// Signal the running loop to stop after its current wait or in-flight cycle.
    pub fn stop(&self) {
        self.cancel.notify_one();
    }

    pub fn current_cycle(&self) -> u64 {
        self.cycle_counter.load(Ordering::SeqCst)
    }
}

async fn run_loop(
    interval: Duration,
    cycle_timeout: Duration,
    runner: Arc<dyn CycleRunner>,
    events: Arc<dyn EventHandler>,
    cancel: Arc<Notify>,
    cycle_counter: Arc<AtomicU64>,
) {
    let mut reason: &'static str = "startup";
    loop {
        let cycle = cycle_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let start = tokio::time::Instant::now();
        events
            .on_scheduler_event(&SchedulerEvent::CycleStarted { cycle, reason })
            .await;

        let outcome = match tokio::time::timeout(cycle_timeout, runner.run_cycle(cycle, reason)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                log::error!("scheduler: cycle {} exceeded timeout of {:?}", cycle, cycle_timeout);
                CycleOutcome::CycleTimeout
            }
        };

        let elapsed = start.elapsed();
        let wait = interval.saturating_sub(elapsed.min(interval));
        events
            .on_scheduler_event(&SchedulerEvent::CycleCompleted {
                cycle,
                outcome: outcome.as_str().to_string(),
                next_start_in_secs: wait.as_secs(),
            })
            .await;
        log::info!(
            "scheduler: cycle {} ({}) finished with outcome={} in {:?}, next start in {:?}",
            cycle,
            reason,
            outcome.as_str(),
            elapsed,
            wait
        );

        reason = "scheduled";

        tokio::select! {
            _ = cancel.notified() => {
                log::info!("scheduler: stop signal received, exiting loop");
                return;
            }
            _ = tokio::time::sleep(wait) => {}
        }
    }
}
