//! Periodic trigger and two-stage shutdown
//!
//! The scheduler calls [`BackupOrchestrator::run_once`] on a fixed
//! interval. Runs never overlap: a tick that fires while a run is in
//! flight is skipped. The first shutdown request stops scheduling and
//! lets the in-flight run finish; a second one abandons it, which drops
//! the lease guard and stops the backend tasks so the lease release and
//! artifact removal run in the background, and then waits for both.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::orchestrator::{BackupOrchestrator, RunOutcome, RunReport};

/// How far a shutdown has escalated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    /// Finish the current run, start no new one
    Graceful,
    /// Abandon the current run
    Forced,
}

/// Shared shutdown switch; the first request is graceful, any later one forced
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    graceful: CancellationToken,
    forced: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Escalate one step and return the phase now in effect
    pub fn request(&self) -> ShutdownPhase {
        if self.graceful.is_cancelled() {
            self.forced.cancel();
            ShutdownPhase::Forced
        } else {
            self.graceful.cancel();
            ShutdownPhase::Graceful
        }
    }

    pub fn phase(&self) -> ShutdownPhase {
        if self.forced.is_cancelled() {
            ShutdownPhase::Forced
        } else if self.graceful.is_cancelled() {
            ShutdownPhase::Graceful
        } else {
            ShutdownPhase::Running
        }
    }

    /// Resolves once any shutdown has been requested
    pub async fn requested(&self) {
        self.graceful.cancelled().await
    }

    /// Resolves once shutdown has been forced
    pub async fn forced(&self) {
        self.forced.cancelled().await
    }
}

/// Counts of runs by outcome
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerSummary {
    pub runs: usize,
    pub done: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Runs cut short by a forced shutdown
    pub abandoned: usize,
}

impl SchedulerSummary {
    fn record(&mut self, report: &RunReport) {
        self.runs += 1;
        match report.outcome {
            RunOutcome::Done => self.done += 1,
            RunOutcome::Skipped => self.skipped += 1,
            RunOutcome::Failed => self.failed += 1,
        }
    }
}

/// Process exit status for a single run: 0 when done or skipped, 1 when failed
pub fn exit_code(outcome: RunOutcome) -> u8 {
    match outcome {
        RunOutcome::Done | RunOutcome::Skipped => 0,
        RunOutcome::Failed => 1,
    }
}

pub struct Scheduler {
    orchestrator: Arc<BackupOrchestrator>,
    interval: Duration,
    run_immediately: bool,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<BackupOrchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
            run_immediately: true,
        }
    }

    /// Wait one full interval before the first run
    pub fn delay_first_run(mut self) -> Self {
        self.run_immediately = false;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run once, unless shutdown is forced first
    pub async fn run_single(&self, shutdown: &Shutdown) -> Option<RunReport> {
        let report = self.guarded_run(shutdown).await;
        self.drain().await;
        report
    }

    /// Run on every tick until shutdown
    pub async fn run(&self, shutdown: Shutdown) -> SchedulerSummary {
        let first = if self.run_immediately {
            Instant::now()
        } else {
            Instant::now() + self.interval
        };
        let mut ticker = interval_at(first, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(interval = ?self.interval, "Scheduler started");
        let mut summary = SchedulerSummary::default();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.requested() => break,
                _ = ticker.tick() => {}
            }

            match self.guarded_run(&shutdown).await {
                Some(report) => summary.record(&report),
                None => {
                    summary.abandoned += 1;
                    break;
                }
            }
        }

        info!("Waiting for lock and artifact cleanup");
        self.drain().await;
        info!(
            runs = summary.runs,
            done = summary.done,
            skipped = summary.skipped,
            failed = summary.failed,
            abandoned = summary.abandoned,
            "Scheduler stopped"
        );
        summary
    }

    async fn drain(&self) {
        self.orchestrator.drain_dispatch().await;
        self.orchestrator.lease().drain_cleanup().await;
    }

    async fn guarded_run(&self, shutdown: &Shutdown) -> Option<RunReport> {
        tokio::select! {
            biased;
            _ = shutdown.forced() => {
                warn!("Forced shutdown; abandoning the in-flight run");
                None
            }
            report = self.orchestrator.run_once() => Some(report),
        }
    }
}
