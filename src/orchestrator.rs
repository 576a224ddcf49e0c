//! Backup run orchestration
//!
//! [`BackupOrchestrator::run_once`] drives one run through
//! `Idle → Acquiring → Renewing → Capturing → Dispatching → Releasing → Done`,
//! with `Failed` reachable from every state. The lease is released on every
//! path out of `Capturing`, and the captured artifact is removed exactly once,
//! after every backend has finished with it.
//!
//! Backends that only read the artifact run concurrently, bounded by a
//! semaphore, and share it through an `Arc`. A backend that takes ownership
//! of the artifact runs after all readers have joined. Dropping a run
//! mid-dispatch stops its reader tasks; [`BackupOrchestrator::drain_dispatch`]
//! waits until they have let go of the artifact.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::clock::{Clock, SystemClock};
use crate::config::ConfigError;
use crate::errors::ErrorSet;
use crate::lease::{Lease, LeaseError};
use crate::output::OutputBackend;
use crate::retention::RetentionReport;
use crate::snapshot::{ArtifactHandle, CaptureError, SnapshotSource};
use crate::SnapError;

/// Error source used for lease failures in a run's [`ErrorSet`]
pub const LEASE_SOURCE: &str = "lease";

/// Error source used for capture failures in a run's [`ErrorSet`]
pub const SNAPSHOT_SOURCE: &str = "snapshot";

/// Lifecycle states of a backup run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunState {
    Idle,
    Acquiring,
    Renewing,
    Capturing,
    Dispatching,
    Releasing,
    Done,
    Failed,
}

impl RunState {
    /// Whether `self → next` is a legal transition
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Idle, Acquiring)
                | (Acquiring, Renewing)
                | (Renewing, Capturing)
                | (Capturing, Dispatching)
                | (Capturing, Releasing)
                | (Dispatching, Releasing)
                | (Releasing, Done)
        ) || (next == Failed && !matches!(self, Done | Failed))
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    /// Snapshot captured and every backend succeeded
    Done,
    /// Another process holds the lock; nothing was attempted
    Skipped,
    /// Something failed; see [`RunReport::errors`]
    Failed,
}

/// Per-backend result of the dispatch phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendReport {
    pub backend: String,
    pub persisted: bool,
    /// `None` when retention was not attempted
    pub retention: Option<RetentionReport>,
}

/// Everything observed during one run
#[derive(Debug)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// States visited, in order, starting with `Idle`
    pub states: Vec<RunState>,
    pub artifact_name: Option<String>,
    pub consistency_index: Option<u64>,
    pub backends: Vec<BackendReport>,
    /// Lease, capture and backend failures, attributed by source
    pub errors: ErrorSet,
    /// Release failure, reported apart from the outcome
    pub release_error: Option<LeaseError>,
    /// Failures reported by the renewal task
    pub renewal_failures: Vec<LeaseError>,
}

impl RunReport {
    pub fn final_state(&self) -> RunState {
        self.states.last().copied().unwrap_or(RunState::Idle)
    }

    pub fn visited(&self, state: RunState) -> bool {
        self.states.contains(&state)
    }

    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Done
    }
}

/// Artifact names of the form `{prefix}{unix nanoseconds}{extension}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactNaming {
    pub prefix: String,
    pub extension: String,
}

impl ArtifactNaming {
    pub fn new(prefix: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            extension: extension.into(),
        }
    }

    pub fn name_at(&self, at: DateTime<Utc>) -> String {
        let nanos = at
            .timestamp_nanos_opt()
            .unwrap_or_else(|| at.timestamp().saturating_mul(1_000_000_000));
        format!("{}{}{}", self.prefix, nanos, self.extension)
    }
}

impl Default for ArtifactNaming {
    fn default() -> Self {
        Self::new("consul-snapshot-", ".snap")
    }
}

/// In-flight run: current state plus accumulated errors
struct BackupRun {
    state: RunState,
    states: Vec<RunState>,
    errors: ErrorSet,
}

impl BackupRun {
    fn new() -> Self {
        Self {
            state: RunState::Idle,
            states: vec![RunState::Idle],
            errors: ErrorSet::new(),
        }
    }

    fn enter(&mut self, next: RunState) {
        debug_assert!(self.state.can_transition_to(next), "{} -> {}", self.state, next);
        debug!(from = %self.state, to = %next, "Run state transition");
        self.state = next;
        self.states.push(next);
    }
}

/// Drives backup runs against one lease, one snapshot source and a set of backends
pub struct BackupOrchestrator {
    lease: Lease,
    source: SnapshotSource,
    backends: Vec<Arc<dyn OutputBackend>>,
    naming: ArtifactNaming,
    clock: Arc<dyn Clock>,
    dispatch_concurrency: usize,
    dispatch_tasks: TaskTracker,
}

/// Builder for [`BackupOrchestrator`]
pub struct BackupOrchestratorBuilder {
    lease: Lease,
    source: SnapshotSource,
    backends: Vec<Arc<dyn OutputBackend>>,
    naming: ArtifactNaming,
    clock: Arc<dyn Clock>,
    dispatch_concurrency: usize,
}

impl BackupOrchestratorBuilder {
    pub fn backend(mut self, backend: Arc<dyn OutputBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn backends(mut self, backends: impl IntoIterator<Item = Arc<dyn OutputBackend>>) -> Self {
        self.backends.extend(backends);
        self
    }

    pub fn naming(mut self, naming: ArtifactNaming) -> Self {
        self.naming = naming;
        self
    }

    /// Clock used to name artifacts
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Maximum number of reading backends running at once
    pub fn dispatch_concurrency(mut self, limit: usize) -> Self {
        self.dispatch_concurrency = limit.max(1);
        self
    }

    /// Fails when backend names collide or more than one backend takes ownership
    pub fn build(self) -> Result<BackupOrchestrator, ConfigError> {
        let owners: Vec<&str> = self
            .backends
            .iter()
            .filter(|b| b.takes_ownership())
            .map(|b| b.name())
            .collect();
        if owners.len() > 1 {
            return Err(ConfigError::Invalid(format!(
                "at most one backend may take ownership of the artifact, got {}",
                owners.join(", ")
            )));
        }

        let mut names: Vec<&str> = self.backends.iter().map(|b| b.name()).collect();
        names.sort_unstable();
        if let Some(pair) = names.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(ConfigError::Invalid(format!("duplicate backend name {}", pair[0])));
        }

        Ok(BackupOrchestrator {
            lease: self.lease,
            source: self.source,
            backends: self.backends,
            naming: self.naming,
            clock: self.clock,
            dispatch_concurrency: self.dispatch_concurrency,
            dispatch_tasks: TaskTracker::new(),
        })
    }
}

impl BackupOrchestrator {
    pub fn builder(lease: Lease, source: SnapshotSource) -> BackupOrchestratorBuilder {
        BackupOrchestratorBuilder {
            lease,
            source,
            backends: Vec::new(),
            naming: ArtifactNaming::default(),
            clock: Arc::new(SystemClock),
            dispatch_concurrency: num_cpus::get().max(1),
        }
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Wait for reader tasks left behind by an abandoned run
    pub async fn drain_dispatch(&self) {
        self.dispatch_tasks.close();
        self.dispatch_tasks.wait().await;
        self.dispatch_tasks.reopen();
    }

    pub fn backend_names(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    /// Execute one run end to end
    pub async fn run_once(&self) -> RunReport {
        let started = Instant::now();
        let span = info_span!("backup_run", key = %self.lease.key());
        let report = self.execute().instrument(span).await;

        match report.outcome {
            RunOutcome::Done => info!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                artifact = report.artifact_name.as_deref().unwrap_or_default(),
                index = report.consistency_index.unwrap_or_default(),
                "Backup run completed"
            ),
            RunOutcome::Skipped => info!("Could not acquire lock; skipping run"),
            RunOutcome::Failed => error!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                errors = %report.errors,
                "Backup run failed"
            ),
        }
        report
    }

    async fn execute(&self) -> RunReport {
        let mut run = BackupRun::new();
        let mut report = RunReport {
            outcome: RunOutcome::Failed,
            states: Vec::new(),
            artifact_name: None,
            consistency_index: None,
            backends: Vec::new(),
            errors: ErrorSet::new(),
            release_error: None,
            renewal_failures: Vec::new(),
        };

        run.enter(RunState::Acquiring);
        let guard = match self.lease.acquire().await {
            Ok(guard) => guard,
            Err(err) => {
                report.outcome = if err.is_already_held() {
                    RunOutcome::Skipped
                } else {
                    error!(error = %err, "Could not acquire lock");
                    RunOutcome::Failed
                };
                run.errors.push(LEASE_SOURCE, err);
                run.enter(RunState::Failed);
                report.states = run.states;
                report.errors = run.errors;
                return report;
            }
        };

        run.enter(RunState::Renewing);
        let renewal = self.lease.start_renewal(&guard);

        run.enter(RunState::Capturing);
        let mut captured = false;
        let mut lost_before_dispatch = false;
        match self.source.capture().await {
            Ok(artifact) => {
                captured = true;
                report.consistency_index = Some(artifact.consistency_index());

                if renewal.is_lost() {
                    error!("Lease lost before dispatch; abandoning artifact");
                    lost_before_dispatch = true;
                    if let Err(err) = artifact.discard() {
                        run.errors.push(SNAPSHOT_SOURCE, CaptureError::Io(err));
                    }
                } else {
                    run.enter(RunState::Dispatching);
                    let name = self.naming.name_at(self.clock.now());
                    report.artifact_name = Some(name.clone());
                    report.backends = self.dispatch(artifact, &name, &mut run.errors).await;
                }
            }
            Err(err) => {
                error!(error = %err, "Could not perform snapshot");
                run.errors.push(SNAPSHOT_SOURCE, err);
            }
        }

        run.enter(RunState::Releasing);
        let renewal = renewal.stop().await;
        if renewal.lost {
            warn!(failures = renewal.summary.failures, "Renewal gave up on the lease during the run");
        }
        if lost_before_dispatch {
            let lost = renewal
                .failures
                .iter()
                .find(|err| matches!(err, LeaseError::LeaseLost { .. }))
                .cloned()
                .unwrap_or_else(|| LeaseError::LeaseLost {
                    key: self.lease.key().to_string(),
                    failures: renewal.summary.failures as u32,
                });
            run.errors.push(LEASE_SOURCE, lost);
        }
        report.renewal_failures = renewal.failures;

        let session = guard.session_id().clone();
        match guard.release().await {
            Ok(()) => {
                info!(session = %session, "Released lock");
                run.enter(if captured && run.errors.is_empty() {
                    RunState::Done
                } else {
                    RunState::Failed
                });
            }
            Err(err) => {
                warn!(session = %session, error = %err, "Could not release lock; relying on session TTL");
                report.release_error = Some(err);
                run.enter(RunState::Failed);
            }
        }

        report.outcome = if captured && run.errors.is_empty() {
            RunOutcome::Done
        } else {
            RunOutcome::Failed
        };
        report.states = run.states;
        report.errors = run.errors;
        report
    }

    /// Persist then apply retention on every backend; the artifact is released once all are done
    async fn dispatch(&self, artifact: ArtifactHandle, name: &str, errors: &mut ErrorSet) -> Vec<BackendReport> {
        let (owners, readers): (Vec<_>, Vec<_>) = self.backends.iter().cloned().partition(|b| b.takes_ownership());
        info!(
            artifact = name,
            readers = readers.len(),
            owners = owners.len(),
            concurrency = self.dispatch_concurrency,
            "Dispatching snapshot"
        );

        let artifact = Arc::new(artifact);
        let semaphore = Arc::new(Semaphore::new(self.dispatch_concurrency));
        let abandoned = CancellationToken::new();
        // Fires only if this future is dropped before every reader joined
        let _abandon_on_drop = abandoned.clone().drop_guard();
        let mut tasks = Vec::with_capacity(readers.len());

        for backend in readers {
            let backend_name = backend.name().to_string();
            let artifact = Arc::clone(&artifact);
            let semaphore = Arc::clone(&semaphore);
            let abandoned = abandoned.clone();
            let name = name.to_string();
            let span = info_span!("dispatch", backend = %backend_name);

            let task = self.dispatch_tasks.spawn(
                async move {
                    let abandoned_report = BackendReport {
                        backend: backend.name().to_string(),
                        persisted: false,
                        retention: None,
                    };
                    let work = async {
                        let _permit = semaphore.acquire_owned().await.ok();
                        let persisted = backend.persist(&artifact, &name).await;
                        drop(artifact);
                        finish_backend(backend.as_ref(), persisted).await
                    };
                    tokio::select! {
                        _ = abandoned.cancelled() => {
                            warn!("Run abandoned; stopping backend");
                            (abandoned_report, ErrorSet::new())
                        }
                        finished = work => finished,
                    }
                }
                .instrument(span),
            );
            tasks.push((backend_name, task));
        }

        let mut reports = Vec::with_capacity(self.backends.len());
        for (backend_name, task) in tasks {
            match task.await {
                Ok((report, backend_errors)) => {
                    errors.merge(backend_errors);
                    reports.push(report);
                }
                Err(err) => {
                    error!(backend = %backend_name, error = %err, "Backend task ended abnormally");
                    errors.push(backend_name.clone(), SnapError::Join(err));
                    reports.push(BackendReport {
                        backend: backend_name,
                        persisted: false,
                        retention: None,
                    });
                }
            }
        }

        let artifact = match Arc::try_unwrap(artifact) {
            Ok(artifact) => Some(artifact),
            Err(shared) => {
                errors.push(
                    SNAPSHOT_SOURCE,
                    SnapError::Internal(format!(
                        "artifact still shared by {} holders after dispatch",
                        Arc::strong_count(&shared) - 1
                    )),
                );
                None
            }
        };

        match (owners.into_iter().next(), artifact) {
            (Some(owner), Some(artifact)) => {
                let span = info_span!("dispatch", backend = %owner.name());
                let persisted = owner.persist_owned(artifact, name).instrument(span.clone()).await;
                let (report, backend_errors) = finish_backend(owner.as_ref(), persisted).instrument(span).await;
                errors.merge(backend_errors);
                reports.push(report);
            }
            (Some(owner), None) => {
                reports.push(BackendReport {
                    backend: owner.name().to_string(),
                    persisted: false,
                    retention: None,
                });
            }
            (None, Some(artifact)) => {
                let path = artifact.path().display().to_string();
                match artifact.discard() {
                    Ok(()) => debug!(path = %path, "Removed temporary snapshot"),
                    Err(err) => errors.push(SNAPSHOT_SOURCE, CaptureError::Io(err)),
                }
            }
            (None, None) => {}
        }

        reports
    }
}

/// Log the persist outcome and, if it succeeded, apply the backend's retention
async fn finish_backend(
    backend: &dyn OutputBackend,
    persisted: Result<(), crate::output::BackendError>,
) -> (BackendReport, ErrorSet) {
    let mut errors = ErrorSet::new();
    let mut report = BackendReport {
        backend: backend.name().to_string(),
        persisted: persisted.is_ok(),
        retention: None,
    };

    match persisted {
        Ok(()) => {
            info!(backend = backend.name(), "Processed output");
            match backend.retention().apply(backend).await {
                Ok(retention) => report.retention = Some(retention),
                Err(retention_errors) => errors.merge(retention_errors),
            }
        }
        Err(err) => {
            error!(backend = backend.name(), error = %err, "Error processing output");
            errors.push(backend.name(), err);
        }
    }

    (report, errors)
}

impl fmt::Debug for BackupOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupOrchestrator")
            .field("lease", &self.lease)
            .field("source", &self.source)
            .field("backends", &self.backend_names())
            .field("naming", &self.naming)
            .field("dispatch_concurrency", &self.dispatch_concurrency)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_naming_uses_unix_nanoseconds() {
        let naming = ArtifactNaming::new("consul-snapshot-", ".snap");
        let at = Utc.timestamp_opt(1_700_000_000, 123).unwrap();

        assert_eq!(naming.name_at(at), "consul-snapshot-1700000000000000123.snap");
    }

    #[test]
    fn test_failed_is_reachable_from_every_non_terminal_state() {
        use RunState::*;
        for state in [Idle, Acquiring, Renewing, Capturing, Dispatching, Releasing] {
            assert!(state.can_transition_to(Failed), "{} -> Failed", state);
        }
        assert!(!Done.can_transition_to(Failed));
        assert!(!Capturing.can_transition_to(Done));
        assert!(Capturing.can_transition_to(Releasing));
    }
}
