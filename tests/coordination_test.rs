mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::Barrier;

use common::*;
use snapcoord::lease::memory::InMemoryCoordinator;
use snapcoord::lease::LeaseError;
use snapcoord::orchestrator::{BackupOrchestrator, RunOutcome, RunState};
use snapcoord::snapshot::memory::StaticSnapshotClient;
use snapcoord::SnapError;

#[tokio::test]
async fn test_contended_run_is_skipped_without_side_effects() {
    let temp = tempfile::tempdir().unwrap();
    let coordinator = Arc::new(InMemoryCoordinator::new());
    let journal = journal();

    let holder = lease_on(&coordinator);
    let held = holder.acquire().await.unwrap();

    let client = static_client(42);
    let backend = Arc::new(RecordingBackend::new("recorder", &journal));
    let orchestrator = BackupOrchestrator::builder(lease_on(&coordinator), source_of(client.clone(), temp.path()))
        .backend(backend.clone())
        .build()
        .unwrap();

    let report = orchestrator.run_once().await;

    assert_eq!(report.outcome, RunOutcome::Skipped);
    assert_eq!(report.states, vec![RunState::Idle, RunState::Acquiring, RunState::Failed]);
    assert_eq!(client.requests(), 0);
    assert!(journal.lock().is_empty());
    assert!(matches!(
        report.errors.iter().next(),
        Some((_, SnapError::Lease(LeaseError::AlreadyHeld { .. })))
    ));
    // The loser's session is gone, the winner still holds the key
    assert_eq!(coordinator.live_sessions(), 1);
    assert_eq!(coordinator.holder(LOCK_KEY).as_ref(), Some(held.session_id()));

    held.release().await.unwrap();
    let report = orchestrator.run_once().await;
    assert_eq!(report.outcome, RunOutcome::Done);
    assert_eq!(client.requests(), 1);
}

#[tokio::test]
async fn test_concurrent_orchestrators_never_overlap() {
    let temp = tempfile::tempdir().unwrap();
    let coordinator = Arc::new(InMemoryCoordinator::new());
    let journal = journal();
    let active = Arc::new(Concurrency::default());

    let orchestrators: Vec<Arc<BackupOrchestrator>> = (0..6)
        .map(|i| {
            let backend = RecordingBackend::new(&format!("node-{}", i), &journal)
                .delayed(Duration::from_millis(40))
                .tracking(&active);
            let orchestrator = BackupOrchestrator::builder(lease_on(&coordinator), source_of(static_client(i), temp.path()))
                .backend(Arc::new(backend))
                .build()
                .unwrap();
            Arc::new(orchestrator)
        })
        .collect();

    for round in 1..=2 {
        let start = Arc::new(Barrier::new(orchestrators.len()));
        let handles: Vec<_> = orchestrators
            .iter()
            .map(|orchestrator| {
                let orchestrator = orchestrator.clone();
                let start = start.clone();
                tokio::spawn(async move {
                    start.wait().await;
                    orchestrator.run_once().await
                })
            })
            .collect();

        let mut done = 0;
        for handle in handles {
            let report = handle.await.unwrap();
            match report.outcome {
                RunOutcome::Done => done += 1,
                RunOutcome::Skipped => {
                    assert!(!report.visited(RunState::Capturing));
                    assert!(matches!(
                        report.errors.iter().next(),
                        Some((_, SnapError::Lease(LeaseError::AlreadyHeld { .. })))
                    ));
                }
                RunOutcome::Failed => panic!("unexpected failure: {}", report.errors),
            }
        }

        assert_eq!(done, 1, "round {}", round);
        assert_eq!(journal.lock().len(), round);
        assert_eq!(coordinator.holder(LOCK_KEY), None);
        assert_eq!(coordinator.live_sessions(), 0);
    }

    assert_eq!(active.peak(), 1);
    let calls = journal.lock().clone();
    for (i, a) in calls.iter().enumerate() {
        for b in &calls[i + 1..] {
            assert!(
                a.finished <= b.started || b.finished <= a.started,
                "persist windows overlap: {:?} and {:?}",
                a,
                b
            );
        }
    }
}

#[tokio::test]
async fn test_lost_lease_abandons_artifact_before_dispatch() {
    let temp = tempfile::tempdir().unwrap();
    let coordinator = Arc::new(InMemoryCoordinator::new());
    let journal = journal();
    coordinator.fail_next_renewals(2);

    let lease = lease_on(&coordinator).with_renew_interval(Duration::from_millis(10));
    let slow = Arc::new(SlowSnapshotClient::new(static_client(9), Duration::from_millis(300)));
    let orchestrator = BackupOrchestrator::builder(lease, source_of(slow, temp.path()))
        .backend(Arc::new(RecordingBackend::new("recorder", &journal)))
        .build()
        .unwrap();

    let report = orchestrator.run_once().await;

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert!(report.visited(RunState::Capturing));
    assert!(!report.visited(RunState::Dispatching));
    assert!(journal.lock().is_empty());
    assert!(report
        .errors
        .iter()
        .any(|(source, err)| source == "lease" && matches!(err, SnapError::Lease(LeaseError::LeaseLost { .. }))));
    assert!(report.renewal_failures.len() >= 2);
    assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    assert_eq!(coordinator.holder(LOCK_KEY), None);
}

#[tokio::test]
async fn test_capture_failure_still_releases_lease() {
    let temp = tempfile::tempdir().unwrap();
    let coordinator = Arc::new(InMemoryCoordinator::new());
    let journal = journal();

    let client = Arc::new(StaticSnapshotClient::new(snapshot_payload(3), 3).rejecting());
    let orchestrator = BackupOrchestrator::builder(lease_on(&coordinator), source_of(client, temp.path()))
        .backend(Arc::new(RecordingBackend::new("recorder", &journal)))
        .build()
        .unwrap();

    let report = orchestrator.run_once().await;

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.errors.sources(), vec!["snapshot"]);
    assert!(report.visited(RunState::Releasing));
    assert!(journal.lock().is_empty());
    assert_eq!(coordinator.holder(LOCK_KEY), None);
    assert_eq!(coordinator.live_sessions(), 0);
}

#[tokio::test]
async fn test_interrupted_stream_leaves_no_artifact() {
    let temp = tempfile::tempdir().unwrap();
    let coordinator = Arc::new(InMemoryCoordinator::new());
    let journal = journal();

    let client = Arc::new(
        StaticSnapshotClient::new(snapshot_payload(5), 5)
            .with_chunk_size(1024)
            .failing_after(3),
    );
    let orchestrator = BackupOrchestrator::builder(lease_on(&coordinator), source_of(client, temp.path()))
        .backend(Arc::new(RecordingBackend::new("recorder", &journal)))
        .build()
        .unwrap();

    let report = orchestrator.run_once().await;

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert!(journal.lock().is_empty());
    assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    assert_eq!(coordinator.holder(LOCK_KEY), None);
}

#[tokio::test]
async fn test_release_failure_is_reported_apart_from_outcome() {
    let temp = tempfile::tempdir().unwrap();
    let coordinator = Arc::new(InMemoryCoordinator::new());
    let journal = journal();
    coordinator.fail_next_releases(1);

    let orchestrator = BackupOrchestrator::builder(lease_on(&coordinator), source_of(static_client(11), temp.path()))
        .backend(Arc::new(RecordingBackend::new("recorder", &journal)))
        .build()
        .unwrap();

    let report = orchestrator.run_once().await;

    assert_eq!(report.outcome, RunOutcome::Done);
    assert!(matches!(report.release_error, Some(LeaseError::Release { .. })));
    assert_eq!(report.final_state(), RunState::Failed);
    assert_eq!(journal.lock().len(), 1);
}
