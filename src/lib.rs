//! # snapcoord
//!
//! Coordinated snapshot orchestration: take a consistent point-in-time
//! snapshot of a replicated state store and distribute it to one or more
//! storage backends, with at most one process in a fleet doing so at a time.
//!
//! ## Overview
//!
//! A run is driven by [`orchestrator::BackupOrchestrator::run_once`]:
//!
//! 1. acquire a [`lease::Lease`] on the coordination service,
//! 2. keep it alive with a background [`lease::RenewalTask`],
//! 3. capture and verify a snapshot through [`snapshot::SnapshotSource`],
//! 4. fan the artifact out to every configured [`output::OutputBackend`],
//!    applying each backend's [`retention::RetentionPolicy`] after its upload,
//! 5. release the lease and delete the temporary artifact.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use snapcoord::clock::SystemClock;
//! use snapcoord::lease::{Lease, memory::InMemoryCoordinator};
//! use snapcoord::orchestrator::{ArtifactNaming, BackupOrchestrator};
//! use snapcoord::output::local::{LocalFilesystemBackend, LocalOutputConfig};
//! use snapcoord::snapshot::SnapshotSource;
//! # use snapcoord::snapshot::SnapshotClient;
//! # async fn example(client: Arc<dyn SnapshotClient>) -> snapcoord::Result<()> {
//! let coordinator = Arc::new(InMemoryCoordinator::new());
//! let lease = Lease::new(coordinator, "snapshots/.lock", Duration::from_secs(600));
//! let source = SnapshotSource::new(client);
//! let local = LocalFilesystemBackend::new(LocalOutputConfig::new("/var/backups"), Arc::new(SystemClock));
//!
//! let orchestrator = BackupOrchestrator::builder(lease, source)
//!     .backend(Arc::new(local))
//!     .naming(ArtifactNaming::new("snapshot-", ".snap"))
//!     .build()?;
//!
//! let report = orchestrator.run_once().await;
//! println!("{:?}", report.outcome);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`lease`]: session-backed mutual exclusion and renewal
//! - [`snapshot`]: streamed capture with integrity verification
//! - [`consul`]: HTTP adapters for Consul sessions, KV locks and snapshots
//! - [`output`]: storage backends (local filesystem, object storage)
//! - [`retention`]: age-based garbage collection per backend
//! - [`orchestrator`]: the run state machine
//! - [`scheduler`]: the periodic trigger and shutdown handling
//! - [`config`]: immutable process configuration

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use thiserror::Error;

/// Result type for snapcoord operations
pub type Result<T> = std::result::Result<T, SnapError>;

/// Main error type for snapcoord operations
#[derive(Error, Debug)]
pub enum SnapError {
    /// Lease acquisition, renewal or release failure
    #[error("Lease error: {0}")]
    Lease(#[from] lease::LeaseError),

    /// Snapshot capture or verification failure
    #[error("Capture error: {0}")]
    Capture(#[from] snapshot::CaptureError),

    /// Output backend failure (persist, list or delete)
    #[error("Backend error: {0}")]
    Backend(#[from] output::BackendError),

    /// Invalid or incomplete configuration
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Join error from async tasks
    #[error("Async join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Time source shared by backends and retention
pub mod clock;

/// Aggregated per-source error reporting
pub mod errors;

/// Lease-based distributed mutual exclusion
pub mod lease;

/// Snapshot capture and verification
pub mod snapshot;

/// Consul coordination and snapshot adapters
pub mod consul;

/// Output backends
pub mod output;

/// Retention policy and garbage collection
pub mod retention;

/// Backup run orchestration
pub mod orchestrator;

/// Periodic trigger and shutdown handling
pub mod scheduler;

/// Process configuration
pub mod config;

pub use errors::ErrorSet;
pub use orchestrator::{BackupOrchestrator, RunOutcome, RunReport, RunState};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion_keeps_source_message() {
        let err: SnapError = lease::LeaseError::AlreadyHeld {
            key: "snapshots/.lock".to_string(),
        }
        .into();

        assert!(matches!(err, SnapError::Lease(_)));
        assert!(err.to_string().contains("snapshots/.lock"));
    }

    #[test]
    fn test_internal_error_display() {
        let err = SnapError::Internal("artifact still shared".to_string());
        assert_eq!(err.to_string(), "Internal error: artifact still shared");
    }
}
