//! Output backends
//!
//! Every destination implements [`OutputBackend`]: persist an artifact under
//! a name, enumerate artifacts older than a threshold, delete by id. The
//! orchestrator iterates backends uniformly and never knows which variant it
//! is talking to.

pub mod local;
pub mod object_store;
#[cfg(feature = "s3")]
pub mod s3;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::retention::RetentionPolicy;
use crate::snapshot::ArtifactHandle;

pub use local::{LocalFilesystemBackend, LocalOutputConfig};
pub use object_store::{
    Credentials, InMemoryObjectStore, ObjectStorageBackend, ObjectStorageClient, ObjectStorageConfig,
};

/// Errors raised by output backends
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Error saving {name}: {reason}")]
    Persist { name: String, reason: String },

    #[error("Error listing artifacts: {0}")]
    List(String),

    #[error("Error deleting {id}: {reason}")]
    Delete { id: String, reason: String },

    /// The destination directory does not exist and creating it is disabled
    #[error("Destination {0} does not exist")]
    DestinationMissing(PathBuf),

    #[error("Error creating container {container}: {reason}")]
    Container { container: String, reason: String },

    /// Object storage configured without usable credentials
    #[error("Missing object storage credentials: {0}")]
    MissingCredentials(String),
}

/// An artifact a backend has stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredArtifact {
    /// Backend-specific identifier accepted by [`OutputBackend::delete`]
    pub id: String,
    /// Last-modified time as reported by the backend
    pub last_modified: DateTime<Utc>,
}

/// A durable destination for snapshot artifacts
#[async_trait]
pub trait OutputBackend: Send + Sync {
    /// Name used in logs and error attribution
    fn name(&self) -> &str;

    /// Age-based garbage collection for this destination
    fn retention(&self) -> &RetentionPolicy;

    /// Whether this backend wants to consume the artifact instead of reading it
    ///
    /// Such a backend is dispatched through [`OutputBackend::persist_owned`]
    /// after every other backend has finished with the artifact.
    fn takes_ownership(&self) -> bool {
        false
    }

    /// Store a copy of `artifact` as `name`; the artifact is left untouched
    async fn persist(&self, artifact: &ArtifactHandle, name: &str) -> Result<(), BackendError>;

    /// Store `artifact` as `name`, consuming the temporary file
    async fn persist_owned(&self, artifact: ArtifactHandle, name: &str) -> Result<(), BackendError> {
        let result = self.persist(&artifact, name).await;
        if let Err(err) = artifact.discard() {
            warn!(backend = self.name(), error = %err, "Failed to remove temporary artifact");
        }
        result
    }

    /// Every stored artifact whose age exceeds `max_age`, across all pages
    async fn list_older_than(&self, max_age: Duration) -> Result<Vec<StoredArtifact>, BackendError>;

    /// Remove a stored artifact
    async fn delete(&self, id: &str) -> Result<(), BackendError>;
}
