// Local filesystem output - copies snapshots into a directory

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, instrument, warn};

use super::{BackendError, OutputBackend, StoredArtifact};
use crate::clock::{age_of, Clock};
use crate::retention::{is_older_than, RetentionPolicy};
use crate::snapshot::ArtifactHandle;

/// Settings for a [`LocalFilesystemBackend`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalOutputConfig {
    /// Directory receiving the artifacts
    pub destination: PathBuf,
    /// Create the directory when it does not exist
    pub create_destination: bool,
    /// Move the temporary artifact here instead of copying it
    pub take_ownership: bool,
    /// Only files whose name starts with this prefix are considered for retention
    pub name_prefix: Option<String>,
    pub retention: RetentionPolicy,
}

impl LocalOutputConfig {
    pub fn new(destination: impl Into<PathBuf>) -> Self {
        Self {
            destination: destination.into(),
            create_destination: false,
            take_ownership: false,
            name_prefix: None,
            retention: RetentionPolicy::retain_forever(),
        }
    }

    pub fn create_destination(mut self, create: bool) -> Self {
        self.create_destination = create;
        self
    }

    pub fn take_ownership(mut self, take: bool) -> Self {
        self.take_ownership = take;
        self
    }

    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = Some(prefix.into());
        self
    }

    pub fn retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }
}

/// Stores artifacts as plain files in a directory
pub struct LocalFilesystemBackend {
    name: String,
    config: LocalOutputConfig,
    clock: Arc<dyn Clock>,
}

impl LocalFilesystemBackend {
    pub fn new(config: LocalOutputConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: "local".to_string(),
            config,
            clock,
        }
    }

    /// Override the name used in logs and errors
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn destination(&self) -> &Path {
        &self.config.destination
    }

    async fn ensure_destination(&self) -> Result<(), BackendError> {
        if fs::metadata(&self.config.destination).await.is_ok() {
            return Ok(());
        }
        if !self.config.create_destination {
            return Err(BackendError::DestinationMissing(self.config.destination.clone()));
        }

        fs::create_dir_all(&self.config.destination)
            .await
            .map_err(|e| BackendError::Persist {
                name: self.config.destination.display().to_string(),
                reason: format!("Failed to create destination directory: {}", e),
            })?;
        info!(backend = %self.name, path = %self.config.destination.display(), "Created destination directory");
        Ok(())
    }

    fn target(&self, name: &str) -> PathBuf {
        self.config.destination.join(name)
    }

    fn partial(&self, name: &str) -> PathBuf {
        self.config.destination.join(format!(".{}.partial", name))
    }

    fn modified_at(metadata: &std::fs::Metadata) -> Option<DateTime<Utc>> {
        metadata.modified().ok().map(DateTime::<Utc>::from)
    }
}

#[async_trait]
impl OutputBackend for LocalFilesystemBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn retention(&self) -> &RetentionPolicy {
        &self.config.retention
    }

    fn takes_ownership(&self) -> bool {
        self.config.take_ownership
    }

    #[instrument(skip(self, artifact), fields(backend = %self.name))]
    async fn persist(&self, artifact: &ArtifactHandle, name: &str) -> Result<(), BackendError> {
        self.ensure_destination().await?;
        let target = self.target(name);
        let partial = self.partial(name);

        // Only complete copies ever appear under the final name
        let copied = match fs::copy(artifact.path(), &partial).await {
            Ok(_) => fs::rename(&partial, &target).await,
            Err(err) => Err(err),
        };
        if let Err(err) = copied {
            if let Err(cleanup) = fs::remove_file(&partial).await {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %partial.display(), error = %cleanup, "Failed to remove partial copy");
                }
            }
            return Err(BackendError::Persist {
                name: name.to_string(),
                reason: err.to_string(),
            });
        }

        info!(path = %target.display(), "Saved snapshot");
        Ok(())
    }

    #[instrument(skip(self, artifact), fields(backend = %self.name))]
    async fn persist_owned(&self, artifact: ArtifactHandle, name: &str) -> Result<(), BackendError> {
        if let Err(err) = self.ensure_destination().await {
            // Nobody else will read the artifact; release it before bailing out
            if let Err(discard) = artifact.discard() {
                warn!(error = %discard, "Failed to remove temporary artifact");
            }
            return Err(err);
        }
        let target = self.target(name);

        let moved_to = target.clone();
        tokio::task::spawn_blocking(move || artifact.persist_to(&moved_to))
            .await
            .map_err(|e| BackendError::Persist {
                name: name.to_string(),
                reason: format!("move task failed: {}", e),
            })?
            .map_err(|e| BackendError::Persist {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        info!(path = %target.display(), "Moved snapshot into place");
        Ok(())
    }

    async fn list_older_than(&self, max_age: Duration) -> Result<Vec<StoredArtifact>, BackendError> {
        let mut entries = fs::read_dir(&self.config.destination)
            .await
            .map_err(|e| BackendError::List(format!("Failed to read {}: {}", self.config.destination.display(), e)))?;

        let now = self.clock.now();
        let mut expired = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| BackendError::List(format!("Failed to read directory entry: {}", e)))?
        {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if let Some(prefix) = &self.config.name_prefix {
                if !file_name.starts_with(prefix.as_str()) {
                    continue;
                }
            }

            let metadata = match entry.metadata().await {
                Ok(metadata) if metadata.is_file() => metadata,
                Ok(_) => continue,
                Err(err) => {
                    warn!(backend = %self.name, file = %file_name, error = %err, "Skipping unreadable entry");
                    continue;
                }
            };
            let Some(last_modified) = Self::modified_at(&metadata) else {
                continue;
            };

            if is_older_than(age_of(last_modified, now), max_age) {
                expired.push(StoredArtifact {
                    id: file_name,
                    last_modified,
                });
            }
        }

        expired.sort_by(|a, b| a.last_modified.cmp(&b.last_modified));
        Ok(expired)
    }

    async fn delete(&self, id: &str) -> Result<(), BackendError> {
        fs::remove_file(self.target(id))
            .await
            .map_err(|e| BackendError::Delete {
                id: id.to_string(),
                reason: e.to_string(),
            })
    }
}

impl std::fmt::Debug for LocalFilesystemBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalFilesystemBackend")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use pretty_assertions::assert_eq;

    fn artifact_in(dir: &Path) -> ArtifactHandle {
        ArtifactHandle::materialize(dir, b"snapshot-bytes", 100).unwrap()
    }

    #[tokio::test]
    async fn test_persist_copies_and_leaves_source() {
        let scratch = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let backend = LocalFilesystemBackend::new(LocalOutputConfig::new(dest.path()), Arc::new(ManualClock::starting_now()));
        let artifact = artifact_in(scratch.path());

        backend.persist(&artifact, "snap-1.snap").await.unwrap();

        assert!(artifact.path().exists());
        assert_eq!(std::fs::read(dest.path().join("snap-1.snap")).unwrap(), b"snapshot-bytes");
        assert!(!dest.path().join(".snap-1.snap.partial").exists());
    }

    #[tokio::test]
    async fn test_failed_copy_leaves_nothing_under_final_name() {
        let scratch = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let backend = LocalFilesystemBackend::new(LocalOutputConfig::new(dest.path()), Arc::new(ManualClock::starting_now()));
        let artifact = artifact_in(scratch.path());
        std::fs::remove_file(artifact.path()).unwrap();

        let err = backend.persist(&artifact, "snap-2.snap").await.unwrap_err();

        assert!(matches!(err, BackendError::Persist { .. }));
        assert_eq!(std::fs::read_dir(dest.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_failed_rename_removes_partial_copy() {
        let scratch = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let blocker = dest.path().join("snap-3.snap");
        std::fs::create_dir(&blocker).unwrap();
        std::fs::write(blocker.join("occupied"), b"x").unwrap();
        let backend = LocalFilesystemBackend::new(LocalOutputConfig::new(dest.path()), Arc::new(ManualClock::starting_now()));
        let artifact = artifact_in(scratch.path());

        assert!(backend.persist(&artifact, "snap-3.snap").await.is_err());

        assert!(blocker.is_dir());
        assert!(!dest.path().join(".snap-3.snap.partial").exists());
        assert!(artifact.path().exists());
    }

    #[tokio::test]
    async fn test_missing_destination_is_reported() {
        let scratch = tempfile::tempdir().unwrap();
        let missing = scratch.path().join("nope");
        let backend = LocalFilesystemBackend::new(LocalOutputConfig::new(&missing), Arc::new(ManualClock::starting_now()));
        let artifact = artifact_in(scratch.path());

        let err = backend.persist(&artifact, "snap.snap").await.unwrap_err();

        assert!(matches!(err, BackendError::DestinationMissing(ref p) if p == &missing));
    }

    #[tokio::test]
    async fn test_destination_is_created_when_enabled() {
        let scratch = tempfile::tempdir().unwrap();
        let nested = scratch.path().join("a").join("b");
        let backend = LocalFilesystemBackend::new(
            LocalOutputConfig::new(&nested).create_destination(true),
            Arc::new(ManualClock::starting_now()),
        );
        let artifact = artifact_in(scratch.path());

        backend.persist(&artifact, "snap.snap").await.unwrap();

        assert!(nested.join("snap.snap").is_file());
    }

    #[tokio::test]
    async fn test_owned_persist_moves_artifact() {
        let scratch = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let backend = LocalFilesystemBackend::new(
            LocalOutputConfig::new(dest.path()).take_ownership(true),
            Arc::new(ManualClock::starting_now()),
        );
        let artifact = artifact_in(scratch.path());
        let source = artifact.path().to_path_buf();

        assert!(backend.takes_ownership());
        backend.persist_owned(artifact, "snap.snap").await.unwrap();

        assert!(!source.exists());
        assert!(dest.path().join("snap.snap").is_file());
    }

    #[tokio::test]
    async fn test_listing_uses_clock_and_prefix() {
        let dest = tempfile::tempdir().unwrap();
        std::fs::write(dest.path().join("consul-snapshot-1.snap"), b"a").unwrap();
        std::fs::write(dest.path().join("unrelated.txt"), b"b").unwrap();
        std::fs::create_dir(dest.path().join("consul-snapshot-dir")).unwrap();

        let clock = Arc::new(ManualClock::starting_now());
        let backend = LocalFilesystemBackend::new(
            LocalOutputConfig::new(dest.path()).name_prefix("consul-snapshot-"),
            clock.clone(),
        );

        assert!(backend.list_older_than(Duration::from_secs(3600)).await.unwrap().is_empty());

        clock.advance(Duration::from_secs(7200));
        let expired = backend.list_older_than(Duration::from_secs(3600)).await.unwrap();
        let ids: Vec<&str> = expired.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["consul-snapshot-1.snap"]);

        backend.delete("consul-snapshot-1.snap").await.unwrap();
        assert!(backend.delete("consul-snapshot-1.snap").await.is_err());
    }
}
