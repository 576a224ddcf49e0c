// Object storage output - blocked uploads into a container with paged listing

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument};

use super::{BackendError, OutputBackend, StoredArtifact};
use crate::clock::{age_of, Clock};
use crate::retention::{is_older_than, RetentionPolicy};
use crate::snapshot::ArtifactHandle;

/// Default upload block size (4 MiB)
pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Default number of blocks in flight
pub const DEFAULT_PARALLELISM: usize = 4;

/// Failures reported by an object storage service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ObjectStoreError {
    #[error("container already exists")]
    AlreadyExists,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Service(String),
}

/// Authentication for an object storage account
///
/// A shared key is a long-lived access key id and secret. A delegation
/// token adds a session token issued by a token service. Exactly one mode
/// is selected; the session token's presence selects delegation.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum Credentials {
    SharedKey {
        access_key_id: String,
        secret_access_key: String,
    },
    DelegationToken {
        access_key_id: String,
        secret_access_key: String,
        session_token: String,
    },
}

impl Credentials {
    pub fn shared_key(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Credentials::SharedKey {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
        }
    }

    /// Pick the authentication mode from whichever values are present
    pub fn resolve(
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        session_token: Option<String>,
    ) -> Result<Self, BackendError> {
        let present = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        let access_key_id = present(access_key_id)
            .ok_or_else(|| BackendError::MissingCredentials("no access key id configured".to_string()))?;
        let secret_access_key = present(secret_access_key).ok_or_else(|| {
            BackendError::MissingCredentials("neither a shared key nor a delegation token is configured".to_string())
        })?;

        Ok(match present(session_token) {
            Some(session_token) => Credentials::DelegationToken {
                access_key_id,
                secret_access_key,
                session_token,
            },
            None => Credentials::SharedKey {
                access_key_id,
                secret_access_key,
            },
        })
    }

    pub fn access_key_id(&self) -> &str {
        match self {
            Credentials::SharedKey { access_key_id, .. } | Credentials::DelegationToken { access_key_id, .. } => {
                access_key_id
            }
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Credentials::SharedKey { .. } => "shared-key",
            Credentials::DelegationToken { .. } => "delegation-token",
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("mode", &self.mode())
            .field("access_key_id", &self.access_key_id())
            .finish_non_exhaustive()
    }
}

/// Tuning for blocked uploads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadOptions {
    pub block_size: usize,
    pub parallelism: usize,
}

/// One page of a flat listing
#[derive(Debug, Clone, Default)]
pub struct ObjectPage {
    pub objects: Vec<StoredArtifact>,
    /// Continuation marker; `None` on the last page
    pub next_marker: Option<String>,
}

/// Primitive operations of an object storage service
#[async_trait]
pub trait ObjectStorageClient: Send + Sync {
    /// Create `container`; an existing container yields [`ObjectStoreError::AlreadyExists`]
    async fn create_container(&self, container: &str) -> Result<(), ObjectStoreError>;

    /// Upload the file at `source` as `key` in blocks
    async fn upload(&self, container: &str, key: &str, source: &Path, options: UploadOptions) -> Result<(), ObjectStoreError>;

    /// List objects under `prefix` starting after `marker`
    async fn list_page(&self, container: &str, prefix: &str, marker: Option<String>) -> Result<ObjectPage, ObjectStoreError>;

    async fn delete(&self, container: &str, key: &str) -> Result<(), ObjectStoreError>;
}

/// Settings for an [`ObjectStorageBackend`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStorageConfig {
    pub container: String,
    /// Path inside the container; artifacts are stored as `<path>/<name>`
    pub path: String,
    pub create_container: bool,
    pub block_size: usize,
    pub parallelism: usize,
    /// Only objects whose name starts with this prefix are considered for retention
    pub name_prefix: Option<String>,
    pub credentials: Option<Credentials>,
    pub retention: RetentionPolicy,
}

impl ObjectStorageConfig {
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            path: String::new(),
            create_container: false,
            block_size: DEFAULT_BLOCK_SIZE,
            parallelism: DEFAULT_PARALLELISM,
            name_prefix: None,
            credentials: None,
            retention: RetentionPolicy::retain_forever(),
        }
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn create_container(mut self, create: bool) -> Self {
        self.create_container = create;
        self
    }

    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = Some(prefix.into());
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Object key for an artifact called `name`
    pub fn key_for(&self, name: &str) -> String {
        let path = self.path.trim_matches('/');
        if path.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", path, name)
        }
    }

    fn listing_prefix(&self) -> String {
        self.key_for(self.name_prefix.as_deref().unwrap_or(""))
    }
}

/// Stores artifacts as objects in one container
pub struct ObjectStorageBackend {
    name: String,
    config: ObjectStorageConfig,
    client: Arc<dyn ObjectStorageClient>,
    clock: Arc<dyn Clock>,
}

impl ObjectStorageBackend {
    /// Fails with `MissingCredentials` when the configuration carries none
    pub fn new(
        config: ObjectStorageConfig,
        client: Arc<dyn ObjectStorageClient>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, BackendError> {
        let credentials = config.credentials.as_ref().ok_or_else(|| {
            BackendError::MissingCredentials(format!("container {} has no credentials", config.container))
        })?;
        debug!(container = %config.container, mode = credentials.mode(), "Object storage backend configured");

        Ok(Self {
            name: "object-store".to_string(),
            config,
            client,
            clock,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn config(&self) -> &ObjectStorageConfig {
        &self.config
    }

    async fn ensure_container(&self) -> Result<(), BackendError> {
        match self.client.create_container(&self.config.container).await {
            Ok(()) => {
                info!(backend = %self.name, container = %self.config.container, "Created container");
                Ok(())
            }
            Err(ObjectStoreError::AlreadyExists) => Ok(()),
            Err(err) => Err(BackendError::Container {
                container: self.config.container.clone(),
                reason: err.to_string(),
            }),
        }
    }
}

#[async_trait]
impl OutputBackend for ObjectStorageBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn retention(&self) -> &RetentionPolicy {
        &self.config.retention
    }

    #[instrument(skip(self, artifact), fields(backend = %self.name, container = %self.config.container))]
    async fn persist(&self, artifact: &ArtifactHandle, name: &str) -> Result<(), BackendError> {
        if self.config.create_container {
            self.ensure_container().await?;
        }

        let key = self.config.key_for(name);
        let options = UploadOptions {
            block_size: self.config.block_size,
            parallelism: self.config.parallelism,
        };
        self.client
            .upload(&self.config.container, &key, artifact.path(), options)
            .await
            .map_err(|e| BackendError::Persist {
                name: key.clone(),
                reason: e.to_string(),
            })?;

        info!(key = %key, size = artifact.size(), "Uploaded snapshot");
        Ok(())
    }

    async fn list_older_than(&self, max_age: Duration) -> Result<Vec<StoredArtifact>, BackendError> {
        let prefix = self.config.listing_prefix();
        let now = self.clock.now();
        let mut expired = Vec::new();
        let mut marker = None;

        loop {
            let page = self
                .client
                .list_page(&self.config.container, &prefix, marker)
                .await
                .map_err(|e| BackendError::List(e.to_string()))?;

            expired.extend(
                page.objects
                    .into_iter()
                    .filter(|object| is_older_than(age_of(object.last_modified, now), max_age)),
            );

            match page.next_marker {
                Some(next) => marker = Some(next),
                None => break,
            }
        }

        Ok(expired)
    }

    async fn delete(&self, id: &str) -> Result<(), BackendError> {
        self.client
            .delete(&self.config.container, id)
            .await
            .map_err(|e| BackendError::Delete {
                id: id.to_string(),
                reason: e.to_string(),
            })
    }
}

impl fmt::Debug for ObjectStorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStorageBackend")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    blocks: usize,
    last_modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct StoreState {
    containers: HashMap<String, BTreeMap<String, StoredObject>>,
    failing_uploads: HashSet<String>,
    failing_deletes: HashSet<String>,
    list_calls: usize,
}

/// Object store held in memory, with timestamps taken from a [`Clock`]
pub struct InMemoryObjectStore {
    state: Mutex<StoreState>,
    clock: Arc<dyn Clock>,
    page_size: usize,
}

impl InMemoryObjectStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            clock,
            page_size: 1000,
        }
    }

    /// Objects returned per listing page
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Insert an object directly, bypassing upload
    pub fn put(&self, container: &str, key: &str, data: impl Into<Bytes>, last_modified: DateTime<Utc>) {
        self.state
            .lock()
            .containers
            .entry(container.to_string())
            .or_default()
            .insert(
                key.to_string(),
                StoredObject {
                    data: data.into(),
                    blocks: 1,
                    last_modified,
                },
            );
    }

    pub fn get(&self, container: &str, key: &str) -> Option<Bytes> {
        let state = self.state.lock();
        state.containers.get(container)?.get(key).map(|o| o.data.clone())
    }

    /// Number of blocks the object was uploaded in
    pub fn blocks(&self, container: &str, key: &str) -> Option<usize> {
        let state = self.state.lock();
        state.containers.get(container)?.get(key).map(|o| o.blocks)
    }

    pub fn keys(&self, container: &str) -> Vec<String> {
        let state = self.state.lock();
        state
            .containers
            .get(container)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn container_exists(&self, container: &str) -> bool {
        self.state.lock().containers.contains_key(container)
    }

    /// Reject uploads to `key`
    pub fn fail_uploads_to(&self, key: &str) {
        self.state.lock().failing_uploads.insert(key.to_string());
    }

    /// Reject deletes of `key`
    pub fn fail_deletes_of(&self, key: &str) {
        self.state.lock().failing_deletes.insert(key.to_string());
    }

    /// Listing pages served so far
    pub fn list_calls(&self) -> usize {
        self.state.lock().list_calls
    }
}

#[async_trait]
impl ObjectStorageClient for InMemoryObjectStore {
    async fn create_container(&self, container: &str) -> Result<(), ObjectStoreError> {
        let mut state = self.state.lock();
        if state.containers.contains_key(container) {
            return Err(ObjectStoreError::AlreadyExists);
        }
        state.containers.insert(container.to_string(), BTreeMap::new());
        Ok(())
    }

    async fn upload(&self, container: &str, key: &str, source: &Path, options: UploadOptions) -> Result<(), ObjectStoreError> {
        let data = tokio::fs::read(source)
            .await
            .map_err(|e| ObjectStoreError::Service(format!("read {}: {}", source.display(), e)))?;
        let blocks = data.len().div_ceil(options.block_size.max(1)).max(1);

        let mut state = self.state.lock();
        if state.failing_uploads.contains(key) {
            return Err(ObjectStoreError::Service(format!("upload of {} rejected", key)));
        }
        let now = self.clock.now();
        let objects = state
            .containers
            .get_mut(container)
            .ok_or_else(|| ObjectStoreError::NotFound(container.to_string()))?;
        objects.insert(
            key.to_string(),
            StoredObject {
                data: Bytes::from(data),
                blocks,
                last_modified: now,
            },
        );
        Ok(())
    }

    async fn list_page(&self, container: &str, prefix: &str, marker: Option<String>) -> Result<ObjectPage, ObjectStoreError> {
        let mut state = self.state.lock();
        state.list_calls += 1;
        let objects = state
            .containers
            .get(container)
            .ok_or_else(|| ObjectStoreError::NotFound(container.to_string()))?;

        let mut page: Vec<StoredArtifact> = objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .filter(|(key, _)| marker.as_ref().map_or(true, |m| key.as_str() > m.as_str()))
            .take(self.page_size + 1)
            .map(|(key, object)| StoredArtifact {
                id: key.clone(),
                last_modified: object.last_modified,
            })
            .collect();

        let next_marker = if page.len() > self.page_size {
            page.truncate(self.page_size);
            page.last().map(|a| a.id.clone())
        } else {
            None
        };

        Ok(ObjectPage {
            objects: page,
            next_marker,
        })
    }

    async fn delete(&self, container: &str, key: &str) -> Result<(), ObjectStoreError> {
        let mut state = self.state.lock();
        if state.failing_deletes.contains(key) {
            return Err(ObjectStoreError::Service(format!("delete of {} rejected", key)));
        }
        state
            .containers
            .get_mut(container)
            .and_then(|objects| objects.remove(key))
            .map(|_| ())
            .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))
    }
}

impl fmt::Debug for InMemoryObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryObjectStore")
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}
