//! Process configuration
//!
//! [`AppConfig`] is read once at start-up from an optional YAML file, then
//! selectively overridden by command-line flags and validated. It is never
//! mutated afterwards: constructors borrow it to build the lease, the
//! snapshot source and the backends.

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use thiserror::Error;
use tracing::info;

use crate::clock::Clock;
use crate::consul::{ConsulCoordinator, ConsulEndpoint, ConsulSnapshotClient};
use crate::lease::{Lease, DEFAULT_MAX_CONSECUTIVE_RENEWAL_FAILURES};
use crate::orchestrator::{ArtifactNaming, BackupOrchestrator};
use crate::output::local::{LocalFilesystemBackend, LocalOutputConfig};
use crate::output::object_store::{
    Credentials, ObjectStorageBackend, ObjectStorageConfig, DEFAULT_BLOCK_SIZE, DEFAULT_PARALLELISM,
};
use crate::output::{BackendError, OutputBackend};
use crate::retention::RetentionPolicy;
use crate::snapshot::SnapshotSource;

/// Shortest session TTL the coordination service accepts
pub const MIN_LOCK_TTL: Duration = Duration::from_secs(10);

/// Longest session TTL the coordination service accepts
pub const MAX_LOCK_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Configuration errors, all raised before any lease is attempted
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Could not create client: {0}")]
    Client(String),
}

/// Destinations the binary knows how to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum OutputKind {
    Local,
    ObjectStorage,
}

impl OutputKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputKind::Local => "local",
            OutputKind::ObjectStorage => "object-storage",
        }
    }
}

/// Top-level configuration
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AppConfig {
    /// Time between scheduled runs
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "interval-secs")]
    pub interval: Duration,
    pub filename_prefix: String,
    pub file_extension: String,
    /// Where captured snapshots are staged; the system temp dir when unset
    pub temp_dir: Option<PathBuf>,
    /// Reading backends dispatched at once; the CPU count when unset
    pub dispatch_concurrency: Option<usize>,
    pub outputs: Vec<OutputKind>,
    pub consul: ConsulConfig,
    pub local: LocalConfig,
    pub object_storage: ObjectStorageSection,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            filename_prefix: "consul-snapshot-".to_string(),
            file_extension: ".snap".to_string(),
            temp_dir: None,
            dispatch_concurrency: None,
            outputs: vec![OutputKind::Local],
            consul: ConsulConfig::default(),
            local: LocalConfig::default(),
            object_storage: ObjectStorageSection::default(),
        }
    }
}

/// Coordination service and lock settings
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ConsulConfig {
    pub url: String,
    pub token: Option<String>,
    pub lock_key: String,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "lock-timeout-secs")]
    pub lock_timeout: Duration,
    /// Renewal period; half the lock timeout when unset
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    #[serde(rename = "renew-interval-secs")]
    pub renew_interval: Option<Duration>,
    /// Consecutive renewal failures before the lease is considered lost (0 = never)
    pub max_renewal_failures: u32,
    /// Let any server, not only the leader, answer snapshot requests
    pub stale: bool,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8500".to_string(),
            token: None,
            lock_key: "consul-snapshot/.lock".to_string(),
            lock_timeout: Duration::from_secs(10 * 60),
            renew_interval: None,
            max_renewal_failures: DEFAULT_MAX_CONSECUTIVE_RENEWAL_FAILURES,
            stale: false,
        }
    }
}

/// Local filesystem output
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LocalConfig {
    pub destination_path: PathBuf,
    pub create_destination: bool,
    /// Move the staged snapshot instead of copying it
    pub take_ownership: bool,
    /// Delete local snapshots older than this; 0 keeps them forever
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "retention-secs")]
    pub retention: Duration,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            destination_path: PathBuf::from("."),
            create_destination: false,
            take_ownership: false,
            retention: Duration::ZERO,
        }
    }
}

/// S3-compatible object storage output
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ObjectStorageSection {
    pub bucket: String,
    /// Path inside the bucket
    pub path: String,
    pub create_bucket: bool,
    pub block_size: usize,
    pub parallelism: usize,
    pub region: String,
    pub endpoint_url: Option<String>,
    pub force_path_style: bool,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Selects delegation-token authentication when present
    pub session_token: Option<String>,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "retention-secs")]
    pub retention: Duration,
}

impl Default for ObjectStorageSection {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            path: String::new(),
            create_bucket: false,
            block_size: DEFAULT_BLOCK_SIZE,
            parallelism: DEFAULT_PARALLELISM,
            region: "us-east-1".to_string(),
            endpoint_url: None,
            force_path_style: false,
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            retention: Duration::ZERO,
        }
    }
}

impl ObjectStorageSection {
    pub fn credentials(&self) -> Result<Credentials, BackendError> {
        Credentials::resolve(
            self.access_key_id.clone(),
            self.secret_access_key.clone(),
            self.session_token.clone(),
        )
    }
}

/// Read a YAML configuration file; missing keys take their defaults
pub fn load<P: AsRef<Path>>(path: P) -> Result<AppConfig, ConfigError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_reader(file).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

impl AppConfig {
    /// Parse configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })
    }

    pub fn naming(&self) -> ArtifactNaming {
        ArtifactNaming::new(&self.filename_prefix, &self.file_extension)
    }

    /// Check every constraint that can be checked without network access
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.interval.is_zero() {
            return invalid("interval must be positive".to_string());
        }
        if self.consul.lock_key.trim().is_empty() {
            return invalid("lock key must not be empty".to_string());
        }
        if self.consul.lock_timeout < MIN_LOCK_TTL || self.consul.lock_timeout > MAX_LOCK_TTL {
            return invalid(format!(
                "lock timeout {:?} is outside {:?}..={:?}",
                self.consul.lock_timeout, MIN_LOCK_TTL, MAX_LOCK_TTL
            ));
        }
        if let Some(renew) = self.consul.renew_interval {
            if renew.is_zero() || renew >= self.consul.lock_timeout {
                return invalid("renew interval must be positive and shorter than the lock timeout".to_string());
            }
        }
        if self.outputs.is_empty() {
            return invalid("at least one output is required".to_string());
        }

        let mut seen = HashSet::new();
        for output in &self.outputs {
            if !seen.insert(*output) {
                return invalid(format!("output {} is listed twice", output.as_str()));
            }
        }

        let owners = self
            .outputs
            .iter()
            .filter(|output| matches!(output, OutputKind::Local) && self.local.take_ownership)
            .count();
        if owners > 1 {
            return invalid("at most one output may take ownership of the snapshot".to_string());
        }

        if self.outputs.contains(&OutputKind::ObjectStorage) {
            let section = &self.object_storage;
            if section.bucket.trim().is_empty() {
                return invalid("object storage requires a bucket".to_string());
            }
            if section.block_size == 0 || section.parallelism == 0 {
                return invalid("object storage block size and parallelism must be positive".to_string());
            }
            section.credentials()?;
            if !cfg!(feature = "s3") {
                return invalid("object storage output requires the `s3` feature".to_string());
            }
        }

        Ok(())
    }

    fn local_backend(&self, clock: Arc<dyn Clock>) -> LocalFilesystemBackend {
        let config = LocalOutputConfig::new(&self.local.destination_path)
            .create_destination(self.local.create_destination)
            .take_ownership(self.local.take_ownership)
            .name_prefix(&self.filename_prefix)
            .retention(RetentionPolicy::max_age(self.local.retention));
        LocalFilesystemBackend::new(config, clock)
    }

    fn object_storage_config(&self) -> Result<ObjectStorageConfig, ConfigError> {
        let section = &self.object_storage;
        Ok(ObjectStorageConfig::new(&section.bucket)
            .path(&section.path)
            .create_container(section.create_bucket)
            .block_size(section.block_size)
            .parallelism(section.parallelism)
            .name_prefix(&self.filename_prefix)
            .credentials(section.credentials()?)
            .retention(RetentionPolicy::max_age(section.retention)))
    }

    /// Build every configured backend
    pub async fn build_backends(&self, clock: Arc<dyn Clock>) -> Result<Vec<Arc<dyn OutputBackend>>, ConfigError> {
        let mut backends: Vec<Arc<dyn OutputBackend>> = Vec::with_capacity(self.outputs.len());
        for output in &self.outputs {
            match output {
                OutputKind::Local => backends.push(Arc::new(self.local_backend(clock.clone()))),
                OutputKind::ObjectStorage => {
                    let config = self.object_storage_config()?;
                    backends.push(self.object_storage_backend(config, clock.clone()).await?);
                }
            }
        }
        Ok(backends)
    }

    #[cfg(feature = "s3")]
    async fn object_storage_backend(
        &self,
        config: ObjectStorageConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<dyn OutputBackend>, ConfigError> {
        use crate::output::s3::{S3ObjectClient, S3Settings};

        let section = &self.object_storage;
        let settings = S3Settings {
            region: section.region.clone(),
            endpoint_url: section.endpoint_url.clone(),
            force_path_style: section.force_path_style,
        };
        let credentials = config
            .credentials
            .clone()
            .ok_or_else(|| BackendError::MissingCredentials("object storage".to_string()))?;
        let client = S3ObjectClient::connect(&credentials, &settings).await;
        let backend = ObjectStorageBackend::new(config, Arc::new(client), clock)?;
        Ok(Arc::new(backend))
    }

    #[cfg(not(feature = "s3"))]
    async fn object_storage_backend(
        &self,
        _config: ObjectStorageConfig,
        _clock: Arc<dyn Clock>,
    ) -> Result<Arc<dyn OutputBackend>, ConfigError> {
        Err(ConfigError::Invalid(
            "object storage output requires the `s3` feature".to_string(),
        ))
    }

    /// Validate and assemble an orchestrator talking to the configured Consul agent
    pub async fn build_orchestrator(&self, clock: Arc<dyn Clock>) -> Result<BackupOrchestrator, ConfigError> {
        self.validate()?;

        let endpoint = ConsulEndpoint::new(&self.consul.url, self.consul.token.clone())
            .map_err(|e| ConfigError::Client(e.to_string()))?;
        let coordinator = Arc::new(ConsulCoordinator::new(endpoint.clone()));
        let snapshots = Arc::new(ConsulSnapshotClient::new(endpoint).allow_stale(self.consul.stale));

        let mut lease = Lease::new(coordinator, &self.consul.lock_key, self.consul.lock_timeout)
            .with_max_consecutive_failures(self.consul.max_renewal_failures);
        if let Some(renew) = self.consul.renew_interval {
            lease = lease.with_renew_interval(renew);
        }

        let mut source = SnapshotSource::new(snapshots);
        if let Some(dir) = &self.temp_dir {
            source = source.with_temp_dir(dir);
        }

        let backends = self.build_backends(clock.clone()).await?;
        let mut builder = BackupOrchestrator::builder(lease, source)
            .backends(backends)
            .naming(self.naming())
            .clock(clock);
        if let Some(limit) = self.dispatch_concurrency {
            builder = builder.dispatch_concurrency(limit);
        }

        let orchestrator = builder.build()?;
        info!(
            consul = %self.consul.url,
            lock_key = %self.consul.lock_key,
            outputs = ?self.outputs,
            "Configured backup orchestrator"
        );
        Ok(orchestrator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = AppConfig::default();

        assert_eq!(config.interval, Duration::from_secs(3600));
        assert_eq!(config.filename_prefix, "consul-snapshot-");
        assert_eq!(config.file_extension, ".snap");
        assert_eq!(config.consul.url, "http://127.0.0.1:8500");
        assert_eq!(config.consul.lock_key, "consul-snapshot/.lock");
        assert_eq!(config.consul.lock_timeout, Duration::from_secs(600));
        assert_eq!(config.outputs, vec![OutputKind::Local]);
        assert_eq!(config.local.destination_path, PathBuf::from("."));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = AppConfig::from_yaml(
            r#"
interval-secs: 900
outputs: [local, object-storage]
consul:
  lock-key: team/.lock
local:
  destination-path: /var/backups
  retention-secs: 86400
object-storage:
  bucket: snapshots
  access-key-id: AKIA
  secret-access-key: secret
"#,
        )
        .unwrap();

        assert_eq!(config.interval, Duration::from_secs(900));
        assert_eq!(config.outputs, vec![OutputKind::Local, OutputKind::ObjectStorage]);
        assert_eq!(config.consul.lock_key, "team/.lock");
        assert_eq!(config.consul.lock_timeout, Duration::from_secs(600));
        assert_eq!(config.local.retention, Duration::from_secs(86400));
        assert_eq!(config.object_storage.credentials().unwrap().mode(), "shared-key");
    }

    #[test]
    fn test_unknown_output_is_rejected() {
        let err = AppConfig::from_yaml("outputs: [tape]").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = AppConfig::default();
        config.consul.lock_key = "  ".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = AppConfig::default();
        config.consul.lock_timeout = Duration::from_secs(5);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = AppConfig::default();
        config.consul.lock_timeout = Duration::ZERO;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = AppConfig::default();
        config.outputs = vec![OutputKind::Local, OutputKind::Local];
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = AppConfig::default();
        config.outputs = vec![OutputKind::ObjectStorage];
        config.object_storage.bucket = "snapshots".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Backend(BackendError::MissingCredentials(_)))
        ));
    }

    #[test]
    fn test_load_reports_missing_file() {
        let err = load("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[tokio::test]
    async fn test_local_backend_is_built_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.local.destination_path = dir.path().to_path_buf();
        config.local.retention = Duration::from_secs(3600);

        let backends = config.build_backends(Arc::new(ManualClock::starting_now())).await.unwrap();

        assert_eq!(backends.len(), 1);
        assert_eq!(backends[0].name(), "local");
        assert_eq!(backends[0].retention().threshold(), Some(Duration::from_secs(3600)));
    }
}
