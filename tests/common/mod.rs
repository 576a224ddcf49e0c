#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use snapcoord::clock::{age_of, Clock, SystemClock};
use snapcoord::lease::memory::InMemoryCoordinator;
use snapcoord::lease::Lease;
use snapcoord::output::{BackendError, OutputBackend, StoredArtifact};
use snapcoord::retention::{is_older_than, RetentionPolicy};
use snapcoord::snapshot::memory::StaticSnapshotClient;
use snapcoord::snapshot::{
    ArchiveBuilder, ArtifactHandle, CaptureError, SnapshotClient, SnapshotSource, SnapshotStream,
};

pub const LOCK_KEY: &str = "consul-snapshot/.lock";

/// A valid snapshot archive tagged with `index`
pub fn snapshot_payload(index: u64) -> Vec<u8> {
    ArchiveBuilder::new()
        .member("meta.json", format!(r#"{{"Index":{},"Term":2}}"#, index).into_bytes())
        .member("state.bin", vec![0x5a; 32 * 1024])
        .finish()
        .unwrap()
}

pub fn lease_on(coordinator: &Arc<InMemoryCoordinator>) -> Lease {
    Lease::new(coordinator.clone(), LOCK_KEY, Duration::from_secs(30))
}

pub fn source_of(client: Arc<dyn SnapshotClient>, temp_dir: &std::path::Path) -> SnapshotSource {
    SnapshotSource::new(client).with_temp_dir(temp_dir)
}

pub fn static_client(index: u64) -> Arc<StaticSnapshotClient> {
    Arc::new(StaticSnapshotClient::new(snapshot_payload(index), index))
}

/// Wraps a snapshot client and waits before every request
#[derive(Debug)]
pub struct SlowSnapshotClient {
    inner: Arc<StaticSnapshotClient>,
    delay: Duration,
}

impl SlowSnapshotClient {
    pub fn new(inner: Arc<StaticSnapshotClient>, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl SnapshotClient for SlowSnapshotClient {
    async fn take_snapshot(&self) -> Result<SnapshotStream, CaptureError> {
        tokio::time::sleep(self.delay).await;
        self.inner.take_snapshot().await
    }
}

/// One observed backend call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub backend: String,
    pub kind: &'static str,
    /// Temporary artifact path as seen by the backend
    pub path: PathBuf,
    /// Whether the artifact file existed when the backend looked
    pub existed: bool,
    pub started: Instant,
    pub finished: Instant,
}

pub type Journal = Arc<Mutex<Vec<Call>>>;

pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

/// Backend that records its calls and keeps stored names in memory
pub struct RecordingBackend {
    name: String,
    journal: Journal,
    delay: Duration,
    fail: bool,
    owner: bool,
    retention: RetentionPolicy,
    clock: Arc<dyn Clock>,
    stored: Mutex<Vec<StoredArtifact>>,
    active: Option<Arc<Concurrency>>,
}

impl RecordingBackend {
    pub fn new(name: &str, journal: &Journal) -> Self {
        Self {
            name: name.to_string(),
            journal: journal.clone(),
            delay: Duration::ZERO,
            fail: false,
            owner: false,
            retention: RetentionPolicy::retain_forever(),
            clock: Arc::new(SystemClock),
            stored: Mutex::new(Vec::new()),
            active: None,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn owning(mut self) -> Self {
        self.owner = true;
        self
    }

    pub fn tracking(mut self, active: &Arc<Concurrency>) -> Self {
        self.active = Some(active.clone());
        self
    }

    pub fn stored(&self) -> Vec<String> {
        self.stored.lock().iter().map(|a| a.id.clone()).collect()
    }

    async fn record(&self, kind: &'static str, artifact: &ArtifactHandle, name: &str) -> Result<(), BackendError> {
        let _active = self.active.as_ref().map(|a| a.enter());
        let path = artifact.path().to_path_buf();
        let started = Instant::now();
        let existed = path.exists();
        tokio::time::sleep(self.delay).await;
        let existed = existed && path.exists();
        self.journal.lock().push(Call {
            backend: self.name.clone(),
            kind,
            path,
            existed,
            started,
            finished: Instant::now(),
        });

        if self.fail {
            return Err(BackendError::Persist {
                name: name.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        self.stored.lock().push(StoredArtifact {
            id: name.to_string(),
            last_modified: self.clock.now(),
        });
        Ok(())
    }
}

#[async_trait]
impl OutputBackend for RecordingBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn retention(&self) -> &RetentionPolicy {
        &self.retention
    }

    fn takes_ownership(&self) -> bool {
        self.owner
    }

    async fn persist(&self, artifact: &ArtifactHandle, name: &str) -> Result<(), BackendError> {
        self.record("persist", artifact, name).await
    }

    async fn persist_owned(&self, artifact: ArtifactHandle, name: &str) -> Result<(), BackendError> {
        let result = self.record("persist_owned", &artifact, name).await;
        artifact.discard().map_err(|e| BackendError::Persist {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        result
    }

    async fn list_older_than(&self, max_age: Duration) -> Result<Vec<StoredArtifact>, BackendError> {
        let now = self.clock.now();
        Ok(self
            .stored
            .lock()
            .iter()
            .filter(|a| is_older_than(age_of(a.last_modified, now), max_age))
            .cloned()
            .collect())
    }

    async fn delete(&self, id: &str) -> Result<(), BackendError> {
        self.stored.lock().retain(|a| a.id != id);
        Ok(())
    }
}

/// Tracks how many holders are active at once and the peak seen
#[derive(Debug, Default)]
pub struct Concurrency {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Concurrency {
    pub fn enter(self: &Arc<Self>) -> ConcurrencyGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        ConcurrencyGuard(self.clone())
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub struct ConcurrencyGuard(Arc<Concurrency>);

/// Poll until a tracked backend is inside `persist`
pub async fn wait_until_active(active: &Concurrency) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while active.current() == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("backend never started");
}

impl Drop for ConcurrencyGuard {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}
