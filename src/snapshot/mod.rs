//! Snapshot capture
//!
//! [`SnapshotSource::capture`] requests a streamed snapshot from the state
//! store and tees every chunk into two consumers at once: a private temporary
//! file and an integrity verifier running on a blocking thread. The payload
//! is never held in memory as a whole. If verification or the write fails,
//! the partial file is removed and no [`ArtifactHandle`] is produced.

pub mod archive;
pub mod memory;

use std::fmt;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use futures::stream::BoxStream;
use futures::StreamExt;
use tempfile::TempPath;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument};

pub use archive::{ArchiveBuilder, ArchiveVerifier, SnapshotVerifier, VerifiedArchive};

/// Chunks buffered between the download and the verifier
const DEFAULT_TEE_DEPTH: usize = 16;

/// Errors raised while capturing a snapshot
#[derive(Error, Debug)]
pub enum CaptureError {
    /// The state store refused or failed the snapshot request
    #[error("Error requesting the snapshot: {0}")]
    Request(String),

    /// The snapshot stream broke mid-transfer
    #[error("Snapshot stream interrupted: {0}")]
    Stream(String),

    /// Writing the temporary artifact failed
    #[error("Error writing snapshot file: {0}")]
    Io(#[from] io::Error),

    /// The payload failed its integrity check
    #[error("Error verifying snapshot: {0}")]
    Verification(String),
}

/// A snapshot in flight: consistency index plus the streamed payload
pub struct SnapshotStream {
    /// State-store version the snapshot reflects
    pub index: u64,
    /// Payload chunks
    pub body: BoxStream<'static, io::Result<Bytes>>,
}

impl fmt::Debug for SnapshotStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotStream")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

/// Client able to request a streamed snapshot from the state store
#[async_trait]
pub trait SnapshotClient: Send + Sync {
    /// Start a snapshot and return its stream
    async fn take_snapshot(&self) -> Result<SnapshotStream, CaptureError>;
}

/// Immutable captured snapshot at a private temporary location
///
/// The temporary file is removed exactly once: by [`ArtifactHandle::discard`],
/// by [`ArtifactHandle::persist_to`] moving it elsewhere, or on drop.
#[derive(Debug)]
pub struct ArtifactHandle {
    path: Option<TempPath>,
    location: PathBuf,
    index: u64,
    size: u64,
}

impl ArtifactHandle {
    fn from_temp_path(path: TempPath, index: u64, size: u64) -> Self {
        let location = path.to_path_buf();
        Self {
            path: Some(path),
            location,
            index,
            size,
        }
    }

    /// Write `payload` to a new private file in `dir` and wrap it
    pub fn materialize(dir: &Path, payload: &[u8], index: u64) -> io::Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix("snapcoord-")
            .suffix(".tmp")
            .tempfile_in(dir)?;
        io::Write::write_all(&mut file, payload)?;
        file.as_file().sync_all()?;
        Ok(Self::from_temp_path(file.into_temp_path(), index, payload.len() as u64))
    }

    /// Location of the temporary file
    pub fn path(&self) -> &Path {
        &self.location
    }

    /// Consistency index reported with the snapshot
    pub fn consistency_index(&self) -> u64 {
        self.index
    }

    /// Payload size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Delete the temporary file
    pub fn discard(mut self) -> io::Result<()> {
        match self.path.take() {
            Some(path) => path.close(),
            None => Ok(()),
        }
    }

    /// Move the temporary file to `destination`, copying when a rename is not possible
    pub fn persist_to(mut self, destination: &Path) -> io::Result<()> {
        let Some(path) = self.path.take() else {
            return Err(io::Error::new(io::ErrorKind::NotFound, "artifact already released"));
        };

        match path.persist(destination) {
            Ok(()) => Ok(()),
            Err(err) => {
                debug!(error = %err.error, "Rename failed, falling back to copy");
                std::fs::copy(&err.path, destination)?;
                err.path.close()
            }
        }
    }
}

/// Captures and verifies snapshots into temporary artifacts
pub struct SnapshotSource {
    client: Arc<dyn SnapshotClient>,
    verifier: Arc<dyn SnapshotVerifier>,
    temp_dir: PathBuf,
    tee_depth: usize,
}

impl SnapshotSource {
    /// Capture through `client`, verifying with [`ArchiveVerifier`] into the system temp dir
    pub fn new(client: Arc<dyn SnapshotClient>) -> Self {
        Self {
            client,
            verifier: Arc::new(ArchiveVerifier::new()),
            temp_dir: std::env::temp_dir(),
            tee_depth: DEFAULT_TEE_DEPTH,
        }
    }

    /// Use a different integrity check
    pub fn with_verifier(mut self, verifier: Arc<dyn SnapshotVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Materialize artifacts under `dir`
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }

    /// Directory holding temporary artifacts
    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Request a snapshot, verify it while writing it, and return the artifact
    #[instrument(skip(self), fields(temp_dir = %self.temp_dir.display()))]
    pub async fn capture(&self) -> Result<ArtifactHandle, CaptureError> {
        let SnapshotStream { index, mut body } = self.client.take_snapshot().await?;
        info!(index, "Performed snapshot");

        let temp = tempfile::Builder::new()
            .prefix("snapcoord-")
            .suffix(".tmp")
            .tempfile_in(&self.temp_dir)?;
        let (file, temp_path) = temp.into_parts();
        let mut file = tokio::fs::File::from_std(file);
        debug!(path = %temp_path.display(), "Saving snapshot to temporary file");

        let (tx, rx) = mpsc::channel::<Bytes>(self.tee_depth);
        let verifier = Arc::clone(&self.verifier);
        let verification = tokio::task::spawn_blocking(move || {
            let mut reader = ChannelReader::new(rx);
            let verdict = verifier.verify(&mut reader);
            reader.drain();
            verdict
        });

        let mut size = 0u64;
        let written: Result<(), CaptureError> = async {
            let mut verifier_open = true;
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|e| CaptureError::Stream(e.to_string()))?;
                file.write_all(&chunk).await?;
                size += chunk.len() as u64;
                if verifier_open && tx.send(chunk).await.is_err() {
                    verifier_open = false;
                }
            }
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;
        drop(tx);

        let verdict = verification
            .await
            .map_err(|e| CaptureError::Verification(format!("verifier task failed: {}", e)))?;

        if let Err(err) = written {
            error!(error = %err, "Snapshot transfer failed; discarding partial file");
            return Err(err);
        }

        match verdict {
            Ok(archive) => {
                info!(index, size, members = archive.members.len(), "Snapshot verified");
                Ok(ArtifactHandle::from_temp_path(temp_path, index, size))
            }
            Err(err) => {
                error!(index, error = %err, "Snapshot verification failed; discarding");
                Err(CaptureError::Verification(err.to_string()))
            }
        }
    }
}

impl fmt::Debug for SnapshotSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotSource")
            .field("temp_dir", &self.temp_dir)
            .field("tee_depth", &self.tee_depth)
            .finish_non_exhaustive()
    }
}

/// Blocking `Read` over chunks arriving on a channel
struct ChannelReader {
    rx: mpsc::Receiver<Bytes>,
    current: Bytes,
}

impl ChannelReader {
    fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            rx,
            current: Bytes::new(),
        }
    }

    /// Consume whatever the verifier left unread so the sender never blocks
    fn drain(&mut self) {
        self.rx.close();
        while self.rx.blocking_recv().is_some() {}
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.current.is_empty() {
            match self.rx.blocking_recv() {
                Some(chunk) => self.current = chunk,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}
