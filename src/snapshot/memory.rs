//! Snapshot client serving a fixed payload
//!
//! Used for dry runs and tests. The payload is streamed in chunks the way a
//! remote state store would send it, and failures can be injected at the
//! request or mid-stream.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};

use super::{CaptureError, SnapshotClient, SnapshotStream};

const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Serves the same payload and consistency index on every request
#[derive(Debug)]
pub struct StaticSnapshotClient {
    payload: Bytes,
    index: u64,
    chunk_size: usize,
    fail_after_chunks: Option<usize>,
    reject_requests: bool,
    requests: AtomicUsize,
}

impl StaticSnapshotClient {
    /// Serve `payload` tagged with `index`
    pub fn new(payload: impl Into<Bytes>, index: u64) -> Self {
        Self {
            payload: payload.into(),
            index,
            chunk_size: DEFAULT_CHUNK_SIZE,
            fail_after_chunks: None,
            reject_requests: false,
            requests: AtomicUsize::new(0),
        }
    }

    /// Stream the payload in chunks of `size` bytes
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Break the stream after `chunks` chunks, or at its end if it is shorter
    pub fn failing_after(mut self, chunks: usize) -> Self {
        self.fail_after_chunks = Some(chunks);
        self
    }

    /// Refuse every snapshot request
    pub fn rejecting(mut self) -> Self {
        self.reject_requests = true;
        self
    }

    /// Number of snapshot requests received
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotClient for StaticSnapshotClient {
    async fn take_snapshot(&self) -> Result<SnapshotStream, CaptureError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.reject_requests {
            return Err(CaptureError::Request("snapshot request rejected".to_string()));
        }

        let mut chunks: Vec<io::Result<Bytes>> = Vec::new();
        let mut offset = 0;
        while offset < self.payload.len() {
            let end = (offset + self.chunk_size).min(self.payload.len());
            chunks.push(Ok(self.payload.slice(offset..end)));
            offset = end;
        }

        if let Some(limit) = self.fail_after_chunks {
            chunks.truncate(limit);
            chunks.push(Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer")));
        }

        Ok(SnapshotStream {
            index: self.index,
            body: stream::iter(chunks).boxed(),
        })
    }
}
