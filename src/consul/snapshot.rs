//! Streaming snapshots from a Consul agent

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::HeaderMap;
use reqwest::Method;
use tracing::instrument;

use super::{check_status, ConsulEndpoint, INDEX_HEADER};
use crate::snapshot::{CaptureError, SnapshotClient, SnapshotStream};

/// Snapshot client issuing `GET /v1/snapshot`
#[derive(Debug, Clone)]
pub struct ConsulSnapshotClient {
    endpoint: ConsulEndpoint,
    stale: bool,
}

impl ConsulSnapshotClient {
    pub fn new(endpoint: ConsulEndpoint) -> Self {
        Self { endpoint, stale: false }
    }

    /// Allow any server, not just the leader, to answer
    pub fn allow_stale(mut self, stale: bool) -> Self {
        self.stale = stale;
        self
    }
}

fn consistency_index(headers: &HeaderMap) -> Result<u64, CaptureError> {
    let value = headers
        .get(INDEX_HEADER)
        .ok_or_else(|| CaptureError::Request(format!("response is missing {}", INDEX_HEADER)))?;
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| CaptureError::Request(format!("invalid {} header: {:?}", INDEX_HEADER, value)))
}

#[async_trait]
impl SnapshotClient for ConsulSnapshotClient {
    #[instrument(skip(self), fields(address = %self.endpoint.address()))]
    async fn take_snapshot(&self) -> Result<SnapshotStream, CaptureError> {
        let mut request = self.endpoint.request(Method::GET, "/v1/snapshot");
        if self.stale {
            request = request.query(&[("stale", "")]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CaptureError::Request(e.to_string()))?;
        let response = check_status(response)
            .await
            .map_err(|(status, body)| CaptureError::Request(format!("{}: {}", status, body)))?;

        let index = consistency_index(response.headers())?;
        let body = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
            .boxed();

        Ok(SnapshotStream { index, body })
    }
}
