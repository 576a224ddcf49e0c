//! Consul HTTP adapters
//!
//! [`ConsulCoordinator`] implements the coordination port on Consul sessions
//! and KV locks; [`ConsulSnapshotClient`] streams `/v1/snapshot`. Both share
//! one [`ConsulEndpoint`], which carries the agent address and ACL token.

pub mod session;
pub mod snapshot;

use std::time::Duration;

use reqwest::{Method, RequestBuilder, Response, StatusCode};

pub use session::ConsulCoordinator;
pub use snapshot::ConsulSnapshotClient;

/// Header carrying the ACL token
pub const TOKEN_HEADER: &str = "X-Consul-Token";

/// Header carrying the Raft index a response reflects
pub const INDEX_HEADER: &str = "X-Consul-Index";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Address and credentials of a Consul agent
#[derive(Debug, Clone)]
pub struct ConsulEndpoint {
    address: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl ConsulEndpoint {
    /// Connect to the agent at `address`, e.g. `http://127.0.0.1:8500`
    pub fn new(address: impl Into<String>, token: Option<String>) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            address: address.into().trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
            http,
        })
    }

    /// Agent base address without a trailing slash
    pub fn address(&self) -> &str {
        &self.address
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.http.request(method, format!("{}{}", self.address, path));
        match &self.token {
            Some(token) => builder.header(TOKEN_HEADER, token),
            None => builder,
        }
    }
}

/// Turn a non-success response into its status and body text
async fn check_status(response: Response) -> Result<Response, (StatusCode, String)> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err((status, body.trim().to_string()))
}
