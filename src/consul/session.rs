//! Consul sessions and KV locks as a coordination service

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{check_status, ConsulEndpoint};
use crate::lease::{CoordinationClient, LeaseError, SessionId};

const DEFAULT_SESSION_NAME: &str = "snapcoord";

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SessionCreate<'a> {
    name: &'a str,
    #[serde(rename = "TTL")]
    ttl: String,
    behavior: &'a str,
}

#[derive(Debug, Deserialize)]
struct SessionCreated {
    #[serde(rename = "ID")]
    id: String,
}

/// Coordination client backed by a Consul agent
#[derive(Debug, Clone)]
pub struct ConsulCoordinator {
    endpoint: ConsulEndpoint,
    session_name: String,
}

impl ConsulCoordinator {
    pub fn new(endpoint: ConsulEndpoint) -> Self {
        Self {
            endpoint,
            session_name: DEFAULT_SESSION_NAME.to_string(),
        }
    }

    /// Name attached to created sessions, visible in the Consul UI
    pub fn with_session_name(mut self, name: impl Into<String>) -> Self {
        self.session_name = name.into();
        self
    }
}

fn transport(err: reqwest::Error) -> LeaseError {
    LeaseError::Transport(err.to_string())
}

fn rejected((status, body): (StatusCode, String)) -> LeaseError {
    LeaseError::Transport(format!("{}: {}", status, body))
}

/// Consul TTLs are whole seconds between 10s and 24h
fn ttl_string(ttl: Duration) -> String {
    format!("{}s", ttl.as_secs().clamp(10, 86_400))
}

#[async_trait]
impl CoordinationClient for ConsulCoordinator {
    #[instrument(skip(self), fields(address = %self.endpoint.address()))]
    async fn create_session(&self, ttl: Duration) -> Result<SessionId, LeaseError> {
        let body = SessionCreate {
            name: &self.session_name,
            ttl: ttl_string(ttl),
            behavior: "delete",
        };

        let response = self
            .endpoint
            .request(Method::PUT, "/v1/session/create")
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        let created: SessionCreated = check_status(response)
            .await
            .map_err(rejected)?
            .json()
            .await
            .map_err(transport)?;

        debug!(session = %created.id, "Created Consul session");
        Ok(SessionId::new(created.id))
    }

    async fn renew_session(&self, session: &SessionId) -> Result<(), LeaseError> {
        let response = self
            .endpoint
            .request(Method::PUT, &format!("/v1/session/renew/{}", session))
            .send()
            .await
            .map_err(transport)?;

        match check_status(response).await {
            Ok(_) => Ok(()),
            Err((StatusCode::NOT_FOUND, _)) => Err(LeaseError::SessionExpired {
                session: session.to_string(),
            }),
            Err(other) => Err(rejected(other)),
        }
    }

    async fn destroy_session(&self, session: &SessionId) -> Result<(), LeaseError> {
        let response = self
            .endpoint
            .request(Method::PUT, &format!("/v1/session/destroy/{}", session))
            .send()
            .await
            .map_err(transport)?;
        check_status(response).await.map_err(rejected)?;
        Ok(())
    }

    async fn acquire_key(&self, key: &str, session: &SessionId) -> Result<bool, LeaseError> {
        kv_lock(&self.endpoint, key, "acquire", session).await
    }

    async fn release_key(&self, key: &str, session: &SessionId) -> Result<bool, LeaseError> {
        kv_lock(&self.endpoint, key, "release", session).await
    }
}

async fn kv_lock(endpoint: &ConsulEndpoint, key: &str, op: &str, session: &SessionId) -> Result<bool, LeaseError> {
    let response = endpoint
        .request(Method::PUT, &format!("/v1/kv/{}", key.trim_start_matches('/')))
        .query(&[(op, session.as_str())])
        .body(session.as_str().to_string())
        .send()
        .await
        .map_err(transport)?;

    let outcome: bool = check_status(response)
        .await
        .map_err(rejected)?
        .json()
        .await
        .map_err(transport)?;
    debug!(key, op, outcome, "KV lock call");
    Ok(outcome)
}
