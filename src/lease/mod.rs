//! Lease-based distributed mutual exclusion
//!
//! A [`Lease`] is an exclusive, time-bounded claim on a resource key. It is
//! backed by a session on a coordination service: the session carries a
//! server-side TTL, and the key is tagged with the session through an atomic
//! acquire-if-unheld write. A crashed holder stops renewing, the session
//! expires, and the key becomes free again without manual intervention.
//!
//! Acquisition returns a [`LeaseGuard`]. Renewal runs separately as a
//! [`RenewalTask`] so that long I/O can proceed while the session is kept
//! alive. Releasing the guard unmarks the key and destroys the session; a
//! guard dropped without release schedules a best-effort release in the
//! background.

pub mod memory;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

/// Default number of consecutive renewal failures after which a lease is considered lost
pub const DEFAULT_MAX_CONSECUTIVE_RENEWAL_FAILURES: u32 = 2;

/// Shortest renewal period; a zero period would panic the renewal timer
const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(1);

/// Errors related to lease handling
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LeaseError {
    /// Another live session holds the key
    #[error("Lock {key} is held by another session")]
    AlreadyHeld { key: String },

    /// The coordination service could not be reached or answered unexpectedly
    #[error("Coordination service unavailable: {0}")]
    Transport(String),

    /// The session no longer exists on the coordination service
    #[error("Session {session} has expired or was destroyed")]
    SessionExpired { session: String },

    /// Unmarking the key failed
    #[error("Failed to release lock {key}: {reason}")]
    Release { key: String, reason: String },

    /// Renewal gave up; the lease must be assumed revoked
    #[error("Lease on {key} lost after {failures} consecutive renewal failures")]
    LeaseLost { key: String, failures: u32 },
}

impl LeaseError {
    /// `true` for the expected "someone else is running" condition
    pub fn is_already_held(&self) -> bool {
        matches!(self, LeaseError::AlreadyHeld { .. })
    }
}

/// Opaque session token assigned by the coordination service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap a token returned by the coordination service
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw token
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session and conditional-write primitives of a coordination service
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Open a session that expires unless renewed within `ttl`
    async fn create_session(&self, ttl: Duration) -> Result<SessionId, LeaseError>;

    /// Extend the session by its TTL
    async fn renew_session(&self, session: &SessionId) -> Result<(), LeaseError>;

    /// Close the session; destroying an unknown session is not an error
    async fn destroy_session(&self, session: &SessionId) -> Result<(), LeaseError>;

    /// Tag `key` with `session` if it is unheld or already held by `session`
    async fn acquire_key(&self, key: &str, session: &SessionId) -> Result<bool, LeaseError>;

    /// Clear the tag on `key` if it is held by `session`
    async fn release_key(&self, key: &str, session: &SessionId) -> Result<bool, LeaseError>;
}

/// Exclusive claim on a resource key
pub struct Lease {
    client: Arc<dyn CoordinationClient>,
    key: String,
    ttl: Duration,
    renew_interval: Duration,
    max_consecutive_failures: u32,
    cleanup: TaskTracker,
}

impl Lease {
    /// Create a lease on `key` with the given session TTL
    ///
    /// Renewal defaults to every `ttl / 2`, and never less than a millisecond.
    pub fn new(client: Arc<dyn CoordinationClient>, key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            client,
            key: key.into(),
            ttl,
            renew_interval: default_renew_interval(ttl),
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_RENEWAL_FAILURES,
            cleanup: TaskTracker::new(),
        }
    }

    /// Override the renewal interval; values not strictly below the TTL fall back to `ttl / 2`
    pub fn with_renew_interval(mut self, interval: Duration) -> Self {
        self.renew_interval = if interval.is_zero() || interval >= self.ttl {
            default_renew_interval(self.ttl)
        } else {
            interval
        };
        self
    }

    /// Consecutive renewal failures tolerated before the lease is declared lost (0 = never)
    pub fn with_max_consecutive_failures(mut self, failures: u32) -> Self {
        self.max_consecutive_failures = failures;
        self
    }

    /// Resource key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Session TTL
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Interval between renewals
    pub fn renew_interval(&self) -> Duration {
        self.renew_interval
    }

    /// Open a session and claim the key
    ///
    /// On contention the freshly opened session is destroyed before
    /// `AlreadyHeld` is returned, so a losing caller never leaks a session.
    #[instrument(skip(self), fields(key = %self.key, ttl = ?self.ttl))]
    pub async fn acquire(&self) -> Result<LeaseGuard, LeaseError> {
        let session = self.client.create_session(self.ttl).await?;
        debug!(session = %session, "Session created");

        match self.client.acquire_key(&self.key, &session).await {
            Ok(true) => {
                info!(session = %session, "Acquired lock");
                Ok(LeaseGuard {
                    client: Arc::clone(&self.client),
                    key: self.key.clone(),
                    session,
                    released: false,
                    cleanup: self.cleanup.clone(),
                })
            }
            Ok(false) => {
                self.discard_session(&session).await;
                Err(LeaseError::AlreadyHeld {
                    key: self.key.clone(),
                })
            }
            Err(err) => {
                self.discard_session(&session).await;
                Err(err)
            }
        }
    }

    async fn discard_session(&self, session: &SessionId) {
        if let Err(err) = self.client.destroy_session(session).await {
            warn!(session = %session, error = %err, "Failed to destroy unused session");
        }
    }

    /// Start renewing the guard's session in the background
    pub fn start_renewal(&self, guard: &LeaseGuard) -> RenewalTask {
        let cancel = CancellationToken::new();
        let lost = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();

        let join = tokio::spawn(renewal_loop(
            Arc::clone(&self.client),
            self.key.clone(),
            guard.session.clone(),
            self.renew_interval,
            self.max_consecutive_failures,
            cancel.clone(),
            lost.clone(),
            tx,
        ));

        RenewalTask {
            cancel,
            lost,
            reports: rx,
            join,
        }
    }

    /// Wait for background releases scheduled by dropped guards
    pub async fn drain_cleanup(&self) {
        self.cleanup.close();
        self.cleanup.wait().await;
        self.cleanup.reopen();
    }
}

fn default_renew_interval(ttl: Duration) -> Duration {
    (ttl / 2).max(MIN_RENEW_INTERVAL)
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .field("renew_interval", &self.renew_interval)
            .field("max_consecutive_failures", &self.max_consecutive_failures)
            .finish()
    }
}

/// A held lease; release it with [`LeaseGuard::release`]
pub struct LeaseGuard {
    client: Arc<dyn CoordinationClient>,
    key: String,
    session: SessionId,
    released: bool,
    cleanup: TaskTracker,
}

impl LeaseGuard {
    /// Session that holds the key
    pub fn session_id(&self) -> &SessionId {
        &self.session
    }

    /// Held key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Unmark the key, then destroy the session regardless of the unmark outcome
    #[instrument(skip(self), fields(key = %self.key, session = %self.session))]
    pub async fn release(mut self) -> Result<(), LeaseError> {
        // Cancelled mid-release, the guard drops unreleased and Drop retries
        let result = release_session(self.client.as_ref(), &self.key, &self.session).await;
        self.released = true;
        result
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(key = %self.key, session = %self.session, "Lease dropped outside a runtime; relying on TTL expiry");
            return;
        };

        warn!(key = %self.key, session = %self.session, "Lease dropped without release; releasing in background");
        let client = Arc::clone(&self.client);
        let key = self.key.clone();
        let session = self.session.clone();
        self.cleanup.spawn_on(
            async move {
                if let Err(err) = release_session(client.as_ref(), &key, &session).await {
                    warn!(key = %key, session = %session, error = %err, "Background release failed");
                }
            },
            &handle,
        );
    }
}

impl fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("key", &self.key)
            .field("session", &self.session)
            .field("released", &self.released)
            .finish()
    }
}

async fn release_session(
    client: &dyn CoordinationClient,
    key: &str,
    session: &SessionId,
) -> Result<(), LeaseError> {
    let unmark = client.release_key(key, session).await;

    match client.destroy_session(session).await {
        Ok(()) | Err(LeaseError::SessionExpired { .. }) => {}
        Err(err) => warn!(session = %session, error = %err, "Failed to destroy session"),
    }

    match unmark {
        Ok(true) => {
            info!(session = %session, "Released lock");
            Ok(())
        }
        Ok(false) => {
            debug!(session = %session, "Lock was no longer held by this session");
            Ok(())
        }
        Err(err) => Err(LeaseError::Release {
            key: key.to_string(),
            reason: err.to_string(),
        }),
    }
}

/// Counters kept by the renewal loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenewalSummary {
    /// Successful renewals
    pub renewals: u64,
    /// Failed renewals
    pub failures: u64,
}

/// What the renewal task observed by the time it was stopped
#[derive(Debug, Default)]
pub struct RenewalOutcome {
    /// Renewal counters
    pub summary: RenewalSummary,
    /// Every failure reported on the error channel, in order
    pub failures: Vec<LeaseError>,
    /// Whether the task gave up on the lease
    pub lost: bool,
}

/// Background renewal of a held lease
#[derive(Debug)]
pub struct RenewalTask {
    cancel: CancellationToken,
    lost: CancellationToken,
    reports: mpsc::UnboundedReceiver<LeaseError>,
    join: JoinHandle<RenewalSummary>,
}

impl RenewalTask {
    /// `true` once renewal has given up on the lease
    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Token cancelled when the lease is declared lost
    pub fn lost_token(&self) -> CancellationToken {
        self.lost.clone()
    }

    /// Next renewal failure reported so far, if any
    pub fn try_next_failure(&mut self) -> Option<LeaseError> {
        self.reports.try_recv().ok()
    }

    /// Signal the loop to stop and wait for it
    pub async fn stop(mut self) -> RenewalOutcome {
        self.cancel.cancel();
        let summary = match (&mut self.join).await {
            Ok(summary) => summary,
            Err(err) => {
                error!(error = %err, "Renewal task ended abnormally");
                RenewalSummary::default()
            }
        };

        let mut failures = Vec::new();
        while let Ok(err) = self.reports.try_recv() {
            failures.push(err);
        }

        RenewalOutcome {
            summary,
            failures,
            lost: self.lost.is_cancelled(),
        }
    }
}

impl Drop for RenewalTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[allow(clippy::too_many_arguments)]
async fn renewal_loop(
    client: Arc<dyn CoordinationClient>,
    key: String,
    session: SessionId,
    interval: Duration,
    max_consecutive_failures: u32,
    cancel: CancellationToken,
    lost: CancellationToken,
    reports: mpsc::UnboundedSender<LeaseError>,
) -> RenewalSummary {
    let mut summary = RenewalSummary::default();
    let mut consecutive = 0u32;
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = client.renew_session(&session) => result,
        };

        match result {
            Ok(()) => {
                consecutive = 0;
                summary.renewals += 1;
                debug!(key = %key, session = %session, "Session renewed");
            }
            Err(err) => {
                consecutive += 1;
                summary.failures += 1;
                let expired = matches!(err, LeaseError::SessionExpired { .. });
                warn!(key = %key, session = %session, consecutive, error = %err, "Session renewal failed");
                let _ = reports.send(err);

                let exhausted = max_consecutive_failures > 0 && consecutive >= max_consecutive_failures;
                if expired || exhausted {
                    error!(key = %key, session = %session, consecutive, "Giving up on lease");
                    let _ = reports.send(LeaseError::LeaseLost {
                        key: key.clone(),
                        failures: consecutive,
                    });
                    lost.cancel();
                    break;
                }
            }
        }
    }

    debug!(key = %key, renewals = summary.renewals, failures = summary.failures, "Renewal loop stopped");
    summary
}
