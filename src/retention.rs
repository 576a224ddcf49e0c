//! Age-based retention
//!
//! The expiry decision is a pure function of an artifact's backend-reported
//! last-modified time and the current time. [`RetentionPolicy::apply`] lists
//! what a backend considers expired and deletes every entry, collecting all
//! failures instead of stopping at the first.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::age_of;
use crate::errors::ErrorSet;
use crate::output::{OutputBackend, StoredArtifact};

/// Maximum artifact age for one backend; `None` keeps artifacts forever
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub max_age: Option<Duration>,
}

/// `true` when `age` is strictly greater than `max_age`
pub fn is_older_than(age: Duration, max_age: Duration) -> bool {
    age > max_age
}

impl RetentionPolicy {
    /// Never delete anything
    pub fn retain_forever() -> Self {
        Self { max_age: None }
    }

    /// Delete artifacts older than `max_age`; a zero age means retain forever
    pub fn max_age(max_age: Duration) -> Self {
        Self {
            max_age: Some(max_age).filter(|age| !age.is_zero()),
        }
    }

    /// Effective threshold, if any
    pub fn threshold(&self) -> Option<Duration> {
        self.max_age.filter(|age| !age.is_zero())
    }

    /// Whether an artifact last modified at `last_modified` is due for deletion at `now`
    pub fn is_expired(&self, last_modified: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self.threshold() {
            Some(max_age) => is_older_than(age_of(last_modified, now), max_age),
            None => false,
        }
    }

    /// The subset of `artifacts` due for deletion at `now`
    pub fn select_expired<'a>(&self, artifacts: &'a [StoredArtifact], now: DateTime<Utc>) -> Vec<&'a StoredArtifact> {
        artifacts
            .iter()
            .filter(|artifact| self.is_expired(artifact.last_modified, now))
            .collect()
    }

    /// Delete everything `backend` reports as older than the threshold
    ///
    /// Returns the deleted ids. A listing failure or any number of delete
    /// failures come back together in one [`ErrorSet`], attributed to the
    /// backend's name.
    pub async fn apply(&self, backend: &dyn OutputBackend) -> Result<RetentionReport, ErrorSet> {
        let Some(max_age) = self.threshold() else {
            debug!(backend = backend.name(), "No retention policy; keeping everything");
            return Ok(RetentionReport::default());
        };

        info!(backend = backend.name(), max_age = ?max_age, "Applying retention policy");
        let mut errors = ErrorSet::new();
        let expired = match backend.list_older_than(max_age).await {
            Ok(expired) => expired,
            Err(err) => {
                errors.push(backend.name(), err);
                return Err(errors);
            }
        };

        let mut report = RetentionReport {
            listed: expired.len(),
            deleted: Vec::with_capacity(expired.len()),
        };
        for artifact in expired {
            match backend.delete(&artifact.id).await {
                Ok(()) => {
                    info!(backend = backend.name(), id = %artifact.id, "Removed expired artifact");
                    report.deleted.push(artifact.id);
                }
                Err(err) => {
                    warn!(backend = backend.name(), id = %artifact.id, error = %err, "Failed to remove expired artifact");
                    errors.push(backend.name(), err);
                }
            }
        }

        errors.into_result().map(|()| report)
    }
}

/// What one retention pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    /// Entries the backend reported as expired
    pub listed: usize,
    /// Ids that were deleted
    pub deleted: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::BackendError;
    use crate::snapshot::ArtifactHandle;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use proptest::prelude::*;

    struct FixedListing {
        entries: Mutex<Vec<String>>,
        failing: Vec<String>,
        policy: RetentionPolicy,
    }

    #[async_trait]
    impl OutputBackend for FixedListing {
        fn name(&self) -> &str {
            "fixed"
        }

        fn retention(&self) -> &RetentionPolicy {
            &self.policy
        }

        async fn persist(&self, _artifact: &ArtifactHandle, _name: &str) -> Result<(), BackendError> {
            Ok(())
        }

        async fn list_older_than(&self, _max_age: Duration) -> Result<Vec<StoredArtifact>, BackendError> {
            Ok(self
                .entries
                .lock()
                .iter()
                .map(|id| StoredArtifact {
                    id: id.clone(),
                    last_modified: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
                })
                .collect())
        }

        async fn delete(&self, id: &str) -> Result<(), BackendError> {
            if self.failing.iter().any(|f| f == id) {
                return Err(BackendError::Delete {
                    id: id.to_string(),
                    reason: "permission denied".to_string(),
                });
            }
            self.entries.lock().retain(|e| e != id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_every_delete_is_attempted() {
        let backend = FixedListing {
            entries: Mutex::new(vec!["a".into(), "b".into(), "c".into()]),
            failing: vec!["a".into(), "b".into()],
            policy: RetentionPolicy::max_age(Duration::from_secs(60)),
        };

        let errors = backend.policy.apply(&backend).await.unwrap_err();

        assert_eq!(errors.len(), 2);
        assert_eq!(*backend.entries.lock(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_unset_policy_is_a_noop() {
        let backend = FixedListing {
            entries: Mutex::new(vec!["a".into()]),
            failing: vec![],
            policy: RetentionPolicy::retain_forever(),
        };

        let report = backend.policy.apply(&backend).await.unwrap();

        assert_eq!(report, RetentionReport::default());
        assert_eq!(backend.entries.lock().len(), 1);
    }

    #[test]
    fn test_zero_max_age_retains_forever() {
        let policy = RetentionPolicy::max_age(Duration::ZERO);
        let now = Utc::now();

        assert_eq!(policy.threshold(), None);
        assert!(!policy.is_expired(now - chrono::Duration::days(365), now));
    }

    proptest! {
        #[test]
        fn prop_expiry_matches_age_comparison(age_secs in 0u64..1_000_000, max_secs in 1u64..1_000_000) {
            let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
            let last_modified = now - chrono::Duration::seconds(age_secs as i64);
            let policy = RetentionPolicy::max_age(Duration::from_secs(max_secs));

            prop_assert_eq!(policy.is_expired(last_modified, now), age_secs > max_secs);
        }

        #[test]
        fn prop_future_timestamps_never_expire(ahead_secs in 0i64..1_000_000, max_secs in 1u64..1_000_000) {
            let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
            let policy = RetentionPolicy::max_age(Duration::from_secs(max_secs));

            prop_assert!(!policy.is_expired(now + chrono::Duration::seconds(ahead_secs), now));
        }

        #[test]
        fn prop_selection_is_monotonic_in_time(ages in proptest::collection::vec(0u64..10_000, 0..20), extra in 0u64..10_000) {
            let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
            let later = now + chrono::Duration::seconds(extra as i64);
            let policy = RetentionPolicy::max_age(Duration::from_secs(3600));
            let artifacts: Vec<StoredArtifact> = ages
                .iter()
                .enumerate()
                .map(|(i, age)| StoredArtifact {
                    id: i.to_string(),
                    last_modified: now - chrono::Duration::seconds(*age as i64),
                })
                .collect();

            let first = policy.select_expired(&artifacts, now).len();
            let second = policy.select_expired(&artifacts, later).len();
            prop_assert!(second >= first);
        }
    }
}
