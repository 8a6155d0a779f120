//src/offline.rs
//! Durable queue of finish submissions that could not be delivered, and the
//! drain that retries them with exponential backoff.
use chrono::{DateTime, Duration, Utc};
use strum_macros::{Display, EnumString};
use tracing::{info, warn};
use uuid::Uuid;

use crate::collaborators::FinishEndpoint;
use crate::config::OfflineSettings;
use crate::db::{DbError, LocalStore};
use crate::finish::FinishPayload;

pub const FINISH_JOB_KIND: &str = "finish_workout";
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
const MAX_BACKOFF_EXPONENT: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OfflineJob {
    pub id: String,
    pub kind: String,
    pub created_at: DateTime<Utc>,
    pub details: String,
    /// Serialized [`FinishPayload`].
    pub payload: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl OfflineJob {
    pub fn finish_workout(
        payload: &FinishPayload,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: format!("finish_{}_{}", now.timestamp_millis(), Uuid::new_v4().simple()),
            kind: FINISH_JOB_KIND.to_string(),
            created_at: now,
            details: payload.workout_title.clone(),
            payload: serde_json::to_string(payload)?,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts,
            next_attempt_at: None,
            last_error: None,
        })
    }

    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Records a failed attempt: backs off `base * 2^attempts` and marks the
    /// job failed once it ran out of attempts.
    pub fn record_failure(&mut self, error: &str, now: DateTime<Utc>, backoff_base_secs: i64) {
        self.attempts += 1;
        let factor = 1_i64 << self.attempts.min(MAX_BACKOFF_EXPONENT);
        self.next_attempt_at = Some(now + Duration::seconds(backoff_base_secs.saturating_mul(factor)));
        self.last_error = Some(error.to_string());
        self.status = if self.attempts >= self.max_attempts {
            JobStatus::Failed
        } else {
            JobStatus::Pending
        };
    }

    /// Records a rejection the server will repeat on every retry: the job is
    /// failed right away.
    pub fn record_rejection(&mut self, error: &str) {
        self.attempts += 1;
        self.next_attempt_at = None;
        self.last_error = Some(error.to_string());
        self.status = JobStatus::Failed;
    }

    /// Makes the job due now with a fresh attempt budget.
    pub fn bump(&mut self) {
        self.next_attempt_at = None;
        self.attempts = 0;
        self.status = JobStatus::Pending;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueSummary {
    pub online: bool,
    pub pending: usize,
    pub failed: usize,
    pub due: usize,
    pub next_due_at: Option<DateTime<Utc>>,
    pub jobs: Vec<OfflineJob>,
}

#[must_use]
pub fn summarize(jobs: Vec<OfflineJob>, online: bool, now: DateTime<Utc>) -> QueueSummary {
    QueueSummary {
        online,
        pending: jobs.iter().filter(|j| j.status == JobStatus::Pending).count(),
        failed: jobs.iter().filter(|j| j.status == JobStatus::Failed).count(),
        due: jobs.iter().filter(|j| j.is_due(now)).count(),
        next_due_at: jobs
            .iter()
            .filter_map(|j| j.next_attempt_at)
            .filter(|at| *at > now)
            .min(),
        jobs,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub processed: usize,
    pub errors: usize,
    pub skipped: usize,
}

/// Delivers due jobs through `endpoint`, oldest first, at most `max` of them.
/// Delivered jobs are deleted; failures are rescheduled. With `force`, backoff
/// and failed status are ignored.
pub async fn flush_offline_queue(
    store: &LocalStore,
    endpoint: &dyn FinishEndpoint,
    settings: &OfflineSettings,
    now: DateTime<Utc>,
    max: usize,
    force: bool,
) -> Result<FlushReport, DbError> {
    let mut report = FlushReport::default();
    for mut job in store.jobs()? {
        if report.processed + report.errors >= max {
            break;
        }
        if !force && (!job.is_due(now) || job.status == JobStatus::Failed) {
            report.skipped += 1;
            continue;
        }
        // Errors carry whether a later retry can succeed.
        let outcome = match job.kind.as_str() {
            FINISH_JOB_KIND => match serde_json::from_str::<FinishPayload>(&job.payload) {
                Ok(payload) => endpoint
                    .submit_finish(&payload)
                    .await
                    .map_err(|e| (e.to_string(), e.is_retryable())),
                Err(e) => Err((format!("Corrupt payload: {e}"), false)),
            },
            // Unknown kinds have nothing to deliver.
            _ => Ok(()),
        };
        match outcome {
            Ok(()) => {
                store.delete_job(&job.id)?;
                report.processed += 1;
                info!("Delivered offline job {}", job.id);
            }
            Err((error, retryable)) => {
                warn!("Offline job {} failed: {}", job.id, error);
                if retryable {
                    job.record_failure(&error, now, settings.backoff_base_secs);
                } else {
                    job.record_rejection(&error);
                }
                store.put_job(&job)?;
                report.errors += 1;
            }
        }
    }
    Ok(report)
}

/// Resets a job so the next drain retries it. Returns `false` if unknown.
pub fn bump_job(store: &LocalStore, id: &str) -> Result<bool, DbError> {
    let Some(mut job) = store.job(id)? else {
        return Ok(false);
    };
    job.bump();
    store.put_job(&job)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::RemoteError;
    use async_trait::async_trait;
    use std::cell::Cell;
    use std::collections::BTreeMap;

    struct FlakyEndpoint {
        fail: Option<u16>,
        calls: Cell<usize>,
    }

    #[async_trait(?Send)]
    impl FinishEndpoint for FlakyEndpoint {
        async fn submit_finish(&self, _payload: &FinishPayload) -> Result<(), RemoteError> {
            self.calls.set(self.calls.get() + 1);
            match self.fail {
                Some(status) => Err(RemoteError::Status {
                    status,
                    message: "unavailable".into(),
                }),
                None => Ok(()),
            }
        }
    }

    fn payload() -> FinishPayload {
        FinishPayload {
            workout_title: "Pull".into(),
            date: Utc::now(),
            total_time: 0,
            real_total_time: 0,
            execution_total_seconds: 0,
            rest_total_seconds: 0,
            logs: BTreeMap::new(),
            exercises: Vec::new(),
            origin_workout_id: None,
            pre_checkin: None,
            post_checkin: None,
            idempotency_key: "key-1".into(),
        }
    }

    #[test]
    fn failures_back_off_and_eventually_fail() {
        let now = Utc::now();
        let mut job = OfflineJob::finish_workout(&payload(), now, 2).unwrap();
        assert!(job.id.starts_with("finish_"));
        job.record_failure("boom", now, 60);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.next_attempt_at, Some(now + Duration::seconds(120)));
        assert!(!job.is_due(now));
        job.record_failure("boom", now, 60);
        assert_eq!(job.status, JobStatus::Failed);
        job.bump();
        assert!(job.is_due(now));
        assert_eq!(job.attempts, 0);
    }

    #[tokio::test]
    async fn flush_delivers_due_jobs_and_reschedules_failures() {
        let store = LocalStore::in_memory().unwrap();
        let now = Utc::now();
        let job = OfflineJob::finish_workout(&payload(), now, 10).unwrap();
        store.put_job(&job).unwrap();
        let settings = OfflineSettings::default();

        let failing = FlakyEndpoint {
            fail: Some(503),
            calls: Cell::new(0),
        };
        let report = flush_offline_queue(&store, &failing, &settings, now, 50, false).await.unwrap();
        assert_eq!(report.errors, 1);
        let stored = store.job(&job.id).unwrap().unwrap();
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.last_error.as_deref(), Some("Server returned 503: unavailable"));

        let ok = FlakyEndpoint {
            fail: None,
            calls: Cell::new(0),
        };
        let report = flush_offline_queue(&store, &ok, &settings, now, 50, false).await.unwrap();
        assert_eq!(report, FlushReport { processed: 0, errors: 0, skipped: 1 });
        assert_eq!(ok.calls.get(), 0);

        let report = flush_offline_queue(&store, &ok, &settings, now, 50, true).await.unwrap();
        assert_eq!(report.processed, 1);
        assert!(store.jobs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejected_job_fails_without_backoff() {
        let store = LocalStore::in_memory().unwrap();
        let now = Utc::now();
        let job = OfflineJob::finish_workout(&payload(), now, 10).unwrap();
        store.put_job(&job).unwrap();
        let rejecting = FlakyEndpoint {
            fail: Some(422),
            calls: Cell::new(0),
        };

        let report = flush_offline_queue(&store, &rejecting, &OfflineSettings::default(), now, 50, false)
            .await
            .unwrap();
        assert_eq!(report.errors, 1);
        let stored = store.job(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts, 1);
        assert!(stored.next_attempt_at.is_none());
    }

    #[test]
    fn summary_counts_due_and_next() {
        let now = Utc::now();
        let mut later = OfflineJob::finish_workout(&payload(), now, 10).unwrap();
        later.record_failure("x", now, 60);
        let due = OfflineJob::finish_workout(&payload(), now, 10).unwrap();
        let summary = summarize(vec![later.clone(), due], true, now);
        assert_eq!(summary.pending, 2);
        assert_eq!(summary.due, 1);
        assert_eq!(summary.next_due_at, later.next_attempt_at);
    }
}
