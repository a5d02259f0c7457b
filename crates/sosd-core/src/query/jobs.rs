//! Asynchronous query jobs.
//!
//! ```text
//!   Submitted ──▶ Executing ──▶ Completed
//!       │             │    └──▶ Failed(code)
//!       └─────────────┴───────▶ Cancelled
//! ```
//!
//! A job belongs to the session that submitted it and is claimed exactly
//! once: `claim` removes it from the registry and hands its result (or
//! error) to the caller. Finished jobs nobody claims are reaped after the
//! retention period; a session's jobs are dropped when it disconnects.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::QueryError;
use crate::error::{Coded, ErrorCode};
use crate::results::ResultSet;
use crate::types::Guid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Submitted,
    Executing,
    Completed,
    Failed { code: ErrorCode },
    Cancelled,
}

impl JobState {
    pub fn is_done(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed { .. } | JobState::Cancelled
        )
    }
}

pub struct QueryJob {
    pub guid: Guid,
    pub owner: Guid,
    pub sql: String,
    state: watch::Sender<JobState>,
    outcome: Mutex<Option<Result<ResultSet, QueryError>>>,
    cancel: CancellationToken,
    finished_at: Mutex<Option<Instant>>,
}

impl QueryJob {
    pub fn new(guid: Guid, owner: Guid, sql: impl Into<String>) -> Self {
        let (state, _) = watch::channel(JobState::Submitted);
        Self {
            guid,
            owner,
            sql: sql.into(),
            state,
            outcome: Mutex::new(None),
            cancel: CancellationToken::new(),
            finished_at: Mutex::new(None),
        }
    }

    pub fn state(&self) -> JobState {
        *self.state.borrow()
    }

    pub fn is_done(&self) -> bool {
        self.state().is_done()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Move from `Submitted` to `Executing`. Returns false if the job was
    /// cancelled first.
    pub fn start(&self) -> bool {
        self.state.send_if_modified(|s| {
            if *s == JobState::Submitted {
                *s = JobState::Executing;
                true
            } else {
                false
            }
        })
    }

    /// Record the outcome. Ignored if the job already finished.
    pub fn finish(&self, result: Result<ResultSet, QueryError>) {
        let next = match &result {
            Ok(_) => JobState::Completed,
            Err(QueryError::Cancelled) => JobState::Cancelled,
            Err(e) => JobState::Failed { code: e.code() },
        };
        let mut outcome = self.outcome.lock();
        let changed = self.state.send_if_modified(|s| {
            if s.is_done() {
                false
            } else {
                *s = next;
                true
            }
        });
        if changed {
            *outcome = Some(result);
            *self.finished_at.lock() = Some(Instant::now());
        }
    }

    /// Cancel the job unless it already finished. Returns the resulting state.
    pub fn cancel(&self) -> JobState {
        self.cancel.cancel();
        self.finish(Err(QueryError::Cancelled));
        self.state()
    }

    /// Wait until the job reaches a terminal state.
    pub async fn wait(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|s| s.is_done()).await;
    }

    fn take_outcome(&self) -> Option<Result<ResultSet, QueryError>> {
        self.outcome.lock().take()
    }

    fn finished_before(&self, cutoff: Instant) -> bool {
        self.finished_at.lock().is_some_and(|t| t <= cutoff)
    }
}

/// Status reply for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub query_guid: Guid,
    #[serde(flatten)]
    pub state: JobState,
    pub is_done: bool,
}

/// Registry of live async jobs.
pub struct QueryJobs {
    jobs: DashMap<Guid, Arc<QueryJob>>,
    retention: Duration,
}

impl QueryJobs {
    pub fn new(retention: Duration) -> Self {
        Self {
            jobs: DashMap::new(),
            retention,
        }
    }

    pub fn insert(&self, job: Arc<QueryJob>) {
        self.jobs.insert(job.guid, job);
    }

    /// A job visible to `owner`.
    fn owned(&self, owner: Guid, guid: Guid) -> Result<Arc<QueryJob>, QueryError> {
        self.jobs
            .get(&guid)
            .map(|j| Arc::clone(j.value()))
            .filter(|j| j.owner == owner)
            .ok_or(QueryError::UnknownQuery(guid))
    }

    pub fn status(&self, owner: Guid, guid: Guid) -> Result<JobStatus, QueryError> {
        let job = self.owned(owner, guid)?;
        let state = job.state();
        Ok(JobStatus {
            query_guid: guid,
            state,
            is_done: state.is_done(),
        })
    }

    /// Take the job's result, removing the job.
    ///
    /// Without `wait`, an unfinished job yields `QueryPending` and stays
    /// registered. With `wait`, this suspends until the job finishes.
    pub async fn claim(
        &self,
        owner: Guid,
        guid: Guid,
        wait: bool,
    ) -> Result<ResultSet, QueryError> {
        let job = self.owned(owner, guid)?;
        if !job.is_done() {
            if !wait {
                return Err(QueryError::Pending(guid));
            }
            job.wait().await;
        }
        // Whoever removes the entry owns the outcome.
        let (_, job) = self
            .jobs
            .remove(&guid)
            .ok_or(QueryError::UnknownQuery(guid))?;
        debug!(query_guid = guid, state = ?job.state(), "Query claimed");
        job.take_outcome()
            .unwrap_or(Err(QueryError::UnknownQuery(guid)))
    }

    pub fn cancel(&self, owner: Guid, guid: Guid) -> Result<JobState, QueryError> {
        Ok(self.owned(owner, guid)?.cancel())
    }

    /// Cancel and drop every job of a disconnected session.
    pub fn release_session(&self, owner: Guid) -> usize {
        let mut released = 0;
        self.jobs.retain(|_, job| {
            if job.owner == owner {
                job.cancel();
                released += 1;
                false
            } else {
                true
            }
        });
        released
    }

    /// Cancel jobs that have not started executing.
    pub fn cancel_pending(&self) -> usize {
        let mut cancelled = 0;
        for job in self.jobs.iter() {
            if job.state() == JobState::Submitted {
                job.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Drop finished jobs older than the retention period.
    pub fn reap_expired(&self) -> usize {
        let Some(cutoff) = Instant::now().checked_sub(self.retention) else {
            return 0;
        };
        let before = self.jobs.len();
        self.jobs.retain(|_, job| !job.finished_before(cutoff));
        before - self.jobs.len()
    }

    /// (submitted, executing) counts.
    pub fn counts(&self) -> (usize, usize) {
        self.jobs
            .iter()
            .fold((0, 0), |(queued, running), j| match j.state() {
                JobState::Submitted => (queued + 1, running),
                JobState::Executing => (queued, running + 1),
                _ => (queued, running),
            })
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn job(guid: Guid, owner: Guid) -> Arc<QueryJob> {
        Arc::new(QueryJob::new(guid, owner, "SELECT * FROM tblPubs"))
    }

    fn result(guid: Guid) -> ResultSet {
        ResultSet {
            query_guid: guid,
            column_names: vec!["n".into()],
            rows: vec![vec![Some("1".into())]],
            exec_duration_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_claim_exactly_once() {
        let jobs = QueryJobs::new(Duration::from_secs(60));
        let j = job(1, 7);
        jobs.insert(Arc::clone(&j));

        assert!(!jobs.status(7, 1).unwrap().is_done);
        assert!(matches!(
            jobs.claim(7, 1, false).await,
            Err(QueryError::Pending(1))
        ));

        assert!(j.start());
        j.finish(Ok(result(1)));
        assert_eq!(jobs.status(7, 1).unwrap().state, JobState::Completed);

        let rs = jobs.claim(7, 1, false).await.unwrap();
        assert_eq!(rs.query_guid, 1);
        assert!(matches!(
            jobs.claim(7, 1, false).await,
            Err(QueryError::UnknownQuery(1))
        ));
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn test_failed_job_returns_recorded_error() {
        let jobs = QueryJobs::new(Duration::from_secs(60));
        let j = job(2, 7);
        jobs.insert(Arc::clone(&j));
        j.start();
        j.finish(Err(QueryError::Execution("no such table: x".into())));

        assert_eq!(
            jobs.status(7, 2).unwrap().state,
            JobState::Failed {
                code: ErrorCode::QueryExecutionError
            }
        );
        let err = jobs.claim(7, 2, false).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::QueryExecutionError);
    }

    #[tokio::test]
    async fn test_claim_with_wait() {
        let jobs = Arc::new(QueryJobs::new(Duration::from_secs(60)));
        let j = job(3, 7);
        jobs.insert(Arc::clone(&j));

        let waiter = {
            let jobs = Arc::clone(&jobs);
            tokio::spawn(async move { jobs.claim(7, 3, true).await })
        };
        tokio::task::yield_now().await;
        j.start();
        j.finish(Ok(result(3)));

        let rs = waiter.await.unwrap().unwrap();
        assert_eq!(rs.row_count(), 1);
    }

    #[tokio::test]
    async fn test_other_sessions_cannot_see_job() {
        let jobs = QueryJobs::new(Duration::from_secs(60));
        jobs.insert(job(4, 7));
        assert!(matches!(
            jobs.status(8, 4),
            Err(QueryError::UnknownQuery(4))
        ));
        assert!(matches!(
            jobs.claim(8, 4, false).await,
            Err(QueryError::UnknownQuery(4))
        ));
    }

    #[test]
    fn test_cancel_beats_late_finish() {
        let jobs = QueryJobs::new(Duration::from_secs(60));
        let j = job(5, 7);
        jobs.insert(Arc::clone(&j));
        assert_eq!(jobs.cancel(7, 5).unwrap(), JobState::Cancelled);
        assert!(!j.start());
        j.finish(Ok(result(5)));
        assert_eq!(j.state(), JobState::Cancelled);
        assert!(j.cancel_token().is_cancelled());
    }

    #[test]
    fn test_release_session_and_cancel_pending() {
        let jobs = QueryJobs::new(Duration::from_secs(60));
        jobs.insert(job(1, 7));
        jobs.insert(job(2, 7));
        let running = job(3, 8);
        running.start();
        jobs.insert(Arc::clone(&running));
        jobs.insert(job(4, 8));

        assert_eq!(jobs.counts(), (3, 1));
        assert_eq!(jobs.release_session(7), 2);
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs.cancel_pending(), 1);
        assert_eq!(running.state(), JobState::Executing);
    }

    #[test]
    fn test_reap_expired() {
        let jobs = QueryJobs::new(Duration::ZERO);
        let done = job(1, 7);
        done.finish(Ok(result(1)));
        jobs.insert(done);
        jobs.insert(job(2, 7));
        assert_eq!(jobs.reap_expired(), 1);
        assert_eq!(jobs.len(), 1);
    }
}
