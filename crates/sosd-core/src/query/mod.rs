//! Query engine.
//!
//! Queries run on blocking workers against a store snapshot taken when
//! execution begins, so they never hold the store lock while scanning and
//! never observe a partial publish. A semaphore bounds how many run at once.
//!
//! Two modes share one execution path:
//! - blocking: [`QueryEngine::execute`] returns the result directly;
//! - asynchronous: [`QueryEngine::submit`] returns a query guid, then the
//!   caller polls [`QueryEngine::status`] and takes the result once with
//!   [`QueryEngine::claim`].

pub mod cache;
pub mod datum;
pub mod exec;
pub mod jobs;
pub mod parser;
pub mod pivot;
pub mod tables;

use std::sync::Arc;
use std::time::{Duration, Instant};

use sosd_config::QueryConfig;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Coded, ErrorCode};
use crate::guid::GuidAllocator;
use crate::results::ResultSet;
use crate::store::{StoreSnapshot, ValueStore};
use crate::types::Guid;

pub use cache::CacheGrab;
pub use jobs::{JobState, JobStatus, QueryJob, QueryJobs};
pub use pivot::PivotRequest;

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueryError {
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("execution error: {0}")]
    Execution(String),

    #[error("query exceeded its {0} ms time limit")]
    Timeout(u64),

    #[error("query cancelled")]
    Cancelled,

    #[error("query {0} has not finished")]
    Pending(Guid),

    #[error("unknown query {0}")]
    UnknownQuery(Guid),

    #[error("result exceeds {limit} rows")]
    TooLarge { limit: usize },

    #[error("query engine is shutting down")]
    ShuttingDown,
}

impl Coded for QueryError {
    fn code(&self) -> ErrorCode {
        match self {
            QueryError::Syntax(_) => ErrorCode::QuerySyntaxError,
            QueryError::Execution(_) => ErrorCode::QueryExecutionError,
            QueryError::Timeout(_) => ErrorCode::QueryTimeout,
            QueryError::Cancelled => ErrorCode::QueryCancelled,
            QueryError::Pending(_) => ErrorCode::QueryPending,
            QueryError::UnknownQuery(_) => ErrorCode::UnknownQuery,
            QueryError::TooLarge { .. } => ErrorCode::ResultTooLarge,
            QueryError::ShuttingDown => ErrorCode::ShuttingDown,
        }
    }
}

/// Work a query worker performs on its snapshot.
enum Work {
    Sql(String),
    Pivot(PivotRequest),
}

impl Work {
    fn run(
        &self,
        snapshot: &StoreSnapshot,
        cancel: &CancellationToken,
        max_rows: usize,
    ) -> Result<exec::Output, QueryError> {
        match self {
            Work::Sql(sql) => exec::execute(&parser::parse(sql)?, snapshot, cancel, max_rows),
            Work::Pivot(req) => pivot::run(req, snapshot, cancel, max_rows),
        }
    }
}

pub struct QueryEngine {
    store: Arc<ValueStore>,
    guids: Arc<GuidAllocator>,
    jobs: QueryJobs,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    default_timeout: Duration,
    max_result_rows: usize,
}

impl QueryEngine {
    pub fn new(store: Arc<ValueStore>, guids: Arc<GuidAllocator>, config: &QueryConfig) -> Self {
        Self {
            store,
            guids,
            jobs: QueryJobs::new(Duration::from_secs(config.job_retention_secs)),
            permits: Arc::new(Semaphore::new(config.max_concurrent)),
            max_concurrent: config.max_concurrent,
            default_timeout: Duration::from_millis(config.default_timeout_ms),
            max_result_rows: config.max_result_rows,
        }
    }

    pub fn jobs(&self) -> &QueryJobs {
        &self.jobs
    }

    /// Queries currently holding an execution slot.
    pub fn executing(&self) -> usize {
        self.max_concurrent - self.permits.available_permits()
    }

    fn timeout(&self, timeout_ms: Option<u64>) -> Duration {
        timeout_ms
            .filter(|ms| *ms > 0)
            .map_or(self.default_timeout, Duration::from_millis)
    }

    /// Run a query and wait for its result.
    pub async fn execute(&self, sql: &str, timeout_ms: Option<u64>) -> Result<ResultSet, QueryError> {
        let guid = self.guids.next();
        self.run(
            guid,
            Work::Sql(sql.to_string()),
            self.timeout(timeout_ms),
            CancellationToken::new(),
            || {},
        )
        .await
    }

    /// Run a pivot and wait for its result.
    pub async fn pivot(
        &self,
        req: &PivotRequest,
        timeout_ms: Option<u64>,
    ) -> Result<ResultSet, QueryError> {
        let guid = self.guids.next();
        self.run(
            guid,
            Work::Pivot(req.clone()),
            self.timeout(timeout_ms),
            CancellationToken::new(),
            || {},
        )
        .await
    }

    /// Serve a cache grab from the frame index.
    pub fn cache_grab(&self, req: &CacheGrab) -> Result<ResultSet, QueryError> {
        cache::grab(&self.store, req, self.guids.next())
    }

    /// Start a query in the background for `owner` and return its guid.
    ///
    /// Syntax errors are not reported here; they surface as a failed job.
    pub fn submit(self: &Arc<Self>, owner: Guid, sql: &str, timeout_ms: Option<u64>) -> Guid {
        let guid = self.guids.next();
        let job = Arc::new(QueryJob::new(guid, owner, sql));
        self.jobs.insert(Arc::clone(&job));
        let timeout = self.timeout(timeout_ms);
        debug!(query_guid = guid, owner, "Query submitted");

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let cancel = job.cancel_token().clone();
            let result = engine
                .run(guid, Work::Sql(job.sql.clone()), timeout, cancel, || {
                    job.start();
                })
                .await;
            if let Err(e) = &result {
                debug!(query_guid = guid, error = %e, "Async query failed");
            }
            job.finish(result);
        });
        guid
    }

    pub fn status(&self, owner: Guid, guid: Guid) -> Result<JobStatus, QueryError> {
        self.jobs.status(owner, guid)
    }

    pub async fn claim(&self, owner: Guid, guid: Guid, wait: bool) -> Result<ResultSet, QueryError> {
        self.jobs.claim(owner, guid, wait).await
    }

    pub fn cancel(&self, owner: Guid, guid: Guid) -> Result<JobState, QueryError> {
        self.jobs.cancel(owner, guid)
    }

    /// Drop everything a disconnected session left behind.
    pub fn release_session(&self, owner: Guid) -> usize {
        let released = self.jobs.release_session(owner);
        if released > 0 {
            debug!(owner, released, "Released query jobs of closed session");
        }
        released
    }

    /// Shutdown: cancel queued jobs, then wait for running ones to finish.
    pub async fn drain(&self) {
        let cancelled = self.jobs.cancel_pending();
        let running = self.executing();
        info!(cancelled, running, "Draining query engine");
        // Holding every permit means no worker is still running.
        match self.permits.acquire_many(self.max_concurrent as u32).await {
            Ok(_all) => {}
            Err(e) => warn!(error = %e, "Query semaphore closed while draining"),
        }
        self.permits.close();
    }

    pub fn reap_expired(&self) -> usize {
        self.jobs.reap_expired()
    }

    /// Shared execution path of every mode.
    ///
    /// `on_start` fires once an execution slot is held, right before the
    /// snapshot is taken.
    async fn run(
        &self,
        guid: Guid,
        work: Work,
        timeout: Duration,
        cancel: CancellationToken,
        on_start: impl FnOnce(),
    ) -> Result<ResultSet, QueryError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let timeout_ms = timeout.as_millis() as u64;

        let permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.map_err(|_| QueryError::ShuttingDown)?
            }
            _ = cancel.cancelled() => return Err(QueryError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => return Err(QueryError::Timeout(timeout_ms)),
        };
        on_start();

        let snapshot = self.store.snapshot();
        let worker_cancel = cancel.child_token();
        // Dropping this future (client gone) stops the worker too.
        let _stop_worker = worker_cancel.clone().drop_guard();
        let max_rows = self.max_result_rows;
        let started = Instant::now();

        let worker = {
            let worker_cancel = worker_cancel.clone();
            tokio::task::spawn_blocking(move || {
                // The slot is released only when the worker actually stops.
                let _permit = permit;
                work.run(&snapshot, &worker_cancel, max_rows)
            })
        };

        let output = tokio::select! {
            joined = worker => match joined {
                Ok(result) => result?,
                Err(e) => return Err(QueryError::Execution(format!("query worker failed: {e}"))),
            },
            _ = cancel.cancelled() => return Err(QueryError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => {
                worker_cancel.cancel();
                warn!(query_guid = guid, timeout_ms, "Query timed out");
                return Err(QueryError::Timeout(timeout_ms));
            }
        };

        Ok(ResultSet {
            query_guid: guid,
            rows: output.render(),
            column_names: output.columns,
            exec_duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}
