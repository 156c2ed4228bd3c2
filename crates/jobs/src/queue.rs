//! Generic persistent job queue engine.
//!
//! ## Design
//!
//! - `add` persists the job before any in-memory scheduling: once it
//!   returns, a process kill cannot lose the work
//! - retries follow the backoff policy inside a wall-clock budget anchored
//!   at the original enqueue time; the attempt budget is derived from the
//!   same policy
//! - the persisted row is deleted exactly once, on terminal outcome; row
//!   absence is the only "done" marker
//! - lanes bound concurrency; jobs on the same lane start in enqueue order
//!
//! Concrete queues plug in via [`JobHandler`]: a strategy object providing
//! the queue discriminator, payload validation, lane mapping, and the
//! per-attempt execution.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use courier_core::DomainError;

use crate::backoff::BackoffPolicy;
use crate::lanes::{LanePolicy, Lanes};
use crate::store::{JobStore, JobStoreError};
use crate::types::{JobError, JobId, JobRecord, JobResult, ParsedJob, RunContext};

/// Strategy implemented by each concrete queue.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Queue discriminator persisted with every row.
    const QUEUE_TYPE: &'static str;

    type Data: Serialize + Send + Sync + 'static;

    /// Validate and deserialize a persisted payload. Called on every `add`
    /// (a payload that could not be reloaded after a crash is rejected up
    /// front) and on every row during `resume`.
    fn parse(&self, payload: &serde_json::Value) -> Result<Self::Data, DomainError>;

    /// Which lane the job runs on. Ignored under [`LanePolicy::Shared`].
    fn lane_key(&self, data: &Self::Data) -> String;

    /// One execution attempt.
    async fn run(&self, data: &Self::Data, ctx: &RunContext) -> JobResult;
}

/// Queue behaviour, fixed at construction.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Wall-clock retry budget, anchored at enqueue time.
    pub max_retry_time: Duration,
    pub lane_policy: LanePolicy,
    pub backoff: BackoffPolicy,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_retry_time: Duration::from_secs(24 * 60 * 60),
            lane_policy: LanePolicy::Shared { parallelism: 5 },
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Error surfaced synchronously by [`JobQueue::add`].
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// The payload failed the queue's schema validation. Nothing was
    /// persisted.
    #[error("invalid job payload: {0}")]
    Validation(#[from] DomainError),

    /// The job could not be persisted; it was not scheduled.
    #[error("failed to persist job: {0}")]
    Store(#[from] JobStoreError),
}

/// Ticket resolving on the job's terminal outcome: `Ok` on success, the
/// terminal [`JobError`] otherwise.
#[derive(Debug)]
pub struct JobTicket {
    id: JobId,
    done: oneshot::Receiver<Result<(), JobError>>,
}

impl JobTicket {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub async fn wait(self) -> Result<(), JobError> {
        match self.done.await {
            Ok(outcome) => outcome,
            Err(_) => Err(JobError::QueueClosed),
        }
    }
}

/// Generic persistent job queue. Cheap to clone; safe to share across tasks.
pub struct JobQueue<H: JobHandler> {
    inner: Arc<Inner<H>>,
}

impl<H: JobHandler> Clone for JobQueue<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<H: JobHandler> {
    handler: H,
    store: Arc<dyn JobStore>,
    lanes: Lanes,
    options: QueueOptions,
    max_attempts: u32,
}

impl<H: JobHandler> JobQueue<H> {
    pub fn new(handler: H, store: Arc<dyn JobStore>, options: QueueOptions) -> Self {
        let max_attempts = options.backoff.max_attempts(options.max_retry_time);
        Self {
            inner: Arc::new(Inner {
                handler,
                store,
                lanes: Lanes::new(options.lane_policy),
                options,
                max_attempts,
            }),
        }
    }

    pub fn queue_type(&self) -> &'static str {
        H::QUEUE_TYPE
    }

    /// Attempts allowed per job under this queue's retry budget.
    pub fn max_attempts(&self) -> u32 {
        self.inner.max_attempts
    }

    /// Enqueue a job.
    ///
    /// The payload is validated through the same `parse` used on reload, and
    /// the row is durable before this returns: a crash immediately after
    /// `add` still leaves recoverable work. The ticket resolves on the
    /// terminal outcome; dropping it detaches the caller without affecting
    /// the job.
    pub async fn add(&self, data: H::Data) -> Result<JobTicket, EnqueueError> {
        let payload = serde_json::to_value(&data)
            .map_err(|e| DomainError::validation(format!("unserializable payload: {e}")))?;
        let data = self.inner.handler.parse(&payload)?;

        let record = JobRecord::new(H::QUEUE_TYPE, payload);
        self.inner.store.insert(&record).await?;
        debug!(queue = H::QUEUE_TYPE, job_id = %record.id, "job persisted");

        Ok(self.admit(ParsedJob {
            id: record.id,
            timestamp: record.timestamp,
            attempts: 0,
            data,
        }))
    }

    /// Reload every persisted job for this queue and re-admit it as if
    /// freshly added, preserving the original timestamp and attempt count.
    /// Rows that fail parsing are deleted and logged, never retried.
    /// Returns the number of jobs resumed. Call once at startup.
    pub async fn resume(&self) -> Result<usize, JobStoreError> {
        let rows = self.inner.store.get_all_for_queue(H::QUEUE_TYPE).await?;
        let mut resumed = 0;

        for row in rows {
            match self.inner.handler.parse(&row.payload) {
                Ok(data) => {
                    // Detached: nobody awaits a resumed job's ticket.
                    let _ = self.admit(ParsedJob {
                        id: row.id,
                        timestamp: row.timestamp,
                        attempts: row.attempts,
                        data,
                    });
                    resumed += 1;
                }
                Err(err) => {
                    warn!(
                        queue = H::QUEUE_TYPE,
                        job_id = %row.id,
                        error = %err,
                        "dropping unparseable persisted job"
                    );
                    self.inner.store.delete(row.id).await?;
                }
            }
        }

        info!(queue = H::QUEUE_TYPE, resumed, "queue resumed");
        Ok(resumed)
    }

    fn admit(&self, job: ParsedJob<H::Data>) -> JobTicket {
        let (tx, rx) = oneshot::channel();
        let id = job.id;
        let key = self.inner.handler.lane_key(&job.data);
        let inner = Arc::clone(&self.inner);

        self.inner.lanes.submit(
            &key,
            Box::pin(async move {
                let outcome = drive(&inner, job).await;
                let _ = tx.send(outcome);
            }),
        );

        JobTicket { id, done: rx }
    }
}

/// Drive one job through attempts to a terminal outcome. Runs inside the
/// job's lane slot; backoff sleeps hold only that slot.
async fn drive<H: JobHandler>(
    inner: &Inner<H>,
    job: ParsedJob<H::Data>,
) -> Result<(), JobError> {
    let deadline = chrono::TimeDelta::from_std(inner.options.max_retry_time)
        .ok()
        .and_then(|budget| job.timestamp.checked_add_signed(budget))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);

    let mut attempts = job.attempts;

    loop {
        attempts += 1;
        if let Err(err) = inner.store.record_attempt(job.id, attempts).await {
            // The row, not the counter, is the authoritative state; a failed
            // bump degrades to the wall-clock budget alone.
            warn!(
                queue = H::QUEUE_TYPE,
                job_id = %job.id,
                error = %err,
                "failed to persist attempt count"
            );
        }

        let time_remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let is_final_attempt = time_remaining.is_zero() || attempts >= inner.max_attempts;
        let ctx = RunContext {
            attempt: attempts,
            time_remaining,
            is_final_attempt,
        };

        debug!(
            queue = H::QUEUE_TYPE,
            job_id = %job.id,
            attempt = attempts,
            final_attempt = is_final_attempt,
            "running job"
        );

        match inner.handler.run(&job.data, &ctx).await {
            JobResult::Success => {
                finish(inner, job.id).await;
                info!(queue = H::QUEUE_TYPE, job_id = %job.id, attempts, "job succeeded");
                return Ok(());
            }
            JobResult::NeedsRetry(err) if !is_final_attempt => {
                let delay = inner.options.backoff.delay_for_attempt(attempts);
                let cause = format!("{err:#}");
                warn!(
                    queue = H::QUEUE_TYPE,
                    job_id = %job.id,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %cause,
                    "transient failure, retrying after backoff"
                );
                tokio::time::sleep(delay).await;
            }
            JobResult::NeedsRetry(err) => {
                finish(inner, job.id).await;
                let last_error = format!("{err:#}");
                info!(
                    queue = H::QUEUE_TYPE,
                    job_id = %job.id,
                    attempts,
                    error = %last_error,
                    "retry budget exhausted"
                );
                return Err(JobError::BudgetExhausted {
                    attempts,
                    last_error,
                });
            }
            JobResult::Failure(err) => {
                finish(inner, job.id).await;
                let message = format!("{err:#}");
                warn!(
                    queue = H::QUEUE_TYPE,
                    job_id = %job.id,
                    attempts,
                    error = %message,
                    "job failed terminally"
                );
                return Err(JobError::Fatal(message));
            }
        }
    }
}

async fn finish<H: JobHandler>(inner: &Inner<H>, id: JobId) {
    if let Err(err) = inner.store.delete(id).await {
        // Worst case the job is re-attempted on next startup; handlers are
        // at-least-once.
        warn!(
            queue = H::QUEUE_TYPE,
            job_id = %id,
            error = %err,
            "failed to delete finished job row"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryJobStore;
    use anyhow::anyhow;
    use serde::Deserialize;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Ping {
        n: u32,
        #[serde(default)]
        lane: String,
    }

    struct FnHandler<F> {
        run_fn: F,
    }

    #[async_trait]
    impl<F> JobHandler for FnHandler<F>
    where
        F: Fn(&Ping, &RunContext) -> JobResult + Send + Sync + 'static,
    {
        const QUEUE_TYPE: &'static str = "test-jobs";
        type Data = Ping;

        fn parse(&self, payload: &serde_json::Value) -> Result<Ping, DomainError> {
            let ping: Ping = serde_json::from_value(payload.clone())
                .map_err(|e| DomainError::validation(format!("ping: {e}")))?;
            if ping.n >= 1_000 {
                return Err(DomainError::validation("n out of range"));
            }
            Ok(ping)
        }

        fn lane_key(&self, data: &Ping) -> String {
            data.lane.clone()
        }

        async fn run(&self, data: &Ping, ctx: &RunContext) -> JobResult {
            (self.run_fn)(data, ctx)
        }
    }

    fn queue<F>(store: Arc<InMemoryJobStore>, options: QueueOptions, run_fn: F) -> JobQueue<FnHandler<F>>
    where
        F: Fn(&Ping, &RunContext) -> JobResult + Send + Sync + 'static,
    {
        JobQueue::new(FnHandler { run_fn }, store, options)
    }

    fn short_budget() -> QueueOptions {
        QueueOptions {
            max_retry_time: Duration::from_secs(1),
            lane_policy: LanePolicy::Shared { parallelism: 5 },
            backoff: BackoffPolicy::new(
                Duration::from_millis(100),
                2.0,
                Duration::from_secs(10),
            ),
        }
    }

    fn ping(n: u32) -> Ping {
        Ping {
            n,
            lane: String::new(),
        }
    }

    #[tokio::test]
    async fn success_deletes_the_row_and_resolves_the_ticket() {
        let store = InMemoryJobStore::arc();
        let q = queue(store.clone(), QueueOptions::default(), |_, _| {
            JobResult::Success
        });

        let ticket = q.add(ping(1)).await.unwrap();
        ticket.wait().await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn validation_failure_persists_nothing() {
        let store = InMemoryJobStore::arc();
        let q = queue(store.clone(), QueueOptions::default(), |_, _| {
            JobResult::Success
        });

        let err = q.add(ping(5_000)).await.unwrap_err();
        assert!(matches!(err, EnqueueError::Validation(_)));
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_retries_then_succeeds() {
        let store = InMemoryJobStore::arc();
        let runs = Arc::new(AtomicU32::new(0));
        let runs_in = Arc::clone(&runs);

        let q = queue(store.clone(), QueueOptions::default(), move |_, _| {
            if runs_in.fetch_add(1, Ordering::SeqCst) == 0 {
                JobResult::NeedsRetry(anyhow!("connection reset"))
            } else {
                JobResult::Success
            }
        });

        let ticket = q.add(ping(1)).await.unwrap();
        ticket.wait().await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_rejects_with_the_last_error() {
        let store = InMemoryJobStore::arc();
        let q = queue(store.clone(), short_budget(), |_, _| {
            JobResult::NeedsRetry(anyhow!("server unreachable"))
        });
        assert_eq!(q.max_attempts(), 4);

        let ticket = q.add(ping(1)).await.unwrap();
        let err = ticket.wait().await.unwrap_err();

        match err {
            JobError::BudgetExhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 4);
                assert!(last_error.contains("server unreachable"));
            }
            other => panic!("expected BudgetExhausted, got {other:?}"),
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn terminal_failure_never_retries() {
        let store = InMemoryJobStore::arc();
        let runs = Arc::new(AtomicU32::new(0));
        let runs_in = Arc::clone(&runs);

        let q = queue(store.clone(), QueueOptions::default(), move |_, _| {
            runs_in.fetch_add(1, Ordering::SeqCst);
            JobResult::Failure(anyhow!("payload rejected by server"))
        });

        let ticket = q.add(ping(1)).await.unwrap();
        let err = ticket.wait().await.unwrap_err();

        assert!(matches!(err, JobError::Fatal(_)));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn the_final_attempt_is_flagged() {
        let store = InMemoryJobStore::arc();
        let contexts: Arc<Mutex<Vec<RunContext>>> = Arc::new(Mutex::new(Vec::new()));
        let contexts_in = Arc::clone(&contexts);

        let q = queue(store.clone(), short_budget(), move |_, ctx| {
            contexts_in.lock().unwrap().push(*ctx);
            JobResult::NeedsRetry(anyhow!("still failing"))
        });

        let ticket = q.add(ping(1)).await.unwrap();
        let _ = ticket.wait().await;

        let contexts = contexts.lock().unwrap();
        assert_eq!(contexts.len(), 4);
        assert!(contexts[..3].iter().all(|c| !c.is_final_attempt));
        assert!(contexts[3].is_final_attempt);
    }

    #[tokio::test(start_paused = true)]
    async fn same_lane_jobs_start_in_enqueue_order() {
        let store = InMemoryJobStore::arc();
        let starts: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let starts_in = Arc::clone(&starts);

        let q = queue(
            store.clone(),
            QueueOptions {
                lane_policy: LanePolicy::PerKey,
                ..QueueOptions::default()
            },
            move |data, _| {
                starts_in.lock().unwrap().push(data.n);
                JobResult::Success
            },
        );

        let mut tickets = Vec::new();
        for n in 0..4 {
            tickets.push(
                q.add(Ping {
                    n,
                    lane: "conversation-a".to_string(),
                })
                .await
                .unwrap(),
            );
        }
        for ticket in tickets {
            ticket.wait().await.unwrap();
        }

        assert_eq!(*starts.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn resume_runs_a_persisted_job_exactly_once() {
        let store = InMemoryJobStore::arc();
        let runs = Arc::new(AtomicU32::new(0));

        // Persist a row directly, as if the process died right after `add`.
        let record = JobRecord::new(
            "test-jobs",
            serde_json::to_value(ping(7)).unwrap(),
        );
        store.insert(&record).await.unwrap();

        let runs_in = Arc::clone(&runs);
        let q = queue(store.clone(), QueueOptions::default(), move |data, _| {
            assert_eq!(data.n, 7);
            runs_in.fetch_add(1, Ordering::SeqCst);
            JobResult::Success
        });

        assert_eq!(q.resume().await.unwrap(), 1);

        for _ in 0..1_000 {
            if store.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(store.is_empty());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn resume_deletes_unparseable_rows() {
        let store = InMemoryJobStore::arc();
        let runs = Arc::new(AtomicU32::new(0));
        let runs_in = Arc::clone(&runs);

        let record = JobRecord::new("test-jobs", serde_json::json!({"not": "a ping"}));
        store.insert(&record).await.unwrap();

        let q = queue(store.clone(), QueueOptions::default(), move |_, _| {
            runs_in.fetch_add(1, Ordering::SeqCst);
            JobResult::Success
        });

        assert_eq!(q.resume().await.unwrap(), 0);
        assert!(store.is_empty());
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn resume_continues_from_the_stored_attempt_count() {
        let store = InMemoryJobStore::arc();
        let attempts_seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_in = Arc::clone(&attempts_seen);

        let mut record = JobRecord::new(
            "test-jobs",
            serde_json::to_value(ping(1)).unwrap(),
        );
        record.attempts = 2;
        store.insert(&record).await.unwrap();

        let q = queue(store.clone(), QueueOptions::default(), move |_, ctx| {
            seen_in.lock().unwrap().push(ctx.attempt);
            JobResult::Success
        });

        q.resume().await.unwrap();
        for _ in 0..1_000 {
            if store.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(*attempts_seen.lock().unwrap(), vec![3]);
    }
}
