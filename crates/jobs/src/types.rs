//! Core job types shared by the engine and the stores.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Unique job identifier. The unit of idempotent retry: one row, one id,
/// deleted exactly once on terminal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The persisted shape of a job.
///
/// `timestamp` is set once at enqueue and never changes across retries; it
/// anchors the remaining-time budget. `attempts` is bumped as each run
/// starts. There is no status column: the row's existence is the status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub queue_type: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    pub attempts: u32,
}

impl JobRecord {
    /// Create a fresh record for enqueue: new id, `timestamp = now`, zero
    /// attempts.
    pub fn new(queue_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: JobId::new(),
            queue_type: queue_type.into(),
            timestamp: Utc::now(),
            payload,
            attempts: 0,
        }
    }
}

/// A job whose payload passed the queue's schema validation.
#[derive(Debug, Clone)]
pub struct ParsedJob<T> {
    pub id: JobId,
    pub timestamp: DateTime<Utc>,
    pub attempts: u32,
    pub data: T,
}

/// Per-attempt execution context handed to the handler.
#[derive(Debug, Clone, Copy)]
pub struct RunContext {
    /// 1-based attempt number, counted across restarts.
    pub attempt: u32,
    /// Wall-clock budget left, anchored at the original enqueue time.
    pub time_remaining: Duration,
    /// No further attempt will be scheduled after this one.
    pub is_final_attempt: bool,
}

/// Outcome of one execution attempt.
///
/// Retry-vs-terminal is decided here, at the type level. `NeedsRetry` is a
/// transient failure retried per backoff while budget remains; `Failure` is
/// terminal immediately. Conditions like "target no longer exists" should be
/// translated into `Success` without effect by the handler.
#[derive(Debug)]
pub enum JobResult {
    Success,
    NeedsRetry(anyhow::Error),
    Failure(anyhow::Error),
}

/// Terminal failure reported to whoever holds the job's ticket.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    /// The engine gave up: the retry budget ran out on a transient failure.
    /// Synthesized by the engine, never by handlers.
    #[error("gave up after {attempts} attempts: {last_error}")]
    BudgetExhausted { attempts: u32, last_error: String },

    /// The handler reported a terminal failure.
    #[error("job failed: {0}")]
    Fatal(String),

    /// The queue went away before the job reached a terminal outcome.
    #[error("job queue shut down before the job finished")]
    QueueClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_record_starts_with_zero_attempts() {
        let record = JobRecord::new("test-queue", serde_json::json!({"k": "v"}));
        assert_eq!(record.attempts, 0);
        assert_eq!(record.queue_type, "test-queue");
    }

    #[test]
    fn job_id_serde_is_transparent() {
        let id = JobId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
    }

    #[test]
    fn record_round_trips_through_json() {
        let record = JobRecord::new("q", serde_json::json!({"n": 1}));
        let json = serde_json::to_string(&record).unwrap();
        let back: JobRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, record.id);
        assert_eq!(back.payload, record.payload);
    }
}
