//! Job persistence contracts and the in-memory store.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{JobId, JobRecord};

/// Job store error.
#[derive(Debug, Clone, Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Durable job persistence consumed by the queue engine.
///
/// Durability contract: once `insert` returns, the job survives a process
/// kill and will be handed back by `get_all_for_queue` on the next startup.
/// Single-row atomicity is all that is required; there are no multi-row
/// transactions.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &JobRecord) -> Result<(), JobStoreError>;

    /// All persisted jobs for one queue, oldest first.
    async fn get_all_for_queue(
        &self,
        queue_type: &str,
    ) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Remove a finished job's row. Idempotent: deleting an absent row is
    /// not an error.
    async fn delete(&self, id: JobId) -> Result<(), JobStoreError>;

    /// Bump the persisted attempt counter as a run starts, so a restart
    /// resumes from the stored count.
    async fn record_attempt(&self, id: JobId, attempts: u32) -> Result<(), JobStoreError>;
}

/// Persisted "last run" cursors for recurring checks.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load_checkpoint(&self, key: &str) -> Result<Option<DateTime<Utc>>, JobStoreError>;

    async fn save_checkpoint(&self, key: &str, at: DateTime<Utc>) -> Result<(), JobStoreError>;
}

/// In-memory store for tests and ephemeral queues.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
    checkpoints: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of live rows (tests).
    pub fn len(&self) -> usize {
        self.jobs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.jobs.read().unwrap().contains_key(&id)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &JobRecord) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_all_for_queue(
        &self,
        queue_type: &str,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let mut rows: Vec<_> = jobs
            .values()
            .filter(|j| j.queue_type == queue_type)
            .cloned()
            .collect();
        rows.sort_by_key(|j| j.timestamp);
        Ok(rows)
    }

    async fn delete(&self, id: JobId) -> Result<(), JobStoreError> {
        self.jobs.write().unwrap().remove(&id);
        Ok(())
    }

    async fn record_attempt(&self, id: JobId, attempts: u32) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        match jobs.get_mut(&id) {
            Some(job) => {
                job.attempts = attempts;
                Ok(())
            }
            None => Err(JobStoreError::NotFound(id)),
        }
    }
}

#[async_trait]
impl CheckpointStore for InMemoryJobStore {
    async fn load_checkpoint(
        &self,
        key: &str,
    ) -> Result<Option<DateTime<Utc>>, JobStoreError> {
        Ok(self.checkpoints.read().unwrap().get(key).copied())
    }

    async fn save_checkpoint(&self, key: &str, at: DateTime<Utc>) -> Result<(), JobStoreError> {
        self.checkpoints.write().unwrap().insert(key.to_string(), at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_and_reload_in_enqueue_order() {
        let store = InMemoryJobStore::new();

        let first = JobRecord::new("q", serde_json::json!({"n": 1}));
        let second = JobRecord::new("q", serde_json::json!({"n": 2}));
        let other = JobRecord::new("other", serde_json::json!({}));

        store.insert(&second).await.unwrap();
        store.insert(&first).await.unwrap();
        store.insert(&other).await.unwrap();

        let rows = store.get_all_for_queue("q").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].timestamp <= rows[1].timestamp);
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let store = InMemoryJobStore::new();
        let job = JobRecord::new("q", serde_json::json!({}));

        store.insert(&job).await.unwrap();
        let err = store.insert(&job).await.unwrap_err();
        assert!(matches!(err, JobStoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = InMemoryJobStore::new();
        let job = JobRecord::new("q", serde_json::json!({}));

        store.insert(&job).await.unwrap();
        store.delete(job.id).await.unwrap();
        store.delete(job.id).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn record_attempt_updates_the_row() {
        let store = InMemoryJobStore::new();
        let job = JobRecord::new("q", serde_json::json!({}));

        store.insert(&job).await.unwrap();
        store.record_attempt(job.id, 3).await.unwrap();

        let rows = store.get_all_for_queue("q").await.unwrap();
        assert_eq!(rows[0].attempts, 3);
    }

    #[tokio::test]
    async fn checkpoint_round_trip() {
        let store = InMemoryJobStore::new();
        assert!(store.load_checkpoint("k").await.unwrap().is_none());

        let at = Utc::now();
        store.save_checkpoint("k", at).await.unwrap();
        assert_eq!(store.load_checkpoint("k").await.unwrap(), Some(at));
    }
}
