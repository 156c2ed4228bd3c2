//! `courier-jobs` — durable background work for the courier client.
//!
//! ## Design
//!
//! - Jobs are typed, validated, and persisted before they are scheduled:
//!   `add` returning means the work survives a process kill at any point
//! - Retries use exponential backoff inside a wall-clock budget anchored at
//!   enqueue time; the attempt budget is derived from the same curve
//! - At startup each queue reloads its persisted rows and resumes them as
//!   if freshly enqueued
//! - Lanes bound concurrency; per-key lanes give strict per-entity ordering
//! - A wait batcher coalesces bursts of small writes into bulk operations
//! - Recurring checks run on a persisted cadence instead of re-firing on
//!   every launch
//!
//! ## Components
//!
//! - [`JobQueue`]: the generic engine, parameterized by a [`JobHandler`]
//! - [`BackoffPolicy`]: pure delay/attempt-budget policy
//! - [`JobStore`] / [`CheckpointStore`]: persistence contracts, with
//!   [`InMemoryJobStore`] and [`SqliteJobStore`] implementations
//! - [`CheckScheduler`]: recurring checks with a persisted cursor
//! - [`WaitBatcher`] / [`BatcherRegistry`]: write coalescing and shutdown
//!   flushing

pub mod backoff;
pub mod batcher;
pub mod lanes;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod sqlite;
pub mod store;
pub mod types;


pub use backoff::BackoffPolicy;
pub use batcher::{BatchError, BatchTicket, BatcherOptions, WaitBatcher};
pub use lanes::LanePolicy;
pub use queue::{EnqueueError, JobHandler, JobQueue, JobTicket, QueueOptions};
pub use registry::{BatcherRegistry, Flushable};
pub use scheduler::{CheckHandle, CheckScheduler};
pub use sqlite::SqliteJobStore;
pub use store::{CheckpointStore, InMemoryJobStore, JobStore, JobStoreError};
pub use types::{JobError, JobId, JobRecord, JobResult, ParsedJob, RunContext};
