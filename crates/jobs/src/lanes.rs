//! In-memory execution lanes.
//!
//! A lane is an ordered admission point: jobs submitted to the same lane
//! start in submission order, with at most `parallelism` running at once.
//! Completion order is unconstrained. Different lanes are fully independent,
//! so a job sleeping through its backoff delay holds only its own slot.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::{Semaphore, mpsc};
use tracing::error;

pub(crate) type LaneJob = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// How a queue maps jobs onto lanes. Fixed at queue construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanePolicy {
    /// All jobs share one lane with at most `parallelism` running at once.
    Shared { parallelism: usize },
    /// One single-concurrency lane per key: strict FIFO per key, distinct
    /// keys run concurrently.
    PerKey,
}

pub(crate) struct Lanes {
    policy: LanePolicy,
    lanes: Mutex<HashMap<String, mpsc::UnboundedSender<LaneJob>>>,
}

impl Lanes {
    pub(crate) fn new(policy: LanePolicy) -> Self {
        Self {
            policy,
            lanes: Mutex::new(HashMap::new()),
        }
    }

    /// Submit a job to its lane. Lanes are created lazily; submission order
    /// is admission order.
    pub(crate) fn submit(&self, key: &str, job: LaneJob) {
        let (key, parallelism) = match self.policy {
            LanePolicy::Shared { parallelism } => ("", parallelism),
            LanePolicy::PerKey => (key, 1),
        };

        let mut lanes = self.lanes.lock().unwrap();
        let tx = lanes
            .entry(key.to_string())
            .or_insert_with(|| spawn_lane(parallelism));
        if tx.send(job).is_err() {
            // Only reachable if the dispatcher task died with the runtime.
            error!(lane = key, "lane dispatcher is gone, dropping job");
        }
    }
}

/// Spawn a lane dispatcher: pulls jobs in FIFO order and starts each one
/// once a permit is free.
fn spawn_lane(parallelism: usize) -> mpsc::UnboundedSender<LaneJob> {
    let (tx, mut rx) = mpsc::unbounded_channel::<LaneJob>();
    let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));

    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            tokio::spawn(async move {
                job.await;
                drop(permit);
            });
        }
    });

    tx
}
