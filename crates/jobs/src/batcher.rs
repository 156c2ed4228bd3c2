//! Time/size-triggered write coalescing.
//!
//! A [`WaitBatcher`] turns many small "add one item" calls into fewer bulk
//! `process` calls, flushing on whichever comes first: the batch reaching
//! `max_size`, or `wait` elapsing since the first item of the batch. Batches
//! are handed to a single worker, so at most one `process` call is in flight
//! and batches complete in the order they were cut.
//!
//! Batchers smooth throughput; they are not durable. Anything that must
//! survive a crash belongs in the job queue instead.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Batcher behaviour, fixed at construction.
#[derive(Debug, Clone)]
pub struct BatcherOptions {
    /// Name used in logs and for registry lookups.
    pub name: &'static str,
    /// How long the first item of a batch waits before the batch is cut.
    pub wait: Duration,
    /// Cut the batch immediately once it holds this many items.
    pub max_size: usize,
}

/// Error delivered to every ticket of a failed batch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BatchError {
    #[error("batch processing failed: {0}")]
    Processing(String),
    #[error("batcher shut down before the batch completed")]
    Closed,
}

/// Ticket resolving when the item's batch has been processed.
#[derive(Debug)]
pub struct BatchTicket {
    done: oneshot::Receiver<Result<(), BatchError>>,
}

impl BatchTicket {
    pub async fn wait(self) -> Result<(), BatchError> {
        self.done.await.unwrap_or(Err(BatchError::Closed))
    }
}

struct Holder<T> {
    item: T,
    done: oneshot::Sender<Result<(), BatchError>>,
}

enum Work<T> {
    Batch(Vec<Holder<T>>),
    Noop(oneshot::Sender<()>),
}

struct OpenBatch<T> {
    items: Vec<Holder<T>>,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every flush so a stale timer cannot cut the next batch.
    generation: u64,
}

/// Coalesces items into bulk `process` calls.
pub struct WaitBatcher<T: Send + 'static> {
    name: &'static str,
    wait: Duration,
    max_size: usize,
    open: Arc<Mutex<OpenBatch<T>>>,
    work_tx: mpsc::UnboundedSender<Work<T>>,
}

impl<T: Send + 'static> WaitBatcher<T> {
    pub fn new<F, Fut>(options: BatcherOptions, process: F) -> Arc<Self>
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        tokio::spawn(worker(options.name, work_rx, process));

        Arc::new(Self {
            name: options.name,
            wait: options.wait,
            max_size: options.max_size.max(1),
            open: Arc::new(Mutex::new(OpenBatch {
                items: Vec::new(),
                timer: None,
                generation: 0,
            })),
            work_tx,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Append an item to the open batch. The item is enqueued before this
    /// returns; the ticket resolves once its batch has been processed.
    ///
    /// The first item of a batch arms the wait timer; later items never
    /// reset it, so no item waits longer than `wait` however busy the
    /// producer is.
    pub fn add(&self, item: T) -> BatchTicket {
        let (done_tx, done_rx) = oneshot::channel();

        let full = {
            let mut open = self.open.lock().unwrap();
            open.items.push(Holder {
                item,
                done: done_tx,
            });
            if open.items.len() >= self.max_size {
                if let Some(timer) = open.timer.take() {
                    timer.abort();
                }
                open.generation += 1;
                Some(std::mem::take(&mut open.items))
            } else {
                if open.items.len() == 1 {
                    self.arm_timer(&mut open);
                }
                None
            }
        };

        if let Some(batch) = full {
            let _ = self.work_tx.send(Work::Batch(batch));
        }

        BatchTicket { done: done_rx }
    }

    fn arm_timer(&self, open: &mut OpenBatch<T>) {
        let generation = open.generation;
        let open_ref = Arc::clone(&self.open);
        let work_tx = self.work_tx.clone();
        let wait = self.wait;

        open.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let batch = {
                let mut open = open_ref.lock().unwrap();
                if open.generation != generation || open.items.is_empty() {
                    return;
                }
                open.generation += 1;
                open.timer = None;
                std::mem::take(&mut open.items)
            };
            let _ = work_tx.send(Work::Batch(batch));
        }));
    }

    /// Cut the open batch (if any) onto the work queue, cancelling its
    /// timer.
    fn flush_open(&self) {
        let batch = {
            let mut open = self.open.lock().unwrap();
            if let Some(timer) = open.timer.take() {
                timer.abort();
            }
            open.generation += 1;
            if open.items.is_empty() {
                return;
            }
            std::mem::take(&mut open.items)
        };
        let _ = self.work_tx.send(Work::Batch(batch));
    }

    /// Barrier: resolves once every batch handed to the worker so far has
    /// completed. Does not force a not-yet-triggered batch to flush.
    pub async fn on_idle(&self) {
        let (tx, rx) = oneshot::channel();
        if self.work_tx.send(Work::Noop(tx)).is_err() {
            return;
        }
        let _ = rx.await;
    }

    /// Flush the open batch, then wait for the worker to clear it.
    pub async fn push_noop_and_wait(&self) {
        self.flush_open();
        self.on_idle().await;
    }

    /// Force out everything buffered and return only when the worker is
    /// fully idle and nothing is left waiting. For orderly shutdown.
    pub async fn flush_and_wait(&self) {
        loop {
            self.flush_open();
            self.on_idle().await;
            if self.open.lock().unwrap().items.is_empty() {
                return;
            }
        }
    }
}

/// Single worker: at most one batch in flight, in cut order.
async fn worker<T, F, Fut>(name: &'static str, mut rx: mpsc::UnboundedReceiver<Work<T>>, process: F)
where
    F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    while let Some(work) = rx.recv().await {
        match work {
            Work::Batch(holders) => {
                let mut items = Vec::with_capacity(holders.len());
                let mut tickets = Vec::with_capacity(holders.len());
                for holder in holders {
                    items.push(holder.item);
                    tickets.push(holder.done);
                }

                let count = items.len();
                match process(items).await {
                    Ok(()) => {
                        debug!(batcher = name, count, "batch processed");
                        for ticket in tickets {
                            let _ = ticket.send(Ok(()));
                        }
                    }
                    Err(err) => {
                        warn!(batcher = name, count, error = ?err, "batch processing failed");
                        let message = format!("{err:#}");
                        for ticket in tickets {
                            let _ = ticket.send(Err(BatchError::Processing(message.clone())));
                        }
                    }
                }
            }
            Work::Noop(ack) => {
                let _ = ack.send(());
            }
        }
    }
}
