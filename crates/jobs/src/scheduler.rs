//! Recurring checks on a persisted cadence.
//!
//! A [`CheckScheduler`] wraps a named recurring check (say, a daily identity
//! re-verification) and persists its last-run instant under a storage key.
//! On startup the next run is scheduled relative to the persisted cursor
//! instead of firing immediately on every launch. After each run, successful
//! or not, the cursor is advanced and the check is rescheduled a full
//! interval later.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::store::CheckpointStore;

/// A named recurring check with a persisted cadence.
pub struct CheckScheduler {
    storage_key: &'static str,
    interval: Duration,
    store: Arc<dyn CheckpointStore>,
}

/// Handle to stop a running check loop.
#[derive(Debug)]
pub struct CheckHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl CheckHandle {
    /// Request shutdown and wait for the loop to stop.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

impl CheckScheduler {
    pub fn new(
        storage_key: &'static str,
        interval: Duration,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            storage_key,
            interval,
            store,
        }
    }

    /// Spawn the check loop. The first run fires after
    /// `max(0, interval - elapsed_since_last_run)`; a missing cursor means
    /// the check is due immediately.
    pub fn spawn<F, Fut>(self, check: F) -> CheckHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let join = tokio::spawn(self.run_loop(check, shutdown_rx));
        CheckHandle {
            shutdown: Some(shutdown_tx),
            join: Some(join),
        }
    }

    async fn run_loop<F, Fut>(self, mut check: F, mut shutdown_rx: oneshot::Receiver<()>)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut delay = self.initial_delay().await;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = &mut shutdown_rx => {
                    debug!(check = self.storage_key, "check loop stopped");
                    return;
                }
            }

            debug!(check = self.storage_key, "running check");
            if let Err(err) = check().await {
                warn!(check = self.storage_key, error = ?err, "check failed");
            }

            // Advance the cursor even after a failure: a broken check must
            // neither spin tightly nor silently stop running.
            if let Err(err) = self.store.save_checkpoint(self.storage_key, Utc::now()).await {
                warn!(check = self.storage_key, error = %err, "failed to persist check cursor");
            }

            delay = self.interval;
        }
    }

    async fn initial_delay(&self) -> Duration {
        match self.store.load_checkpoint(self.storage_key).await {
            Ok(Some(last_run)) => {
                let elapsed = (Utc::now() - last_run).to_std().unwrap_or(Duration::ZERO);
                self.interval.saturating_sub(elapsed)
            }
            Ok(None) => Duration::ZERO,
            Err(err) => {
                warn!(
                    check = self.storage_key,
                    error = %err,
                    "failed to load check cursor, treating the check as due"
                );
                Duration::ZERO
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryJobStore;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    #[tokio::test(start_paused = true)]
    async fn overdue_check_fires_immediately() {
        let store = InMemoryJobStore::arc();
        // Last run 30 hours ago on a 24-hour cadence: already overdue.
        store
            .save_checkpoint("identity", Utc::now() - chrono::Duration::hours(30))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = CheckScheduler::new("identity", DAY, store).spawn(move || {
            let tx = tx.clone();
            async move {
                let _ = tx.send(());
                Ok(())
            }
        });

        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("overdue check should fire without waiting a full interval");
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_cursor_waits_out_the_interval() {
        let store = InMemoryJobStore::arc();
        store
            .save_checkpoint("identity", Utc::now())
            .await
            .unwrap();

        let runs = Arc::new(AtomicU32::new(0));
        let runs_in = Arc::clone(&runs);
        let handle =
            CheckScheduler::new("identity", DAY, store).spawn(move || {
                let runs = Arc::clone(&runs_in);
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });

        // Well inside the interval nothing should have fired. Paused time
        // only advances while we sleep, so an hour here stays an hour short
        // of the cadence.
        tokio::time::sleep(Duration::from_secs(60 * 60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failing_check_still_advances_and_reschedules() {
        let store = InMemoryJobStore::arc();
        let runs = Arc::new(AtomicU32::new(0));
        let runs_in = Arc::clone(&runs);

        let interval = Duration::from_millis(100);
        let handle = CheckScheduler::new("flaky", interval, store.clone()).spawn(move || {
            let runs = Arc::clone(&runs_in);
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Err(anyhow!("verification endpoint is down"))
            }
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        handle.shutdown().await;

        // Ran more than once (no silent stop), with the cursor persisted.
        assert!(runs.load(Ordering::SeqCst) >= 2);
        assert!(store.load_checkpoint("flaky").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_the_loop() {
        let store = InMemoryJobStore::arc();
        let runs = Arc::new(AtomicU32::new(0));
        let runs_in = Arc::clone(&runs);

        let handle = CheckScheduler::new("stoppable", Duration::from_millis(50), store)
            .spawn(move || {
                let runs = Arc::clone(&runs_in);
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });

        tokio::time::sleep(Duration::from_millis(120)).await;
        handle.shutdown().await;
        let after = runs.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after);
    }
}
