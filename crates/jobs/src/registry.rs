//! Owned registry of live batchers.
//!
//! The process lifecycle owner creates one registry, hands it to whatever
//! wires up batchers, and calls [`BatcherRegistry::flush_all`] on shutdown
//! so no buffered write is lost to an orderly exit. It is an explicit owned
//! object, not ambient global state.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use crate::batcher::WaitBatcher;

/// Anything the registry can flush on shutdown.
#[async_trait]
pub trait Flushable: Send + Sync {
    fn name(&self) -> &'static str;

    /// Force out everything buffered and wait for it to complete.
    async fn flush(&self);
}

#[async_trait]
impl<T: Send + 'static> Flushable for WaitBatcher<T> {
    fn name(&self) -> &'static str {
        WaitBatcher::name(self)
    }

    async fn flush(&self) {
        self.flush_and_wait().await;
    }
}

/// Registry of live batchers, flushed together on shutdown.
#[derive(Default)]
pub struct BatcherRegistry {
    batchers: Mutex<Vec<Arc<dyn Flushable>>>,
}

impl BatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, batcher: Arc<dyn Flushable>) {
        self.batchers.lock().unwrap().push(batcher);
    }

    /// Drop a batcher from the registry. Removing an unknown name is a
    /// no-op.
    pub fn unregister(&self, name: &str) {
        self.batchers.lock().unwrap().retain(|b| b.name() != name);
    }

    pub fn len(&self) -> usize {
        self.batchers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush every registered batcher, in registration order. Processing
    /// failures are reported to the batch tickets and logged by the batcher
    /// itself; shutdown proceeds regardless.
    pub async fn flush_all(&self) {
        let batchers: Vec<_> = self.batchers.lock().unwrap().clone();
        for batcher in batchers {
            debug!(batcher = batcher.name(), "flushing on shutdown");
            batcher.flush().await;
        }
    }
}
