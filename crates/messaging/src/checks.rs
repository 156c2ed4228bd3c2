//! Routine account integrity checks.

use std::sync::Arc;
use std::time::Duration;

use courier_jobs::{CheckHandle, CheckScheduler, CheckpointStore};

use crate::transport::MessageTransport;

pub const IDENTITY_CHECK_KEY: &str = "identity-check";
pub const IDENTITY_CHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Spawn the daily identity re-verification.
///
/// The cadence is persisted under [`IDENTITY_CHECK_KEY`], so a client
/// restarted five minutes after its last check waits out the rest of the
/// day instead of re-verifying on every launch, while one restarted after a
/// week offline verifies immediately.
pub fn spawn_identity_check<X: MessageTransport>(
    store: Arc<dyn CheckpointStore>,
    transport: Arc<X>,
) -> CheckHandle {
    CheckScheduler::new(IDENTITY_CHECK_KEY, IDENTITY_CHECK_INTERVAL, store).spawn(move || {
        let transport = Arc::clone(&transport);
        async move {
            transport
                .check_identity()
                .await
                .map_err(anyhow::Error::from)
        }
    })
}
