//! Receipt coalescing.
//!
//! Reading a conversation produces a flurry of per-message receipts; sending
//! each one as its own request would hammer the transport. A wait batcher
//! folds them into bulk sends: a batch goes out half a second after the
//! first receipt, or immediately at 64 receipts, whichever comes first.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use courier_core::{ConversationId, MessageId};
use courier_jobs::{BatcherOptions, BatcherRegistry, WaitBatcher};

use crate::transport::MessageTransport;

pub const RECEIPT_WAIT: Duration = Duration::from_millis(500);
pub const RECEIPT_MAX_BATCH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptKind {
    Delivery,
    Read,
}

/// A single delivery/read acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub kind: ReceiptKind,
}

/// Build the receipt batcher and register it for shutdown flushing.
pub fn receipt_batcher<X: MessageTransport>(
    transport: Arc<X>,
    registry: &BatcherRegistry,
) -> Arc<WaitBatcher<Receipt>> {
    let batcher = WaitBatcher::new(
        BatcherOptions {
            name: "receipts",
            wait: RECEIPT_WAIT,
            max_size: RECEIPT_MAX_BATCH,
        },
        move |receipts: Vec<Receipt>| {
            let transport = Arc::clone(&transport);
            async move {
                transport
                    .send_receipts(&receipts)
                    .await
                    .map_err(anyhow::Error::from)
            }
        },
    );
    registry.register(batcher.clone());
    batcher
}
