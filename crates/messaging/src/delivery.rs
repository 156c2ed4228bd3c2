//! Outgoing message delivery queue.
//!
//! Sends are the one piece of background work that must never be lost and
//! must stay in order per conversation: each conversation gets its own
//! single-concurrency lane, and a send keeps retrying transient transport
//! failures for up to a day before the conversation is told it failed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use courier_core::{ConversationId, DomainError, MessageId};
use courier_jobs::{
    BackoffPolicy, JobHandler, JobQueue, JobResult, JobStore, LanePolicy, QueueOptions,
    RunContext,
};

use crate::transport::{MessageTransport, TransportError};

/// How long a send keeps retrying before it is reported failed.
pub const MAX_SEND_RETRY_TIME: Duration = Duration::from_secs(24 * 60 * 60);

/// An already-sealed message waiting to leave the device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    /// Sealed message content; opaque to the queue.
    pub content: Vec<u8>,
    /// Urgent sends bypass server-side delivery batching hints.
    #[serde(default)]
    pub urgent: bool,
}

/// Delivery strategy plugged into the generic queue engine.
pub struct MessageDeliveryHandler<X> {
    transport: Arc<X>,
}

#[async_trait]
impl<X: MessageTransport> JobHandler for MessageDeliveryHandler<X> {
    const QUEUE_TYPE: &'static str = "message-delivery";
    type Data = OutgoingMessage;

    fn parse(&self, payload: &serde_json::Value) -> Result<OutgoingMessage, DomainError> {
        let message: OutgoingMessage = serde_json::from_value(payload.clone())
            .map_err(|e| DomainError::validation(format!("outgoing message: {e}")))?;
        if message.content.is_empty() {
            return Err(DomainError::validation("outgoing message has empty content"));
        }
        Ok(message)
    }

    fn lane_key(&self, data: &OutgoingMessage) -> String {
        // One lane per conversation: sends leave in enqueue order per peer.
        data.conversation_id.to_string()
    }

    async fn run(&self, message: &OutgoingMessage, ctx: &RunContext) -> JobResult {
        debug!(
            message_id = %message.message_id,
            conversation_id = %message.conversation_id,
            attempt = ctx.attempt,
            "sending message"
        );

        match self.transport.send_message(message).await {
            Ok(()) => JobResult::Success,
            Err(TransportError::UnknownRecipient(who)) => {
                // Nothing left to deliver to; done rather than failed.
                info!(
                    message_id = %message.message_id,
                    recipient = %who,
                    "recipient gone, dropping send"
                );
                JobResult::Success
            }
            Err(TransportError::RateLimited {
                retry_after: Some(wait),
            }) if wait > ctx.time_remaining => {
                // The server's cool-down outlives our budget; waiting it out
                // cannot help.
                JobResult::Failure(anyhow::anyhow!(
                    "rate limited for {wait:?}, beyond the remaining retry budget"
                ))
            }
            Err(err) if err.is_retryable() => JobResult::NeedsRetry(err.into()),
            Err(err) => JobResult::Failure(err.into()),
        }
    }
}

/// Build the delivery queue over the given store and transport.
pub fn message_delivery_queue<X: MessageTransport>(
    store: Arc<dyn JobStore>,
    transport: Arc<X>,
) -> JobQueue<MessageDeliveryHandler<X>> {
    JobQueue::new(
        MessageDeliveryHandler { transport },
        store,
        QueueOptions {
            max_retry_time: MAX_SEND_RETRY_TIME,
            lane_policy: LanePolicy::PerKey,
            backoff: BackoffPolicy::default(),
        },
    )
}
