//! Wire transport boundary.
//!
//! Framing, authentication, and message encryption all live behind this
//! trait; the queues only need to send things and classify what went wrong.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::delivery::OutgoingMessage;
use crate::receipts::Receipt;

/// Transport failure, split by how the queues should react.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// The recipient no longer exists (account deleted, conversation gone).
    #[error("recipient is no longer reachable: {0}")]
    UnknownRecipient(String),

    /// The server understood the request and refused it.
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl TransportError {
    /// Whether a later attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout | Self::RateLimited { .. }
        )
    }
}

/// Protocol client the background work sends through.
#[async_trait]
pub trait MessageTransport: Send + Sync + 'static {
    async fn send_message(&self, message: &OutgoingMessage) -> Result<(), TransportError>;

    async fn send_receipts(&self, receipts: &[Receipt]) -> Result<(), TransportError>;

    /// Re-verify the account's identity binding with the server.
    async fn check_identity(&self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(TransportError::Network("reset".into()).is_retryable());
        assert!(TransportError::Timeout.is_retryable());
        assert!(
            TransportError::RateLimited {
                retry_after: Some(Duration::from_secs(30))
            }
            .is_retryable()
        );
        assert!(!TransportError::UnknownRecipient("gone".into()).is_retryable());
        assert!(!TransportError::Rejected("bad proto".into()).is_retryable());
    }
}
