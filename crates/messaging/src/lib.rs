//! `courier-messaging` — concrete background work for the messaging client.
//!
//! Binds the generic machinery in `courier-jobs` to the messaging domain:
//! the outgoing message delivery queue (per-conversation ordering, 24h retry
//! budget), receipt coalescing, and the routine identity check. The wire
//! protocol itself lives behind the [`MessageTransport`] boundary.

pub mod checks;
pub mod delivery;
pub mod receipts;
pub mod transport;

pub use checks::spawn_identity_check;
pub use delivery::{MAX_SEND_RETRY_TIME, MessageDeliveryHandler, OutgoingMessage, message_delivery_queue};
pub use receipts::{Receipt, ReceiptKind, receipt_batcher};
pub use transport::{MessageTransport, TransportError};
