//! `courier-core` — domain foundation building blocks.
//!
//! Pure domain primitives shared by the rest of the workspace: strongly-typed
//! identifiers and the domain error model. No infrastructure concerns.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{ConversationId, MessageId};
