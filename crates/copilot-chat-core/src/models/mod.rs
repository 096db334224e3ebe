//! Data models for conversations and requests.
//!
//! - `Message`, `Role`, `Attachment`: immutable conversation turns
//! - `ContextBudget`: per-model token limits for one request
//! - `AssembledRequest`: the trimmed payload handed to the chat client

pub mod message;
pub mod request;

pub use message::{Attachment, Message, Role};
pub use request::{AssembledRequest, ContextBudget};
