//! Identifiers and tuning constants shared by the hearth store and client.

pub mod constants;
pub mod types;

pub use types::{ContainerId, MessageId, UserId};
