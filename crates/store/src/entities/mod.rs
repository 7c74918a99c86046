//! Entity models for the conversation store.

pub mod conversation;
pub mod message;
