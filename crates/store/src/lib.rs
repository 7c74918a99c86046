//! Storage layer for chatwire.
//!
//! Holds the server-side conversation aggregates: conversation summaries,
//! their ordered message logs, unread counters and per-user settings. All
//! state lives in process memory behind a single lock per store, so every
//! operation is atomic at the aggregate level.

pub mod entities;
pub mod repository;
#[cfg(test)]
mod test_utils;

pub use repository::ConversationRepository;
