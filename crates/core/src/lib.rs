//! Core business logic for chatwire.

pub mod services;

pub use services::*;
