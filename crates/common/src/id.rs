//! ID generation utilities.

use ulid::Ulid;
use uuid::Uuid;

/// Prefix that marks a client-generated placeholder ID.
pub const TEMP_ID_PREFIX: &str = "tmp-";

/// Returns whether an ID is a client-generated placeholder awaiting
/// confirmation by the server.
#[must_use]
pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// ID generator for entities.
#[derive(Debug, Clone, Default)]
pub struct IdGenerator {
    _private: (),
}

impl IdGenerator {
    /// Create a new ID generator.
    #[must_use]
    pub const fn new() -> Self {
        Self { _private: () }
    }

    /// Generate a new ULID-based ID.
    ///
    /// ULIDs are:
    /// - Lexicographically sortable
    /// - Monotonically increasing within the same millisecond
    /// - Shorter than UUIDs when represented as strings
    #[must_use]
    pub fn generate(&self) -> String {
        Ulid::new().to_string().to_lowercase()
    }

    /// Generate a placeholder ID for an optimistically appended entity.
    ///
    /// Placeholder IDs are replaced by server-assigned IDs once the write
    /// is confirmed, and never collide with them.
    #[must_use]
    pub fn generate_temp(&self) -> String {
        format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4().simple())
    }

    /// Generate a cryptographically secure random token.
    #[must_use]
    pub fn generate_token(&self) -> String {
        // Use UUID v4 for tokens (no time component for security)
        Uuid::new_v4().simple().to_string()
    }
}
