pub mod binding;
pub mod contact;
pub mod conversation;
pub mod credential;
pub mod instance;
pub mod message;
pub mod tenant;

use uuid::Uuid;

/// Prefixed row identifier in the storage encoding used across all tables.
pub fn prefixed_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}
