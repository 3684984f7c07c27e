//! Shared types, error definitions, and utilities used across all switchboard crates.

pub mod error;
pub mod phone;
pub mod types;

pub use error::{Error, FromMessage, Result};

/// Milliseconds since the Unix epoch. All persisted timestamps use this unit.
#[must_use]
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
