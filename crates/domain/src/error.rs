//! Domain error types.

use thiserror::Error;

/// Errors raised by domain rules.
///
/// These are rejected immediately: no side effect has happened yet, so there
/// is nothing to retry or compensate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    /// A required field was absent.
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// A duration was negative.
    #[error("Invalid duration for {field}: {minutes} minutes")]
    InvalidDuration { field: &'static str, minutes: i64 },

    /// Any other rule violation.
    #[error("Validation failed: {0}")]
    Validation(String),
}
