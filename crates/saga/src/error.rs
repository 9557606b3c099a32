//! Saga error types.

use chrono::{DateTime, Utc};
use common::{SessionId, UserId};
use domain::{DomainError, MeetingProvider, SessionStatus};
use event_bus::EventBusError;
use thiserror::Error;

use crate::services::calendar::CalendarError;

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// Domain validation failed; nothing was written.
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// Session not found.
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    /// Session moved out of the expected state under us.
    #[error("Session {session_id} is {status}, transition no longer applies")]
    StaleSession {
        session_id: SessionId,
        status: SessionStatus,
    },

    /// A calendar slot for this participant and time is already taken.
    #[error("Scheduling conflict for user {user_id} at {start}")]
    SlotConflict {
        user_id: UserId,
        start: DateTime<Utc>,
    },

    /// Conferencing provider call failed.
    #[error("Conferencing provider error: {0}")]
    Provider(String),

    /// Conferencing provider call did not answer in time.
    #[error("Conferencing provider timed out during {operation} after {timeout_ms}ms")]
    ProviderTimeout {
        operation: &'static str,
        timeout_ms: u128,
    },

    /// No client registered for the session's provider.
    #[error("No conferencing client configured for provider {0}")]
    ProviderNotConfigured(MeetingProvider),

    /// Calendar service error.
    #[error("Calendar error: {0}")]
    Calendar(#[from] CalendarError),

    /// Entitlement / ledger service error.
    #[error("Contract service error: {0}")]
    Contract(String),

    /// Billing service error.
    #[error("Billing service error: {0}")]
    Billing(String),

    /// Identity lookup error.
    #[error("Identity service error: {0}")]
    Identity(String),

    /// Billing cannot proceed without a rate.
    #[error("No active price for mentor {mentor_id} and session type {session_type_code}")]
    MentorPriceMissing {
        mentor_id: UserId,
        session_type_code: String,
    },

    /// Transaction handling failed.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Event bus error.
    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
