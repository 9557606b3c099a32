//! Domain layer for session scheduling and settlement.
//!
//! This crate provides:
//! - The session model and its status state machine
//! - Integration event payloads and their catalog declarations
//! - Settlement rules (consumption quantity, money)

pub mod error;
pub mod events;
pub mod session;
pub mod settlement;

pub use error::DomainError;
pub use events::{
    AiCareerSessionCreated, ClassSessionCreated, CommSessionCreated, GapAnalysisSessionCreated,
    MeetingLifecycleCompleted, MeetingOperation, MeetingOperationResult, NotifyRole,
    OperationStatus, RegularMentoringSessionCreated, ServiceSessionCompleted, SessionCancelled,
    SessionCreatedData, SessionRescheduled, producers, register_event_catalog,
    session_created_event_type,
};
pub use session::{MeetingLink, MeetingProvider, SessionKind, SessionRecord, SessionStatus};
pub use settlement::{Money, consumption_quantity};
