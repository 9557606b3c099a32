//! Saga orchestration for session scheduling and settlement.
//!
//! This crate coordinates the side effects of a session's lifecycle across
//! the conferencing provider, the calendar, the entitlement ledger and mentor
//! billing:
//!
//! - [`SessionScheduler`] books a session and announces it
//! - [`SessionProvisioningSaga`] creates and links the meeting, compensating on failure
//! - [`MeetingChangeSaga`] propagates reschedules and cancellations
//! - [`MeetingCompletionHandler`] turns "meeting ended" into "session completed"
//! - [`SessionEndSaga`] settles calendar, consumption and billing
//!
//! Local writes that must be atomic go through a [`SagaExecutionContext`];
//! provider calls are retried with [`RetryPolicy`].

pub mod base;
pub mod compensation;
pub mod completion;
pub mod config;
pub mod context;
pub mod error;
pub mod meeting_change;
pub mod postgres;
pub mod provisioning;
pub mod retry;
pub mod scheduling;
pub mod services;
pub mod session_end;
pub mod wiring;

pub use base::{SagaBase, SagaDependencies};
pub use compensation::CompensationResult;
pub use completion::{CompletionOutcome, MeetingCompletionHandler};
pub use config::SagaConfig;
pub use context::{InMemoryTransactionManager, SagaExecutionContext, TransactionManager};
pub use error::{Result, SagaError};
pub use meeting_change::{ChangeOutcome, MeetingChangeSaga};
pub use postgres::{PgTransactionManager, PostgresContractService};
pub use provisioning::{
    ProvisioningOutcome, SessionProvisioningSaga, SkipReason, decode_session_created,
};
pub use retry::RetryPolicy;
pub use scheduling::{SessionRequest, SessionScheduler};
pub use session_end::{
    BillingOutcome, CalendarOutcome, ConsumptionOutcome, SessionEndSaga, SettlementOutcome,
    SettlementProgress,
};
pub use services::{
    BillingService, CalendarError, CalendarService, ClassMembership, ConferencingClient,
    ConferencingProviders, ContractService, IdentityService, InMemoryBillingService,
    InMemoryCalendarService, InMemoryClassMembership, InMemoryConferencingClient,
    InMemoryContractService, InMemoryIdentityService, InMemorySessionRepository, SessionRepository,
};
pub use wiring::Sagas;
