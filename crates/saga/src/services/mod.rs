//! Collaborator traits consumed by the sagas, with in-memory implementations.
//!
//! Each in-memory implementation keeps its state behind an `Arc<RwLock<_>>`
//! and exposes failure toggles and inspection helpers for tests.

pub mod billing;
pub mod calendar;
pub mod conferencing;
pub mod contract;
pub mod identity;
pub mod membership;
pub mod sessions;

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use billing::{
    BillingEntry, BillingService, InMemoryBillingService, MentorPrice, PerSessionBilling,
};
pub use calendar::{
    CalendarError, CalendarService, InMemoryCalendarService, Slot, SlotLink, SlotRequest,
    SlotStatus,
};
pub use conferencing::{
    ConferencingClient, ConferencingProviders, CreateMeetingRequest, InMemoryConferencingClient,
    MeetingInfo, MeetingUpdate,
};
pub use contract::{
    ConsumptionRecord, ContractService, Hold, HoldKey, HoldStatus, InMemoryContractService,
    LedgerEntry, NewHold, release_reasons,
};
pub use identity::{IdentityService, InMemoryIdentityService};
pub use membership::{ClassMembership, InMemoryClassMembership};
pub use sessions::{InMemorySessionRepository, SessionRepository};

// In-memory state stays usable after a panicking test thread.
pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
