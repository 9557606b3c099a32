//! Shared identifier types used across the session saga workspace.

mod types;

pub use types::{ClassId, HoldId, LedgerEntryId, SessionId, SlotId, UserId};
