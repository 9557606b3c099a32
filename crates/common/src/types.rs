use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declares a UUID-backed identifier newtype.
///
/// Each identifier gets its own type so a `SlotId` can never be passed where
/// a `SessionId` is expected, even though both are UUIDs on the wire.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates an identifier from an existing UUID.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

uuid_id!(
    /// Identifier of a scheduled session (any kind). Also used as the
    /// `related_booking_id` of holds and ledger entries.
    SessionId
);

uuid_id!(
    /// Identifier of a person: mentor, student or counselor.
    UserId
);

uuid_id!(
    /// Identifier of a reserved calendar slot.
    SlotId
);

uuid_id!(
    /// Identifier of an entitlement hold.
    HoldId
);

uuid_id!(
    /// Identifier of a class (group session roster owner).
    ClassId
);

uuid_id!(
    /// Identifier of a ledger entry.
    LedgerEntryId
);
