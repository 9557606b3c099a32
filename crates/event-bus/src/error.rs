use thiserror::Error;

/// Errors raised by the event catalog.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    /// A consumer was registered for an event type nobody declared.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// A second producer declared an event type with a different version.
    #[error(
        "Version conflict for {event_type}: registered {registered}, declared {declared}"
    )]
    VersionConflict {
        event_type: String,
        registered: String,
        declared: String,
    },
}

/// Errors that can occur when building, decoding or publishing events.
#[derive(Debug, Error)]
pub enum EventBusError {
    /// A required field was not set on the event builder.
    #[error("Incomplete event: missing {0}")]
    IncompleteEvent(&'static str),

    /// An event was decoded as a payload type it does not carry.
    #[error("Unexpected event type: expected {expected}, got {actual}")]
    UnexpectedEventType { expected: String, actual: String },

    /// The transport has been shut down.
    #[error("Event transport closed")]
    TransportClosed,

    /// One or more handlers failed for an event.
    #[error("Dispatch of {event_type} failed for {failed} handler(s)")]
    Dispatch { event_type: String, failed: usize },

    /// Catalog error.
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for event bus operations.
pub type Result<T> = std::result::Result<T, EventBusError>;
