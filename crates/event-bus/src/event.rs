use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::catalog::PayloadSchema;
use crate::error::{EventBusError, Result};

/// Unique identifier for an integration event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an event ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A typed payload that travels as an [`IntegrationEvent`].
///
/// Every event type is a plain struct implementing this trait. The constants
/// are the dispatch key and the payload version; [`EventCatalog::declare`]
/// reads them at startup.
///
/// [`EventCatalog::declare`]: crate::EventCatalog::declare
pub trait EventDefinition: Serialize + DeserializeOwned + Send + Sync {
    /// Dispatch key, e.g. `"services.session.completed"`.
    const EVENT_TYPE: &'static str;

    /// Payload version.
    const VERSION: &'static str;

    /// Declared payload shape.
    fn schema() -> PayloadSchema;

    /// Human readable summary for governance listings.
    fn description() -> &'static str {
        ""
    }

    /// Whether new producers should stop emitting this event.
    fn deprecated() -> bool {
        false
    }
}

/// An event published across bounded contexts.
///
/// Created when a domain operation commits and immutable afterwards. Delivery
/// is at-least-once, so every consumer must tolerate seeing the same `id`
/// more than once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationEvent {
    /// The dispatch key.
    pub event_type: String,

    /// Payload version.
    pub version: String,

    /// Unique identifier for this event.
    pub id: EventId,

    /// When the event was created.
    pub timestamp: DateTime<Utc>,

    /// The event payload as JSON.
    pub payload: serde_json::Value,

    /// Additional metadata (correlation ids and the like).
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl IntegrationEvent {
    /// Creates a new event builder.
    pub fn builder() -> IntegrationEventBuilder {
        IntegrationEventBuilder::default()
    }

    /// Wraps a typed payload in a fresh event.
    pub fn from_definition<E: EventDefinition>(payload: &E) -> Result<Self> {
        IntegrationEvent::builder()
            .event_type(E::EVENT_TYPE)
            .version(E::VERSION)
            .payload(payload)?
            .build()
    }

    /// Returns true if this event carries the given payload type.
    pub fn is<E: EventDefinition>(&self) -> bool {
        self.event_type == E::EVENT_TYPE
    }

    /// Decodes the payload as `E`.
    ///
    /// Unknown payload fields are ignored so older consumers keep working when
    /// producers add fields.
    pub fn decode<E: EventDefinition>(&self) -> Result<E> {
        if !self.is::<E>() {
            return Err(EventBusError::UnexpectedEventType {
                expected: E::EVENT_TYPE.to_string(),
                actual: self.event_type.clone(),
            });
        }
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Builder for constructing integration events.
#[derive(Debug, Default)]
pub struct IntegrationEventBuilder {
    id: Option<EventId>,
    event_type: Option<String>,
    version: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    payload: Option<serde_json::Value>,
    metadata: HashMap<String, serde_json::Value>,
}

impl IntegrationEventBuilder {
    /// Sets the event ID. If not set, a new ID will be generated.
    pub fn id(mut self, id: EventId) -> Self {
        self.id = Some(id);
        self
    }

    /// Sets the event type.
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Sets the payload version.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Sets the timestamp. If not set, the current time will be used.
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Sets the payload from a serializable value.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    /// Sets the payload from a raw JSON value.
    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Adds a metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Builds the event, failing if the event type, version or payload is missing.
    pub fn build(self) -> Result<IntegrationEvent> {
        Ok(IntegrationEvent {
            event_type: self
                .event_type
                .ok_or(EventBusError::IncompleteEvent("event_type"))?,
            version: self.version.ok_or(EventBusError::IncompleteEvent("version"))?,
            id: self.id.unwrap_or_default(),
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            payload: self.payload.ok_or(EventBusError::IncompleteEvent("payload"))?,
            metadata: self.metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Ping {
        count: u32,
    }

    impl EventDefinition for Ping {
        const EVENT_TYPE: &'static str = "test.ping";
        const VERSION: &'static str = "1.0";

        fn schema() -> PayloadSchema {
            PayloadSchema::new().required("count")
        }
    }

    #[test]
    fn builder_requires_event_type() {
        let result = IntegrationEvent::builder()
            .version("1.0")
            .payload_raw(serde_json::json!({}))
            .build();
        assert!(matches!(
            result,
            Err(EventBusError::IncompleteEvent("event_type"))
        ));
    }

    #[test]
    fn builder_keeps_metadata() {
        let event = IntegrationEvent::builder()
            .event_type("test.ping")
            .version("1.0")
            .payload_raw(serde_json::json!({"count": 1}))
            .metadata("correlation_id", serde_json::json!("abc"))
            .build()
            .unwrap();

        assert_eq!(
            event.metadata.get("correlation_id"),
            Some(&serde_json::json!("abc"))
        );
    }

    #[test]
    fn decode_tolerates_unknown_fields() {
        let event = IntegrationEvent::builder()
            .event_type(Ping::EVENT_TYPE)
            .version(Ping::VERSION)
            .payload_raw(serde_json::json!({"count": 3, "addedLater": true}))
            .build()
            .unwrap();

        assert_eq!(event.decode::<Ping>().unwrap(), Ping { count: 3 });
    }

    #[test]
    fn decode_rejects_other_event_types() {
        let event = IntegrationEvent::builder()
            .event_type("test.other")
            .version("1.0")
            .payload_raw(serde_json::json!({"count": 3}))
            .build()
            .unwrap();

        assert!(matches!(
            event.decode::<Ping>(),
            Err(EventBusError::UnexpectedEventType { .. })
        ));
    }

    #[test]
    fn from_definition_sets_type_and_version() {
        let event = IntegrationEvent::from_definition(&Ping { count: 7 }).unwrap();
        assert_eq!(event.event_type, "test.ping");
        assert_eq!(event.version, "1.0");
        assert!(event.is::<Ping>());
    }

    #[test]
    fn envelope_uses_camel_case_on_the_wire() {
        let event = IntegrationEvent::from_definition(&Ping { count: 1 }).unwrap();
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("eventType").is_some());
        assert!(json.get("event_type").is_none());
    }
}
