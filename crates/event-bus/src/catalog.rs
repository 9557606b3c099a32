//! Governance registry of integration event types.
//!
//! The catalog records, per event type, who declares it and who consumes it.
//! It is filled in at startup: producers declare their event types, then the
//! dispatcher appends a consumer name for every handler it subscribes. It is
//! queried for drift (event types nobody consumes, deprecated types still in
//! use) and never consulted during delivery.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;

use crate::error::CatalogError;
use crate::event::EventDefinition;

/// A declared payload field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaField {
    pub name: String,
    pub required: bool,
}

/// Declared shape of an event payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PayloadSchema {
    fields: Vec<SchemaField>,
}

impl PayloadSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a required field.
    pub fn required(mut self, name: impl Into<String>) -> Self {
        self.fields.push(SchemaField {
            name: name.into(),
            required: true,
        });
        self
    }

    /// Adds an optional field.
    pub fn optional(mut self, name: impl Into<String>) -> Self {
        self.fields.push(SchemaField {
            name: name.into(),
            required: false,
        });
        self
    }

    pub fn fields(&self) -> &[SchemaField] {
        &self.fields
    }

    /// Returns the required fields absent from (or null in) `payload`.
    pub fn missing_required(&self, payload: &serde_json::Value) -> Vec<String> {
        self.fields
            .iter()
            .filter(|f| f.required)
            .filter(|f| payload.get(&f.name).is_none_or(serde_json::Value::is_null))
            .map(|f| f.name.clone())
            .collect()
    }
}

/// A producer's declaration of an event type.
#[derive(Debug, Clone)]
pub struct ProducerDeclaration {
    pub event_type: String,
    pub version: String,
    pub producer: String,
    pub schema: PayloadSchema,
    pub deprecated: bool,
    pub description: String,
}

impl ProducerDeclaration {
    /// Builds a declaration from a typed event definition.
    pub fn of<E: EventDefinition>(producer: impl Into<String>) -> Self {
        Self {
            event_type: E::EVENT_TYPE.to_string(),
            version: E::VERSION.to_string(),
            producer: producer.into(),
            schema: E::schema(),
            deprecated: E::deprecated(),
            description: E::description().to_string(),
        }
    }
}

/// Catalog entry for one event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventCatalogEntry {
    pub event_type: String,
    pub version: String,
    pub producers: BTreeSet<String>,
    pub consumers: BTreeSet<String>,
    pub schema: PayloadSchema,
    pub deprecated: bool,
    pub description: String,
}

/// Process-scoped registry of event types, producers and consumers.
///
/// Share one instance behind an `Arc`.
#[derive(Debug, Default)]
pub struct EventCatalog {
    entries: RwLock<BTreeMap<String, EventCatalogEntry>>,
}

impl EventCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, EventCatalogEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, EventCatalogEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a producer declaration.
    ///
    /// A second declaration of the same event type adds its producer to the
    /// existing entry, provided the versions agree.
    pub fn register(&self, declaration: ProducerDeclaration) -> Result<(), CatalogError> {
        let mut entries = self.write();

        if let Some(entry) = entries.get_mut(&declaration.event_type) {
            if entry.version != declaration.version {
                return Err(CatalogError::VersionConflict {
                    event_type: declaration.event_type,
                    registered: entry.version.clone(),
                    declared: declaration.version,
                });
            }
            entry.producers.insert(declaration.producer);
            return Ok(());
        }

        tracing::debug!(
            event_type = %declaration.event_type,
            version = %declaration.version,
            producer = %declaration.producer,
            "event type declared"
        );
        entries.insert(
            declaration.event_type.clone(),
            EventCatalogEntry {
                event_type: declaration.event_type,
                version: declaration.version,
                producers: BTreeSet::from([declaration.producer]),
                consumers: BTreeSet::new(),
                schema: declaration.schema,
                deprecated: declaration.deprecated,
                description: declaration.description,
            },
        );
        Ok(())
    }

    /// Declares a typed event for the given producer.
    pub fn declare<E: EventDefinition>(&self, producer: &str) -> Result<(), CatalogError> {
        self.register(ProducerDeclaration::of::<E>(producer))
    }

    /// Appends a consumer to a declared event type.
    pub fn add_consumer(&self, event_type: &str, consumer: &str) -> Result<(), CatalogError> {
        let mut entries = self.write();
        let entry = entries
            .get_mut(event_type)
            .ok_or_else(|| CatalogError::UnknownEventType(event_type.to_string()))?;
        entry.consumers.insert(consumer.to_string());
        Ok(())
    }

    /// Event types with no registered consumer.
    pub fn orphans(&self) -> Vec<String> {
        self.read()
            .values()
            .filter(|e| e.consumers.is_empty())
            .map(|e| e.event_type.clone())
            .collect()
    }

    /// Deprecated event types that still have consumers.
    pub fn deprecated_in_use(&self) -> Vec<String> {
        self.read()
            .values()
            .filter(|e| e.deprecated && !e.consumers.is_empty())
            .map(|e| e.event_type.clone())
            .collect()
    }

    pub fn producers_of(&self, event_type: &str) -> Vec<String> {
        self.read()
            .get(event_type)
            .map(|e| e.producers.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn consumers_of(&self, event_type: &str) -> Vec<String> {
        self.read()
            .get(event_type)
            .map(|e| e.consumers.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, event_type: &str) -> Option<EventCatalogEntry> {
        self.read().get(event_type).cloned()
    }

    /// All entries, ordered by event type.
    pub fn entries(&self) -> Vec<EventCatalogEntry> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
