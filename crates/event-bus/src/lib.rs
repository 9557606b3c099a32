//! Integration event plumbing for the session saga workspace.
//!
//! - [`IntegrationEvent`] envelope and the [`EventDefinition`] trait typed payloads implement
//! - [`EventCatalog`] governance registry (producers, consumers, orphans)
//! - [`EventDispatcher`] explicit dispatch table built at startup
//! - [`EventPublisher`] outbound port and the [`InMemoryEventBus`] transport

pub mod bus;
pub mod catalog;
pub mod dispatch;
pub mod error;
pub mod event;

pub use bus::{Delivery, DeliveryReceiver, EventPublisher, InMemoryEventBus, PublishedEvent, run_consumer};
pub use catalog::{EventCatalog, EventCatalogEntry, PayloadSchema, ProducerDeclaration, SchemaField};
pub use dispatch::{DispatchReport, EventDispatcher, EventHandler, HandlerError, HandlerFailure};
pub use error::{CatalogError, EventBusError, Result};
pub use event::{EventDefinition, EventId, IntegrationEvent, IntegrationEventBuilder};
