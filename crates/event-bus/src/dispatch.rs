//! Dispatch table mapping event types to ordered handler lists.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::catalog::EventCatalog;
use crate::error::{CatalogError, EventBusError};
use crate::event::{EventId, IntegrationEvent};

/// Error type returned by handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A consumer of integration events.
///
/// Handlers must be safe to re-run: the transport redelivers an event to a
/// handler that returned an error.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &IntegrationEvent) -> Result<(), HandlerError>;
}

struct Subscription {
    consumer: String,
    handler: Arc<dyn EventHandler>,
}

/// A handler that failed for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub consumer: String,
    pub error: String,
}

/// Outcome of delivering one event to its subscribers.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub event_id: EventId,
    pub event_type: String,
    pub delivered: usize,
    pub failures: Vec<HandlerFailure>,
}

impl DispatchReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Consumers that should see the event again.
    pub fn failed_consumers(&self) -> Vec<String> {
        self.failures.iter().map(|f| f.consumer.clone()).collect()
    }

    pub fn into_result(self) -> Result<(), EventBusError> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(EventBusError::Dispatch {
                event_type: self.event_type,
                failed: self.failures.len(),
            })
        }
    }
}

/// Explicit dispatch table built at startup.
///
/// Every subscription is also recorded as a consumer in the shared
/// [`EventCatalog`], which is how the catalog learns about actual wiring.
pub struct EventDispatcher {
    catalog: Arc<EventCatalog>,
    routes: HashMap<String, Vec<Subscription>>,
}

impl EventDispatcher {
    pub fn new(catalog: Arc<EventCatalog>) -> Self {
        Self {
            catalog,
            routes: HashMap::new(),
        }
    }

    /// Appends a handler for `event_type`. Handlers run in subscription order.
    pub fn subscribe(
        &mut self,
        event_type: &str,
        consumer: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), CatalogError> {
        self.catalog.add_consumer(event_type, consumer)?;
        self.routes
            .entry(event_type.to_string())
            .or_default()
            .push(Subscription {
                consumer: consumer.to_string(),
                handler,
            });
        Ok(())
    }

    pub fn catalog(&self) -> &Arc<EventCatalog> {
        &self.catalog
    }

    /// Returns the number of handlers subscribed to `event_type`.
    pub fn handler_count(&self, event_type: &str) -> usize {
        self.routes.get(event_type).map_or(0, Vec::len)
    }

    /// Delivers an event to every subscribed handler.
    pub async fn dispatch(&self, event: &IntegrationEvent) -> DispatchReport {
        self.deliver(event, None).await
    }

    /// Delivers an event only to the named consumers (used for redelivery).
    pub async fn dispatch_to(&self, event: &IntegrationEvent, consumers: &[String]) -> DispatchReport {
        self.deliver(event, Some(consumers)).await
    }

    #[tracing::instrument(skip(self, event, only), fields(event_type = %event.event_type, event_id = %event.id))]
    async fn deliver(&self, event: &IntegrationEvent, only: Option<&[String]>) -> DispatchReport {
        let mut report = DispatchReport {
            event_id: event.id,
            event_type: event.event_type.clone(),
            delivered: 0,
            failures: Vec::new(),
        };

        let Some(subscriptions) = self.routes.get(&event.event_type) else {
            tracing::debug!("no handlers subscribed");
            return report;
        };

        for subscription in subscriptions {
            if let Some(only) = only
                && !only.contains(&subscription.consumer)
            {
                continue;
            }

            match subscription.handler.handle(event).await {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    metrics::counter!("event_dispatch_failures_total").increment(1);
                    tracing::warn!(consumer = %subscription.consumer, error = %e, "handler failed");
                    report.failures.push(HandlerFailure {
                        consumer: subscription.consumer.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        report
    }
}
