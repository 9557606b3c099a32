//! Outbound publishing and the in-memory transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};

use crate::dispatch::EventDispatcher;
use crate::error::{EventBusError, Result};
use crate::event::IntegrationEvent;

/// Outbound side of the event transport.
///
/// Delivery guarantees (ordering, at-least-once, redelivery on consumer
/// failure) belong to the transport. Publishers only hand events over.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: IntegrationEvent, producer: &str) -> Result<()>;
}

/// An event as recorded by the in-memory bus.
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub event: IntegrationEvent,
    pub producer: String,
}

/// One delivery attempt of an event.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub event: IntegrationEvent,
    /// 1 for the first delivery.
    pub attempt: u32,
    /// Consumers to deliver to; `None` means every subscriber.
    pub consumers: Option<Vec<String>>,
}

/// In-memory event transport.
///
/// A bus from [`InMemoryEventBus::new`] records every published event for
/// inspection. A bus from [`InMemoryEventBus::channel`] forwards events to a
/// [`DeliveryReceiver`] for asynchronous dispatch and keeps nothing.
#[derive(Clone)]
pub struct InMemoryEventBus {
    published: Option<Arc<RwLock<Vec<PublishedEvent>>>>,
    sender: Option<mpsc::UnboundedSender<Delivery>>,
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventBus {
    /// Creates a recording-only bus.
    pub fn new() -> Self {
        Self {
            published: Some(Arc::default()),
            sender: None,
        }
    }

    /// Creates a non-recording bus wired to a delivery channel.
    pub fn channel() -> (Self, DeliveryReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let receiver = DeliveryReceiver {
            rx,
            redeliver: tx.downgrade(),
        };
        let bus = Self {
            published: None,
            sender: Some(tx),
        };
        (bus, receiver)
    }

    pub fn is_recording(&self) -> bool {
        self.published.is_some()
    }

    /// Returns every event published so far, oldest first.
    ///
    /// Always empty on a channel bus.
    pub async fn published(&self) -> Vec<PublishedEvent> {
        match &self.published {
            Some(published) => published.read().await.clone(),
            None => Vec::new(),
        }
    }

    /// Returns published events of one type.
    pub async fn published_of(&self, event_type: &str) -> Vec<IntegrationEvent> {
        self.published()
            .await
            .into_iter()
            .filter(|p| p.event.event_type == event_type)
            .map(|p| p.event)
            .collect()
    }

    pub async fn event_count(&self) -> usize {
        match &self.published {
            Some(published) => published.read().await.len(),
            None => 0,
        }
    }

    pub async fn clear(&self) {
        if let Some(published) = &self.published {
            published.write().await.clear();
        }
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventBus {
    async fn publish(&self, event: IntegrationEvent, producer: &str) -> Result<()> {
        tracing::debug!(
            event_type = %event.event_type,
            event_id = %event.id,
            producer,
            "event published"
        );
        if let Some(published) = &self.published {
            published.write().await.push(PublishedEvent {
                event: event.clone(),
                producer: producer.to_string(),
            });
        }

        if let Some(sender) = &self.sender {
            sender
                .send(Delivery {
                    event,
                    attempt: 1,
                    consumers: None,
                })
                .map_err(|_| EventBusError::TransportClosed)?;
        }
        Ok(())
    }
}

/// Receiving end of the in-memory transport.
pub struct DeliveryReceiver {
    rx: mpsc::UnboundedReceiver<Delivery>,
    redeliver: mpsc::WeakUnboundedSender<Delivery>,
}

/// Consumes deliveries and dispatches them until every bus handle is dropped.
///
/// A delivery whose handlers fail is re-queued for the failed consumers only,
/// after `redelivery_delay * attempt`, until `max_deliveries` is reached; after
/// that the event is logged as dead-lettered.
pub async fn run_consumer(
    mut receiver: DeliveryReceiver,
    dispatcher: Arc<EventDispatcher>,
    max_deliveries: u32,
    redelivery_delay: Duration,
) {
    while let Some(delivery) = receiver.rx.recv().await {
        let report = match &delivery.consumers {
            Some(consumers) => dispatcher.dispatch_to(&delivery.event, consumers).await,
            None => dispatcher.dispatch(&delivery.event).await,
        };

        if report.is_success() {
            continue;
        }

        if delivery.attempt >= max_deliveries {
            metrics::counter!("event_dead_lettered_total").increment(1);
            tracing::error!(
                event_type = %delivery.event.event_type,
                event_id = %delivery.event.id,
                attempts = delivery.attempt,
                failures = ?report.failures,
                "event dead-lettered after exhausting redeliveries"
            );
            continue;
        }

        let Some(sender) = receiver.redeliver.upgrade() else {
            tracing::warn!(event_id = %delivery.event.id, "transport closed, dropping redelivery");
            continue;
        };
        let next = Delivery {
            event: delivery.event,
            attempt: delivery.attempt + 1,
            consumers: Some(report.failed_consumers()),
        };
        let delay = redelivery_delay * delivery.attempt;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(next);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{EventCatalog, PayloadSchema, ProducerDeclaration};
    use crate::dispatch::{EventHandler, HandlerError};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyHandler {
        calls: Arc<AtomicU32>,
        failures_before_success: u32,
    }

    #[async_trait]
    impl EventHandler for FlakyHandler {
        async fn handle(&self, _event: &IntegrationEvent) -> std::result::Result<(), HandlerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures_before_success {
                return Err(format!("failure #{call}").into());
            }
            Ok(())
        }
    }

    fn dispatcher_with(handler: FlakyHandler) -> Arc<EventDispatcher> {
        let catalog = Arc::new(EventCatalog::new());
        catalog
            .register(ProducerDeclaration {
                event_type: "e".to_string(),
                version: "1.0".to_string(),
                producer: "test".to_string(),
                schema: PayloadSchema::new(),
                deprecated: false,
                description: String::new(),
            })
            .unwrap();
        let mut dispatcher = EventDispatcher::new(catalog);
        dispatcher.subscribe("e", "flaky", Arc::new(handler)).unwrap();
        Arc::new(dispatcher)
    }

    fn event() -> IntegrationEvent {
        IntegrationEvent::builder()
            .event_type("e")
            .version("1.0")
            .payload_raw(serde_json::json!({}))
            .build()
            .unwrap()
    }

    async fn wait_for(calls: &AtomicU32, expected: u32) {
        for _ in 0..200 {
            if calls.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn recording_bus_keeps_producer() {
        let bus = InMemoryEventBus::new();
        bus.publish(event(), "scheduler").await.unwrap();

        let published = bus.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].producer, "scheduler");
        assert_eq!(bus.published_of("e").await.len(), 1);
        assert!(bus.published_of("other").await.is_empty());
    }

    #[tokio::test]
    async fn channel_bus_retains_nothing() {
        let (bus, mut receiver) = InMemoryEventBus::channel();
        assert!(!bus.is_recording());

        for _ in 0..100 {
            bus.publish(event(), "scheduler").await.unwrap();
        }

        assert_eq!(bus.event_count().await, 0);
        assert!(bus.published().await.is_empty());
        let delivery = receiver.rx.recv().await.unwrap();
        assert_eq!(delivery.attempt, 1);
        assert_eq!(delivery.event.event_type, "e");
    }

    #[tokio::test]
    async fn failed_handler_is_redelivered() {
        let calls = Arc::new(AtomicU32::new(0));
        let dispatcher = dispatcher_with(FlakyHandler {
            calls: calls.clone(),
            failures_before_success: 2,
        });
        let (bus, receiver) = InMemoryEventBus::channel();
        let consumer = tokio::spawn(run_consumer(
            receiver,
            dispatcher,
            5,
            Duration::from_millis(1),
        ));

        bus.publish(event(), "test").await.unwrap();
        wait_for(&calls, 3).await;
        drop(bus);
        consumer.await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn redelivery_stops_at_limit() {
        let calls = Arc::new(AtomicU32::new(0));
        let dispatcher = dispatcher_with(FlakyHandler {
            calls: calls.clone(),
            failures_before_success: u32::MAX,
        });
        let (bus, receiver) = InMemoryEventBus::channel();
        let consumer = tokio::spawn(run_consumer(
            receiver,
            dispatcher,
            2,
            Duration::from_millis(1),
        ));

        bus.publish(event(), "test").await.unwrap();
        wait_for(&calls, 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(bus);
        consumer.await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
