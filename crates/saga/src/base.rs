//! Shared saga plumbing: collaborators, transaction boundaries and event emission.

use std::sync::Arc;

use event_bus::{EventDefinition, EventPublisher, IntegrationEvent};

use crate::context::{SagaExecutionContext, TransactionManager};
use crate::error::Result;
use crate::services::{
    BillingService, CalendarService, ClassMembership, ConferencingProviders, ContractService,
    IdentityService, SessionRepository,
};

/// Collaborators a saga may call.
#[derive(Clone)]
pub struct SagaDependencies {
    pub sessions: Arc<dyn SessionRepository>,
    pub conferencing: ConferencingProviders,
    pub calendar: Arc<dyn CalendarService>,
    pub contracts: Arc<dyn ContractService>,
    pub billing: Arc<dyn BillingService>,
    pub identity: Arc<dyn IdentityService>,
    pub membership: Arc<dyn ClassMembership>,
    pub transactions: Arc<dyn TransactionManager>,
    pub publisher: Arc<dyn EventPublisher>,
}

/// Transaction and publishing helpers embedded in every saga.
#[derive(Clone)]
pub struct SagaBase {
    transactions: Arc<dyn TransactionManager>,
    publisher: Arc<dyn EventPublisher>,
    producer: &'static str,
}

impl SagaBase {
    pub fn new(deps: &SagaDependencies, producer: &'static str) -> Self {
        Self {
            transactions: deps.transactions.clone(),
            publisher: deps.publisher.clone(),
            producer,
        }
    }

    pub fn producer(&self) -> &'static str {
        self.producer
    }

    /// Opens a unit of work.
    pub async fn begin(&self) -> Result<SagaExecutionContext> {
        self.transactions.begin().await
    }

    /// Commits `ctx` if `result` is `Ok`, rolls it back otherwise.
    ///
    /// A failed rollback is logged; the original error is returned.
    pub async fn finish<T>(&self, ctx: SagaExecutionContext, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                ctx.commit().await?;
                Ok(value)
            }
            Err(error) => {
                if let Err(rollback_error) = ctx.rollback().await {
                    tracing::error!(
                        error = %error,
                        rollback_error = %rollback_error,
                        "Rollback failed"
                    );
                }
                Err(error)
            }
        }
    }

    /// Publishes a typed event under this saga's producer name.
    pub async fn emit<E: EventDefinition>(&self, payload: &E) -> Result<IntegrationEvent> {
        let event = IntegrationEvent::from_definition(payload)?;
        self.publisher.publish(event.clone(), self.producer).await?;
        tracing::debug!(
            event_type = E::EVENT_TYPE,
            event_id = %event.id,
            producer = self.producer,
            "Event emitted"
        );
        Ok(event)
    }
}
