//! Settlement of completed sessions.
//!
//! Consumes `services.session.completed` and settles three domains in order:
//!
//! 1. Calendar: mark the meeting's slots completed
//! 2. Contract (one transaction): release the booking's hold and append the
//!    consumption to the ledger, guarded against duplicates
//! 3. Billing: create the mentor payable, guarded by its reference id
//!
//! Each step is idempotent on its own, so a redelivered event settles only
//! what is still missing. On failure the inconsistency between the steps is
//! logged for operators and the error is returned for redelivery.

use async_trait::async_trait;
use common::UserId;
use domain::{ServiceSessionCompleted, consumption_quantity};
use event_bus::{EventHandler, HandlerError, IntegrationEvent};

use crate::base::{SagaBase, SagaDependencies};
use crate::compensation::CompensationResult;
use crate::context::SagaExecutionContext;
use crate::error::{Result, SagaError};
use crate::services::{ConsumptionRecord, HoldKey, PerSessionBilling, SlotStatus, release_reasons};

pub const CONSUMER: &str = "session-end-saga";

const BOOKING_SOURCE: &str = "session_completed";
const CREATED_BY: &str = "session-end-saga";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarOutcome {
    /// Number of slots marked completed.
    Completed(u64),
    /// The session never got a meeting.
    NoMeeting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumptionOutcome {
    Recorded { quantity: u32, released_holds: usize },
    AlreadyRecorded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingOutcome {
    Created { billing_id: String },
    Duplicate,
    /// No mentor on the session or billing disabled for it.
    NotBillable,
}

/// What a settlement run did in each domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementOutcome {
    pub calendar: CalendarOutcome,
    pub consumption: ConsumptionOutcome,
    pub billing: BillingOutcome,
}

/// Steps that completed before a failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettlementProgress {
    pub calendar_completed: bool,
    pub consumption_recorded: bool,
}

/// Session end saga.
pub struct SessionEndSaga {
    base: SagaBase,
    deps: SagaDependencies,
}

impl SessionEndSaga {
    pub fn new(deps: SagaDependencies) -> Self {
        Self {
            base: SagaBase::new(&deps, CONSUMER),
            deps,
        }
    }

    /// Settles a completed session.
    #[tracing::instrument(skip(self, event), fields(session_id = %event.session_id))]
    pub async fn handle_session_completed(
        &self,
        event: &ServiceSessionCompleted,
    ) -> Result<SettlementOutcome> {
        // rejected before any side effect
        let quantity = consumption_quantity(event.actual_duration_minutes, event.duration_minutes)?;

        let mut progress = SettlementProgress::default();
        match self.settle(event, quantity, &mut progress).await {
            Ok(outcome) => {
                let skipped = outcome.consumption == ConsumptionOutcome::AlreadyRecorded;
                if skipped {
                    metrics::counter!("session_settlement_skipped_total").increment(1);
                }
                metrics::counter!("session_settlement_total").increment(1);
                tracing::info!(?outcome, "Session settled");
                Ok(outcome)
            }
            Err(error) => {
                metrics::counter!("session_settlement_failed_total").increment(1);
                self.compensate_session_end(event, &progress, &error);
                Err(error)
            }
        }
    }

    async fn settle(
        &self,
        event: &ServiceSessionCompleted,
        quantity: u32,
        progress: &mut SettlementProgress,
    ) -> Result<SettlementOutcome> {
        let calendar = match self.deps.sessions.find_meeting_id(event.session_id).await? {
            Some(meeting_id) => {
                let updated = self
                    .deps
                    .calendar
                    .update_status_by_meeting_id(&meeting_id, SlotStatus::Completed)
                    .await?;
                tracing::debug!(meeting_id = %meeting_id, updated, "Calendar slots completed");
                CalendarOutcome::Completed(updated)
            }
            None => {
                tracing::info!("No meeting linked to session, skipping calendar update");
                CalendarOutcome::NoMeeting
            }
        };
        progress.calendar_completed = true;

        let mut ctx = self.base.begin().await?;
        let result = self.settle_contract(&mut ctx, event, quantity).await;
        let consumption = self.base.finish(ctx, result).await?;
        progress.consumption_recorded = true;

        let billing = match event.mentor_id {
            Some(mentor_id) if event.allow_billing => {
                self.settle_billing(event, mentor_id, quantity).await?
            }
            _ => {
                tracing::debug!("Session not billable");
                BillingOutcome::NotBillable
            }
        };

        Ok(SettlementOutcome {
            calendar,
            consumption,
            billing,
        })
    }

    async fn settle_contract(
        &self,
        ctx: &mut SagaExecutionContext,
        event: &ServiceSessionCompleted,
        quantity: u32,
    ) -> Result<ConsumptionOutcome> {
        let contracts = &self.deps.contracts;
        let key = HoldKey {
            student_id: event.student_id,
            service_type: event.service_type_code.clone(),
            related_booking_id: event.session_id,
        };

        if let Some(entry) = contracts.find_consumption(ctx, &key).await? {
            tracing::info!(entry_id = %entry.id, "Consumption already recorded, skipping");
            return Ok(ConsumptionOutcome::AlreadyRecorded);
        }

        let holds = contracts.find_active_holds_for_update(ctx, &key).await?;

        // a concurrent delivery may have settled while we waited for the lock
        if contracts.find_consumption(ctx, &key).await?.is_some() {
            tracing::info!("Consumption recorded concurrently, skipping");
            return Ok(ConsumptionOutcome::AlreadyRecorded);
        }

        if holds.len() != 1 {
            tracing::warn!(
                active_holds = holds.len(),
                "Expected exactly one active hold for booking"
            );
        }
        for hold in &holds {
            contracts
                .release_hold(hold.id, release_reasons::COMPLETED, Some(&mut *ctx))
                .await?;
        }

        let entry = contracts
            .record_consumption(
                ctx,
                ConsumptionRecord {
                    student_id: event.student_id,
                    service_type: event.service_type_code.clone(),
                    quantity,
                    related_booking_id: event.session_id,
                    booking_source: BOOKING_SOURCE.to_string(),
                    created_by: CREATED_BY.to_string(),
                },
            )
            .await?;
        tracing::debug!(entry_id = %entry.id, quantity, "Consumption recorded");

        Ok(ConsumptionOutcome::Recorded {
            quantity,
            released_holds: holds.len(),
        })
    }

    async fn settle_billing(
        &self,
        event: &ServiceSessionCompleted,
        mentor_id: UserId,
        quantity: u32,
    ) -> Result<BillingOutcome> {
        let billing = &self.deps.billing;
        let reference_id = billing_reference(event);

        if billing.is_duplicate(&reference_id).await? {
            tracing::info!(reference_id = %reference_id, "Payable already exists, skipping");
            return Ok(BillingOutcome::Duplicate);
        }

        let price = billing
            .get_mentor_price(mentor_id, &event.session_type_code)
            .await?
            .ok_or_else(|| SagaError::MentorPriceMissing {
                mentor_id,
                session_type_code: event.session_type_code.clone(),
            })?;

        let entry = billing
            .create_per_session_billing(PerSessionBilling {
                session_id: event.session_id,
                mentor_id,
                student_id: event.student_id,
                service_type_code: event.service_type_code.clone(),
                session_type_code: event.session_type_code.clone(),
                reference_id,
                duration_minutes: event.duration_minutes,
                actual_duration_minutes: event.actual_duration_minutes,
                billed_hours: quantity,
                unit_price: price.price,
                currency: price.currency,
                amount: price.price.multiply(quantity)?,
                completed_at: event.completed_at,
            })
            .await?;
        tracing::debug!(billing_id = %entry.billing_id, "Payable created");

        Ok(BillingOutcome::Created {
            billing_id: entry.billing_id,
        })
    }

    /// Classifies the cross-domain inconsistency a failure left behind.
    ///
    /// Nothing is undone: every step is idempotent, so redelivery finishes
    /// the settlement. The classification is for operators.
    pub fn compensate_session_end(
        &self,
        event: &ServiceSessionCompleted,
        progress: &SettlementProgress,
        error: &SagaError,
    ) -> CompensationResult {
        let mut result = CompensationResult::new();

        if progress.consumption_recorded {
            result.record("billing", format!("consumption recorded but payable missing: {error}"));
        } else if progress.calendar_completed {
            result.record(
                "contract",
                format!("calendar completed but consumption not recorded: {error}"),
            );
        } else {
            tracing::warn!(error = %error, "Settlement failed before any step applied");
        }

        if result.require_manual_intervention() {
            tracing::error!(
                session_id = %event.session_id,
                errors = ?result.errors(),
                "Settlement left domains inconsistent until redelivery succeeds"
            );
        }
        result
    }
}

/// Billing idempotency key: the event's reference id, or one derived from
/// the session so redeliveries without a reference still collapse.
fn billing_reference(event: &ServiceSessionCompleted) -> String {
    event
        .reference_id
        .clone()
        .unwrap_or_else(|| format!("session:{}", event.session_id))
}

#[async_trait]
impl EventHandler for SessionEndSaga {
    async fn handle(&self, event: &IntegrationEvent) -> std::result::Result<(), HandlerError> {
        let payload = event.decode::<ServiceSessionCompleted>()?;
        self.handle_session_completed(&payload).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::SessionId;

    fn event(reference_id: Option<&str>) -> ServiceSessionCompleted {
        ServiceSessionCompleted {
            session_id: SessionId::new(),
            student_id: UserId::new(),
            mentor_id: Some(UserId::new()),
            service_type_code: "MENTORING".to_string(),
            session_type_code: "MENTORING_60".to_string(),
            actual_duration_minutes: None,
            duration_minutes: 60,
            allow_billing: true,
            reference_id: reference_id.map(str::to_string),
            session_kind: None,
            completed_at: None,
        }
    }

    #[test]
    fn reference_defaults_to_session() {
        let explicit = event(Some("REF-9"));
        assert_eq!(billing_reference(&explicit), "REF-9");

        let derived = event(None);
        assert_eq!(
            billing_reference(&derived),
            format!("session:{}", derived.session_id)
        );
    }
}
