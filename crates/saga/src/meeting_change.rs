//! Propagates reschedules and cancellations of booked sessions to the
//! conferencing provider, the calendar and the entitlement ledger.

use async_trait::async_trait;
use domain::{
    MeetingOperation, MeetingOperationResult, OperationStatus, SessionCancelled,
    SessionRescheduled, SessionStatus, producers,
};
use event_bus::{EventDefinition, EventHandler, HandlerError, IntegrationEvent};

use crate::base::{SagaBase, SagaDependencies};
use crate::compensation::{CompensationResult, cancel_slots, release_booking_hold};
use crate::config::SagaConfig;
use crate::error::Result;
use crate::retry::with_timeout;
use crate::services::{MeetingUpdate, release_reasons};

pub const CONSUMER: &str = "meeting-change-saga";

pub const TRIGGERS: [&str; 2] = [SessionRescheduled::EVENT_TYPE, SessionCancelled::EVENT_TYPE];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOutcome {
    /// The session is unknown or not in a state the change applies to.
    Skipped,
    Succeeded,
    Failed { require_manual_intervention: bool },
}

/// Meeting change saga.
pub struct MeetingChangeSaga {
    base: SagaBase,
    deps: SagaDependencies,
    config: SagaConfig,
}

impl MeetingChangeSaga {
    pub fn new(deps: SagaDependencies, config: SagaConfig) -> Self {
        Self {
            base: SagaBase::new(&deps, producers::MEETING_CHANGE),
            deps,
            config,
        }
    }

    /// Moves the provider meeting of a scheduled session.
    ///
    /// The session record follows only once the provider accepted the change.
    #[tracing::instrument(skip(self, event), fields(session_id = %event.session_id))]
    pub async fn handle_rescheduled(&self, event: &SessionRescheduled) -> Result<ChangeOutcome> {
        let Some(session) = self.deps.sessions.find(event.session_id).await? else {
            tracing::warn!("Session not found, skipping");
            return Ok(ChangeOutcome::Skipped);
        };
        let (SessionStatus::Scheduled, Some(meeting_id)) = (session.status, session.meeting_id.clone())
        else {
            tracing::info!(status = %session.status, "Session has no live meeting, skipping");
            return Ok(ChangeOutcome::Skipped);
        };

        let update = MeetingUpdate {
            topic: event.new_topic.clone(),
            start_time: Some(event.new_start),
            duration_minutes: event.new_duration_minutes,
        };
        let timeout = self.config.provider_timeout;
        let updated = match self.deps.conferencing.get(session.meeting_provider) {
            Ok(client) => {
                self.config
                    .provider_retry
                    .retry("update_meeting", || {
                        with_timeout(
                            timeout,
                            "update_meeting",
                            client.update_meeting(&meeting_id, update.clone()),
                        )
                    })
                    .await
            }
            Err(e) => Err(e),
        };

        let result =
            MeetingOperationResult::for_session(&session, MeetingOperation::Update, OperationStatus::Success);
        match updated {
            Ok(()) => {
                self.deps
                    .sessions
                    .reschedule(
                        session.id,
                        event.new_start,
                        event.new_duration_minutes,
                        event.new_topic.clone(),
                    )
                    .await?;

                let mut result = result;
                result.scheduled_start = Some(event.new_start);
                if let Some(duration) = event.new_duration_minutes {
                    result.duration_minutes = Some(duration);
                }
                if let Some(topic) = &event.new_topic {
                    result.topic = Some(topic.clone());
                }
                self.base.emit(&result).await?;
                tracing::info!(meeting_id = %meeting_id, "Meeting rescheduled");
                Ok(ChangeOutcome::Succeeded)
            }
            Err(error) => {
                // provider still holds the old time; operators must reconcile
                tracing::error!(error = %error, "Meeting update failed");
                let mut failed = result.with_error(error.to_string(), true);
                failed.status = OperationStatus::Failed;
                self.base.emit(&failed).await?;
                Ok(ChangeOutcome::Failed {
                    require_manual_intervention: true,
                })
            }
        }
    }

    /// Cancels a session and tears down its meeting, slots and hold.
    ///
    /// The status flips first so concurrent provisioning cannot link a meeting
    /// afterwards; the teardown steps are best effort.
    #[tracing::instrument(skip(self, event), fields(session_id = %event.session_id))]
    pub async fn handle_cancelled(&self, event: &SessionCancelled) -> Result<ChangeOutcome> {
        let Some(session) = self.deps.sessions.find(event.session_id).await? else {
            tracing::warn!("Session not found, skipping");
            return Ok(ChangeOutcome::Skipped);
        };
        if !session.status.can_cancel() {
            tracing::info!(status = %session.status, "Session cannot be cancelled, skipping");
            return Ok(ChangeOutcome::Skipped);
        }
        if !self
            .deps
            .sessions
            .mark_cancelled(session.id, &event.reason)
            .await?
        {
            tracing::info!("Session changed concurrently, skipping");
            return Ok(ChangeOutcome::Skipped);
        }

        let mut compensation = CompensationResult::new();

        if let Some(meeting_id) = &session.meeting_id {
            let timeout = self.config.provider_timeout;
            let cancelled = match self.deps.conferencing.get(session.meeting_provider) {
                Ok(client) => {
                    self.config
                        .provider_retry
                        .retry("cancel_meeting", || {
                            with_timeout(timeout, "cancel_meeting", client.cancel_meeting(meeting_id))
                        })
                        .await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = cancelled {
                compensation.record("cancel_meeting", e);
            }
        }

        cancel_slots(self.deps.calendar.as_ref(), &session.slot_ids, &mut compensation).await;
        release_booking_hold(
            self.deps.contracts.as_ref(),
            &session,
            release_reasons::SESSION_CANCELLED,
            &mut compensation,
        )
        .await;

        let mut result =
            MeetingOperationResult::for_session(&session, MeetingOperation::Cancel, OperationStatus::Success);
        let outcome = if compensation.require_manual_intervention() {
            result.status = OperationStatus::Failed;
            result = result.with_error(
                compensation.failure_message(&format!("cancellation incomplete ({})", event.reason)),
                true,
            );
            ChangeOutcome::Failed {
                require_manual_intervention: true,
            }
        } else {
            ChangeOutcome::Succeeded
        };

        if session.kind.is_group()
            && let Some(class_id) = session.class_id
            && let (Ok(students), Ok(counselors)) = (
                self.deps.membership.student_ids(class_id).await,
                self.deps.membership.counselor_ids(class_id).await,
            )
        {
            result = result.with_roster(students, counselors);
        }

        self.base.emit(&result).await?;
        tracing::info!(?outcome, "Session cancelled");
        Ok(outcome)
    }
}

#[async_trait]
impl EventHandler for MeetingChangeSaga {
    async fn handle(&self, event: &IntegrationEvent) -> std::result::Result<(), HandlerError> {
        if event.is::<SessionRescheduled>() {
            self.handle_rescheduled(&event.decode()?).await?;
        } else {
            self.handle_cancelled(&event.decode::<SessionCancelled>()?).await?;
        }
        Ok(())
    }
}
