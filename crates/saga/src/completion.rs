//! Turns provider "meeting ended" signals into session completion.

use async_trait::async_trait;
use common::{SessionId, UserId};
use domain::{
    MeetingLifecycleCompleted, ServiceSessionCompleted, SessionRecord, SessionStatus, producers,
};
use event_bus::{EventHandler, HandlerError, IntegrationEvent};

use crate::base::{SagaBase, SagaDependencies};
use crate::error::Result;
use crate::services::SlotStatus;

pub const CONSUMER: &str = "meeting-completion-handler";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// No session uses the meeting.
    UnknownMeeting,
    /// The session is not scheduled; nothing to complete.
    NotScheduled(SessionStatus),
    /// Settlement event published.
    Completed(SessionId),
    /// Group session completed; classes are not settled per student.
    ClassCompleted(SessionId),
}

/// Handler for `meeting.lifecycle.completed`.
pub struct MeetingCompletionHandler {
    base: SagaBase,
    deps: SagaDependencies,
}

impl MeetingCompletionHandler {
    pub fn new(deps: SagaDependencies) -> Self {
        Self {
            base: SagaBase::new(&deps, producers::MEETING_COMPLETION),
            deps,
        }
    }

    /// Completes the session behind a finished meeting.
    ///
    /// The settlement event goes out before the status flips: if publishing
    /// fails the session stays `Scheduled` and redelivery retries. A duplicate
    /// settlement event is harmless, settlement is idempotent.
    #[tracing::instrument(skip(self, event), fields(meeting_id = %event.meeting_id))]
    pub async fn handle_meeting_completed(
        &self,
        event: &MeetingLifecycleCompleted,
    ) -> Result<CompletionOutcome> {
        let Some(session) = self.deps.sessions.find_by_meeting_id(&event.meeting_id).await? else {
            tracing::warn!("No session for meeting, ignoring");
            return Ok(CompletionOutcome::UnknownMeeting);
        };

        if session.status != SessionStatus::Scheduled {
            tracing::info!(session_id = %session.id, status = %session.status, "Session not scheduled, ignoring");
            return Ok(CompletionOutcome::NotScheduled(session.status));
        }

        let outcome = match session.student_id {
            Some(student_id) if !session.kind.is_group() => {
                self.base
                    .emit(&settlement_event(&session, student_id, event))
                    .await?;
                CompletionOutcome::Completed(session.id)
            }
            _ => {
                let updated = self
                    .deps
                    .calendar
                    .update_status_by_meeting_id(&event.meeting_id, SlotStatus::Completed)
                    .await?;
                tracing::debug!(updated, "Class slots completed");
                CompletionOutcome::ClassCompleted(session.id)
            }
        };

        if !self.deps.sessions.mark_completed(session.id).await? {
            tracing::info!(session_id = %session.id, "Session completed concurrently");
        }
        Ok(outcome)
    }
}

fn settlement_event(
    session: &SessionRecord,
    student_id: UserId,
    event: &MeetingLifecycleCompleted,
) -> ServiceSessionCompleted {
    ServiceSessionCompleted {
        session_id: session.id,
        student_id,
        mentor_id: Some(session.mentor_id),
        service_type_code: session.service_type_code.clone(),
        session_type_code: session.session_type_code.clone(),
        actual_duration_minutes: event.actual_duration_minutes,
        duration_minutes: i64::from(session.duration_minutes),
        allow_billing: session.allow_billing,
        reference_id: Some(format!("session:{}", session.id)),
        session_kind: Some(session.kind),
        completed_at: Some(event.ended_at),
    }
}

#[async_trait]
impl EventHandler for MeetingCompletionHandler {
    async fn handle(&self, event: &IntegrationEvent) -> std::result::Result<(), HandlerError> {
        let payload = event.decode::<MeetingLifecycleCompleted>()?;
        self.handle_meeting_completed(&payload).await?;
        Ok(())
    }
}
