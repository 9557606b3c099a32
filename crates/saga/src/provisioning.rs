//! Meeting provisioning for freshly booked sessions.
//!
//! The saga consumes the five "session created" events and drives a
//! `PendingMeeting` session to `Scheduled`:
//!
//! 1. Skip unless the session still awaits a meeting
//! 2. Create the meeting with the session's provider, retrying with backoff
//! 3. Resolve participant display names (and the roster for classes)
//! 4. In one transaction: link the meeting to the session, then to its slots
//! 5. Emit a `meeting.operation.result`
//!
//! Any failure after the status guard triggers best-effort compensation and a
//! failure result; the saga itself never fails the delivery. The meeting id is
//! captured as soon as the provider answers so compensation can always cancel
//! the external meeting.

use std::time::Instant;

use async_trait::async_trait;
use common::UserId;
use domain::{
    AiCareerSessionCreated, ClassSessionCreated, CommSessionCreated, GapAnalysisSessionCreated,
    MeetingLink, MeetingOperation, MeetingOperationResult, OperationStatus,
    RegularMentoringSessionCreated, SessionCreatedData, SessionRecord, SessionStatus, producers,
};
use event_bus::{EventBusError, EventDefinition, EventHandler, HandlerError, IntegrationEvent};

use crate::base::{SagaBase, SagaDependencies};
use crate::compensation::{CompensationResult, cancel_slots};
use crate::config::SagaConfig;
use crate::context::SagaExecutionContext;
use crate::error::{Result, SagaError};
use crate::retry::with_timeout;
use crate::services::{CreateMeetingRequest, MeetingInfo, SlotLink, release_reasons};

/// Consumer name registered in the event catalog.
pub const CONSUMER: &str = "session-provisioning-saga";

/// Event types that trigger provisioning.
pub const TRIGGERS: [&str; 5] = [
    RegularMentoringSessionCreated::EVENT_TYPE,
    GapAnalysisSessionCreated::EVENT_TYPE,
    AiCareerSessionCreated::EVENT_TYPE,
    CommSessionCreated::EVENT_TYPE,
    ClassSessionCreated::EVENT_TYPE,
];

/// Why a creation event was ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    SessionNotFound,
    /// Already provisioned, failed or cancelled.
    NotPending(SessionStatus),
}

/// What a provisioning run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningOutcome {
    Skipped(SkipReason),
    Scheduled { meeting_id: String },
    /// A concurrent run linked its meeting first; ours was cancelled.
    Superseded { duplicate_meeting_id: String },
    Failed(CompensationResult),
}

/// Participants and roster resolved before the linking transaction.
#[derive(Debug, Default)]
struct Audience {
    display_names: Vec<String>,
    roster_students: Vec<UserId>,
    roster_counselors: Vec<UserId>,
}

enum Provisioned {
    Linked(MeetingInfo, Audience),
    LostRace(MeetingInfo),
}

/// Session provisioning saga.
pub struct SessionProvisioningSaga {
    base: SagaBase,
    deps: SagaDependencies,
    config: SagaConfig,
}

impl SessionProvisioningSaga {
    pub fn new(deps: SagaDependencies, config: SagaConfig) -> Self {
        Self {
            base: SagaBase::new(&deps, producers::SESSION_PROVISIONING),
            deps,
            config,
        }
    }

    /// Provisions a meeting for a newly created session.
    ///
    /// Errors are returned only when the session cannot be loaded or the
    /// result event cannot be published.
    #[tracing::instrument(skip(self, data), fields(session_id = %data.session_id, kind = %data.session_kind))]
    pub async fn handle_session_created(
        &self,
        data: &SessionCreatedData,
    ) -> Result<ProvisioningOutcome> {
        let Some(session) = self.deps.sessions.find(data.session_id).await? else {
            tracing::warn!("Session not found, skipping");
            return Ok(ProvisioningOutcome::Skipped(SkipReason::SessionNotFound));
        };

        if !session.status.awaits_meeting() {
            tracing::info!(status = %session.status, "Session already processed, skipping");
            return Ok(ProvisioningOutcome::Skipped(SkipReason::NotPending(
                session.status,
            )));
        }

        let started = Instant::now();
        metrics::counter!("session_provisioning_total", "kind" => session.kind.as_str())
            .increment(1);

        // Filled in as soon as the provider returns, so compensation sees it
        // even when a later step fails.
        let mut meeting: Option<MeetingInfo> = None;

        let outcome = match self.provision(&session, &mut meeting).await {
            Ok(Provisioned::Linked(info, audience)) => {
                self.emit_success(&session, &info, audience).await?;
                tracing::info!(meeting_id = %info.id, "Meeting provisioned");
                ProvisioningOutcome::Scheduled {
                    meeting_id: info.id,
                }
            }
            Ok(Provisioned::LostRace(info)) => {
                self.cancel_duplicate(&session, &info.id).await;
                ProvisioningOutcome::Superseded {
                    duplicate_meeting_id: info.id,
                }
            }
            Err(error) => {
                tracing::warn!(error = %error, "Provisioning failed, compensating");
                metrics::counter!("session_provisioning_failed_total", "kind" => session.kind.as_str())
                    .increment(1);

                let compensation = self.compensate(&session, meeting.as_ref(), &error).await;
                self.emit_failure(&session, &error, &compensation).await?;
                ProvisioningOutcome::Failed(compensation)
            }
        };

        metrics::histogram!("session_provisioning_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        Ok(outcome)
    }

    async fn provision(
        &self,
        session: &SessionRecord,
        meeting: &mut Option<MeetingInfo>,
    ) -> Result<Provisioned> {
        let client = self.deps.conferencing.get(session.meeting_provider)?;
        let request = CreateMeetingRequest {
            topic: session.topic.clone(),
            start_time: session.scheduled_start,
            duration_minutes: session.duration_minutes,
            host_user_id: session.mentor_id,
            auto_record: true,
            allow_early_join: true,
        };

        let timeout = self.config.provider_timeout;
        let info = self
            .config
            .provider_retry
            .retry("create_meeting", || {
                with_timeout(timeout, "create_meeting", client.create_meeting(request.clone()))
            })
            .await?;
        tracing::debug!(meeting_id = %info.id, "Meeting created");
        *meeting = Some(info.clone());

        let audience = self.resolve_audience(session).await?;

        let mut ctx = self.base.begin().await?;
        let result = self.link(&mut ctx, session, &info, &audience).await;
        let linked = self.base.finish(ctx, result).await?;

        Ok(if linked {
            Provisioned::Linked(info, audience)
        } else {
            Provisioned::LostRace(info)
        })
    }

    async fn resolve_audience(&self, session: &SessionRecord) -> Result<Audience> {
        let mut audience = Audience::default();
        for user_id in session.participants() {
            audience
                .display_names
                .push(self.deps.identity.get_display_name(user_id).await?);
        }

        if session.kind.is_group()
            && let Some(class_id) = session.class_id
        {
            audience.roster_students = self.deps.membership.student_ids(class_id).await?;
            audience.roster_counselors = self.deps.membership.counselor_ids(class_id).await?;
        }
        Ok(audience)
    }

    /// Returns false when another run already moved the session on.
    async fn link(
        &self,
        ctx: &mut SagaExecutionContext,
        session: &SessionRecord,
        info: &MeetingInfo,
        audience: &Audience,
    ) -> Result<bool> {
        let link = MeetingLink {
            provider: session.meeting_provider,
            meeting_id: info.id.clone(),
            meeting_url: info.meeting_url.clone(),
        };
        if !self.deps.sessions.link_meeting(ctx, session.id, link).await? {
            return Ok(false);
        }

        self.deps
            .calendar
            .update_slot_with_session_and_meeting(
                ctx,
                SlotLink {
                    session_id: session.id,
                    meeting_id: info.id.clone(),
                    meeting_url: info.meeting_url.clone(),
                    slot_ids: session.slot_ids.clone(),
                    display_names: audience.display_names.clone(),
                },
            )
            .await?;
        Ok(true)
    }

    async fn cancel_meeting(&self, session: &SessionRecord, meeting_id: &str) -> Result<()> {
        let client = self.deps.conferencing.get(session.meeting_provider)?;
        let timeout = self.config.provider_timeout;
        self.config
            .provider_retry
            .retry("cancel_meeting", || {
                with_timeout(timeout, "cancel_meeting", client.cancel_meeting(meeting_id))
            })
            .await
    }

    async fn cancel_duplicate(&self, session: &SessionRecord, meeting_id: &str) {
        let status = self
            .deps
            .sessions
            .find(session.id)
            .await
            .ok()
            .flatten()
            .map(|s| s.status);
        tracing::info!(
            meeting_id,
            current_status = ?status,
            "Session moved on concurrently, cancelling duplicate meeting"
        );

        if let Err(e) = self.cancel_meeting(session, meeting_id).await {
            tracing::error!(meeting_id, error = %e, "Failed to cancel duplicate meeting");
            metrics::counter!("saga_compensation_errors_total", "step" => "cancel_duplicate_meeting")
                .increment(1);
        }
    }

    /// Undoes whatever provisioning left behind. Every step runs regardless
    /// of earlier failures.
    async fn compensate(
        &self,
        session: &SessionRecord,
        meeting: Option<&MeetingInfo>,
        error: &SagaError,
    ) -> CompensationResult {
        let mut result = CompensationResult::new();

        if let Some(info) = meeting
            && let Err(e) = self.cancel_meeting(session, &info.id).await
        {
            result.record("cancel_meeting", e);
        }

        match self
            .deps
            .sessions
            .mark_meeting_failed(session.id, &error.to_string())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!("Session left PENDING_MEETING concurrently, status not changed");
            }
            Err(e) => result.record("mark_meeting_failed", e),
        }

        crate::compensation::release_booking_hold(
            self.deps.contracts.as_ref(),
            session,
            release_reasons::MEETING_CREATE_FAILED,
            &mut result,
        )
        .await;

        cancel_slots(self.deps.calendar.as_ref(), &session.slot_ids, &mut result).await;

        if result.require_manual_intervention() {
            tracing::error!(
                errors = ?result.errors(),
                "Compensation incomplete, manual intervention required"
            );
        }
        result
    }

    async fn emit_success(
        &self,
        session: &SessionRecord,
        info: &MeetingInfo,
        audience: Audience,
    ) -> Result<()> {
        let result = MeetingOperationResult::for_session(
            session,
            MeetingOperation::Create,
            OperationStatus::Success,
        )
        .with_meeting(&info.id, &info.meeting_url)
        .with_roster(audience.roster_students, audience.roster_counselors);
        self.base.emit(&result).await?;
        Ok(())
    }

    async fn emit_failure(
        &self,
        session: &SessionRecord,
        error: &SagaError,
        compensation: &CompensationResult,
    ) -> Result<()> {
        let mut result = MeetingOperationResult::for_session(
            session,
            MeetingOperation::Create,
            OperationStatus::Failed,
        )
        .with_error(
            compensation.failure_message(error),
            compensation.require_manual_intervention(),
        );
        // the meeting was cancelled, do not advertise it
        result.meeting_id = None;
        result.meeting_url = None;

        if session.kind.is_group()
            && let Some(class_id) = session.class_id
        {
            let students = self.deps.membership.student_ids(class_id).await;
            let counselors = self.deps.membership.counselor_ids(class_id).await;
            if let (Ok(students), Ok(counselors)) = (students, counselors) {
                result = result.with_roster(students, counselors);
            }
        }

        self.base.emit(&result).await?;
        Ok(())
    }
}

/// Decodes any of the creation events into their shared payload.
pub fn decode_session_created(
    event: &IntegrationEvent,
) -> std::result::Result<SessionCreatedData, EventBusError> {
    if event.is::<RegularMentoringSessionCreated>() {
        Ok(event.decode::<RegularMentoringSessionCreated>()?.0)
    } else if event.is::<GapAnalysisSessionCreated>() {
        Ok(event.decode::<GapAnalysisSessionCreated>()?.0)
    } else if event.is::<AiCareerSessionCreated>() {
        Ok(event.decode::<AiCareerSessionCreated>()?.0)
    } else if event.is::<CommSessionCreated>() {
        Ok(event.decode::<CommSessionCreated>()?.0)
    } else if event.is::<ClassSessionCreated>() {
        Ok(event.decode::<ClassSessionCreated>()?.0)
    } else {
        Err(EventBusError::UnexpectedEventType {
            expected: "*.session.created".to_string(),
            actual: event.event_type.clone(),
        })
    }
}

#[async_trait]
impl EventHandler for SessionProvisioningSaga {
    async fn handle(&self, event: &IntegrationEvent) -> std::result::Result<(), HandlerError> {
        let data = decode_session_created(event)?;
        self.handle_session_created(&data).await?;
        Ok(())
    }
}
