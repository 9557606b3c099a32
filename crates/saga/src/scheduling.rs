//! Booking entry point: reserves time and entitlement, persists the session
//! as `PendingMeeting` and announces it to the provisioning saga.

use chrono::{DateTime, Utc};
use common::{ClassId, SessionId, UserId};
use domain::{
    AiCareerSessionCreated, ClassSessionCreated, CommSessionCreated, DomainError,
    GapAnalysisSessionCreated, MeetingProvider, RegularMentoringSessionCreated, SessionCreatedData,
    SessionKind, SessionRecord, SessionStatus, consumption_quantity, producers,
};

use crate::base::{SagaBase, SagaDependencies};
use crate::context::SagaExecutionContext;
use crate::error::{Result, SagaError};
use crate::services::{NewHold, SlotRequest};

/// A booking request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub kind: SessionKind,
    pub mentor_id: UserId,
    pub student_id: Option<UserId>,
    pub counselor_id: Option<UserId>,
    pub class_id: Option<ClassId>,
    pub topic: String,
    pub scheduled_start: DateTime<Utc>,
    pub duration_minutes: u32,
    pub meeting_provider: MeetingProvider,
    pub service_type_code: String,
    pub session_type_code: String,
    pub allow_billing: bool,
}

impl SessionRequest {
    fn validate(&self) -> std::result::Result<(), DomainError> {
        if self.duration_minutes == 0 {
            return Err(DomainError::InvalidDuration {
                field: "duration_minutes",
                minutes: 0,
            });
        }
        if self.topic.trim().is_empty() {
            return Err(DomainError::MissingField("topic"));
        }
        if self.kind.is_group() {
            if self.class_id.is_none() {
                return Err(DomainError::MissingField("class_id"));
            }
        } else if self.student_id.is_none() {
            return Err(DomainError::MissingField("student_id"));
        }
        Ok(())
    }

    /// Participants that get a calendar slot. Class attendees book through
    /// the class, so only the mentor's time is blocked.
    fn slot_owners(&self) -> Vec<UserId> {
        if self.kind.is_group() {
            return vec![self.mentor_id];
        }
        std::iter::once(self.mentor_id)
            .chain(self.student_id)
            .chain(self.counselor_id)
            .collect()
    }
}

/// Session scheduler.
pub struct SessionScheduler {
    base: SagaBase,
    deps: SagaDependencies,
}

impl SessionScheduler {
    pub fn new(deps: SagaDependencies) -> Self {
        Self {
            base: SagaBase::new(&deps, producers::SESSION_SCHEDULER),
            deps,
        }
    }

    /// Books a session and returns its id.
    ///
    /// Slots, hold and session are written in one transaction; any conflict
    /// rolls all of them back.
    #[tracing::instrument(skip(self, request), fields(kind = %request.kind, mentor_id = %request.mentor_id))]
    pub async fn schedule(&self, request: SessionRequest) -> Result<SessionId> {
        request.validate()?;

        let session_id = SessionId::new();
        let mut ctx = self.base.begin().await?;
        let result = self.persist(&mut ctx, session_id, &request).await;
        self.base.finish(ctx, result).await?;

        self.announce(session_id, &request).await?;
        tracing::info!(session_id = %session_id, "Session booked");
        Ok(session_id)
    }

    async fn persist(
        &self,
        ctx: &mut SagaExecutionContext,
        session_id: SessionId,
        request: &SessionRequest,
    ) -> Result<()> {
        let mut slot_ids = Vec::new();
        for user_id in request.slot_owners() {
            let slot = self
                .deps
                .calendar
                .create_slot_direct(
                    ctx,
                    SlotRequest {
                        user_id,
                        session_id,
                        start: request.scheduled_start,
                        duration_minutes: request.duration_minutes,
                    },
                )
                .await?
                .ok_or(SagaError::SlotConflict {
                    user_id,
                    start: request.scheduled_start,
                })?;
            slot_ids.push(slot.id);
        }

        let hold_id = match request.student_id {
            Some(student_id) if !request.kind.is_group() => {
                let quantity =
                    consumption_quantity(None, i64::from(request.duration_minutes))?;
                let hold = self
                    .deps
                    .contracts
                    .create_hold(
                        ctx,
                        NewHold {
                            student_id,
                            service_type: request.service_type_code.clone(),
                            related_booking_id: session_id,
                            quantity,
                        },
                    )
                    .await?;
                Some(hold.id)
            }
            _ => None,
        };

        self.deps
            .sessions
            .insert(
                ctx,
                SessionRecord {
                    id: session_id,
                    kind: request.kind,
                    status: SessionStatus::PendingMeeting,
                    mentor_id: request.mentor_id,
                    student_id: request.student_id,
                    counselor_id: request.counselor_id,
                    class_id: request.class_id,
                    topic: request.topic.clone(),
                    scheduled_start: request.scheduled_start,
                    duration_minutes: request.duration_minutes,
                    meeting_provider: request.meeting_provider,
                    meeting_id: None,
                    meeting_url: None,
                    slot_ids,
                    hold_id,
                    service_type_code: request.service_type_code.clone(),
                    session_type_code: request.session_type_code.clone(),
                    allow_billing: request.allow_billing,
                    failure_reason: None,
                },
            )
            .await
    }

    async fn announce(&self, session_id: SessionId, request: &SessionRequest) -> Result<()> {
        let data = SessionCreatedData {
            session_id,
            session_kind: request.kind,
            mentor_id: request.mentor_id,
            student_id: request.student_id,
            counselor_id: request.counselor_id,
            class_id: request.class_id,
            topic: request.topic.clone(),
            scheduled_start: request.scheduled_start,
            duration_minutes: request.duration_minutes,
            meeting_provider: request.meeting_provider,
        };

        match request.kind {
            SessionKind::RegularMentoring => {
                self.base.emit(&RegularMentoringSessionCreated(data)).await?
            }
            SessionKind::GapAnalysis => self.base.emit(&GapAnalysisSessionCreated(data)).await?,
            SessionKind::AiCareer => self.base.emit(&AiCareerSessionCreated(data)).await?,
            SessionKind::Communication => self.base.emit(&CommSessionCreated(data)).await?,
            SessionKind::Class => self.base.emit(&ClassSessionCreated(data)).await?,
        };
        Ok(())
    }
}
