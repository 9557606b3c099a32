//! Session repository trait and in-memory implementation.
//!
//! Every status transition is a compare-and-set: it applies only when the
//! session is still in the expected source state and reports whether it did.
//! Concurrent deliveries of the same event therefore race on the transition
//! and exactly one of them wins.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::SessionId;
use domain::{MeetingLink, SessionRecord, SessionStatus};

use super::{read, write};
use crate::context::SagaExecutionContext;
use crate::error::SagaError;

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn insert(
        &self,
        ctx: &mut SagaExecutionContext,
        session: SessionRecord,
    ) -> Result<(), SagaError>;

    async fn find(&self, session_id: SessionId) -> Result<Option<SessionRecord>, SagaError>;

    async fn find_by_meeting_id(&self, meeting_id: &str) -> Result<Option<SessionRecord>, SagaError>;

    async fn find_meeting_id(&self, session_id: SessionId) -> Result<Option<String>, SagaError>;

    /// `PendingMeeting -> Scheduled`, storing the meeting link.
    async fn link_meeting(
        &self,
        ctx: &mut SagaExecutionContext,
        session_id: SessionId,
        link: MeetingLink,
    ) -> Result<bool, SagaError>;

    /// `PendingMeeting -> MeetingFailed`.
    async fn mark_meeting_failed(
        &self,
        session_id: SessionId,
        reason: &str,
    ) -> Result<bool, SagaError>;

    /// `Scheduled -> Completed`.
    async fn mark_completed(&self, session_id: SessionId) -> Result<bool, SagaError>;

    /// `PendingMeeting | Scheduled -> Cancelled`.
    async fn mark_cancelled(&self, session_id: SessionId, reason: &str) -> Result<bool, SagaError>;

    /// Moves a scheduled session; `None` fields are kept.
    async fn reschedule(
        &self,
        session_id: SessionId,
        start: DateTime<Utc>,
        duration_minutes: Option<u32>,
        topic: Option<String>,
    ) -> Result<bool, SagaError>;
}

/// In-memory session repository for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemorySessionRepository {
    sessions: Arc<RwLock<HashMap<SessionId, SessionRecord>>>,
}

impl InMemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a session directly, bypassing any context.
    pub fn seed(&self, session: SessionRecord) {
        write(&self.sessions).insert(session.id, session);
    }

    pub fn get(&self, session_id: SessionId) -> Option<SessionRecord> {
        read(&self.sessions).get(&session_id).cloned()
    }

    pub fn status(&self, session_id: SessionId) -> Option<SessionStatus> {
        read(&self.sessions).get(&session_id).map(|s| s.status)
    }

    pub fn session_count(&self) -> usize {
        read(&self.sessions).len()
    }

    /// Applies `change` if the session passes `guard`; returns the prior record.
    fn compare_and_set(
        &self,
        session_id: SessionId,
        guard: impl Fn(SessionStatus) -> bool,
        change: impl FnOnce(&mut SessionRecord),
    ) -> Result<Option<SessionRecord>, SagaError> {
        let mut sessions = write(&self.sessions);
        let session = sessions
            .get_mut(&session_id)
            .ok_or(SagaError::SessionNotFound(session_id))?;
        if !guard(session.status) {
            return Ok(None);
        }
        let previous = session.clone();
        change(session);
        Ok(Some(previous))
    }
}

#[async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn insert(
        &self,
        ctx: &mut SagaExecutionContext,
        session: SessionRecord,
    ) -> Result<(), SagaError> {
        let session_id = session.id;
        self.seed(session);

        let sessions = self.sessions.clone();
        ctx.on_rollback(move || {
            write(&sessions).remove(&session_id);
        });
        Ok(())
    }

    async fn find(&self, session_id: SessionId) -> Result<Option<SessionRecord>, SagaError> {
        Ok(self.get(session_id))
    }

    async fn find_by_meeting_id(&self, meeting_id: &str) -> Result<Option<SessionRecord>, SagaError> {
        Ok(read(&self.sessions)
            .values()
            .find(|s| s.meeting_id.as_deref() == Some(meeting_id))
            .cloned())
    }

    async fn find_meeting_id(&self, session_id: SessionId) -> Result<Option<String>, SagaError> {
        Ok(read(&self.sessions)
            .get(&session_id)
            .and_then(|s| s.meeting_id.clone()))
    }

    async fn link_meeting(
        &self,
        ctx: &mut SagaExecutionContext,
        session_id: SessionId,
        link: MeetingLink,
    ) -> Result<bool, SagaError> {
        let previous = self.compare_and_set(
            session_id,
            |status| status.awaits_meeting(),
            |session| {
                session.status = SessionStatus::Scheduled;
                session.meeting_provider = link.provider;
                session.meeting_id = Some(link.meeting_id);
                session.meeting_url = Some(link.meeting_url);
            },
        )?;

        let Some(previous) = previous else {
            return Ok(false);
        };
        let sessions = self.sessions.clone();
        ctx.on_rollback(move || {
            write(&sessions).insert(previous.id, previous);
        });
        Ok(true)
    }

    async fn mark_meeting_failed(
        &self,
        session_id: SessionId,
        reason: &str,
    ) -> Result<bool, SagaError> {
        self.compare_and_set(
            session_id,
            |status| status.awaits_meeting(),
            |session| {
                session.status = SessionStatus::MeetingFailed;
                session.failure_reason = Some(reason.to_string());
            },
        )
        .map(|previous| previous.is_some())
    }

    async fn mark_completed(&self, session_id: SessionId) -> Result<bool, SagaError> {
        self.compare_and_set(
            session_id,
            |status| status == SessionStatus::Scheduled,
            |session| session.status = SessionStatus::Completed,
        )
        .map(|previous| previous.is_some())
    }

    async fn mark_cancelled(&self, session_id: SessionId, reason: &str) -> Result<bool, SagaError> {
        self.compare_and_set(
            session_id,
            |status| status.can_cancel(),
            |session| {
                session.status = SessionStatus::Cancelled;
                session.failure_reason = Some(reason.to_string());
            },
        )
        .map(|previous| previous.is_some())
    }

    async fn reschedule(
        &self,
        session_id: SessionId,
        start: DateTime<Utc>,
        duration_minutes: Option<u32>,
        topic: Option<String>,
    ) -> Result<bool, SagaError> {
        self.compare_and_set(
            session_id,
            |status| status == SessionStatus::Scheduled,
            |session| {
                session.scheduled_start = start;
                if let Some(duration) = duration_minutes {
                    session.duration_minutes = duration;
                }
                if let Some(topic) = topic {
                    session.topic = topic;
                }
            },
        )
        .map(|previous| previous.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::UserId;
    use domain::{MeetingProvider, SessionKind};

    fn pending() -> SessionRecord {
        SessionRecord {
            id: SessionId::new(),
            kind: SessionKind::RegularMentoring,
            status: SessionStatus::PendingMeeting,
            mentor_id: UserId::new(),
            student_id: Some(UserId::new()),
            counselor_id: None,
            class_id: None,
            topic: "Career chat".to_string(),
            scheduled_start: Utc::now(),
            duration_minutes: 60,
            meeting_provider: MeetingProvider::Feishu,
            meeting_id: None,
            meeting_url: None,
            slot_ids: vec![],
            hold_id: None,
            service_type_code: "MENTORING".to_string(),
            session_type_code: "MENTORING_60".to_string(),
            allow_billing: true,
            failure_reason: None,
        }
    }

    fn link(meeting_id: &str) -> MeetingLink {
        MeetingLink {
            provider: MeetingProvider::Feishu,
            meeting_id: meeting_id.to_string(),
            meeting_url: format!("https://meet/{meeting_id}"),
        }
    }

    #[tokio::test]
    async fn test_link_meeting_only_once() {
        let repo = InMemorySessionRepository::new();
        let session = pending();
        repo.seed(session.clone());

        let mut ctx = SagaExecutionContext::in_memory();
        assert!(repo.link_meeting(&mut ctx, session.id, link("M-1")).await.unwrap());
        assert!(!repo.link_meeting(&mut ctx, session.id, link("M-2")).await.unwrap());
        ctx.commit().await.unwrap();

        let stored = repo.get(session.id).unwrap();
        assert_eq!(stored.status, SessionStatus::Scheduled);
        assert_eq!(stored.meeting_id.as_deref(), Some("M-1"));
        assert_eq!(
            repo.find_by_meeting_id("M-1").await.unwrap().map(|s| s.id),
            Some(session.id)
        );
    }

    #[tokio::test]
    async fn test_link_is_reverted_on_rollback() {
        let repo = InMemorySessionRepository::new();
        let session = pending();
        repo.seed(session.clone());

        let mut ctx = SagaExecutionContext::in_memory();
        repo.link_meeting(&mut ctx, session.id, link("M-1")).await.unwrap();
        ctx.rollback().await.unwrap();

        assert_eq!(repo.status(session.id), Some(SessionStatus::PendingMeeting));
        assert!(repo.find_meeting_id(session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_session_cannot_complete() {
        let repo = InMemorySessionRepository::new();
        let session = pending();
        repo.seed(session.clone());

        assert!(repo.mark_meeting_failed(session.id, "provider down").await.unwrap());
        assert!(!repo.mark_completed(session.id).await.unwrap());
        assert!(!repo.mark_cancelled(session.id, "student request").await.unwrap());
        assert_eq!(repo.status(session.id), Some(SessionStatus::MeetingFailed));
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let repo = InMemorySessionRepository::new();
        let missing = SessionId::new();

        assert!(repo.find(missing).await.unwrap().is_none());
        assert!(matches!(
            repo.mark_completed(missing).await,
            Err(SagaError::SessionNotFound(id)) if id == missing
        ));
    }
}
