//! Integration event payloads exchanged between the scheduling service, the
//! sagas and downstream notification / calendar-sync consumers.

use chrono::{DateTime, Utc};
use common::{ClassId, SessionId, UserId};
use event_bus::{CatalogError, EventCatalog, EventDefinition, PayloadSchema};
use serde::{Deserialize, Serialize};

use crate::session::{MeetingProvider, SessionKind, SessionRecord};

/// Producer names used in catalog declarations and when publishing.
pub mod producers {
    pub const SESSION_SCHEDULER: &str = "session-scheduler";
    pub const SESSION_PROVISIONING: &str = "session-provisioning-saga";
    pub const MEETING_CHANGE: &str = "meeting-change-saga";
    pub const MEETING_LIFECYCLE: &str = "meeting-lifecycle";
    pub const MEETING_COMPLETION: &str = "meeting-completion-handler";
}

/// Data shared by every "session created, pending meeting" event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCreatedData {
    pub session_id: SessionId,
    pub session_kind: SessionKind,
    pub mentor_id: UserId,
    pub student_id: Option<UserId>,
    pub counselor_id: Option<UserId>,
    pub class_id: Option<ClassId>,
    pub topic: String,
    pub scheduled_start: DateTime<Utc>,
    pub duration_minutes: u32,
    pub meeting_provider: MeetingProvider,
}

fn session_created_schema() -> PayloadSchema {
    PayloadSchema::new()
        .required("session_id")
        .required("session_kind")
        .required("mentor_id")
        .optional("student_id")
        .optional("counselor_id")
        .optional("class_id")
        .required("topic")
        .required("scheduled_start")
        .required("duration_minutes")
        .required("meeting_provider")
}

macro_rules! session_created_event {
    ($(#[$meta:meta])* $name:ident, $event_type:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub SessionCreatedData);

        impl EventDefinition for $name {
            const EVENT_TYPE: &'static str = $event_type;
            const VERSION: &'static str = "1.0";

            fn schema() -> PayloadSchema {
                session_created_schema()
            }

            fn description() -> &'static str {
                "Session persisted in PENDING_MEETING; a meeting must be provisioned"
            }
        }
    };
}

session_created_event!(
    /// A one-off mentoring session was booked.
    RegularMentoringSessionCreated,
    "regular_mentoring.session.created"
);
session_created_event!(
    /// A gap-analysis session was booked.
    GapAnalysisSessionCreated,
    "gap_analysis.session.created"
);
session_created_event!(
    /// An AI-career session was booked.
    AiCareerSessionCreated,
    "ai_career.session.created"
);
session_created_event!(
    /// A counselor communication session was booked.
    CommSessionCreated,
    "comm_session.session.created"
);
session_created_event!(
    /// A class session was booked.
    ClassSessionCreated,
    "class_session.session.created"
);

/// Returns the creation event type for a session kind.
pub fn session_created_event_type(kind: SessionKind) -> &'static str {
    match kind {
        SessionKind::RegularMentoring => RegularMentoringSessionCreated::EVENT_TYPE,
        SessionKind::GapAnalysis => GapAnalysisSessionCreated::EVENT_TYPE,
        SessionKind::AiCareer => AiCareerSessionCreated::EVENT_TYPE,
        SessionKind::Communication => CommSessionCreated::EVENT_TYPE,
        SessionKind::Class => ClassSessionCreated::EVENT_TYPE,
    }
}

/// Meeting operation reported by [`MeetingOperationResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingOperation {
    Create,
    Update,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Success,
    Failed,
}

/// Audience of a result notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyRole {
    Counselor,
    Mentor,
    Student,
}

impl NotifyRole {
    /// Roles notified about every meeting outcome.
    pub const ALL: [NotifyRole; 3] = [NotifyRole::Counselor, NotifyRole::Mentor, NotifyRole::Student];
}

/// Outcome of a saga run against the conferencing provider.
///
/// `require_manual_intervention` is the operator alarm: some compensation
/// step failed and state across domains may be inconsistent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeetingOperationResult {
    pub session_id: SessionId,
    pub session_kind: SessionKind,
    pub operation: MeetingOperation,
    pub status: OperationStatus,
    pub provider: MeetingProvider,
    pub meeting_id: Option<String>,
    pub meeting_url: Option<String>,
    pub scheduled_start: Option<DateTime<Utc>>,
    pub duration_minutes: Option<u32>,
    pub topic: Option<String>,
    pub mentor_id: UserId,
    pub student_id: Option<UserId>,
    pub counselor_id: Option<UserId>,
    #[serde(default)]
    pub affected_student_ids: Vec<UserId>,
    #[serde(default)]
    pub affected_counselor_ids: Vec<UserId>,
    pub notify_roles: Vec<NotifyRole>,
    pub require_manual_intervention: bool,
    pub error_message: Option<String>,
}

impl EventDefinition for MeetingOperationResult {
    const EVENT_TYPE: &'static str = "meeting.operation.result";
    const VERSION: &'static str = "1.0";

    fn schema() -> PayloadSchema {
        PayloadSchema::new()
            .required("session_id")
            .required("session_kind")
            .required("operation")
            .required("status")
            .required("provider")
            .optional("meeting_id")
            .optional("meeting_url")
            .optional("scheduled_start")
            .optional("duration_minutes")
            .optional("topic")
            .required("mentor_id")
            .optional("student_id")
            .optional("counselor_id")
            .optional("affected_student_ids")
            .optional("affected_counselor_ids")
            .required("notify_roles")
            .required("require_manual_intervention")
            .optional("error_message")
    }

    fn description() -> &'static str {
        "Result of a meeting create/update/cancel saga run"
    }
}

impl MeetingOperationResult {
    /// Result skeleton for a session: participants and meeting details are
    /// copied from the record, every role is notified.
    pub fn for_session(
        session: &SessionRecord,
        operation: MeetingOperation,
        status: OperationStatus,
    ) -> Self {
        Self {
            session_id: session.id,
            session_kind: session.kind,
            operation,
            status,
            provider: session.meeting_provider,
            meeting_id: session.meeting_id.clone(),
            meeting_url: session.meeting_url.clone(),
            scheduled_start: Some(session.scheduled_start),
            duration_minutes: Some(session.duration_minutes),
            topic: Some(session.topic.clone()),
            mentor_id: session.mentor_id,
            student_id: session.student_id,
            counselor_id: session.counselor_id,
            affected_student_ids: Vec::new(),
            affected_counselor_ids: Vec::new(),
            notify_roles: NotifyRole::ALL.to_vec(),
            require_manual_intervention: false,
            error_message: None,
        }
    }

    pub fn with_meeting(mut self, meeting_id: impl Into<String>, meeting_url: impl Into<String>) -> Self {
        self.meeting_id = Some(meeting_id.into());
        self.meeting_url = Some(meeting_url.into());
        self
    }

    /// Adds class roster members to the notification audience.
    pub fn with_roster(mut self, students: Vec<UserId>, counselors: Vec<UserId>) -> Self {
        self.affected_student_ids = students;
        self.affected_counselor_ids = counselors;
        self
    }

    pub fn with_error(mut self, message: impl Into<String>, require_manual_intervention: bool) -> Self {
        self.error_message = Some(message.into());
        self.require_manual_intervention = require_manual_intervention;
        self
    }
}

/// Provider signal that a meeting has ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeetingLifecycleCompleted {
    pub meeting_id: String,
    pub provider: MeetingProvider,
    pub actual_duration_minutes: Option<i64>,
    pub ended_at: DateTime<Utc>,
}

impl EventDefinition for MeetingLifecycleCompleted {
    const EVENT_TYPE: &'static str = "meeting.lifecycle.completed";
    const VERSION: &'static str = "1.0";

    fn schema() -> PayloadSchema {
        PayloadSchema::new()
            .required("meeting_id")
            .required("provider")
            .optional("actual_duration_minutes")
            .required("ended_at")
    }

    fn description() -> &'static str {
        "Conferencing provider reports a meeting has ended"
    }
}

/// A service session finished and must be settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSessionCompleted {
    pub session_id: SessionId,
    pub student_id: UserId,
    pub mentor_id: Option<UserId>,
    pub service_type_code: String,
    pub session_type_code: String,
    pub actual_duration_minutes: Option<i64>,
    pub duration_minutes: i64,
    pub allow_billing: bool,
    /// Billing idempotency key.
    pub reference_id: Option<String>,
    pub session_kind: Option<SessionKind>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl EventDefinition for ServiceSessionCompleted {
    const EVENT_TYPE: &'static str = "services.session.completed";
    const VERSION: &'static str = "1.0";

    fn schema() -> PayloadSchema {
        PayloadSchema::new()
            .required("session_id")
            .required("student_id")
            .optional("mentor_id")
            .required("service_type_code")
            .required("session_type_code")
            .optional("actual_duration_minutes")
            .required("duration_minutes")
            .required("allow_billing")
            .optional("reference_id")
            .optional("session_kind")
            .optional("completed_at")
    }

    fn description() -> &'static str {
        "Service session completed; settle calendar, entitlement and billing"
    }
}

/// A scheduled session moved to a new time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRescheduled {
    pub session_id: SessionId,
    pub new_start: DateTime<Utc>,
    pub new_duration_minutes: Option<u32>,
    pub new_topic: Option<String>,
}

impl EventDefinition for SessionRescheduled {
    const EVENT_TYPE: &'static str = "session.rescheduled";
    const VERSION: &'static str = "1.0";

    fn schema() -> PayloadSchema {
        PayloadSchema::new()
            .required("session_id")
            .required("new_start")
            .optional("new_duration_minutes")
            .optional("new_topic")
    }
}

/// A session was called off before it took place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCancelled {
    pub session_id: SessionId,
    pub reason: String,
    pub cancelled_by: Option<UserId>,
}

impl EventDefinition for SessionCancelled {
    const EVENT_TYPE: &'static str = "session.cancelled";
    const VERSION: &'static str = "1.0";

    fn schema() -> PayloadSchema {
        PayloadSchema::new()
            .required("session_id")
            .required("reason")
            .optional("cancelled_by")
    }
}

/// Declares every event type with its producer.
///
/// Called once at startup, before handlers subscribe.
pub fn register_event_catalog(catalog: &EventCatalog) -> Result<(), CatalogError> {
    use producers::*;

    catalog.declare::<RegularMentoringSessionCreated>(SESSION_SCHEDULER)?;
    catalog.declare::<GapAnalysisSessionCreated>(SESSION_SCHEDULER)?;
    catalog.declare::<AiCareerSessionCreated>(SESSION_SCHEDULER)?;
    catalog.declare::<CommSessionCreated>(SESSION_SCHEDULER)?;
    catalog.declare::<ClassSessionCreated>(SESSION_SCHEDULER)?;
    catalog.declare::<SessionRescheduled>(SESSION_SCHEDULER)?;
    catalog.declare::<SessionCancelled>(SESSION_SCHEDULER)?;
    catalog.declare::<MeetingOperationResult>(SESSION_PROVISIONING)?;
    catalog.declare::<MeetingOperationResult>(MEETING_CHANGE)?;
    catalog.declare::<MeetingLifecycleCompleted>(MEETING_LIFECYCLE)?;
    catalog.declare::<ServiceSessionCompleted>(MEETING_COMPLETION)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_bus::IntegrationEvent;

    fn created_data(kind: SessionKind) -> SessionCreatedData {
        SessionCreatedData {
            session_id: SessionId::new(),
            session_kind: kind,
            mentor_id: UserId::new(),
            student_id: Some(UserId::new()),
            counselor_id: None,
            class_id: None,
            topic: "Resume review".to_string(),
            scheduled_start: Utc::now(),
            duration_minutes: 60,
            meeting_provider: MeetingProvider::Feishu,
        }
    }

    #[test]
    fn catalog_declares_every_event_once() {
        let catalog = EventCatalog::new();
        register_event_catalog(&catalog).unwrap();

        assert_eq!(catalog.len(), 10);
        assert_eq!(
            catalog.producers_of(MeetingOperationResult::EVENT_TYPE),
            vec![
                producers::MEETING_CHANGE.to_string(),
                producers::SESSION_PROVISIONING.to_string()
            ]
        );
        // nothing subscribed yet
        assert_eq!(catalog.orphans().len(), 10);
    }

    #[test]
    fn creation_event_type_per_kind_is_distinct() {
        let mut types: Vec<_> = SessionKind::ALL
            .iter()
            .map(|k| session_created_event_type(*k))
            .collect();
        types.sort();
        types.dedup();
        assert_eq!(types.len(), SessionKind::ALL.len());
    }

    #[test]
    fn created_payload_is_flat_and_satisfies_schema() {
        let event =
            IntegrationEvent::from_definition(&ClassSessionCreated(created_data(SessionKind::Class)))
                .unwrap();

        assert!(event.payload.get("session_id").is_some());
        assert!(session_created_schema().missing_required(&event.payload).is_empty());
    }

    #[test]
    fn result_for_session_notifies_every_role() {
        let session = SessionRecord {
            id: SessionId::new(),
            kind: SessionKind::GapAnalysis,
            status: crate::session::SessionStatus::Scheduled,
            mentor_id: UserId::new(),
            student_id: Some(UserId::new()),
            counselor_id: None,
            class_id: None,
            topic: "Gap analysis".to_string(),
            scheduled_start: Utc::now(),
            duration_minutes: 45,
            meeting_provider: MeetingProvider::Zoom,
            meeting_id: None,
            meeting_url: None,
            slot_ids: vec![],
            hold_id: None,
            service_type_code: "GAP".to_string(),
            session_type_code: "GAP_60".to_string(),
            allow_billing: true,
            failure_reason: None,
        };

        let result = MeetingOperationResult::for_session(
            &session,
            MeetingOperation::Create,
            OperationStatus::Failed,
        )
        .with_error("provider down", true);

        assert_eq!(result.notify_roles, NotifyRole::ALL.to_vec());
        assert_eq!(result.duration_minutes, Some(45));
        assert!(result.require_manual_intervention);
        assert_eq!(result.error_message.as_deref(), Some("provider down"));
    }

    #[test]
    fn completed_payload_reports_missing_required_fields() {
        let payload = serde_json::json!({"session_id": SessionId::new()});
        let missing = ServiceSessionCompleted::schema().missing_required(&payload);
        assert!(missing.contains(&"student_id".to_string()));
        assert!(missing.contains(&"allow_billing".to_string()));
    }
}
