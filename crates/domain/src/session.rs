//! Session model shared by the scheduling service and the sagas.

use chrono::{DateTime, Utc};
use common::{ClassId, HoldId, SessionId, SlotId, UserId};
use serde::{Deserialize, Serialize};

/// The status of a session in its lifecycle.
///
/// State transitions:
/// ```text
/// PendingMeeting ──┬──► Scheduled ──┬──► Completed
///                  │                └──► Cancelled
///                  ├──► MeetingFailed
///                  └──► Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Persisted by the scheduling service, waiting for a meeting.
    #[default]
    PendingMeeting,

    /// Meeting created and linked.
    Scheduled,

    /// Meeting creation failed and was compensated (terminal state).
    MeetingFailed,

    /// Session took place (terminal state).
    Completed,

    /// Session was called off (terminal state).
    Cancelled,
}

impl SessionStatus {
    /// Returns true if a meeting may still be provisioned.
    pub fn awaits_meeting(&self) -> bool {
        matches!(self, SessionStatus::PendingMeeting)
    }

    /// Returns true if the session can be cancelled in this state.
    pub fn can_cancel(&self) -> bool {
        matches!(
            self,
            SessionStatus::PendingMeeting | SessionStatus::Scheduled
        )
    }

    /// Returns true if this is a terminal state (no further transitions possible).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::MeetingFailed | SessionStatus::Completed | SessionStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::PendingMeeting => "PENDING_MEETING",
            SessionStatus::Scheduled => "SCHEDULED",
            SessionStatus::MeetingFailed => "MEETING_FAILED",
            SessionStatus::Completed => "COMPLETED",
            SessionStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The kinds of session that go through meeting provisioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// One-off mentor/student session.
    RegularMentoring,
    GapAnalysis,
    AiCareer,
    /// Counselor/student communication session.
    Communication,
    /// Mentor-led group session; attendees come from the class roster.
    Class,
}

impl SessionKind {
    pub const ALL: [SessionKind; 5] = [
        SessionKind::RegularMentoring,
        SessionKind::GapAnalysis,
        SessionKind::AiCareer,
        SessionKind::Communication,
        SessionKind::Class,
    ];

    /// Class sessions reserve a single slot and carry no student-side hold.
    pub fn is_group(&self) -> bool {
        matches!(self, SessionKind::Class)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::RegularMentoring => "regular_mentoring",
            SessionKind::GapAnalysis => "gap_analysis",
            SessionKind::AiCareer => "ai_career",
            SessionKind::Communication => "communication",
            SessionKind::Class => "class",
        }
    }
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Conferencing provider hosting a session's meeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingProvider {
    Feishu,
    Zoom,
}

impl MeetingProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeetingProvider::Feishu => "feishu",
            MeetingProvider::Zoom => "zoom",
        }
    }
}

impl std::fmt::Display for MeetingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Meeting linkage written when provisioning succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeetingLink {
    pub provider: MeetingProvider,
    pub meeting_id: String,
    pub meeting_url: String,
}

/// A persisted session, as seen by the sagas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub mentor_id: UserId,
    pub student_id: Option<UserId>,
    pub counselor_id: Option<UserId>,
    pub class_id: Option<ClassId>,
    pub topic: String,
    pub scheduled_start: DateTime<Utc>,
    pub duration_minutes: u32,
    pub meeting_provider: MeetingProvider,
    pub meeting_id: Option<String>,
    pub meeting_url: Option<String>,
    /// Calendar slots reserved for this booking.
    pub slot_ids: Vec<SlotId>,
    pub hold_id: Option<HoldId>,
    pub service_type_code: String,
    pub session_type_code: String,
    pub allow_billing: bool,
    pub failure_reason: Option<String>,
}

impl SessionRecord {
    /// Every participant that owns a calendar slot, mentor first.
    pub fn participants(&self) -> Vec<UserId> {
        std::iter::once(self.mentor_id)
            .chain(self.student_id)
            .chain(self.counselor_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_status_is_pending_meeting() {
        assert_eq!(SessionStatus::default(), SessionStatus::PendingMeeting);
    }

    #[test]
    fn only_pending_awaits_meeting() {
        assert!(SessionStatus::PendingMeeting.awaits_meeting());
        assert!(!SessionStatus::Scheduled.awaits_meeting());
        assert!(!SessionStatus::MeetingFailed.awaits_meeting());
        assert!(!SessionStatus::Completed.awaits_meeting());
        assert!(!SessionStatus::Cancelled.awaits_meeting());
    }

    #[test]
    fn terminal_states() {
        assert!(!SessionStatus::PendingMeeting.is_terminal());
        assert!(!SessionStatus::Scheduled.is_terminal());
        assert!(SessionStatus::MeetingFailed.is_terminal());
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn status_serializes_screaming_snake() {
        let json = serde_json::to_string(&SessionStatus::MeetingFailed).unwrap();
        assert_eq!(json, "\"MEETING_FAILED\"");
        assert_eq!(SessionStatus::PendingMeeting.to_string(), "PENDING_MEETING");
    }

    #[test]
    fn only_class_is_group() {
        let groups: Vec<_> = SessionKind::ALL.iter().filter(|k| k.is_group()).collect();
        assert_eq!(groups, vec![&SessionKind::Class]);
    }
}
