//! Calendar service trait and in-memory implementation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::{SessionId, SlotId, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{read, write};
use crate::context::SagaExecutionContext;

/// Calendar service errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CalendarError {
    /// The slot was cancelled before; cancelling again is a no-op.
    #[error("Slot {0} is already cancelled")]
    AlreadyCancelled(SlotId),

    #[error("Slot {0} not found")]
    NotFound(SlotId),

    #[error("Calendar unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotStatus {
    /// Time blocked, no meeting yet.
    Reserved,
    /// Linked to a session with a meeting.
    Booked,
    Completed,
    Cancelled,
}

/// A participant's time reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: SlotId,
    pub user_id: UserId,
    pub session_id: Option<SessionId>,
    pub start: DateTime<Utc>,
    pub duration_minutes: u32,
    pub status: SlotStatus,
    pub meeting_id: Option<String>,
    pub meeting_url: Option<String>,
    /// Names of everyone in the session, shown on the calendar entry.
    pub display_names: Vec<String>,
}

impl Slot {
    fn end(&self) -> DateTime<Utc> {
        self.start + Duration::minutes(i64::from(self.duration_minutes))
    }

    fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start < end && start < self.end()
    }
}

/// Request to block time for one participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRequest {
    pub user_id: UserId,
    pub session_id: SessionId,
    pub start: DateTime<Utc>,
    pub duration_minutes: u32,
}

/// Meeting linkage applied to a booking's slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotLink {
    pub session_id: SessionId,
    pub meeting_id: String,
    pub meeting_url: String,
    pub slot_ids: Vec<SlotId>,
    pub display_names: Vec<String>,
}

/// Trait for calendar operations.
#[async_trait]
pub trait CalendarService: Send + Sync {
    /// Blocks time inside the caller's unit of work.
    ///
    /// Returns `None` when the participant already has an overlapping slot.
    async fn create_slot_direct(
        &self,
        ctx: &mut SagaExecutionContext,
        request: SlotRequest,
    ) -> Result<Option<Slot>, CalendarError>;

    /// Attaches session and meeting details to the given slots.
    async fn update_slot_with_session_and_meeting(
        &self,
        ctx: &mut SagaExecutionContext,
        link: SlotLink,
    ) -> Result<(), CalendarError>;

    async fn cancel_slot(&self, slot_id: SlotId) -> Result<(), CalendarError>;

    /// Sets the status of every slot linked to a meeting; returns how many changed.
    async fn update_status_by_meeting_id(
        &self,
        meeting_id: &str,
        status: SlotStatus,
    ) -> Result<u64, CalendarError>;
}

#[derive(Debug, Default)]
struct InMemoryCalendarState {
    slots: HashMap<SlotId, Slot>,
    fail_on_link: bool,
    fail_on_status_update: bool,
    failing_cancellations: HashSet<SlotId>,
    cancel_calls: u32,
}

/// In-memory calendar service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCalendarService {
    state: Arc<RwLock<InMemoryCalendarState>>,
}

impl InMemoryCalendarService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_on_link(&self, fail: bool) {
        write(&self.state).fail_on_link = fail;
    }

    pub fn set_fail_on_status_update(&self, fail: bool) {
        write(&self.state).fail_on_status_update = fail;
    }

    /// Makes cancellation of one slot fail with an unavailable error.
    pub fn fail_cancel_of(&self, slot_id: SlotId) {
        write(&self.state).failing_cancellations.insert(slot_id);
    }

    pub fn slot(&self, slot_id: SlotId) -> Option<Slot> {
        read(&self.state).slots.get(&slot_id).cloned()
    }

    pub fn slot_count(&self) -> usize {
        read(&self.state).slots.len()
    }

    pub fn cancel_calls(&self) -> u32 {
        read(&self.state).cancel_calls
    }

    /// Slots of a session in the given status.
    pub fn slots_with_status(&self, session_id: SessionId, status: SlotStatus) -> Vec<Slot> {
        read(&self.state)
            .slots
            .values()
            .filter(|s| s.session_id == Some(session_id) && s.status == status)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CalendarService for InMemoryCalendarService {
    async fn create_slot_direct(
        &self,
        ctx: &mut SagaExecutionContext,
        request: SlotRequest,
    ) -> Result<Option<Slot>, CalendarError> {
        let end = request.start + Duration::minutes(i64::from(request.duration_minutes));
        let mut state = write(&self.state);

        let conflict = state.slots.values().any(|s| {
            s.user_id == request.user_id
                && s.status != SlotStatus::Cancelled
                && s.overlaps(request.start, end)
        });
        if conflict {
            return Ok(None);
        }

        let slot = Slot {
            id: SlotId::new(),
            user_id: request.user_id,
            session_id: Some(request.session_id),
            start: request.start,
            duration_minutes: request.duration_minutes,
            status: SlotStatus::Reserved,
            meeting_id: None,
            meeting_url: None,
            display_names: Vec::new(),
        };
        state.slots.insert(slot.id, slot.clone());

        let undo_state = self.state.clone();
        let slot_id = slot.id;
        ctx.on_rollback(move || {
            write(&undo_state).slots.remove(&slot_id);
        });

        Ok(Some(slot))
    }

    async fn update_slot_with_session_and_meeting(
        &self,
        ctx: &mut SagaExecutionContext,
        link: SlotLink,
    ) -> Result<(), CalendarError> {
        let mut state = write(&self.state);

        if state.fail_on_link {
            return Err(CalendarError::Unavailable("slot update rejected".to_string()));
        }
        if let Some(missing) = link.slot_ids.iter().find(|id| !state.slots.contains_key(id)) {
            return Err(CalendarError::NotFound(*missing));
        }

        let mut previous = Vec::with_capacity(link.slot_ids.len());
        for slot_id in &link.slot_ids {
            if let Some(slot) = state.slots.get_mut(slot_id) {
                previous.push(slot.clone());
                slot.session_id = Some(link.session_id);
                slot.meeting_id = Some(link.meeting_id.clone());
                slot.meeting_url = Some(link.meeting_url.clone());
                slot.display_names = link.display_names.clone();
                slot.status = SlotStatus::Booked;
            }
        }

        let undo_state = self.state.clone();
        ctx.on_rollback(move || {
            let mut state = write(&undo_state);
            for slot in previous {
                state.slots.insert(slot.id, slot);
            }
        });
        Ok(())
    }

    async fn cancel_slot(&self, slot_id: SlotId) -> Result<(), CalendarError> {
        let mut state = write(&self.state);
        state.cancel_calls += 1;

        if state.failing_cancellations.contains(&slot_id) {
            return Err(CalendarError::Unavailable(format!(
                "cancellation of {slot_id} rejected"
            )));
        }

        let slot = state
            .slots
            .get_mut(&slot_id)
            .ok_or(CalendarError::NotFound(slot_id))?;
        if slot.status == SlotStatus::Cancelled {
            return Err(CalendarError::AlreadyCancelled(slot_id));
        }
        slot.status = SlotStatus::Cancelled;
        Ok(())
    }

    async fn update_status_by_meeting_id(
        &self,
        meeting_id: &str,
        status: SlotStatus,
    ) -> Result<u64, CalendarError> {
        let mut state = write(&self.state);

        if state.fail_on_status_update {
            return Err(CalendarError::Unavailable("status update rejected".to_string()));
        }

        let mut updated = 0;
        for slot in state
            .slots
            .values_mut()
            .filter(|s| s.meeting_id.as_deref() == Some(meeting_id))
        {
            slot.status = status;
            updated += 1;
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(user_id: UserId, start: DateTime<Utc>) -> SlotRequest {
        SlotRequest {
            user_id,
            session_id: SessionId::new(),
            start,
            duration_minutes: 60,
        }
    }

    #[tokio::test]
    async fn test_overlapping_slot_is_a_conflict() {
        let calendar = InMemoryCalendarService::new();
        let user = UserId::new();
        let start = Utc::now();
        let mut ctx = SagaExecutionContext::in_memory();

        let first = calendar
            .create_slot_direct(&mut ctx, request(user, start))
            .await
            .unwrap();
        assert!(first.is_some());

        let overlapping = calendar
            .create_slot_direct(&mut ctx, request(user, start + Duration::minutes(30)))
            .await
            .unwrap();
        assert!(overlapping.is_none());

        let adjacent = calendar
            .create_slot_direct(&mut ctx, request(user, start + Duration::minutes(60)))
            .await
            .unwrap();
        assert!(adjacent.is_some());
        ctx.commit().await.unwrap();

        assert_eq!(calendar.slot_count(), 2);
    }

    #[tokio::test]
    async fn test_rollback_removes_created_slots() {
        let calendar = InMemoryCalendarService::new();
        let mut ctx = SagaExecutionContext::in_memory();

        calendar
            .create_slot_direct(&mut ctx, request(UserId::new(), Utc::now()))
            .await
            .unwrap();
        ctx.rollback().await.unwrap();

        assert_eq!(calendar.slot_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_twice_reports_already_cancelled() {
        let calendar = InMemoryCalendarService::new();
        let mut ctx = SagaExecutionContext::in_memory();
        let slot = calendar
            .create_slot_direct(&mut ctx, request(UserId::new(), Utc::now()))
            .await
            .unwrap()
            .unwrap();
        ctx.commit().await.unwrap();

        calendar.cancel_slot(slot.id).await.unwrap();
        assert_eq!(
            calendar.cancel_slot(slot.id).await,
            Err(CalendarError::AlreadyCancelled(slot.id))
        );
    }

    #[tokio::test]
    async fn test_status_update_by_meeting() {
        let calendar = InMemoryCalendarService::new();
        let session_id = SessionId::new();
        let mut ctx = SagaExecutionContext::in_memory();
        let slot = calendar
            .create_slot_direct(
                &mut ctx,
                SlotRequest {
                    session_id,
                    ..request(UserId::new(), Utc::now())
                },
            )
            .await
            .unwrap()
            .unwrap();
        calendar
            .update_slot_with_session_and_meeting(
                &mut ctx,
                SlotLink {
                    session_id,
                    meeting_id: "M-1".to_string(),
                    meeting_url: "https://meet/M-1".to_string(),
                    slot_ids: vec![slot.id],
                    display_names: vec!["Ada".to_string()],
                },
            )
            .await
            .unwrap();
        ctx.commit().await.unwrap();

        let updated = calendar
            .update_status_by_meeting_id("M-1", SlotStatus::Completed)
            .await
            .unwrap();

        assert_eq!(updated, 1);
        assert_eq!(
            calendar.slot(slot.id).unwrap().status,
            SlotStatus::Completed
        );
    }
}
