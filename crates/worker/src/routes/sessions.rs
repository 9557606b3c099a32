//! Session booking and lifecycle endpoints.
//!
//! Booking runs the scheduler inline. Changes and provider signals are
//! published to the transport and handled by the sagas asynchronously.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use common::{ClassId, SessionId, UserId};
use domain::{
    MeetingLifecycleCompleted, MeetingProvider, SessionCancelled, SessionKind, SessionRecord,
    SessionRescheduled, producers,
};
use event_bus::{EventDefinition, IntegrationEvent};
use saga::SessionRequest;
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

// -- Request types --

#[derive(Deserialize)]
pub struct BookSessionRequest {
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
    #[serde(default = "default_allow_billing")]
    pub allow_billing: bool,
}

fn default_allow_billing() -> bool {
    true
}

impl From<BookSessionRequest> for SessionRequest {
    fn from(req: BookSessionRequest) -> Self {
        SessionRequest {
            kind: req.kind,
            mentor_id: req.mentor_id,
            student_id: req.student_id,
            counselor_id: req.counselor_id,
            class_id: req.class_id,
            topic: req.topic,
            scheduled_start: req.scheduled_start,
            duration_minutes: req.duration_minutes,
            meeting_provider: req.meeting_provider,
            service_type_code: req.service_type_code,
            session_type_code: req.session_type_code,
            allow_billing: req.allow_billing,
        }
    }
}

#[derive(Deserialize)]
pub struct CancelSessionRequest {
    pub reason: String,
    pub cancelled_by: Option<UserId>,
}

#[derive(Deserialize)]
pub struct RescheduleSessionRequest {
    pub new_start: DateTime<Utc>,
    pub new_duration_minutes: Option<u32>,
    pub new_topic: Option<String>,
}

// -- Response types --

#[derive(Serialize)]
pub struct SessionBookedResponse {
    pub session_id: SessionId,
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct AcceptedResponse {
    pub event_id: String,
    pub event_type: String,
}

// -- Handlers --

/// POST /sessions: book a session; the meeting is provisioned asynchronously.
#[tracing::instrument(skip(state, req))]
pub async fn book(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BookSessionRequest>,
) -> Result<(StatusCode, Json<SessionBookedResponse>), ApiError> {
    let session_id = state.sagas.scheduler.schedule(req.into()).await?;
    metrics::counter!("sessions_booked_total").increment(1);

    Ok((
        StatusCode::CREATED,
        Json(SessionBookedResponse {
            session_id,
            status: "PENDING_MEETING",
        }),
    ))
}

/// GET /sessions/{id}
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionRecord>, ApiError> {
    let session_id = parse_session_id(&id)?;
    state
        .sessions
        .find(session_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Session {session_id} not found")))
}

/// POST /sessions/{id}/cancel
#[tracing::instrument(skip(state, req))]
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<CancelSessionRequest>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let session_id = parse_session_id(&id)?;
    let payload = SessionCancelled {
        session_id,
        reason: req.reason,
        cancelled_by: req.cancelled_by,
    };
    accept(&state, &payload, producers::SESSION_SCHEDULER).await
}

/// POST /sessions/{id}/reschedule
#[tracing::instrument(skip(state, req))]
pub async fn reschedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<RescheduleSessionRequest>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let session_id = parse_session_id(&id)?;
    let payload = SessionRescheduled {
        session_id,
        new_start: req.new_start,
        new_duration_minutes: req.new_duration_minutes,
        new_topic: req.new_topic,
    };
    accept(&state, &payload, producers::SESSION_SCHEDULER).await
}

/// POST /meetings/completed: provider callback for an ended meeting.
#[tracing::instrument(skip(state, payload), fields(meeting_id = %payload.meeting_id))]
pub async fn meeting_completed(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<MeetingLifecycleCompleted>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    accept(&state, &payload, producers::MEETING_LIFECYCLE).await
}

async fn accept<E: EventDefinition>(
    state: &AppState,
    payload: &E,
    producer: &str,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let event = IntegrationEvent::from_definition(payload)?;
    let response = AcceptedResponse {
        event_id: event.id.to_string(),
        event_type: event.event_type.clone(),
    };
    state.publisher.publish(event, producer).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

fn parse_session_id(raw: &str) -> Result<SessionId, ApiError> {
    uuid::Uuid::parse_str(raw)
        .map(SessionId::from_uuid)
        .map_err(|e| ApiError::BadRequest(format!("Invalid session id: {e}")))
}
