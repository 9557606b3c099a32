//! Conferencing provider client trait, provider registry and in-memory client.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::UserId;
use domain::MeetingProvider;

use super::{read, write};
use crate::error::SagaError;

/// Parameters for creating a meeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateMeetingRequest {
    pub topic: String,
    pub start_time: DateTime<Utc>,
    pub duration_minutes: u32,
    pub host_user_id: UserId,
    pub auto_record: bool,
    pub allow_early_join: bool,
}

/// Meeting created by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeetingInfo {
    /// Provider-side meeting identifier.
    pub id: String,
    pub meeting_url: String,
    pub password: Option<String>,
}

/// Partial meeting update; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeetingUpdate {
    pub topic: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub duration_minutes: Option<u32>,
}

/// Client for one conferencing provider.
#[async_trait]
pub trait ConferencingClient: Send + Sync {
    fn provider(&self) -> MeetingProvider;

    async fn create_meeting(&self, request: CreateMeetingRequest) -> Result<MeetingInfo, SagaError>;

    async fn update_meeting(&self, meeting_id: &str, update: MeetingUpdate) -> Result<(), SagaError>;

    async fn cancel_meeting(&self, meeting_id: &str) -> Result<(), SagaError>;
}

/// Conferencing clients keyed by provider.
#[derive(Clone, Default)]
pub struct ConferencingProviders {
    clients: HashMap<MeetingProvider, Arc<dyn ConferencingClient>>,
}

impl ConferencingProviders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a client under the provider it reports.
    pub fn with_client(mut self, client: Arc<dyn ConferencingClient>) -> Self {
        self.clients.insert(client.provider(), client);
        self
    }

    pub fn get(&self, provider: MeetingProvider) -> Result<Arc<dyn ConferencingClient>, SagaError> {
        self.clients
            .get(&provider)
            .cloned()
            .ok_or(SagaError::ProviderNotConfigured(provider))
    }

    pub fn providers(&self) -> Vec<MeetingProvider> {
        self.clients.keys().copied().collect()
    }
}

#[derive(Debug, Clone)]
struct StoredMeeting {
    request: CreateMeetingRequest,
    cancelled: bool,
}

#[derive(Debug, Default)]
struct InMemoryConferencingState {
    meetings: HashMap<String, StoredMeeting>,
    next_id: u32,
    create_failures_remaining: u32,
    create_delay: Option<Duration>,
    fail_on_update: bool,
    fail_on_cancel: bool,
    create_calls: u32,
    update_calls: u32,
    cancel_calls: u32,
}

/// In-memory conferencing client for testing.
#[derive(Debug, Clone)]
pub struct InMemoryConferencingClient {
    provider: MeetingProvider,
    state: Arc<RwLock<InMemoryConferencingState>>,
}

impl InMemoryConferencingClient {
    pub fn new(provider: MeetingProvider) -> Self {
        Self {
            provider,
            state: Arc::default(),
        }
    }

    /// Makes the next `count` create calls fail.
    pub fn fail_next_creates(&self, count: u32) {
        write(&self.state).create_failures_remaining = count;
    }

    /// Makes every create call wait before answering.
    pub fn set_create_delay(&self, delay: Option<Duration>) {
        write(&self.state).create_delay = delay;
    }

    pub fn set_fail_on_update(&self, fail: bool) {
        write(&self.state).fail_on_update = fail;
    }

    pub fn set_fail_on_cancel(&self, fail: bool) {
        write(&self.state).fail_on_cancel = fail;
    }

    pub fn create_calls(&self) -> u32 {
        read(&self.state).create_calls
    }

    pub fn update_calls(&self) -> u32 {
        read(&self.state).update_calls
    }

    pub fn cancel_calls(&self) -> u32 {
        read(&self.state).cancel_calls
    }

    /// Number of meetings created and not cancelled.
    pub fn active_meeting_count(&self) -> usize {
        read(&self.state)
            .meetings
            .values()
            .filter(|m| !m.cancelled)
            .count()
    }

    pub fn is_cancelled(&self, meeting_id: &str) -> bool {
        read(&self.state)
            .meetings
            .get(meeting_id)
            .is_some_and(|m| m.cancelled)
    }

    /// Current parameters of a meeting.
    pub fn meeting(&self, meeting_id: &str) -> Option<CreateMeetingRequest> {
        read(&self.state)
            .meetings
            .get(meeting_id)
            .map(|m| m.request.clone())
    }
}

#[async_trait]
impl ConferencingClient for InMemoryConferencingClient {
    fn provider(&self) -> MeetingProvider {
        self.provider
    }

    async fn create_meeting(&self, request: CreateMeetingRequest) -> Result<MeetingInfo, SagaError> {
        let delay = {
            let mut state = write(&self.state);
            state.create_calls += 1;
            state.create_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = write(&self.state);
        if state.create_failures_remaining > 0 {
            state.create_failures_remaining -= 1;
            return Err(SagaError::Provider(format!(
                "{} rejected meeting creation",
                self.provider
            )));
        }

        state.next_id += 1;
        let id = format!("{}-MTG-{:04}", self.provider.as_str().to_uppercase(), state.next_id);
        let meeting_url = format!("https://meet.{}.example/j/{id}", self.provider);
        state.meetings.insert(
            id.clone(),
            StoredMeeting {
                request,
                cancelled: false,
            },
        );

        Ok(MeetingInfo {
            id,
            meeting_url,
            password: None,
        })
    }

    async fn update_meeting(&self, meeting_id: &str, update: MeetingUpdate) -> Result<(), SagaError> {
        let mut state = write(&self.state);
        state.update_calls += 1;

        if state.fail_on_update {
            return Err(SagaError::Provider(format!(
                "{} rejected update of {meeting_id}",
                self.provider
            )));
        }

        let meeting = state
            .meetings
            .get_mut(meeting_id)
            .filter(|m| !m.cancelled)
            .ok_or_else(|| SagaError::Provider(format!("unknown meeting {meeting_id}")))?;
        if let Some(topic) = update.topic {
            meeting.request.topic = topic;
        }
        if let Some(start) = update.start_time {
            meeting.request.start_time = start;
        }
        if let Some(duration) = update.duration_minutes {
            meeting.request.duration_minutes = duration;
        }
        Ok(())
    }

    async fn cancel_meeting(&self, meeting_id: &str) -> Result<(), SagaError> {
        let mut state = write(&self.state);
        state.cancel_calls += 1;

        if state.fail_on_cancel {
            return Err(SagaError::Provider(format!(
                "{} rejected cancellation of {meeting_id}",
                self.provider
            )));
        }

        match state.meetings.get_mut(meeting_id) {
            Some(meeting) => {
                meeting.cancelled = true;
                Ok(())
            }
            None => Err(SagaError::Provider(format!("unknown meeting {meeting_id}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CreateMeetingRequest {
        CreateMeetingRequest {
            topic: "Mock interview".to_string(),
            start_time: Utc::now(),
            duration_minutes: 60,
            host_user_id: UserId::new(),
            auto_record: true,
            allow_early_join: true,
        }
    }

    #[tokio::test]
    async fn test_create_and_cancel() {
        let client = InMemoryConferencingClient::new(MeetingProvider::Feishu);

        let meeting = client.create_meeting(request()).await.unwrap();
        assert_eq!(meeting.id, "FEISHU-MTG-0001");
        assert_eq!(client.active_meeting_count(), 1);

        client.cancel_meeting(&meeting.id).await.unwrap();
        assert!(client.is_cancelled(&meeting.id));
        assert_eq!(client.active_meeting_count(), 0);
    }

    #[tokio::test]
    async fn test_fail_next_creates() {
        let client = InMemoryConferencingClient::new(MeetingProvider::Zoom);
        client.fail_next_creates(2);

        assert!(client.create_meeting(request()).await.is_err());
        assert!(client.create_meeting(request()).await.is_err());
        assert!(client.create_meeting(request()).await.is_ok());
        assert_eq!(client.create_calls(), 3);
    }

    #[tokio::test]
    async fn test_update_changes_only_given_fields() {
        let client = InMemoryConferencingClient::new(MeetingProvider::Zoom);
        let meeting = client.create_meeting(request()).await.unwrap();

        client
            .update_meeting(
                &meeting.id,
                MeetingUpdate {
                    duration_minutes: Some(90),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let stored = client.meeting(&meeting.id).unwrap();
        assert_eq!(stored.duration_minutes, 90);
        assert_eq!(stored.topic, "Mock interview");
    }

    #[test]
    fn test_registry_reports_missing_provider() {
        let providers = ConferencingProviders::new()
            .with_client(Arc::new(InMemoryConferencingClient::new(MeetingProvider::Feishu)));

        assert!(providers.get(MeetingProvider::Feishu).is_ok());
        assert!(matches!(
            providers.get(MeetingProvider::Zoom),
            Err(SagaError::ProviderNotConfigured(MeetingProvider::Zoom))
        ));
    }
}
