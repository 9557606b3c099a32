//! Builds the sagas and subscribes them to the event dispatcher.

use std::sync::Arc;

use domain::{MeetingLifecycleCompleted, ServiceSessionCompleted};
use event_bus::{CatalogError, EventDefinition, EventDispatcher};

use crate::base::SagaDependencies;
use crate::completion::{self, MeetingCompletionHandler};
use crate::config::SagaConfig;
use crate::meeting_change::{self, MeetingChangeSaga};
use crate::provisioning::{self, SessionProvisioningSaga};
use crate::scheduling::SessionScheduler;
use crate::session_end::{self, SessionEndSaga};

/// Every saga of the workspace, sharing one set of collaborators.
#[derive(Clone)]
pub struct Sagas {
    pub scheduler: Arc<SessionScheduler>,
    pub provisioning: Arc<SessionProvisioningSaga>,
    pub session_end: Arc<SessionEndSaga>,
    pub completion: Arc<MeetingCompletionHandler>,
    pub meeting_change: Arc<MeetingChangeSaga>,
}

impl Sagas {
    pub fn new(deps: SagaDependencies, config: SagaConfig) -> Self {
        Self {
            scheduler: Arc::new(SessionScheduler::new(deps.clone())),
            provisioning: Arc::new(SessionProvisioningSaga::new(deps.clone(), config.clone())),
            session_end: Arc::new(SessionEndSaga::new(deps.clone())),
            completion: Arc::new(MeetingCompletionHandler::new(deps.clone())),
            meeting_change: Arc::new(MeetingChangeSaga::new(deps, config)),
        }
    }

    /// Subscribes each saga to the events it consumes.
    ///
    /// Event types must already be declared in the dispatcher's catalog.
    pub fn subscribe(&self, dispatcher: &mut EventDispatcher) -> Result<(), CatalogError> {
        for event_type in provisioning::TRIGGERS {
            dispatcher.subscribe(event_type, provisioning::CONSUMER, self.provisioning.clone())?;
        }
        dispatcher.subscribe(
            ServiceSessionCompleted::EVENT_TYPE,
            session_end::CONSUMER,
            self.session_end.clone(),
        )?;
        dispatcher.subscribe(
            MeetingLifecycleCompleted::EVENT_TYPE,
            completion::CONSUMER,
            self.completion.clone(),
        )?;
        for event_type in meeting_change::TRIGGERS {
            dispatcher.subscribe(event_type, meeting_change::CONSUMER, self.meeting_change.clone())?;
        }
        Ok(())
    }
}
