//! Identity lookups for calendar display names.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use common::UserId;

use super::{read, write};
use crate::error::SagaError;

#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn get_display_name(&self, user_id: UserId) -> Result<String, SagaError>;
}

#[derive(Debug, Default)]
struct InMemoryIdentityState {
    names: HashMap<UserId, String>,
    fail_on_lookup: bool,
}

/// In-memory identity service for testing.
///
/// Unknown users resolve to their id.
#[derive(Debug, Clone, Default)]
pub struct InMemoryIdentityService {
    state: Arc<RwLock<InMemoryIdentityState>>,
}

impl InMemoryIdentityService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_name(&self, user_id: UserId, name: impl Into<String>) {
        write(&self.state).names.insert(user_id, name.into());
    }

    pub fn set_fail_on_lookup(&self, fail: bool) {
        write(&self.state).fail_on_lookup = fail;
    }
}

#[async_trait]
impl IdentityService for InMemoryIdentityService {
    async fn get_display_name(&self, user_id: UserId) -> Result<String, SagaError> {
        let state = read(&self.state);
        if state.fail_on_lookup {
            return Err(SagaError::Identity(format!("lookup of {user_id} failed")));
        }
        Ok(state
            .names
            .get(&user_id)
            .cloned()
            .unwrap_or_else(|| user_id.to_string()))
    }
}
