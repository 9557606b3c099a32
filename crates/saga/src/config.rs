//! Saga tuning knobs.

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Settings shared by the sagas that call conferencing providers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SagaConfig {
    /// Retry policy for create/update/cancel meeting calls.
    pub provider_retry: RetryPolicy,
    /// Upper bound for a single provider attempt. `None` waits indefinitely.
    pub provider_timeout: Option<Duration>,
}

impl SagaConfig {
    pub fn new(provider_retry: RetryPolicy, provider_timeout: Option<Duration>) -> Self {
        Self {
            provider_retry,
            provider_timeout,
        }
    }
}
