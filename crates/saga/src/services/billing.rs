//! Mentor billing service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{SessionId, UserId};
use domain::Money;
use serde::{Deserialize, Serialize};

use super::{read, write};
use crate::error::SagaError;

/// Hourly rate for a mentor and session type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MentorPrice {
    pub price: Money,
    pub currency: String,
}

/// Payable to create for one completed session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerSessionBilling {
    pub session_id: SessionId,
    pub mentor_id: UserId,
    pub student_id: UserId,
    pub service_type_code: String,
    pub session_type_code: String,
    /// Idempotency key of the payable.
    pub reference_id: String,
    pub duration_minutes: i64,
    pub actual_duration_minutes: Option<i64>,
    pub billed_hours: u32,
    pub unit_price: Money,
    pub currency: String,
    pub amount: Money,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A stored payable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingEntry {
    pub billing_id: String,
    pub billing: PerSessionBilling,
}

/// Trait for mentor billing operations.
#[async_trait]
pub trait BillingService: Send + Sync {
    async fn get_mentor_price(
        &self,
        mentor_id: UserId,
        session_type_code: &str,
    ) -> Result<Option<MentorPrice>, SagaError>;

    /// Returns true if a payable with this reference already exists.
    async fn is_duplicate(&self, reference_id: &str) -> Result<bool, SagaError>;

    async fn create_per_session_billing(
        &self,
        billing: PerSessionBilling,
    ) -> Result<BillingEntry, SagaError>;
}

#[derive(Debug, Default)]
struct InMemoryBillingState {
    prices: HashMap<(UserId, String), MentorPrice>,
    entries: HashMap<String, BillingEntry>,
    next_id: u32,
    fail_on_create: bool,
}

/// In-memory billing service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBillingService {
    state: Arc<RwLock<InMemoryBillingState>>,
}

impl InMemoryBillingService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_price(&self, mentor_id: UserId, session_type_code: &str, price: MentorPrice) {
        write(&self.state)
            .prices
            .insert((mentor_id, session_type_code.to_string()), price);
    }

    pub fn set_fail_on_create(&self, fail: bool) {
        write(&self.state).fail_on_create = fail;
    }

    pub fn entry_count(&self) -> usize {
        read(&self.state).entries.len()
    }

    pub fn entry(&self, reference_id: &str) -> Option<BillingEntry> {
        read(&self.state).entries.get(reference_id).cloned()
    }
}

#[async_trait]
impl BillingService for InMemoryBillingService {
    async fn get_mentor_price(
        &self,
        mentor_id: UserId,
        session_type_code: &str,
    ) -> Result<Option<MentorPrice>, SagaError> {
        Ok(read(&self.state)
            .prices
            .get(&(mentor_id, session_type_code.to_string()))
            .cloned())
    }

    async fn is_duplicate(&self, reference_id: &str) -> Result<bool, SagaError> {
        Ok(read(&self.state).entries.contains_key(reference_id))
    }

    async fn create_per_session_billing(
        &self,
        billing: PerSessionBilling,
    ) -> Result<BillingEntry, SagaError> {
        let mut state = write(&self.state);

        if state.fail_on_create {
            return Err(SagaError::Billing("payable rejected".to_string()));
        }
        if state.entries.contains_key(&billing.reference_id) {
            return Err(SagaError::Billing(format!(
                "payable {} already exists",
                billing.reference_id
            )));
        }

        state.next_id += 1;
        let entry = BillingEntry {
            billing_id: format!("BILL-{:04}", state.next_id),
            billing,
        };
        state
            .entries
            .insert(entry.billing.reference_id.clone(), entry.clone());
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn billing(reference_id: &str) -> PerSessionBilling {
        PerSessionBilling {
            session_id: SessionId::new(),
            mentor_id: UserId::new(),
            student_id: UserId::new(),
            service_type_code: "MENTORING".to_string(),
            session_type_code: "MENTORING_60".to_string(),
            reference_id: reference_id.to_string(),
            duration_minutes: 60,
            actual_duration_minutes: Some(55),
            billed_hours: 1,
            unit_price: Money::from_minor(20000),
            currency: "CNY".to_string(),
            amount: Money::from_minor(20000),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_price_lookup() {
        let service = InMemoryBillingService::new();
        let mentor = UserId::new();
        service.set_price(
            mentor,
            "MENTORING_60",
            MentorPrice {
                price: Money::from_minor(30000),
                currency: "CNY".to_string(),
            },
        );

        let price = service.get_mentor_price(mentor, "MENTORING_60").await.unwrap();
        assert_eq!(price.unwrap().price, Money::from_minor(30000));
        assert!(service.get_mentor_price(mentor, "OTHER").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_reference() {
        let service = InMemoryBillingService::new();

        let entry = service.create_per_session_billing(billing("REF-1")).await.unwrap();
        assert_eq!(entry.billing_id, "BILL-0001");
        assert!(service.is_duplicate("REF-1").await.unwrap());
        assert!(!service.is_duplicate("REF-2").await.unwrap());
        assert!(service.create_per_session_billing(billing("REF-1")).await.is_err());
        assert_eq!(service.entry_count(), 1);
    }
}
