//! Entitlement contract service: service holds and the consumption ledger.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{HoldId, LedgerEntryId, SessionId, UserId};
use serde::{Deserialize, Serialize};

use super::{read, write};
use crate::context::SagaExecutionContext;
use crate::error::SagaError;

/// Reasons recorded when a hold is released.
pub mod release_reasons {
    pub const MEETING_CREATE_FAILED: &str = "meeting_create_failed";
    pub const COMPLETED: &str = "completed";
    pub const SESSION_CANCELLED: &str = "session_cancelled";
}

/// Identifies the entitlement rows of one booking.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HoldKey {
    pub student_id: UserId,
    pub service_type: String,
    pub related_booking_id: SessionId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldStatus {
    Active,
    Released,
}

impl HoldStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HoldStatus::Active => "active",
            HoldStatus::Released => "released",
        }
    }
}

/// Entitlement units reserved for a booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub id: HoldId,
    pub student_id: UserId,
    pub service_type: String,
    pub related_booking_id: SessionId,
    pub quantity: u32,
    pub status: HoldStatus,
    pub release_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewHold {
    pub student_id: UserId,
    pub service_type: String,
    pub related_booking_id: SessionId,
    pub quantity: u32,
}

/// Consumption to append to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumptionRecord {
    pub student_id: UserId,
    pub service_type: String,
    pub quantity: u32,
    pub related_booking_id: SessionId,
    pub booking_source: String,
    pub created_by: String,
}

impl ConsumptionRecord {
    pub fn key(&self) -> HoldKey {
        HoldKey {
            student_id: self.student_id,
            service_type: self.service_type.clone(),
            related_booking_id: self.related_booking_id,
        }
    }
}

/// Append-only ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub student_id: UserId,
    pub service_type: String,
    pub quantity: u32,
    pub related_booking_id: SessionId,
    pub booking_source: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// Trait for entitlement operations.
#[async_trait]
pub trait ContractService: Send + Sync {
    async fn create_hold(
        &self,
        ctx: &mut SagaExecutionContext,
        hold: NewHold,
    ) -> Result<Hold, SagaError>;

    async fn find_active_hold(&self, key: &HoldKey) -> Result<Option<Hold>, SagaError>;

    /// Active holds for a booking, row-locked until `ctx` ends.
    async fn find_active_holds_for_update(
        &self,
        ctx: &mut SagaExecutionContext,
        key: &HoldKey,
    ) -> Result<Vec<Hold>, SagaError>;

    /// Releases a hold; releasing a released hold is a no-op.
    ///
    /// Without a context the release commits on its own.
    async fn release_hold(
        &self,
        hold_id: HoldId,
        reason: &str,
        ctx: Option<&mut SagaExecutionContext>,
    ) -> Result<(), SagaError>;

    /// The consumption entry for a booking, if one was recorded.
    async fn find_consumption(
        &self,
        ctx: &mut SagaExecutionContext,
        key: &HoldKey,
    ) -> Result<Option<LedgerEntry>, SagaError>;

    async fn record_consumption(
        &self,
        ctx: &mut SagaExecutionContext,
        record: ConsumptionRecord,
    ) -> Result<LedgerEntry, SagaError>;
}

#[derive(Debug, Default)]
struct InMemoryContractState {
    holds: HashMap<HoldId, Hold>,
    ledger: Vec<LedgerEntry>,
    fail_on_release: bool,
    fail_on_record: bool,
}

/// In-memory contract service for testing.
///
/// Row locks are per booking key and live in the caller's context.
#[derive(Debug, Clone, Default)]
pub struct InMemoryContractService {
    state: Arc<RwLock<InMemoryContractState>>,
    row_locks: Arc<RwLock<HashMap<HoldKey, Arc<tokio::sync::Mutex<()>>>>>,
}

impl InMemoryContractService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_on_release(&self, fail: bool) {
        write(&self.state).fail_on_release = fail;
    }

    pub fn set_fail_on_record(&self, fail: bool) {
        write(&self.state).fail_on_record = fail;
    }

    /// Inserts a hold directly, bypassing any context.
    pub fn seed_hold(&self, hold: NewHold) -> Hold {
        let hold = Hold {
            id: HoldId::new(),
            student_id: hold.student_id,
            service_type: hold.service_type,
            related_booking_id: hold.related_booking_id,
            quantity: hold.quantity,
            status: HoldStatus::Active,
            release_reason: None,
        };
        write(&self.state).holds.insert(hold.id, hold.clone());
        hold
    }

    pub fn hold(&self, hold_id: HoldId) -> Option<Hold> {
        read(&self.state).holds.get(&hold_id).cloned()
    }

    pub fn active_hold_count(&self) -> usize {
        read(&self.state)
            .holds
            .values()
            .filter(|h| h.status == HoldStatus::Active)
            .count()
    }

    pub fn ledger(&self) -> Vec<LedgerEntry> {
        read(&self.state).ledger.clone()
    }

    /// Number of booking locks currently tracked.
    pub fn row_lock_count(&self) -> usize {
        read(&self.row_locks).len()
    }

    /// Returns the lock for a booking, dropping locks nobody holds or awaits.
    ///
    /// Guards and waiters keep their own `Arc`, so a strong count of one means
    /// only the map references the lock.
    fn row_lock(&self, key: &HoldKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = write(&self.row_locks);
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(key.clone()).or_default().clone()
    }
}

fn matches_key(hold: &Hold, key: &HoldKey) -> bool {
    hold.student_id == key.student_id
        && hold.service_type == key.service_type
        && hold.related_booking_id == key.related_booking_id
}

#[async_trait]
impl ContractService for InMemoryContractService {
    async fn create_hold(
        &self,
        ctx: &mut SagaExecutionContext,
        hold: NewHold,
    ) -> Result<Hold, SagaError> {
        let hold = self.seed_hold(hold);

        let undo_state = self.state.clone();
        let hold_id = hold.id;
        ctx.on_rollback(move || {
            write(&undo_state).holds.remove(&hold_id);
        });
        Ok(hold)
    }

    async fn find_active_hold(&self, key: &HoldKey) -> Result<Option<Hold>, SagaError> {
        Ok(read(&self.state)
            .holds
            .values()
            .find(|h| h.status == HoldStatus::Active && matches_key(h, key))
            .cloned())
    }

    async fn find_active_holds_for_update(
        &self,
        ctx: &mut SagaExecutionContext,
        key: &HoldKey,
    ) -> Result<Vec<Hold>, SagaError> {
        let guard = self.row_lock(key).lock_owned().await;
        ctx.hold_lock(guard);

        let mut holds: Vec<Hold> = read(&self.state)
            .holds
            .values()
            .filter(|h| h.status == HoldStatus::Active && matches_key(h, key))
            .cloned()
            .collect();
        holds.sort_by_key(|h| h.id);
        Ok(holds)
    }

    async fn release_hold(
        &self,
        hold_id: HoldId,
        reason: &str,
        ctx: Option<&mut SagaExecutionContext>,
    ) -> Result<(), SagaError> {
        let previous = {
            let mut state = write(&self.state);
            if state.fail_on_release {
                return Err(SagaError::Contract(format!("release of hold {hold_id} rejected")));
            }
            let hold = state
                .holds
                .get_mut(&hold_id)
                .ok_or_else(|| SagaError::Contract(format!("hold {hold_id} not found")))?;
            if hold.status == HoldStatus::Released {
                return Ok(());
            }
            let previous = hold.clone();
            hold.status = HoldStatus::Released;
            hold.release_reason = Some(reason.to_string());
            previous
        };

        if let Some(ctx) = ctx {
            let undo_state = self.state.clone();
            ctx.on_rollback(move || {
                write(&undo_state).holds.insert(previous.id, previous);
            });
        }
        Ok(())
    }

    async fn find_consumption(
        &self,
        _ctx: &mut SagaExecutionContext,
        key: &HoldKey,
    ) -> Result<Option<LedgerEntry>, SagaError> {
        Ok(read(&self.state)
            .ledger
            .iter()
            .find(|e| {
                e.student_id == key.student_id
                    && e.service_type == key.service_type
                    && e.related_booking_id == key.related_booking_id
            })
            .cloned())
    }

    async fn record_consumption(
        &self,
        ctx: &mut SagaExecutionContext,
        record: ConsumptionRecord,
    ) -> Result<LedgerEntry, SagaError> {
        let entry = {
            let mut state = write(&self.state);
            if state.fail_on_record {
                return Err(SagaError::Contract("ledger write rejected".to_string()));
            }
            let key = record.key();
            let duplicate = state.ledger.iter().any(|e| {
                e.student_id == key.student_id
                    && e.service_type == key.service_type
                    && e.related_booking_id == key.related_booking_id
            });
            if duplicate {
                return Err(SagaError::Contract(format!(
                    "consumption for booking {} already recorded",
                    key.related_booking_id
                )));
            }

            let entry = LedgerEntry {
                id: LedgerEntryId::new(),
                student_id: record.student_id,
                service_type: record.service_type,
                quantity: record.quantity,
                related_booking_id: record.related_booking_id,
                booking_source: record.booking_source,
                created_by: record.created_by,
                created_at: Utc::now(),
            };
            state.ledger.push(entry.clone());
            entry
        };

        let undo_state = self.state.clone();
        let entry_id = entry.id;
        ctx.on_rollback(move || {
            write(&undo_state).ledger.retain(|e| e.id != entry_id);
        });
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key() -> HoldKey {
        HoldKey {
            student_id: UserId::new(),
            service_type: "MENTORING".to_string(),
            related_booking_id: SessionId::new(),
        }
    }

    fn new_hold(key: &HoldKey) -> NewHold {
        NewHold {
            student_id: key.student_id,
            service_type: key.service_type.clone(),
            related_booking_id: key.related_booking_id,
            quantity: 1,
        }
    }

    fn consumption(key: &HoldKey) -> ConsumptionRecord {
        ConsumptionRecord {
            student_id: key.student_id,
            service_type: key.service_type.clone(),
            quantity: 1,
            related_booking_id: key.related_booking_id,
            booking_source: "session_completed".to_string(),
            created_by: "system".to_string(),
        }
    }

    #[tokio::test]
    async fn test_release_is_reverted_on_rollback() {
        let contracts = InMemoryContractService::new();
        let key = key();
        let hold = contracts.seed_hold(new_hold(&key));

        let mut ctx = SagaExecutionContext::in_memory();
        contracts
            .release_hold(hold.id, release_reasons::COMPLETED, Some(&mut ctx))
            .await
            .unwrap();
        assert_eq!(contracts.active_hold_count(), 0);

        ctx.rollback().await.unwrap();
        assert_eq!(contracts.active_hold_count(), 1);
    }

    #[tokio::test]
    async fn test_release_without_context_is_immediate_and_idempotent() {
        let contracts = InMemoryContractService::new();
        let hold = contracts.seed_hold(new_hold(&key()));

        contracts
            .release_hold(hold.id, release_reasons::MEETING_CREATE_FAILED, None)
            .await
            .unwrap();
        contracts
            .release_hold(hold.id, release_reasons::COMPLETED, None)
            .await
            .unwrap();

        let released = contracts.hold(hold.id).unwrap();
        assert_eq!(released.status, HoldStatus::Released);
        assert_eq!(
            released.release_reason.as_deref(),
            Some(release_reasons::MEETING_CREATE_FAILED)
        );
    }

    #[tokio::test]
    async fn test_second_consumption_for_booking_is_rejected() {
        let contracts = InMemoryContractService::new();
        let key = key();
        let mut ctx = SagaExecutionContext::in_memory();

        contracts.record_consumption(&mut ctx, consumption(&key)).await.unwrap();
        assert!(contracts.find_consumption(&mut ctx, &key).await.unwrap().is_some());
        assert!(contracts.record_consumption(&mut ctx, consumption(&key)).await.is_err());
        ctx.commit().await.unwrap();

        assert_eq!(contracts.ledger().len(), 1);
    }

    #[tokio::test]
    async fn test_released_booking_locks_are_pruned() {
        let contracts = InMemoryContractService::new();

        for _ in 0..5 {
            let key = key();
            contracts.seed_hold(new_hold(&key));
            let mut ctx = SagaExecutionContext::in_memory();
            contracts
                .find_active_holds_for_update(&mut ctx, &key)
                .await
                .unwrap();
            ctx.commit().await.unwrap();
        }
        assert_eq!(contracts.row_lock_count(), 1);

        // a held lock survives the sweep
        let held = key();
        let mut first = SagaExecutionContext::in_memory();
        contracts
            .find_active_holds_for_update(&mut first, &held)
            .await
            .unwrap();
        let mut second = SagaExecutionContext::in_memory();
        contracts
            .find_active_holds_for_update(&mut second, &key())
            .await
            .unwrap();
        assert_eq!(contracts.row_lock_count(), 2);

        drop(second);
        drop(first);
        let mut last = SagaExecutionContext::in_memory();
        contracts
            .find_active_holds_for_update(&mut last, &key())
            .await
            .unwrap();
        assert_eq!(contracts.row_lock_count(), 1);
    }

    #[tokio::test]
    async fn test_holds_for_update_block_a_second_context() {
        let contracts = InMemoryContractService::new();
        let key = key();
        contracts.seed_hold(new_hold(&key));

        let mut first = SagaExecutionContext::in_memory();
        let holds = contracts
            .find_active_holds_for_update(&mut first, &key)
            .await
            .unwrap();
        assert_eq!(holds.len(), 1);

        let other = contracts.clone();
        let other_key = key.clone();
        let waiter = tokio::spawn(async move {
            let mut second = SagaExecutionContext::in_memory();
            other
                .find_active_holds_for_update(&mut second, &other_key)
                .await
                .map(|h| h.len())
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        contracts
            .release_hold(holds[0].id, release_reasons::COMPLETED, Some(&mut first))
            .await
            .unwrap();
        first.commit().await.unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), 0);
    }
}
