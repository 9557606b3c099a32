//! PostgreSQL integration tests for the contract ledger.
//!
//! These tests use a shared PostgreSQL container and need Docker.
//! Run with:
//!
//! ```bash
//! cargo test -p saga --test postgres_contracts -- --ignored --test-threads=1
//! ```

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use common::{SessionId, UserId};
use domain::{MeetingProvider, Money, ServiceSessionCompleted, SessionKind};
use event_bus::InMemoryEventBus;
use saga::services::{ConsumptionRecord, HoldKey, HoldStatus, MentorPrice, NewHold};
use saga::{
    ConferencingProviders, ConsumptionOutcome, ContractService, InMemoryBillingService,
    InMemoryCalendarService, InMemoryClassMembership, InMemoryConferencingClient,
    InMemoryIdentityService, InMemorySessionRepository, PgTransactionManager,
    PostgresContractService, SagaConfig, SagaDependencies, SagaError, Sagas, SessionRequest,
    TransactionManager,
};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

const SERVICE_TYPE: &str = "MENTORING";

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_contract_tables.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Fresh pool with cleared tables
async fn get_test_pool() -> PgPool {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE service_holds, service_ledger")
        .execute(&pool)
        .await
        .unwrap();

    pool
}

struct PgHarness {
    sagas: Sagas,
    contracts: PostgresContractService,
    transactions: PgTransactionManager,
    billing: InMemoryBillingService,
    mentor: UserId,
    student: UserId,
}

impl PgHarness {
    async fn new() -> Self {
        let pool = get_test_pool().await;
        let contracts = PostgresContractService::new(pool.clone());
        let transactions = PgTransactionManager::new(pool);
        let billing = InMemoryBillingService::new();

        let mentor = UserId::new();
        billing.set_price(
            mentor,
            "MENTORING_60",
            MentorPrice {
                price: Money::from_minor(25000),
                currency: "CNY".to_string(),
            },
        );

        let deps = SagaDependencies {
            sessions: Arc::new(InMemorySessionRepository::new()),
            conferencing: ConferencingProviders::new().with_client(Arc::new(
                InMemoryConferencingClient::new(MeetingProvider::Feishu),
            )),
            calendar: Arc::new(InMemoryCalendarService::new()),
            contracts: Arc::new(contracts.clone()),
            billing: Arc::new(billing.clone()),
            identity: Arc::new(InMemoryIdentityService::new()),
            membership: Arc::new(InMemoryClassMembership::new()),
            transactions: Arc::new(transactions.clone()),
            publisher: Arc::new(InMemoryEventBus::new()),
        };

        Self {
            sagas: Sagas::new(deps, SagaConfig::default()),
            contracts,
            transactions,
            billing,
            mentor,
            student: UserId::new(),
        }
    }

    fn key(&self, session_id: SessionId) -> HoldKey {
        HoldKey {
            student_id: self.student,
            service_type: SERVICE_TYPE.to_string(),
            related_booking_id: session_id,
        }
    }

    /// Commits an active hold for a new booking.
    async fn committed_hold(&self) -> SessionId {
        let session_id = SessionId::new();
        let mut ctx = self.transactions.begin().await.unwrap();
        self.contracts
            .create_hold(
                &mut ctx,
                NewHold {
                    student_id: self.student,
                    service_type: SERVICE_TYPE.to_string(),
                    related_booking_id: session_id,
                    quantity: 1,
                },
            )
            .await
            .unwrap();
        ctx.commit().await.unwrap();
        session_id
    }

    fn completed(&self, session_id: SessionId) -> ServiceSessionCompleted {
        ServiceSessionCompleted {
            session_id,
            student_id: self.student,
            mentor_id: Some(self.mentor),
            service_type_code: SERVICE_TYPE.to_string(),
            session_type_code: "MENTORING_60".to_string(),
            actual_duration_minutes: Some(75),
            duration_minutes: 60,
            allow_billing: true,
            reference_id: None,
            session_kind: Some(SessionKind::RegularMentoring),
            completed_at: Some(Utc::now()),
        }
    }

    async fn ledger_rows(&self, session_id: SessionId) -> i64 {
        let pool = self.transactions.pool();
        sqlx::query_scalar("SELECT COUNT(*) FROM service_ledger WHERE related_booking_id = $1")
            .bind(session_id.as_uuid())
            .fetch_one(pool)
            .await
            .unwrap()
    }
}

#[tokio::test]
#[serial]
#[ignore = "requires docker"]
async fn test_settlement_releases_hold_and_records_consumption() {
    let h = PgHarness::new().await;
    let session_id = h.committed_hold().await;

    let outcome = h
        .sagas
        .session_end
        .handle_session_completed(&h.completed(session_id))
        .await
        .unwrap();

    assert_eq!(
        outcome.consumption,
        ConsumptionOutcome::Recorded {
            quantity: 2,
            released_holds: 1
        }
    );
    assert!(h.contracts.find_active_hold(&h.key(session_id)).await.unwrap().is_none());
    assert_eq!(h.ledger_rows(session_id).await, 1);

    let entry = h.billing.entry(&format!("session:{session_id}")).unwrap();
    assert_eq!(entry.billing.amount, Money::from_minor(50000));
}

#[tokio::test]
#[serial]
#[ignore = "requires docker"]
async fn test_redelivered_settlement_records_once() {
    let h = PgHarness::new().await;
    let session_id = h.committed_hold().await;
    let event = h.completed(session_id);

    h.sagas
        .session_end
        .handle_session_completed(&event)
        .await
        .unwrap();
    let second = h
        .sagas
        .session_end
        .handle_session_completed(&event)
        .await
        .unwrap();

    assert_eq!(second.consumption, ConsumptionOutcome::AlreadyRecorded);
    assert_eq!(h.ledger_rows(session_id).await, 1);
}

#[tokio::test]
#[serial]
#[ignore = "requires docker"]
async fn test_concurrent_settlements_serialize_on_hold_rows() {
    let h = PgHarness::new().await;
    let session_id = h.committed_hold().await;
    let event = h.completed(session_id);

    let (first, second) = tokio::join!(
        h.sagas.session_end.handle_session_completed(&event),
        h.sagas.session_end.handle_session_completed(&event),
    );

    let consumptions: Vec<_> = [first, second]
        .into_iter()
        .filter_map(|r| r.ok())
        .map(|o| o.consumption)
        .collect();
    assert!(consumptions.contains(&ConsumptionOutcome::Recorded {
        quantity: 2,
        released_holds: 1
    }));
    assert_eq!(h.ledger_rows(session_id).await, 1);
}

#[tokio::test]
#[serial]
#[ignore = "requires docker"]
async fn test_unique_index_rejects_second_consumption() {
    let h = PgHarness::new().await;
    let session_id = SessionId::new();
    let record = ConsumptionRecord {
        student_id: h.student,
        service_type: SERVICE_TYPE.to_string(),
        quantity: 1,
        related_booking_id: session_id,
        booking_source: "session_completed".to_string(),
        created_by: "test".to_string(),
    };

    let mut ctx = h.transactions.begin().await.unwrap();
    h.contracts
        .record_consumption(&mut ctx, record.clone())
        .await
        .unwrap();
    ctx.commit().await.unwrap();

    let mut ctx = h.transactions.begin().await.unwrap();
    let result = h.contracts.record_consumption(&mut ctx, record).await;
    ctx.rollback().await.unwrap();

    assert!(matches!(result, Err(SagaError::Contract(msg)) if msg.contains("already recorded")));
}

#[tokio::test]
#[serial]
#[ignore = "requires docker"]
async fn test_failed_ledger_write_rolls_back_release() {
    let h = PgHarness::new().await;
    let session_id = h.committed_hold().await;
    let key = h.key(session_id);

    let mut ctx = h.transactions.begin().await.unwrap();
    let holds = h
        .contracts
        .find_active_holds_for_update(&mut ctx, &key)
        .await
        .unwrap();
    assert_eq!(holds.len(), 1);
    h.contracts
        .release_hold(holds[0].id, "completed", Some(&mut ctx))
        .await
        .unwrap();
    drop(ctx);

    let hold = h.contracts.find_active_hold(&key).await.unwrap().unwrap();
    assert_eq!(hold.status, HoldStatus::Active);
    assert_eq!(hold.quantity, 1);
}

#[tokio::test]
#[serial]
#[ignore = "requires docker"]
async fn test_booking_conflict_leaves_no_hold_row() {
    let h = PgHarness::new().await;
    let start = Utc.with_ymd_and_hms(2026, 11, 9, 10, 0, 0).unwrap();
    let request = SessionRequest {
        kind: SessionKind::RegularMentoring,
        mentor_id: h.mentor,
        student_id: Some(h.student),
        counselor_id: None,
        class_id: None,
        topic: "Interview prep".to_string(),
        scheduled_start: start,
        duration_minutes: 60,
        meeting_provider: MeetingProvider::Feishu,
        service_type_code: SERVICE_TYPE.to_string(),
        session_type_code: "MENTORING_60".to_string(),
        allow_billing: true,
    };

    let booked = h.sagas.scheduler.schedule(request.clone()).await.unwrap();
    assert!(h.contracts.find_active_hold(&h.key(booked)).await.unwrap().is_some());

    let mut overlapping = request;
    overlapping.scheduled_start = start + Duration::minutes(15);
    let result = h.sagas.scheduler.schedule(overlapping).await;
    assert!(matches!(result, Err(SagaError::SlotConflict { .. })));

    let holds: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM service_holds")
        .fetch_one(h.transactions.pool())
        .await
        .unwrap();
    assert_eq!(holds, 1);
}
