//! PostgreSQL transaction manager and contract service.

use async_trait::async_trait;
use chrono::Utc;
use common::{HoldId, LedgerEntryId, SessionId, UserId};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::context::{SagaExecutionContext, TransactionManager};
use crate::error::{Result, SagaError};
use crate::services::{
    ConsumptionRecord, ContractService, Hold, HoldKey, HoldStatus, LedgerEntry, NewHold,
};

const CONSUMPTION: &str = "consumption";

/// Opens saga contexts on Postgres transactions.
#[derive(Clone)]
pub struct PgTransactionManager {
    pool: PgPool,
}

impl PgTransactionManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TransactionManager for PgTransactionManager {
    async fn begin(&self) -> Result<SagaExecutionContext> {
        let tx = self.pool.begin().await?;
        Ok(SagaExecutionContext::postgres(tx))
    }
}

/// Contract service backed by the `service_holds` and `service_ledger` tables.
#[derive(Clone)]
pub struct PostgresContractService {
    pool: PgPool,
}

impl PostgresContractService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_hold(row: PgRow) -> Result<Hold> {
        let status: String = row.try_get("status")?;
        Ok(Hold {
            id: HoldId::from_uuid(row.try_get::<Uuid, _>("id")?),
            student_id: UserId::from_uuid(row.try_get::<Uuid, _>("student_id")?),
            service_type: row.try_get("service_type")?,
            related_booking_id: SessionId::from_uuid(row.try_get::<Uuid, _>("related_booking_id")?),
            quantity: quantity_from_db(row.try_get("quantity")?)?,
            status: if status == HoldStatus::Active.as_str() {
                HoldStatus::Active
            } else {
                HoldStatus::Released
            },
            release_reason: row.try_get("release_reason")?,
        })
    }

    fn row_to_entry(row: PgRow) -> Result<LedgerEntry> {
        Ok(LedgerEntry {
            id: LedgerEntryId::from_uuid(row.try_get::<Uuid, _>("id")?),
            student_id: UserId::from_uuid(row.try_get::<Uuid, _>("student_id")?),
            service_type: row.try_get("service_type")?,
            quantity: quantity_from_db(row.try_get("quantity")?)?,
            related_booking_id: SessionId::from_uuid(row.try_get::<Uuid, _>("related_booking_id")?),
            booking_source: row.try_get("booking_source")?,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

fn quantity_from_db(quantity: i64) -> Result<u32> {
    u32::try_from(quantity)
        .map_err(|_| SagaError::Contract(format!("stored quantity {quantity} out of range")))
}

#[async_trait]
impl ContractService for PostgresContractService {
    async fn create_hold(&self, ctx: &mut SagaExecutionContext, hold: NewHold) -> Result<Hold> {
        let id = HoldId::new();
        sqlx::query(
            r#"
            INSERT INTO service_holds (id, student_id, service_type, related_booking_id, quantity, status)
            VALUES ($1, $2, $3, $4, $5, 'active')
            "#,
        )
        .bind(id.as_uuid())
        .bind(hold.student_id.as_uuid())
        .bind(&hold.service_type)
        .bind(hold.related_booking_id.as_uuid())
        .bind(i64::from(hold.quantity))
        .execute(ctx.connection()?)
        .await?;

        Ok(Hold {
            id,
            student_id: hold.student_id,
            service_type: hold.service_type,
            related_booking_id: hold.related_booking_id,
            quantity: hold.quantity,
            status: HoldStatus::Active,
            release_reason: None,
        })
    }

    async fn find_active_hold(&self, key: &HoldKey) -> Result<Option<Hold>> {
        let row = sqlx::query(
            r#"
            SELECT id, student_id, service_type, related_booking_id, quantity, status, release_reason
            FROM service_holds
            WHERE student_id = $1 AND service_type = $2 AND related_booking_id = $3
              AND status = 'active'
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(key.student_id.as_uuid())
        .bind(&key.service_type)
        .bind(key.related_booking_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_hold).transpose()
    }

    async fn find_active_holds_for_update(
        &self,
        ctx: &mut SagaExecutionContext,
        key: &HoldKey,
    ) -> Result<Vec<Hold>> {
        let rows = sqlx::query(
            r#"
            SELECT id, student_id, service_type, related_booking_id, quantity, status, release_reason
            FROM service_holds
            WHERE student_id = $1 AND service_type = $2 AND related_booking_id = $3
              AND status = 'active'
            ORDER BY id
            FOR UPDATE
            "#,
        )
        .bind(key.student_id.as_uuid())
        .bind(&key.service_type)
        .bind(key.related_booking_id.as_uuid())
        .fetch_all(ctx.connection()?)
        .await?;

        rows.into_iter().map(Self::row_to_hold).collect()
    }

    async fn release_hold(
        &self,
        hold_id: HoldId,
        reason: &str,
        ctx: Option<&mut SagaExecutionContext>,
    ) -> Result<()> {
        let query = sqlx::query(
            r#"
            UPDATE service_holds
            SET status = 'released', release_reason = $2, released_at = $3
            WHERE id = $1 AND status = 'active'
            "#,
        )
        .bind(hold_id.as_uuid())
        .bind(reason)
        .bind(Utc::now());

        let result = match ctx {
            Some(ctx) => query.execute(ctx.connection()?).await?,
            None => query.execute(&self.pool).await?,
        };
        if result.rows_affected() == 0 {
            tracing::debug!(hold_id = %hold_id, "Hold already released or missing");
        }
        Ok(())
    }

    async fn find_consumption(
        &self,
        ctx: &mut SagaExecutionContext,
        key: &HoldKey,
    ) -> Result<Option<LedgerEntry>> {
        let row = sqlx::query(
            r#"
            SELECT id, student_id, service_type, quantity, related_booking_id, booking_source,
                   created_by, created_at
            FROM service_ledger
            WHERE student_id = $1 AND service_type = $2 AND related_booking_id = $3
              AND entry_type = $4
            "#,
        )
        .bind(key.student_id.as_uuid())
        .bind(&key.service_type)
        .bind(key.related_booking_id.as_uuid())
        .bind(CONSUMPTION)
        .fetch_optional(ctx.connection()?)
        .await?;

        row.map(Self::row_to_entry).transpose()
    }

    async fn record_consumption(
        &self,
        ctx: &mut SagaExecutionContext,
        record: ConsumptionRecord,
    ) -> Result<LedgerEntry> {
        let id = LedgerEntryId::new();
        let created_at = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO service_ledger
                (id, student_id, service_type, entry_type, quantity, related_booking_id,
                 booking_source, created_by, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(id.as_uuid())
        .bind(record.student_id.as_uuid())
        .bind(&record.service_type)
        .bind(CONSUMPTION)
        .bind(i64::from(record.quantity))
        .bind(record.related_booking_id.as_uuid())
        .bind(&record.booking_source)
        .bind(&record.created_by)
        .bind(created_at)
        .execute(ctx.connection()?)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some("unique_consumption_per_booking")
            {
                return SagaError::Contract(format!(
                    "consumption for booking {} already recorded",
                    record.related_booking_id
                ));
            }
            SagaError::Database(e)
        })?;

        Ok(LedgerEntry {
            id,
            student_id: record.student_id,
            service_type: record.service_type,
            quantity: record.quantity,
            related_booking_id: record.related_booking_id,
            booking_source: record.booking_source,
            created_by: record.created_by,
            created_at,
        })
    }
}
