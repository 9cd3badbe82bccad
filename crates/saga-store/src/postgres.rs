use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{
    CorrelationId, DeadLetter, DeadLetterId, OutboxEntry, Result, SagaRecord, ScheduledTimeout,
    StoreError, TimeoutTokenId, Version,
    store::{CorrelationStore, DeadLetterStore, OutboxStore, TimeoutStore},
};

/// PostgreSQL-backed saga store implementation.
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    /// Creates a new PostgreSQL saga store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects to the database at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_record(row: PgRow) -> Result<SagaRecord> {
        Ok(SagaRecord {
            correlation_id: CorrelationId::from_uuid(row.try_get::<Uuid, _>("correlation_id")?),
            saga_type: row.try_get("saga_type")?,
            status: row.try_get("status")?,
            terminal: row.try_get("terminal")?,
            version: Version::new(row.try_get("version")?),
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_timeout(row: PgRow) -> Result<ScheduledTimeout> {
        Ok(ScheduledTimeout {
            token_id: TimeoutTokenId::from_uuid(row.try_get::<Uuid, _>("token_id")?),
            correlation_id: CorrelationId::from_uuid(row.try_get::<Uuid, _>("correlation_id")?),
            kind: row.try_get("kind")?,
            deadline: row.try_get("deadline")?,
            payload: row.try_get("payload")?,
            scheduled_at: row.try_get("scheduled_at")?,
            claimed_until: row.try_get("claimed_until")?,
        })
    }

    fn row_to_outbox(row: PgRow) -> Result<OutboxEntry> {
        let seq: i32 = row.try_get("seq")?;
        Ok(OutboxEntry {
            correlation_id: CorrelationId::from_uuid(row.try_get::<Uuid, _>("correlation_id")?),
            version: Version::new(row.try_get("version")?),
            seq: seq.max(0) as u32,
            effect_kind: row.try_get("effect_kind")?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn append_outbox(
        tx: &mut Transaction<'_, Postgres>,
        version: Version,
        entries: &[OutboxEntry],
    ) -> Result<()> {
        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO saga_outbox (correlation_id, version, seq, effect_kind, payload, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(entry.correlation_id.as_uuid())
            .bind(version.as_i64())
            .bind(entry.seq as i32)
            .bind(&entry.effect_kind)
            .bind(&entry.payload)
            .bind(entry.created_at)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    fn row_to_dead_letter(row: PgRow) -> Result<DeadLetter> {
        let attempts: i32 = row.try_get("attempts")?;
        Ok(DeadLetter {
            id: DeadLetterId::from_uuid(row.try_get::<Uuid, _>("id")?),
            correlation_id: CorrelationId::from_uuid(row.try_get::<Uuid, _>("correlation_id")?),
            effect_kind: row.try_get("effect_kind")?,
            payload: row.try_get("payload")?,
            last_error: row.try_get("last_error")?,
            attempts: attempts.max(0) as u32,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl CorrelationStore for PostgresSagaStore {
    #[tracing::instrument(skip(self, record, outbox), fields(correlation_id = %record.correlation_id, outbox = outbox.len()))]
    async fn insert(&self, record: SagaRecord, outbox: Vec<OutboxEntry>) -> Result<Version> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO saga_instances (correlation_id, saga_type, status, terminal, version, payload, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (correlation_id) DO NOTHING
            "#,
        )
        .bind(record.correlation_id.as_uuid())
        .bind(&record.saga_type)
        .bind(&record.status)
        .bind(record.terminal)
        .bind(Version::first().as_i64())
        .bind(&record.payload)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(record.correlation_id));
        }

        Self::append_outbox(&mut tx, Version::first(), &outbox).await?;
        tx.commit().await?;

        Ok(Version::first())
    }

    async fn get(&self, correlation_id: CorrelationId) -> Result<Option<SagaRecord>> {
        let row = sqlx::query(
            r#"
            SELECT correlation_id, saga_type, status, terminal, version, payload, created_at, updated_at
            FROM saga_instances
            WHERE correlation_id = $1
            "#,
        )
        .bind(correlation_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_record).transpose()
    }

    #[tracing::instrument(skip(self, record, outbox), fields(correlation_id = %record.correlation_id, outbox = outbox.len()))]
    async fn update(
        &self,
        record: SagaRecord,
        expected: Version,
        outbox: Vec<OutboxEntry>,
    ) -> Result<Version> {
        let new_version = expected.next();
        let mut tx = self.pool.begin().await?;

        // Compare-and-swap on the version column.
        let result = sqlx::query(
            r#"
            UPDATE saga_instances
            SET status = $2, terminal = $3, version = $4, payload = $5, updated_at = $6
            WHERE correlation_id = $1 AND version = $7
            "#,
        )
        .bind(record.correlation_id.as_uuid())
        .bind(&record.status)
        .bind(record.terminal)
        .bind(new_version.as_i64())
        .bind(&record.payload)
        .bind(record.updated_at)
        .bind(expected.as_i64())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 1 {
            Self::append_outbox(&mut tx, new_version, &outbox).await?;
            tx.commit().await?;
            return Ok(new_version);
        }

        let actual: Option<i64> =
            sqlx::query_scalar("SELECT version FROM saga_instances WHERE correlation_id = $1")
                .bind(record.correlation_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await?;

        match actual {
            Some(actual) => Err(StoreError::ConcurrencyConflict {
                correlation_id: record.correlation_id,
                expected,
                actual: Version::new(actual),
            }),
            None => Err(StoreError::NotFound(record.correlation_id)),
        }
    }

    async fn find_by_status(&self, status: &str, limit: usize) -> Result<Vec<SagaRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT correlation_id, saga_type, status, terminal, version, payload, created_at, updated_at
            FROM saga_instances
            WHERE status = $1
            ORDER BY updated_at DESC
            LIMIT $2
            "#,
        )
        .bind(status)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_record).collect()
    }
}

#[async_trait]
impl OutboxStore for PostgresSagaStore {
    async fn pending_outbox(&self, correlation_id: CorrelationId) -> Result<Vec<OutboxEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT correlation_id, version, seq, effect_kind, payload, created_at
            FROM saga_outbox
            WHERE correlation_id = $1
            ORDER BY version ASC, seq ASC
            "#,
        )
        .bind(correlation_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_outbox).collect()
    }

    async fn settle(
        &self,
        correlation_id: CorrelationId,
        version: Version,
        seq: u32,
    ) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM saga_outbox WHERE correlation_id = $1 AND version = $2 AND seq = $3",
        )
        .bind(correlation_id.as_uuid())
        .bind(version.as_i64())
        .bind(seq as i32)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn stale_outbox(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CorrelationId>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT correlation_id
            FROM saga_outbox
            WHERE created_at <= $1
            GROUP BY correlation_id
            ORDER BY MIN(created_at) ASC
            LIMIT $2
            "#,
        )
        .bind(older_than)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(CorrelationId::from_uuid).collect())
    }
}

#[async_trait]
impl TimeoutStore for PostgresSagaStore {
    #[tracing::instrument(skip(self, timeout), fields(token_id = %timeout.token_id, kind = %timeout.kind))]
    async fn schedule(&self, timeout: ScheduledTimeout) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO saga_timeouts (token_id, correlation_id, kind, deadline, payload, scheduled_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (token_id) DO UPDATE SET
                deadline = EXCLUDED.deadline,
                payload = EXCLUDED.payload,
                scheduled_at = EXCLUDED.scheduled_at,
                claimed_until = NULL
            "#,
        )
        .bind(timeout.token_id.as_uuid())
        .bind(timeout.correlation_id.as_uuid())
        .bind(&timeout.kind)
        .bind(timeout.deadline)
        .bind(&timeout.payload)
        .bind(timeout.scheduled_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn cancel(&self, token_id: TimeoutTokenId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM saga_timeouts WHERE token_id = $1")
            .bind(token_id.as_uuid())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledTimeout>> {
        // SKIP LOCKED lets several pollers claim disjoint batches.
        let rows = sqlx::query(
            r#"
            UPDATE saga_timeouts
            SET claimed_until = $2
            WHERE token_id IN (
                SELECT token_id FROM saga_timeouts
                WHERE deadline <= $1
                  AND (claimed_until IS NULL OR claimed_until <= $1)
                ORDER BY deadline ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING token_id, correlation_id, kind, deadline, payload, scheduled_at, claimed_until
            "#,
        )
        .bind(now)
        .bind(lease_until)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut timeouts = rows
            .into_iter()
            .map(Self::row_to_timeout)
            .collect::<Result<Vec<_>>>()?;
        timeouts.sort_by_key(|t| t.deadline);
        Ok(timeouts)
    }

    async fn release(&self, token_id: TimeoutTokenId, due_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE saga_timeouts SET claimed_until = NULL, deadline = $2 WHERE token_id = $1",
        )
        .bind(token_id.as_uuid())
        .bind(due_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn pending_for(&self, correlation_id: CorrelationId) -> Result<Vec<ScheduledTimeout>> {
        let rows = sqlx::query(
            r#"
            SELECT token_id, correlation_id, kind, deadline, payload, scheduled_at, claimed_until
            FROM saga_timeouts
            WHERE correlation_id = $1
            ORDER BY deadline ASC
            "#,
        )
        .bind(correlation_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_timeout).collect()
    }
}

#[async_trait]
impl DeadLetterStore for PostgresSagaStore {
    #[tracing::instrument(skip(self, letter), fields(id = %letter.id, effect_kind = %letter.effect_kind))]
    async fn record(&self, letter: DeadLetter) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO saga_dead_letters (id, correlation_id, effect_kind, payload, last_error, attempts, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(letter.id.as_uuid())
        .bind(letter.correlation_id.as_uuid())
        .bind(&letter.effect_kind)
        .bind(&letter.payload)
        .bind(&letter.last_error)
        .bind(letter.attempts as i32)
        .bind(letter.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query(
            r#"
            SELECT id, correlation_id, effect_kind, payload, last_error, attempts, created_at
            FROM saga_dead_letters
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_dead_letter).collect()
    }

    async fn get(&self, id: DeadLetterId) -> Result<Option<DeadLetter>> {
        let row = sqlx::query(
            r#"
            SELECT id, correlation_id, effect_kind, payload, last_error, attempts, created_at
            FROM saga_dead_letters
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_dead_letter).transpose()
    }

    async fn remove(&self, id: DeadLetterId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM saga_dead_letters WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
