use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::scheduler::{CompileRunRecord, RunStatus};
use crate::types::{
    DigestDocument, PeriodId, PipelineError, Result, ScanBatch, SupersededDigestPolicy,
};

/// Sqlite-backed persistence for the pipeline's shared state: the
/// append-only daily-scan store, the compile-run audit trail, and compiled
/// digests.
pub struct PipelineStore {
    pool: SqlitePool,
}

impl PipelineStore {
    /// Opens (creating if missing) the database at `database_url`.
    ///
    /// A single connection keeps sqlite writes serialized and makes
    /// `:memory:` databases behave as one database.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        info!(database_url, "pipeline store ready");
        Ok(store)
    }

    /// Fresh in-memory store for tests and dry runs.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scan_batches (
                batch_id TEXT PRIMARY KEY,
                source_type TEXT NOT NULL,
                period_id TEXT NOT NULL,
                collected_at TEXT NOT NULL,
                records TEXT NOT NULL,
                UNIQUE (source_type, batch_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS compile_runs (
                period_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                next_retry_at TEXT,
                started_at TEXT,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS digests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                period_id TEXT NOT NULL,
                generated_at TEXT NOT NULL,
                document TEXT NOT NULL,
                superseded INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_digests_period ON digests (period_id, superseded)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Appends one scan batch. The store is an append-only log; batches
    /// are consumed (not deleted) by compile cycles.
    pub async fn append_batch(&self, batch: &ScanBatch) -> Result<()> {
        let records = serde_json::to_string(&batch.records)?;
        sqlx::query(
            r#"
            INSERT INTO scan_batches (batch_id, source_type, period_id, collected_at, records)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(batch.batch_id.to_string())
        .bind(batch.source_type.as_str())
        .bind(PeriodId::from_datetime(batch.collected_at).to_string())
        .bind(batch.collected_at)
        .bind(records)
        .execute(&self.pool)
        .await?;

        debug!(batch_id = %batch.batch_id, source_type = %batch.source_type, "appended scan batch");
        Ok(())
    }

    /// Every batch collected within `period_id`, oldest first.
    pub async fn batches_for_period(&self, period_id: &PeriodId) -> Result<Vec<ScanBatch>> {
        let rows = sqlx::query(
            r#"
            SELECT batch_id, source_type, collected_at, records
            FROM scan_batches
            WHERE period_id = $1
            ORDER BY collected_at ASC, batch_id ASC
            "#,
        )
        .bind(period_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_batch).collect()
    }

    /// Batch counts per source type, for operator status output.
    pub async fn batch_stats(&self) -> Result<HashMap<String, i64>> {
        let rows = sqlx::query(
            "SELECT source_type, COUNT(*) AS batches FROM scan_batches GROUP BY source_type",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = HashMap::new();
        for row in rows {
            let source_type: String = row.try_get("source_type")?;
            let batches: i64 = row.try_get("batches")?;
            stats.insert(source_type, batches);
        }
        Ok(stats)
    }

    pub async fn get_run(&self, period_id: &PeriodId) -> Result<Option<CompileRunRecord>> {
        let row = sqlx::query(
            r#"
            SELECT period_id, status, attempt_count, last_error, next_retry_at, started_at, updated_at
            FROM compile_runs
            WHERE period_id = $1
            "#,
        )
        .bind(period_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_run).transpose()
    }

    /// All run records, newest period first. Records are never deleted.
    pub async fn list_runs(&self) -> Result<Vec<CompileRunRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT period_id, status, attempt_count, last_error, next_retry_at, started_at, updated_at
            FROM compile_runs
            ORDER BY period_id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_run).collect()
    }

    /// Upserts one run record. The scheduler is the sole caller.
    pub async fn save_run(&self, record: &CompileRunRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO compile_runs
                (period_id, status, attempt_count, last_error, next_retry_at, started_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (period_id) DO UPDATE SET
                status = EXCLUDED.status,
                attempt_count = EXCLUDED.attempt_count,
                last_error = EXCLUDED.last_error,
                next_retry_at = EXCLUDED.next_retry_at,
                started_at = EXCLUDED.started_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(record.period_id.to_string())
        .bind(record.status.as_str())
        .bind(record.attempt_count as i64)
        .bind(record.last_error.as_deref())
        .bind(record.next_retry_at)
        .bind(record.started_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Stores a compiled digest. An existing digest for the period is
    /// retained-but-superseded or discarded per `policy`.
    pub async fn store_digest(
        &self,
        digest: &DigestDocument,
        policy: SupersededDigestPolicy,
    ) -> Result<()> {
        let document = serde_json::to_string(digest)?;
        let mut tx = self.pool.begin().await?;

        match policy {
            SupersededDigestPolicy::Retain => {
                sqlx::query(
                    "UPDATE digests SET superseded = 1 WHERE period_id = $1 AND superseded = 0",
                )
                .bind(digest.period_id.to_string())
                .execute(&mut *tx)
                .await?;
            }
            SupersededDigestPolicy::Discard => {
                sqlx::query("DELETE FROM digests WHERE period_id = $1")
                    .bind(digest.period_id.to_string())
                    .execute(&mut *tx)
                    .await?;
            }
        }

        sqlx::query(
            r#"
            INSERT INTO digests (period_id, generated_at, document, superseded)
            VALUES ($1, $2, $3, 0)
            "#,
        )
        .bind(digest.period_id.to_string())
        .bind(digest.generated_at)
        .bind(document)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(period_id = %digest.period_id, "stored digest");
        Ok(())
    }

    /// The non-superseded digest for a period, if one was compiled.
    pub async fn current_digest(&self, period_id: &PeriodId) -> Result<Option<DigestDocument>> {
        let row = sqlx::query(
            r#"
            SELECT document FROM digests
            WHERE period_id = $1 AND superseded = 0
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(period_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let document: String = row.try_get("document")?;
            Ok(serde_json::from_str(&document)?)
        })
        .transpose()
    }

    /// Digests replaced by force recompiles under the retain policy.
    pub async fn superseded_digests(&self, period_id: &PeriodId) -> Result<Vec<DigestDocument>> {
        let rows = sqlx::query(
            r#"
            SELECT document FROM digests
            WHERE period_id = $1 AND superseded = 1
            ORDER BY id ASC
            "#,
        )
        .bind(period_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let document: String = row.try_get("document")?;
                Ok(serde_json::from_str::<DigestDocument>(&document)?)
            })
            .collect()
    }
}

fn row_to_batch(row: SqliteRow) -> Result<ScanBatch> {
    let batch_id: String = row.try_get("batch_id")?;
    let source_type: String = row.try_get("source_type")?;
    let collected_at: DateTime<Utc> = row.try_get("collected_at")?;
    let records: String = row.try_get("records")?;

    Ok(ScanBatch {
        batch_id: Uuid::parse_str(&batch_id)
            .map_err(|e| PipelineError::General(format!("invalid batch id {batch_id}: {e}")))?,
        source_type: source_type.parse()?,
        collected_at,
        records: serde_json::from_str(&records)?,
    })
}

fn row_to_run(row: SqliteRow) -> Result<CompileRunRecord> {
    let period_id: String = row.try_get("period_id")?;
    let status: String = row.try_get("status")?;
    let attempt_count: i64 = row.try_get("attempt_count")?;

    Ok(CompileRunRecord {
        period_id: period_id.parse()?,
        status: status.parse::<RunStatus>()?,
        attempt_count: attempt_count as u32,
        last_error: row.try_get("last_error")?,
        next_retry_at: row.try_get("next_retry_at")?,
        started_at: row.try_get("started_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
