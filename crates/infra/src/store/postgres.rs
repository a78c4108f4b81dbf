//! Postgres-backed job store and transaction sink.
//!
//! ## Claiming
//!
//! `claim_batch` selects pending rows with `FOR UPDATE SKIP LOCKED` and flips them
//! to `processing` in the same statement, so overlapping dispatcher runs never
//! receive the same job.
//!
//! ## Outcomes
//!
//! `commit_outcome` writes the job's terminal state and the mirrored transaction
//! columns inside one SQL transaction. The transaction row is locked first; if it
//! has been deleted the job is committed as `failed` with a "transaction not
//! found" message. The job update is conditional on `status = 'processing'`; if it
//! matches no row, or any statement errors, the SQL transaction is rolled back.
//!
//! ## Error Mapping
//!
//! | SQLx Error | Mapped to | Retryable |
//! |------------|-----------|-----------|
//! | Io / PoolTimedOut / PoolClosed / WorkerCrashed | `Unavailable` | yes |
//! | Database `40001` (serialization) / `40P01` (deadlock) | `Unavailable` | yes |
//! | Any other | `Storage` | no |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Row};
use tracing::{instrument, warn};
use uuid::Uuid;

use lendkiosk_ai::AnalysisResult;
use lendkiosk_core::{JobId, SeverityLevel, TransactionId};

use super::r#trait::{
    AiAnalysisStatus, AnalysisStore, JobOutcome, JobStats, JobStore, JobStoreError,
    PersistenceError, SinkError, StatusUpdate, TransactionAnalysis, TransactionStatusSink,
};
use crate::jobs::types::{ComparisonJob, JobStatus};

const SCHEMA: &str = include_str!("../../migrations/0001_comparison_jobs.sql");

const JOB_COLUMNS: &str = "job_id, transaction_id, status, priority, payload, result, \
                           error_message, created_at, updated_at, processed_at";

/// Create the job table and transaction analysis columns if they are missing.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), JobStoreError> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .map_err(|e| map_job_error("ensure_schema", e))?;
    Ok(())
}

/// Postgres-backed [`AnalysisStore`].
///
/// `Send + Sync`; all operations go through the SQLx connection pool.
#[derive(Debug, Clone)]
pub struct PostgresAnalysisStore {
    pool: Arc<PgPool>,
}

impl PostgresAnalysisStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Current analysis fields of a transaction.
    #[instrument(skip(self), fields(transaction_id = %transaction_id), err)]
    pub async fn transaction_analysis(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Option<TransactionAnalysis>, SinkError> {
        let row = sqlx::query(
            r#"
            SELECT
                ai_analysis_status,
                ai_analysis_message,
                ai_similarity_score,
                ai_severity_level,
                ai_analysis_meta,
                detected_issues
            FROM transactions
            WHERE id = $1
            "#,
        )
        .bind(transaction_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sink_error("transaction_analysis", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let decode = |e: sqlx::Error| SinkError::Storage(format!("failed to decode transaction row: {e}"));
        let status: Option<String> = row.try_get("ai_analysis_status").map_err(decode)?;
        let severity: Option<String> = row.try_get("ai_severity_level").map_err(decode)?;
        let meta: Option<serde_json::Value> = row.try_get("ai_analysis_meta").map_err(decode)?;

        Ok(Some(TransactionAnalysis {
            ai_analysis_status: AiAnalysisStatus::parse(status.as_deref()),
            ai_analysis_message: row.try_get("ai_analysis_message").map_err(decode)?,
            ai_similarity_score: row.try_get("ai_similarity_score").map_err(decode)?,
            ai_severity_level: severity.and_then(|s| s.parse::<SeverityLevel>().ok()),
            ai_analysis_meta: meta.and_then(|m| serde_json::from_value(m).ok()),
            detected_issues: row.try_get("detected_issues").map_err(decode)?,
        }))
    }
}

#[async_trait]
impl JobStore for PostgresAnalysisStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, transaction_id = %job.transaction_id), err)]
    async fn enqueue(&self, job: ComparisonJob) -> Result<JobId, JobStoreError> {
        if job.status != JobStatus::Pending {
            return Err(JobStoreError::InvalidTransition {
                id: job.id,
                from: job.status,
                to: JobStatus::Pending,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO comparison_jobs (
                job_id,
                transaction_id,
                status,
                priority,
                payload,
                created_at,
                updated_at
            )
            VALUES ($1, $2, 'pending', $3, $4, $5, $6)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.transaction_id.as_uuid())
        .bind(job.priority)
        .bind(&job.payload)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(job.id)
            } else {
                map_job_error("enqueue", e)
            }
        })?;

        Ok(job.id)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<ComparisonJob>, JobStoreError> {
        let query = format!("SELECT {JOB_COLUMNS} FROM comparison_jobs WHERE job_id = $1");
        let row = sqlx::query(&query)
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_job_error("get", e))?;

        row.map(|r| job_from_row(&r)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn fetch_batch(&self, limit: usize) -> Result<Vec<ComparisonJob>, JobStoreError> {
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM comparison_jobs \
             WHERE status = 'pending' \
             ORDER BY priority ASC, created_at ASC \
             LIMIT $1"
        );
        let rows = sqlx::query(&query)
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_job_error("fetch_batch", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn claim_batch(&self, limit: usize) -> Result<Vec<ComparisonJob>, JobStoreError> {
        let query = format!(
            "UPDATE comparison_jobs \
             SET status = 'processing', updated_at = NOW() \
             WHERE job_id IN ( \
                 SELECT job_id FROM comparison_jobs \
                 WHERE status = 'pending' \
                 ORDER BY priority ASC, created_at ASC \
                 LIMIT $1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {JOB_COLUMNS}"
        );
        let rows = sqlx::query(&query)
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_job_error("claim_batch", e))?;

        // RETURNING does not preserve the subquery's order.
        let mut jobs = rows.iter().map(job_from_row).collect::<Result<Vec<_>, _>>()?;
        jobs.sort_by_key(|j| (j.queue_key(), j.id));
        Ok(jobs)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn mark_processing(&self, job_id: JobId) -> Result<ComparisonJob, JobStoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_job_error("acquire", e))?;

        let query = format!(
            "UPDATE comparison_jobs \
             SET status = 'processing', updated_at = NOW() \
             WHERE job_id = $1 AND status = 'pending' \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(job_id.as_uuid())
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| map_job_error("mark_processing", e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(rejected_transition(&mut conn, job_id, JobStatus::Processing).await),
        }
    }

    #[instrument(skip(self, result), fields(job_id = %job_id), err)]
    async fn mark_completed(&self, job_id: JobId, result: &AnalysisResult) -> Result<(), JobStoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_job_error("acquire", e))?;
        finish_job(&mut conn, job_id, &JobOutcome::Completed(result.clone()))
            .await
            .map(|_| ())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn mark_failed(&self, job_id: JobId, error_message: &str) -> Result<(), JobStoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_job_error("acquire", e))?;
        finish_job(&mut conn, job_id, &JobOutcome::Failed(error_message.to_string()))
            .await
            .map(|_| ())
    }

    #[instrument(skip(self), fields(transaction_id = %transaction_id), err)]
    async fn list_for_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Vec<ComparisonJob>, JobStoreError> {
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM comparison_jobs \
             WHERE transaction_id = $1 \
             ORDER BY created_at ASC, job_id ASC"
        );
        let rows = sqlx::query(&query)
            .bind(transaction_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_job_error("list_for_transaction", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM comparison_jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_job_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| JobStoreError::Storage(format!("failed to read status: {e}")))?;
            let total: i64 = row
                .try_get("total")
                .map_err(|e| JobStoreError::Storage(format!("failed to read count: {e}")))?;
            let count = total.max(0) as usize;
            match parse_status(&status)? {
                JobStatus::Pending => stats.pending += count,
                JobStatus::Processing => stats.processing += count,
                JobStatus::Completed => stats.completed += count,
                JobStatus::Failed => stats.failed += count,
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl TransactionStatusSink for PostgresAnalysisStore {
    #[instrument(skip(self, update), fields(transaction_id = %transaction_id), err)]
    async fn record_status(
        &self,
        transaction_id: TransactionId,
        update: &StatusUpdate,
    ) -> Result<(), SinkError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sink_error("acquire", e))?;
        mirror_status(&mut conn, transaction_id, update).await
    }
}

#[async_trait]
impl AnalysisStore for PostgresAnalysisStore {
    #[instrument(
        skip(self, job, outcome),
        fields(job_id = %job.id, transaction_id = %job.transaction_id, status = %outcome.status()),
        err
    )]
    async fn commit_outcome(
        &self,
        job: &ComparisonJob,
        outcome: &JobOutcome,
    ) -> Result<JobStatus, PersistenceError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_job_error("begin_transaction", e))?;

        let status = match write_outcome(&mut tx, job, outcome).await {
            Ok(status) => status,
            Err(e) => {
                tx.rollback()
                    .await
                    .map_err(|e| map_job_error("rollback", e))?;
                return Err(e);
            }
        };

        tx.commit()
            .await
            .map_err(|e| map_job_error("commit_transaction", e))?;
        Ok(status)
    }
}

/// Terminal job write plus mirror, on a connection already inside a transaction.
async fn write_outcome(
    conn: &mut PgConnection,
    job: &ComparisonJob,
    outcome: &JobOutcome,
) -> Result<JobStatus, PersistenceError> {
    if !lock_transaction_row(conn, job.transaction_id).await? {
        warn!(
            job_id = %job.id,
            transaction_id = %job.transaction_id,
            "transaction row missing, failing job"
        );
        let orphaned = JobOutcome::orphaned(job.transaction_id);
        finish_job(conn, job.id, &orphaned).await?;
        return Ok(orphaned.status());
    }

    let transaction_id = finish_job(conn, job.id, outcome).await?;
    mirror_status(conn, transaction_id, &outcome.mirror()).await?;
    Ok(outcome.status())
}

/// Lock the transaction row for the rest of the SQL transaction. `false` if it does not exist.
async fn lock_transaction_row(
    conn: &mut PgConnection,
    transaction_id: TransactionId,
) -> Result<bool, SinkError> {
    let row = sqlx::query("SELECT id FROM transactions WHERE id = $1 FOR UPDATE")
        .bind(transaction_id.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sink_error("lock_transaction", e))?;
    Ok(row.is_some())
}

/// Move a processing job to its terminal state. Returns the owning transaction.
async fn finish_job(
    conn: &mut PgConnection,
    job_id: JobId,
    outcome: &JobOutcome,
) -> Result<TransactionId, JobStoreError> {
    let row = match outcome {
        JobOutcome::Completed(result) => {
            let blob = serde_json::to_value(result)
                .map_err(|e| JobStoreError::Storage(format!("failed to encode result: {e}")))?;
            sqlx::query(
                r#"
                UPDATE comparison_jobs
                SET status = 'completed',
                    result = $2,
                    error_message = NULL,
                    processed_at = NOW(),
                    updated_at = NOW()
                WHERE job_id = $1 AND status = 'processing'
                RETURNING transaction_id
                "#,
            )
            .bind(job_id.as_uuid())
            .bind(blob)
            .fetch_optional(&mut *conn)
            .await
        }
        JobOutcome::Failed(message) => {
            sqlx::query(
                r#"
                UPDATE comparison_jobs
                SET status = 'failed',
                    error_message = $2,
                    updated_at = NOW()
                WHERE job_id = $1 AND status = 'processing'
                RETURNING transaction_id
                "#,
            )
            .bind(job_id.as_uuid())
            .bind(message)
            .fetch_optional(&mut *conn)
            .await
        }
    }
    .map_err(|e| map_job_error("finish_job", e))?;

    match row {
        Some(row) => {
            let id: Uuid = row
                .try_get("transaction_id")
                .map_err(|e| JobStoreError::Storage(format!("failed to read transaction_id: {e}")))?;
            Ok(TransactionId::from_uuid(id))
        }
        None => Err(rejected_transition(conn, job_id, outcome.status()).await),
    }
}

/// Explain why a conditional status update matched no row.
async fn rejected_transition(conn: &mut PgConnection, job_id: JobId, to: JobStatus) -> JobStoreError {
    let current = sqlx::query("SELECT status FROM comparison_jobs WHERE job_id = $1")
        .bind(job_id.as_uuid())
        .fetch_optional(&mut *conn)
        .await;

    match current {
        Ok(None) => JobStoreError::NotFound(job_id),
        Ok(Some(row)) => match row.try_get::<String, _>("status") {
            Ok(status) => match parse_status(&status) {
                Ok(from) => JobStoreError::InvalidTransition { id: job_id, from, to },
                Err(e) => e,
            },
            Err(e) => JobStoreError::Storage(format!("failed to read status: {e}")),
        },
        Err(e) => map_job_error("current_status", e),
    }
}

async fn mirror_status(
    conn: &mut PgConnection,
    transaction_id: TransactionId,
    update: &StatusUpdate,
) -> Result<(), SinkError> {
    let query = match update {
        StatusUpdate::Pending { message } => sqlx::query(
            r#"
            UPDATE transactions
            SET ai_analysis_status = 'pending',
                ai_analysis_message = $2,
                ai_similarity_score = NULL,
                ai_severity_level = NULL,
                ai_analysis_meta = NULL
            WHERE id = $1
            "#,
        )
        .bind(transaction_id.as_uuid())
        .bind(message),
        StatusUpdate::Processing { message } => sqlx::query(
            r#"
            UPDATE transactions
            SET ai_analysis_status = 'processing',
                ai_analysis_message = $2
            WHERE id = $1
            "#,
        )
        .bind(transaction_id.as_uuid())
        .bind(message),
        StatusUpdate::Completed(result) => {
            let meta = serde_json::to_value(result)
                .map_err(|e| SinkError::Storage(format!("failed to encode analysis meta: {e}")))?;
            sqlx::query(
                r#"
                UPDATE transactions
                SET ai_analysis_status = 'completed',
                    ai_analysis_message = NULL,
                    ai_similarity_score = $2,
                    ai_severity_level = $3,
                    ai_analysis_meta = $4,
                    detected_issues = $5
                WHERE id = $1
                "#,
            )
            .bind(transaction_id.as_uuid())
            .bind(result.ai_similarity_score)
            .bind(result.ai_severity_level.as_str())
            .bind(meta)
            .bind(&result.ai_detected_issues)
        }
        StatusUpdate::Failed { message } => sqlx::query(
            r#"
            UPDATE transactions
            SET ai_analysis_status = 'failed',
                ai_analysis_message = $2
            WHERE id = $1
            "#,
        )
        .bind(transaction_id.as_uuid())
        .bind(message),
    };

    let done = query
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sink_error("mirror_status", e))?;

    if done.rows_affected() == 0 {
        return Err(SinkError::TransactionNotFound(transaction_id));
    }
    Ok(())
}

// SQLx row types

#[derive(Debug)]
struct ComparisonJobRow {
    job_id: Uuid,
    transaction_id: Uuid,
    status: String,
    priority: i32,
    payload: serde_json::Value,
    result: Option<serde_json::Value>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for ComparisonJobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(ComparisonJobRow {
            job_id: row.try_get("job_id")?,
            transaction_id: row.try_get("transaction_id")?,
            status: row.try_get("status")?,
            priority: row.try_get("priority")?,
            payload: row.try_get("payload")?,
            result: row.try_get("result")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            processed_at: row.try_get("processed_at")?,
        })
    }
}

impl TryFrom<ComparisonJobRow> for ComparisonJob {
    type Error = JobStoreError;

    fn try_from(row: ComparisonJobRow) -> Result<Self, Self::Error> {
        let result = row
            .result
            .map(serde_json::from_value::<AnalysisResult>)
            .transpose()
            .map_err(|e| JobStoreError::Storage(format!("job {}: malformed result: {e}", row.job_id)))?;

        Ok(ComparisonJob {
            id: JobId::from_uuid(row.job_id),
            transaction_id: TransactionId::from_uuid(row.transaction_id),
            payload: row.payload,
            status: parse_status(&row.status)?,
            priority: row.priority,
            created_at: row.created_at,
            updated_at: row.updated_at,
            processed_at: row.processed_at,
            result,
            error_message: row.error_message,
        })
    }
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<ComparisonJob, JobStoreError> {
    use sqlx::FromRow;

    let raw = ComparisonJobRow::from_row(row)
        .map_err(|e| JobStoreError::Storage(format!("failed to deserialize job row: {e}")))?;
    raw.try_into()
}

fn parse_status(value: &str) -> Result<JobStatus, JobStoreError> {
    value
        .parse::<JobStatus>()
        .map_err(|e| JobStoreError::Storage(e.to_string()))
}

fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db_err) => matches!(
            db_err.code().as_deref(),
            Some("40001") | Some("40P01")
        ),
        _ => false,
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

fn map_job_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    let msg = format!("{operation}: {err}");
    if is_transient(&err) {
        JobStoreError::Unavailable(msg)
    } else {
        JobStoreError::Storage(msg)
    }
}

fn map_sink_error(operation: &str, err: sqlx::Error) -> SinkError {
    let msg = format!("{operation}: {err}");
    if is_transient(&err) {
        SinkError::Unavailable(msg)
    } else {
        SinkError::Storage(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lendkiosk_ai::{ComparatorError, ScoreBlender, analyze};

    fn row(status: &str) -> ComparisonJobRow {
        let now = Utc::now();
        ComparisonJobRow {
            job_id: Uuid::now_v7(),
            transaction_id: Uuid::now_v7(),
            status: status.to_string(),
            priority: 3,
            payload: serde_json::json!({"reference_path": "a.jpg", "return_path": "b.jpg"}),
            result: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            processed_at: None,
        }
    }

    #[test]
    fn row_converts_into_job() {
        let raw = row("processing");
        let job_id = raw.job_id;
        let job = ComparisonJob::try_from(raw).unwrap();
        assert_eq!(job.id, JobId::from_uuid(job_id));
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.priority, 3);
        assert!(job.result.is_none());
    }

    #[test]
    fn row_with_result_blob_decodes_it() {
        let result = analyze(
            &ScoreBlender::default(),
            lendkiosk_ai::AnalysisInput {
                offline_similarity: 61.0,
                offline_severity: SeverityLevel::Medium,
            },
            Err(&ComparatorError::Disabled),
            Utc::now(),
        );
        let mut raw = row("completed");
        raw.result = Some(serde_json::to_value(&result).unwrap());

        let job = ComparisonJob::try_from(raw).unwrap();
        assert_eq!(job.result, Some(result));
    }

    #[test]
    fn unknown_status_is_a_storage_error() {
        let err = ComparisonJob::try_from(row("queued")).unwrap_err();
        assert!(matches!(err, JobStoreError::Storage(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn malformed_result_is_a_storage_error() {
        let mut raw = row("completed");
        raw.result = Some(serde_json::json!({"unexpected": true}));
        assert!(matches!(ComparisonJob::try_from(raw), Err(JobStoreError::Storage(_))));
    }

    #[test]
    fn pool_failures_are_retryable() {
        assert!(map_job_error("claim_batch", sqlx::Error::PoolTimedOut).is_retryable());
        assert!(map_sink_error("mirror_status", sqlx::Error::PoolClosed).is_retryable());
        assert!(!map_job_error("get", sqlx::Error::RowNotFound).is_retryable());
    }

    #[test]
    fn schema_creates_queue_table_and_mirror_columns() {
        assert!(SCHEMA.contains("CREATE TABLE IF NOT EXISTS comparison_jobs"));
        for column in [
            "ai_analysis_status",
            "ai_analysis_message",
            "ai_similarity_score",
            "ai_severity_level",
            "ai_analysis_meta",
            "detected_issues",
        ] {
            assert!(SCHEMA.contains(column), "missing column {column}");
        }
    }
}
