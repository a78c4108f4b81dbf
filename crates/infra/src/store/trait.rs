use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use lendkiosk_ai::AnalysisResult;
use lendkiosk_core::{JobId, SeverityLevel, TransactionId};

use crate::jobs::types::{ComparisonJob, JobStatus};

/// Durable queue of comparison jobs. Pure persistence, no policy.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. The job must be `pending`.
    async fn enqueue(&self, job: ComparisonJob) -> Result<JobId, JobStoreError>;

    /// Get a job by ID.
    async fn get(&self, job_id: JobId) -> Result<Option<ComparisonJob>, JobStoreError>;

    /// Up to `limit` pending jobs ordered by `(priority, created_at)`. Does not mutate state.
    async fn fetch_batch(&self, limit: usize) -> Result<Vec<ComparisonJob>, JobStoreError>;

    /// Atomically claim up to `limit` pending jobs, moving them to `processing`.
    ///
    /// Concurrent callers never receive the same job.
    async fn claim_batch(&self, limit: usize) -> Result<Vec<ComparisonJob>, JobStoreError>;

    /// Move a single job from `pending` to `processing` if it is still pending.
    ///
    /// Fails with `InvalidTransition` when another caller got there first.
    async fn mark_processing(&self, job_id: JobId) -> Result<ComparisonJob, JobStoreError>;

    /// Move a `processing` job to `completed` with its analysis.
    async fn mark_completed(&self, job_id: JobId, result: &AnalysisResult) -> Result<(), JobStoreError>;

    /// Move a `processing` job to `failed` with an error message.
    async fn mark_failed(&self, job_id: JobId, error_message: &str) -> Result<(), JobStoreError>;

    /// All jobs for a transaction, oldest first.
    async fn list_for_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Vec<ComparisonJob>, JobStoreError>;

    /// A pending or processing job for the transaction, if one exists.
    async fn open_job_for_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Option<ComparisonJob>, JobStoreError> {
        let jobs = self.list_for_transaction(transaction_id).await?;
        Ok(jobs.into_iter().find(|j| !j.status.is_terminal()))
    }

    /// Job counts per status.
    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("storage error: {0}")]
    Storage(String),
    /// Transient failure (connection lost, pool exhausted, serialization conflict).
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl JobStoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobStoreError::Unavailable(_))
    }
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Processing => self.processing += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
        }
    }
}

/// Analysis status as stored on a lending transaction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiAnalysisStatus {
    #[default]
    None,
    Pending,
    Processing,
    Completed,
    Failed,
}

impl AiAnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AiAnalysisStatus::None => "none",
            AiAnalysisStatus::Pending => "pending",
            AiAnalysisStatus::Processing => "processing",
            AiAnalysisStatus::Completed => "completed",
            AiAnalysisStatus::Failed => "failed",
        }
    }

    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("pending") => AiAnalysisStatus::Pending,
            Some("processing") => AiAnalysisStatus::Processing,
            Some("completed") => AiAnalysisStatus::Completed,
            Some("failed") => AiAnalysisStatus::Failed,
            _ => AiAnalysisStatus::None,
        }
    }
}

/// Status update mirrored onto the transaction that originated a job.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    /// Job queued; clears any previous analysis.
    Pending { message: String },
    Processing { message: String },
    Completed(AnalysisResult),
    Failed { message: String },
}

/// AI analysis fields of a lending transaction.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct TransactionAnalysis {
    pub ai_analysis_status: AiAnalysisStatus,
    pub ai_analysis_message: Option<String>,
    pub ai_similarity_score: Option<f64>,
    pub ai_severity_level: Option<SeverityLevel>,
    pub ai_analysis_meta: Option<AnalysisResult>,
    pub detected_issues: Option<String>,
}

impl TransactionAnalysis {
    /// Apply a mirrored update the same way the Postgres sink's SQL does.
    pub fn apply(&mut self, update: &StatusUpdate) {
        match update {
            StatusUpdate::Pending { message } => {
                self.ai_analysis_status = AiAnalysisStatus::Pending;
                self.ai_analysis_message = Some(message.clone());
                self.ai_similarity_score = None;
                self.ai_severity_level = None;
                self.ai_analysis_meta = None;
            }
            StatusUpdate::Processing { message } => {
                self.ai_analysis_status = AiAnalysisStatus::Processing;
                self.ai_analysis_message = Some(message.clone());
            }
            StatusUpdate::Completed(result) => {
                self.ai_analysis_status = AiAnalysisStatus::Completed;
                self.ai_analysis_message = None;
                self.ai_similarity_score = Some(result.ai_similarity_score);
                self.ai_severity_level = Some(result.ai_severity_level);
                self.ai_analysis_meta = Some(result.clone());
                self.detected_issues = Some(result.ai_detected_issues.clone());
            }
            StatusUpdate::Failed { message } => {
                self.ai_analysis_status = AiAnalysisStatus::Failed;
                self.ai_analysis_message = Some(message.clone());
            }
        }
    }
}

/// Receives analysis status for the transaction that originated a job.
#[async_trait]
pub trait TransactionStatusSink: Send + Sync {
    async fn record_status(
        &self,
        transaction_id: TransactionId,
        update: &StatusUpdate,
    ) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SinkError {
    #[error("transaction not found: {0}")]
    TransactionNotFound(TransactionId),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl SinkError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SinkError::Unavailable(_))
    }
}

/// Terminal outcome of one job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(AnalysisResult),
    Failed(String),
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Completed(_) => JobStatus::Completed,
            JobOutcome::Failed(_) => JobStatus::Failed,
        }
    }

    /// Outcome for a job whose transaction row no longer exists.
    pub fn orphaned(transaction_id: TransactionId) -> Self {
        JobOutcome::Failed(SinkError::TransactionNotFound(transaction_id).to_string())
    }

    pub fn mirror(&self) -> StatusUpdate {
        match self {
            JobOutcome::Completed(result) => StatusUpdate::Completed(result.clone()),
            JobOutcome::Failed(message) => StatusUpdate::Failed {
                message: message.clone(),
            },
        }
    }
}

/// A write of a job's terminal state (or its mirror) that did not land.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PersistenceError {
    #[error("job store: {0}")]
    Job(#[from] JobStoreError),
    #[error("transaction sink: {0}")]
    Transaction(#[from] SinkError),
}

impl PersistenceError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PersistenceError::Job(e) => e.is_retryable(),
            PersistenceError::Transaction(e) => e.is_retryable(),
        }
    }
}

/// Job store and transaction sink sharing one transaction boundary.
#[async_trait]
pub trait AnalysisStore: JobStore + TransactionStatusSink {
    /// Persist the job's terminal state and mirror it onto the owning
    /// transaction as one unit of work: both land or neither does.
    ///
    /// If the transaction row is gone, the job is committed as failed with
    /// [`JobOutcome::orphaned`] instead. Returns the status actually written.
    async fn commit_outcome(
        &self,
        job: &ComparisonJob,
        outcome: &JobOutcome,
    ) -> Result<JobStatus, PersistenceError>;
}

#[async_trait]
impl<T: JobStore + ?Sized> JobStore for Arc<T> {
    async fn enqueue(&self, job: ComparisonJob) -> Result<JobId, JobStoreError> {
        (**self).enqueue(job).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<ComparisonJob>, JobStoreError> {
        (**self).get(job_id).await
    }

    async fn fetch_batch(&self, limit: usize) -> Result<Vec<ComparisonJob>, JobStoreError> {
        (**self).fetch_batch(limit).await
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<ComparisonJob>, JobStoreError> {
        (**self).claim_batch(limit).await
    }

    async fn mark_processing(&self, job_id: JobId) -> Result<ComparisonJob, JobStoreError> {
        (**self).mark_processing(job_id).await
    }

    async fn mark_completed(&self, job_id: JobId, result: &AnalysisResult) -> Result<(), JobStoreError> {
        (**self).mark_completed(job_id, result).await
    }

    async fn mark_failed(&self, job_id: JobId, error_message: &str) -> Result<(), JobStoreError> {
        (**self).mark_failed(job_id, error_message).await
    }

    async fn list_for_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Vec<ComparisonJob>, JobStoreError> {
        (**self).list_for_transaction(transaction_id).await
    }

    async fn open_job_for_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Option<ComparisonJob>, JobStoreError> {
        (**self).open_job_for_transaction(transaction_id).await
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats().await
    }
}

#[async_trait]
impl<T: TransactionStatusSink + ?Sized> TransactionStatusSink for Arc<T> {
    async fn record_status(
        &self,
        transaction_id: TransactionId,
        update: &StatusUpdate,
    ) -> Result<(), SinkError> {
        (**self).record_status(transaction_id, update).await
    }
}

#[async_trait]
impl<T: AnalysisStore + ?Sized> AnalysisStore for Arc<T> {
    async fn commit_outcome(
        &self,
        job: &ComparisonJob,
        outcome: &JobOutcome,
    ) -> Result<JobStatus, PersistenceError> {
        (**self).commit_outcome(job, outcome).await
    }
}
