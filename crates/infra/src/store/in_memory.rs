use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use lendkiosk_ai::AnalysisResult;
use lendkiosk_core::{JobId, TransactionId};

use super::r#trait::{
    AnalysisStore, JobOutcome, JobStats, JobStore, JobStoreError, PersistenceError, SinkError,
    StatusUpdate, TransactionAnalysis, TransactionStatusSink,
};
use crate::jobs::types::{ComparisonJob, JobStatus};

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, ComparisonJob>,
    transactions: HashMap<TransactionId, TransactionAnalysis>,
}

impl State {
    fn job_mut(&mut self, job_id: JobId) -> Result<&mut ComparisonJob, JobStoreError> {
        self.jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))
    }

    fn pending_in_queue_order(&self) -> Vec<JobId> {
        let mut pending: Vec<&ComparisonJob> = self
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .collect();
        pending.sort_by_key(|j| (j.queue_key(), j.id));
        pending.into_iter().map(|j| j.id).collect()
    }

    /// Apply `outcome` to the job, failing without side effects if it is not processing.
    fn finish(&mut self, job_id: JobId, outcome: &JobOutcome) -> Result<TransactionId, JobStoreError> {
        let job = self.job_mut(job_id)?;
        let now = Utc::now();
        match outcome {
            JobOutcome::Completed(result) => job.mark_completed(result.clone(), now)?,
            JobOutcome::Failed(message) => job.mark_failed(message.clone(), now)?,
        }
        Ok(job.transaction_id)
    }
}

/// In-memory job store and transaction sink for tests/dev.
///
/// Jobs and transactions share one lock, so claims and outcome commits are atomic.
/// `record_status` creates a transaction on first write; `commit_outcome` treats an
/// unknown transaction as deleted.
#[derive(Debug, Default)]
pub struct InMemoryAnalysisStore {
    state: Mutex<State>,
}

impl InMemoryAnalysisStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current analysis fields of a transaction, if it has ever been written.
    pub fn transaction(&self, transaction_id: TransactionId) -> Option<TransactionAnalysis> {
        self.lock().transactions.get(&transaction_id).cloned()
    }
}

#[async_trait]
impl JobStore for InMemoryAnalysisStore {
    async fn enqueue(&self, job: ComparisonJob) -> Result<JobId, JobStoreError> {
        if job.status != JobStatus::Pending {
            return Err(JobStoreError::InvalidTransition {
                id: job.id,
                from: job.status,
                to: JobStatus::Pending,
            });
        }
        let mut state = self.lock();
        if state.jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        state.jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<ComparisonJob>, JobStoreError> {
        Ok(self.lock().jobs.get(&job_id).cloned())
    }

    async fn fetch_batch(&self, limit: usize) -> Result<Vec<ComparisonJob>, JobStoreError> {
        let state = self.lock();
        Ok(state
            .pending_in_queue_order()
            .into_iter()
            .take(limit)
            .filter_map(|id| state.jobs.get(&id).cloned())
            .collect())
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<ComparisonJob>, JobStoreError> {
        let mut state = self.lock();
        let now = Utc::now();
        let mut claimed = Vec::new();
        for id in state.pending_in_queue_order().into_iter().take(limit) {
            let job = state.job_mut(id)?;
            job.mark_processing(now)?;
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn mark_processing(&self, job_id: JobId) -> Result<ComparisonJob, JobStoreError> {
        let mut state = self.lock();
        let job = state.job_mut(job_id)?;
        job.mark_processing(Utc::now())?;
        Ok(job.clone())
    }

    async fn mark_completed(&self, job_id: JobId, result: &AnalysisResult) -> Result<(), JobStoreError> {
        self.lock()
            .finish(job_id, &JobOutcome::Completed(result.clone()))
            .map(|_| ())
    }

    async fn mark_failed(&self, job_id: JobId, error_message: &str) -> Result<(), JobStoreError> {
        self.lock()
            .finish(job_id, &JobOutcome::Failed(error_message.to_string()))
            .map(|_| ())
    }

    async fn list_for_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Vec<ComparisonJob>, JobStoreError> {
        let state = self.lock();
        let mut jobs: Vec<_> = state
            .jobs
            .values()
            .filter(|j| j.transaction_id == transaction_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let state = self.lock();
        let mut stats = JobStats::default();
        for job in state.jobs.values() {
            stats.record(job.status);
        }
        Ok(stats)
    }
}

#[async_trait]
impl TransactionStatusSink for InMemoryAnalysisStore {
    async fn record_status(
        &self,
        transaction_id: TransactionId,
        update: &StatusUpdate,
    ) -> Result<(), SinkError> {
        self.lock()
            .transactions
            .entry(transaction_id)
            .or_default()
            .apply(update);
        Ok(())
    }
}

#[async_trait]
impl AnalysisStore for InMemoryAnalysisStore {
    async fn commit_outcome(
        &self,
        job: &ComparisonJob,
        outcome: &JobOutcome,
    ) -> Result<JobStatus, PersistenceError> {
        let mut state = self.lock();
        let transaction_id = state.job_mut(job.id)?.transaction_id;
        if !state.transactions.contains_key(&transaction_id) {
            let orphaned = JobOutcome::orphaned(transaction_id);
            state.finish(job.id, &orphaned)?;
            return Ok(orphaned.status());
        }

        state.finish(job.id, outcome)?;
        if let Some(analysis) = state.transactions.get_mut(&transaction_id) {
            analysis.apply(&outcome.mirror());
        }
        Ok(outcome.status())
    }
}
