//! Bounded batch runner for comparison jobs.
//!
//! One call to [`JobDispatcher::run_batch`] processes up to `batch_size` pending
//! jobs one after another and returns a [`BatchSummary`]. Jobs are claimed one at
//! a time, right before they are processed, so a run that dies mid-batch leaves
//! at most one job in `processing`. It is meant to be triggered repeatedly by an
//! external scheduler, not left running.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use lendkiosk_ai::{
    AnalysisResult, ComparatorError, ComparisonResult, ImageComparator, ScoreBlender, analyze,
};
use lendkiosk_core::JobId;

use super::types::{ComparisonJob, JobError, JobStatus};
use crate::store::{AnalysisStore, JobOutcome, JobStore, JobStoreError, StatusUpdate, TransactionStatusSink};

/// Transaction message while a job is being analyzed.
pub const PROCESSING_MESSAGE: &str = "AI analysis in progress";

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Name for logging
    pub name: String,
    /// Maximum jobs claimed per run
    pub batch_size: usize,
    /// Wall-clock bound on one comparator call
    pub comparator_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: "comparison-dispatcher".to_string(),
            batch_size: 10,
            comparator_timeout: Duration::from_secs(30),
        }
    }
}

impl DispatcherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_comparator_timeout(mut self, timeout: Duration) -> Self {
        self.comparator_timeout = timeout;
        self
    }
}

/// Counts for one batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    /// Jobs that reached `completed`.
    pub processed: usize,
    /// Jobs that reached `failed`.
    pub failed: usize,
    /// Jobs whose terminal state could not be written. They stay `processing`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unpersisted: Vec<JobId>,
}

/// Failure of a whole run. Per-job failures never surface here.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("failed to claim jobs: {0}")]
    Claim(#[from] JobStoreError),
}

impl DispatchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            DispatchError::Claim(e) => e.is_retryable(),
        }
    }
}

/// Runs comparison jobs against an [`ImageComparator`] and records the outcome.
pub struct JobDispatcher<S, C> {
    store: S,
    comparator: C,
    blender: ScoreBlender,
    config: DispatcherConfig,
}

impl<S: AnalysisStore, C: ImageComparator> JobDispatcher<S, C> {
    pub fn new(store: S, comparator: C) -> Self {
        Self {
            store,
            comparator,
            blender: ScoreBlender::default(),
            config: DispatcherConfig::default(),
        }
    }

    pub fn with_blender(mut self, blender: ScoreBlender) -> Self {
        self.blender = blender;
        self
    }

    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Claim and process up to `batch_size` pending jobs, sequentially.
    pub async fn run_batch(&self) -> Result<BatchSummary, DispatchError> {
        info!(
            dispatcher = %self.config.name,
            batch_size = self.config.batch_size,
            "dispatcher run started"
        );

        let mut summary = BatchSummary::default();
        for _ in 0..self.config.batch_size {
            let Some(job) = self.store.claim_batch(1).await?.into_iter().next() else {
                break;
            };
            self.run_job(&job, &mut summary).await;
        }

        info!(
            dispatcher = %self.config.name,
            processed = summary.processed,
            failed = summary.failed,
            unpersisted = summary.unpersisted.len(),
            "dispatcher run finished"
        );
        Ok(summary)
    }

    async fn run_job(&self, job: &ComparisonJob, summary: &mut BatchSummary) {
        debug!(
            dispatcher = %self.config.name,
            job_id = %job.id,
            transaction_id = %job.transaction_id,
            priority = job.priority,
            "claimed job"
        );

        let processing = StatusUpdate::Processing {
            message: PROCESSING_MESSAGE.to_string(),
        };
        if let Err(e) = self.store.record_status(job.transaction_id, &processing).await {
            warn!(
                job_id = %job.id,
                transaction_id = %job.transaction_id,
                error = %e,
                "failed to mirror processing status"
            );
        }

        let outcome = match self.process_job(job).await {
            Ok(result) => JobOutcome::Completed(result),
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "comparison job failed");
                JobOutcome::Failed(e.to_string())
            }
        };

        match self.store.commit_outcome(job, &outcome).await {
            Ok(JobStatus::Completed) => summary.processed += 1,
            Ok(_) => summary.failed += 1,
            Err(e) => {
                error!(
                    job_id = %job.id,
                    status = %outcome.status(),
                    retryable = e.is_retryable(),
                    error = %e,
                    "failed to persist job outcome"
                );
                summary.unpersisted.push(job.id);
            }
        }
    }

    async fn process_job(&self, job: &ComparisonJob) -> Result<AnalysisResult, JobError> {
        let payload = job.payload()?;
        let (reference, returned) = payload.image_paths().ok_or(JobError::MissingImagePaths)?;

        let comparison = self.compare(Path::new(reference), Path::new(returned)).await;
        if let Err(reason) = &comparison {
            warn!(job_id = %job.id, reason = %reason, "comparator unavailable, using offline results");
        }

        Ok(analyze(
            &self.blender,
            payload.analysis_input(),
            comparison.as_ref(),
            Utc::now(),
        ))
    }

    async fn compare(
        &self,
        reference: &Path,
        returned: &Path,
    ) -> Result<ComparisonResult, ComparatorError> {
        let limit = self.config.comparator_timeout;
        match tokio::time::timeout(limit, self.comparator.compare(reference, returned)).await {
            Ok(result) => result.and_then(ComparisonResult::validate),
            Err(_) => Err(ComparatorError::Timeout {
                elapsed_ms: limit.as_millis() as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use lendkiosk_ai::{BlendMethod, FALLBACK_MODEL_VERSION, MISMATCH_WARNING};
    use lendkiosk_core::{SeverityLevel, TransactionId};

    use crate::jobs::types::JobPayload;
    use crate::store::{AiAnalysisStatus, InMemoryAnalysisStore, JobOutcome, PersistenceError, SinkError};

    enum Reply {
        Ok(ComparisonResult),
        Err(ComparatorError),
        Hang,
    }

    struct ScriptedComparator {
        reply: Reply,
        calls: AtomicUsize,
    }

    impl ScriptedComparator {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                reply,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ImageComparator for ScriptedComparator {
        async fn compare(
            &self,
            _reference: &Path,
            _returned: &Path,
        ) -> Result<ComparisonResult, ComparatorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.reply {
                Reply::Ok(result) => Ok(result.clone()),
                Reply::Err(e) => Err(e.clone()),
                Reply::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Err(ComparatorError::EmptyOutput)
                }
            }
        }
    }

    async fn queue(store: &InMemoryAnalysisStore, payload: &JobPayload) -> ComparisonJob {
        let job = ComparisonJob::new(TransactionId::new(), payload, 0);
        store.enqueue(job.clone()).await.unwrap();
        job
    }

    fn photos() -> JobPayload {
        JobPayload::new("/photos/ref.jpg", "/photos/ret.jpg")
    }

    #[tokio::test]
    async fn missing_reference_path_fails_job_without_calling_comparator() {
        let store = InMemoryAnalysisStore::arc();
        let comparator = ScriptedComparator::new(Reply::Ok(ComparisonResult::new(90.0, 0.9)));
        let job = ComparisonJob::from_raw_payload(
            TransactionId::new(),
            serde_json::json!({"return_path": "/photos/ret.jpg", "offline_similarity": 60}),
            0,
        );
        store.enqueue(job.clone()).await.unwrap();

        let dispatcher = JobDispatcher::new(store.clone(), comparator.clone());
        let summary = dispatcher.run_batch().await.unwrap();

        assert_eq!(summary, BatchSummary { processed: 0, failed: 1, unpersisted: vec![] });
        assert_eq!(comparator.calls(), 0);

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("Missing image paths in job payload"));
        assert!(stored.processed_at.is_none());

        let txn = store.transaction(job.transaction_id).unwrap();
        assert_eq!(txn.ai_analysis_status, AiAnalysisStatus::Failed);
        assert_eq!(txn.ai_analysis_message.as_deref(), Some("Missing image paths in job payload"));
    }

    #[tokio::test]
    async fn out_of_range_offline_similarity_fails_job_without_calling_comparator() {
        for raw in [serde_json::json!("NaN"), serde_json::json!(250)] {
            let store = InMemoryAnalysisStore::arc();
            let comparator = ScriptedComparator::new(Reply::Ok(ComparisonResult::new(90.0, 0.9)));
            let job = ComparisonJob::from_raw_payload(
                TransactionId::new(),
                serde_json::json!({
                    "reference_path": "/photos/ref.jpg",
                    "return_path": "/photos/ret.jpg",
                    "offline_similarity": raw
                }),
                0,
            );
            store.enqueue(job.clone()).await.unwrap();

            let summary = JobDispatcher::new(store.clone(), comparator.clone())
                .run_batch()
                .await
                .unwrap();

            assert_eq!(summary, BatchSummary { processed: 0, failed: 1, unpersisted: vec![] });
            assert_eq!(comparator.calls(), 0);

            let stored = store.get(job.id).await.unwrap().unwrap();
            assert_eq!(stored.status, JobStatus::Failed);
            assert!(stored.result.is_none());
            let message = stored.error_message.unwrap();
            assert!(message.starts_with("invalid job payload"), "{raw}: {message}");
            assert!(message.contains("offline_similarity"), "{raw}: {message}");

            let txn = store.transaction(job.transaction_id).unwrap();
            assert_eq!(txn.ai_analysis_status, AiAnalysisStatus::Failed);
            assert!(txn.ai_similarity_score.is_none());
        }
    }

    #[tokio::test]
    async fn comparator_failure_completes_with_offline_results() {
        let store = InMemoryAnalysisStore::arc();
        let comparator = ScriptedComparator::new(Reply::Err(ComparatorError::Reported(
            "model weights missing".to_string(),
        )));
        let job = queue(&store, &photos().with_offline(64.5, SeverityLevel::High)).await;

        let summary = JobDispatcher::new(store.clone(), comparator.clone())
            .run_batch()
            .await
            .unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(comparator.calls(), 1);

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert!(stored.processed_at.is_some());
        let result = stored.result.unwrap();
        assert_eq!(result.model_version, FALLBACK_MODEL_VERSION);
        assert_eq!(result.final_blended_score, 64.5);
        assert_eq!(result.ai_severity_level, SeverityLevel::High);
        assert_eq!(result.blend_method, BlendMethod::OfflineOnly);

        let txn = store.transaction(job.transaction_id).unwrap();
        assert_eq!(txn.ai_analysis_status, AiAnalysisStatus::Completed);
        assert_eq!(txn.ai_similarity_score, Some(64.5));
        assert!(txn.ai_analysis_message.is_none());
    }

    #[tokio::test]
    async fn confident_comparator_result_is_blended() {
        let store = InMemoryAnalysisStore::arc();
        let comparator = ScriptedComparator::new(Reply::Ok(
            ComparisonResult::new(90.0, 0.9).with_issues(["Scuff on lid"]),
        ));
        let job = queue(&store, &photos().with_offline(60.0, SeverityLevel::Medium)).await;

        JobDispatcher::new(store.clone(), comparator).run_batch().await.unwrap();

        let result = store.get(job.id).await.unwrap().unwrap().result.unwrap();
        assert_eq!(result.blend_method, BlendMethod::Blended);
        assert_eq!(result.final_blended_score, 72.0);
        assert_eq!(result.ai_similarity_score, 90.0);
        assert_eq!(result.ai_severity_level, SeverityLevel::None);
        assert_eq!(result.ai_detected_issues_list[0], MISMATCH_WARNING);
        assert_eq!(result.ai_detected_issues_list[1], "Scuff on lid");

        let txn = store.transaction(job.transaction_id).unwrap();
        assert_eq!(txn.ai_severity_level, Some(SeverityLevel::None));
        assert_eq!(txn.detected_issues.as_deref(), Some(result.ai_detected_issues.as_str()));
    }

    #[tokio::test]
    async fn concurrent_runs_process_each_job_once() {
        let store = InMemoryAnalysisStore::arc();
        let comparator = ScriptedComparator::new(Reply::Ok(ComparisonResult::new(80.0, 0.9)));
        let job = queue(&store, &photos()).await;

        let first = JobDispatcher::new(store.clone(), comparator.clone());
        let second = JobDispatcher::new(store.clone(), comparator.clone());
        let (a, b) = tokio::join!(first.run_batch(), second.run_batch());
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.processed + b.processed, 1);
        assert_eq!(a.failed + b.failed, 0);
        assert_eq!(comparator.calls(), 1);
        assert_eq!(store.get(job.id).await.unwrap().unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn slow_comparator_times_out_into_fallback() {
        let store = InMemoryAnalysisStore::arc();
        let comparator = ScriptedComparator::new(Reply::Hang);
        let job = queue(&store, &photos().with_offline(55.0, SeverityLevel::Medium)).await;

        let config = DispatcherConfig::default().with_comparator_timeout(Duration::from_millis(20));
        let summary = JobDispatcher::new(store.clone(), comparator)
            .with_config(config)
            .run_batch()
            .await
            .unwrap();

        assert_eq!(summary.processed, 1);
        let result = store.get(job.id).await.unwrap().unwrap().result.unwrap();
        assert!(result.used_fallback());
        assert_eq!(result.final_blended_score, 55.0);
        assert!(result.fallback_reason.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn out_of_range_comparator_result_falls_back() {
        let store = InMemoryAnalysisStore::arc();
        let comparator = ScriptedComparator::new(Reply::Ok(ComparisonResult::new(250.0, 0.9)));
        let job = queue(&store, &photos().with_offline(70.0, SeverityLevel::None)).await;

        JobDispatcher::new(store.clone(), comparator).run_batch().await.unwrap();

        let result = store.get(job.id).await.unwrap().unwrap().result.unwrap();
        assert_eq!(result.model_version, FALLBACK_MODEL_VERSION);
        assert_eq!(result.final_blended_score, 70.0);
    }

    #[tokio::test]
    async fn failure_does_not_stop_the_batch() {
        let store = InMemoryAnalysisStore::arc();
        let comparator = ScriptedComparator::new(Reply::Ok(ComparisonResult::new(75.0, 0.6)));

        let bad = ComparisonJob::from_raw_payload(TransactionId::new(), serde_json::json!("not an object"), 0);
        store.enqueue(bad.clone()).await.unwrap();
        let bad_severity = ComparisonJob::from_raw_payload(
            TransactionId::new(),
            serde_json::json!({
                "reference_path": "/a.jpg",
                "return_path": "/b.jpg",
                "offline_severity": "catastrophic"
            }),
            1,
        );
        store.enqueue(bad_severity.clone()).await.unwrap();
        let good = ComparisonJob::new(TransactionId::new(), &photos(), 2);
        store.enqueue(good.clone()).await.unwrap();

        let summary = JobDispatcher::new(store.clone(), comparator.clone())
            .run_batch()
            .await
            .unwrap();

        assert_eq!(summary.processed, 1);
        assert_eq!(summary.failed, 2);
        assert_eq!(comparator.calls(), 1);
        assert_eq!(store.get(good.id).await.unwrap().unwrap().status, JobStatus::Completed);
        let stored_bad = store.get(bad.id).await.unwrap().unwrap();
        assert!(stored_bad.error_message.unwrap().starts_with("invalid job payload"));
    }

    #[tokio::test]
    async fn batch_size_bounds_a_run() {
        let store = InMemoryAnalysisStore::arc();
        let comparator = ScriptedComparator::new(Reply::Err(ComparatorError::Disabled));
        for _ in 0..4 {
            queue(&store, &photos()).await;
        }

        let dispatcher = JobDispatcher::new(store.clone(), comparator)
            .with_config(DispatcherConfig::default().with_batch_size(3));
        assert_eq!(dispatcher.run_batch().await.unwrap().processed, 3);
        assert_eq!(store.stats().await.unwrap().pending, 1);
        assert_eq!(dispatcher.run_batch().await.unwrap().processed, 1);
        assert_eq!(dispatcher.run_batch().await.unwrap(), BatchSummary::default());
    }

    #[tokio::test]
    async fn interrupted_run_leaves_only_the_current_job_processing() {
        let store = InMemoryAnalysisStore::arc();
        let comparator = ScriptedComparator::new(Reply::Hang);
        for _ in 0..3 {
            queue(&store, &photos()).await;
        }

        let dispatcher = JobDispatcher::new(store.clone(), comparator.clone());
        let interrupted =
            tokio::time::timeout(Duration::from_millis(50), dispatcher.run_batch()).await;
        assert!(interrupted.is_err());

        assert_eq!(comparator.calls(), 1);
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.pending, 2);
    }

    enum Fault {
        /// Outcome commit fails with a transient error.
        CommitUnavailable,
        /// The transaction row was deleted after the job was queued.
        TransactionDeleted,
    }

    /// In-memory store with one injected fault.
    struct FaultyStore {
        inner: Arc<InMemoryAnalysisStore>,
        fault: Fault,
    }

    #[async_trait]
    impl JobStore for FaultyStore {
        async fn enqueue(&self, job: ComparisonJob) -> Result<JobId, JobStoreError> {
            self.inner.enqueue(job).await
        }
        async fn get(&self, job_id: JobId) -> Result<Option<ComparisonJob>, JobStoreError> {
            self.inner.get(job_id).await
        }
        async fn fetch_batch(&self, limit: usize) -> Result<Vec<ComparisonJob>, JobStoreError> {
            self.inner.fetch_batch(limit).await
        }
        async fn claim_batch(&self, limit: usize) -> Result<Vec<ComparisonJob>, JobStoreError> {
            self.inner.claim_batch(limit).await
        }
        async fn mark_processing(&self, job_id: JobId) -> Result<ComparisonJob, JobStoreError> {
            self.inner.mark_processing(job_id).await
        }
        async fn mark_completed(&self, job_id: JobId, result: &AnalysisResult) -> Result<(), JobStoreError> {
            self.inner.mark_completed(job_id, result).await
        }
        async fn mark_failed(&self, job_id: JobId, error_message: &str) -> Result<(), JobStoreError> {
            self.inner.mark_failed(job_id, error_message).await
        }
        async fn list_for_transaction(
            &self,
            transaction_id: TransactionId,
        ) -> Result<Vec<ComparisonJob>, JobStoreError> {
            self.inner.list_for_transaction(transaction_id).await
        }
        async fn stats(&self) -> Result<crate::store::JobStats, JobStoreError> {
            self.inner.stats().await
        }
    }

    #[async_trait]
    impl TransactionStatusSink for FaultyStore {
        async fn record_status(
            &self,
            transaction_id: TransactionId,
            update: &StatusUpdate,
        ) -> Result<(), SinkError> {
            match self.fault {
                Fault::TransactionDeleted => Err(SinkError::TransactionNotFound(transaction_id)),
                Fault::CommitUnavailable => self.inner.record_status(transaction_id, update).await,
            }
        }
    }

    #[async_trait]
    impl AnalysisStore for FaultyStore {
        async fn commit_outcome(
            &self,
            job: &ComparisonJob,
            outcome: &JobOutcome,
        ) -> Result<JobStatus, PersistenceError> {
            match self.fault {
                Fault::CommitUnavailable => {
                    Err(JobStoreError::Unavailable("connection reset".to_string()).into())
                }
                Fault::TransactionDeleted => self.inner.commit_outcome(job, outcome).await,
            }
        }
    }

    #[tokio::test]
    async fn unpersisted_outcomes_are_reported() {
        let inner = InMemoryAnalysisStore::arc();
        let store = FaultyStore {
            inner: inner.clone(),
            fault: Fault::CommitUnavailable,
        };
        let comparator = ScriptedComparator::new(Reply::Err(ComparatorError::Disabled));
        let first = queue(&inner, &photos()).await;
        let second = queue(&inner, &photos()).await;

        let summary = JobDispatcher::new(store, comparator).run_batch().await.unwrap();

        assert_eq!(summary.processed, 0);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.unpersisted.len(), 2);
        assert!(summary.unpersisted.contains(&first.id));
        assert!(summary.unpersisted.contains(&second.id));
        assert_eq!(inner.stats().await.unwrap().processing, 2);

        let txn = inner.transaction(first.transaction_id).unwrap();
        assert_eq!(txn.ai_analysis_status, AiAnalysisStatus::Processing);
        assert_eq!(txn.ai_analysis_message.as_deref(), Some(PROCESSING_MESSAGE));
    }

    #[tokio::test]
    async fn deleted_transaction_fails_the_job_instead_of_stranding_it() {
        let inner = InMemoryAnalysisStore::arc();
        let store = FaultyStore {
            inner: inner.clone(),
            fault: Fault::TransactionDeleted,
        };
        let comparator = ScriptedComparator::new(Reply::Ok(ComparisonResult::new(80.0, 0.9)));
        let job = queue(&inner, &photos()).await;

        let summary = JobDispatcher::new(store, comparator).run_batch().await.unwrap();

        assert_eq!(summary, BatchSummary { processed: 0, failed: 1, unpersisted: vec![] });
        let stored = inner.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.result.is_none());
        assert_eq!(
            stored.error_message,
            Some(format!("transaction not found: {}", job.transaction_id))
        );
        assert!(inner.transaction(job.transaction_id).is_none());
        assert_eq!(inner.stats().await.unwrap().processing, 0);
    }

    #[test]
    fn summary_serializes_counts() {
        let summary = BatchSummary { processed: 2, failed: 1, unpersisted: vec![] };
        assert_eq!(
            serde_json::to_value(&summary).unwrap(),
            serde_json::json!({"processed": 2, "failed": 1})
        );
    }
}
