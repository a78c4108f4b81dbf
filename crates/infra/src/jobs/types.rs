//! Comparison job types and lifecycle.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use lendkiosk_ai::{AnalysisInput, AnalysisResult};
use lendkiosk_core::{DomainError, JobId, SeverityLevel, TransactionId};

use crate::store::JobStoreError;

/// Offline similarity assumed when the payload carries none.
pub const DEFAULT_OFFLINE_SIMILARITY: f64 = 50.0;

/// Job lifecycle status.
///
/// Transitions only move forward: `pending -> processing -> {completed, failed}`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be claimed
    Pending,
    /// Claimed by a dispatcher run
    Processing,
    /// Analysis persisted
    Completed,
    /// Gave up; no automatic retry
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DomainError::validation(format!("unknown job status '{other}'"))),
        }
    }
}

/// Snapshot taken when the return was logged.
///
/// Unknown keys (e.g. `item_size`) are preserved so the stored payload is never
/// rewritten lossily.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JobPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_path: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_score",
        skip_serializing_if = "Option::is_none"
    )]
    pub offline_similarity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offline_severity: Option<SeverityLevel>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl JobPayload {
    pub fn new(reference_path: impl Into<String>, return_path: impl Into<String>) -> Self {
        Self {
            reference_path: Some(reference_path.into()),
            return_path: Some(return_path.into()),
            ..Default::default()
        }
    }

    pub fn with_offline(mut self, similarity: f64, severity: SeverityLevel) -> Self {
        self.offline_similarity = Some(similarity);
        self.offline_severity = Some(severity);
        self
    }

    /// Both image paths, when present and non-blank.
    pub fn image_paths(&self) -> Option<(&str, &str)> {
        let reference = non_blank(self.reference_path.as_deref())?;
        let returned = non_blank(self.return_path.as_deref())?;
        Some((reference, returned))
    }

    /// Reject offline scores outside `[0, 100]`, including NaN and infinities.
    pub fn validate(self) -> Result<Self, JobError> {
        if let Some(score) = self.offline_similarity {
            if !score.is_finite() || !(0.0..=100.0).contains(&score) {
                return Err(JobError::InvalidPayload(format!(
                    "offline_similarity must be within [0, 100], got {score}"
                )));
            }
        }
        Ok(self)
    }

    pub fn analysis_input(&self) -> AnalysisInput {
        AnalysisInput {
            offline_similarity: self.offline_similarity.unwrap_or(DEFAULT_OFFLINE_SIMILARITY),
            offline_severity: self.offline_severity.unwrap_or_default(),
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Accept `72.5`, `"72.5"` or `null`; payloads written by older tooling store
/// decimal columns as strings.
fn lenient_score<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Score {
        Number(f64),
        Text(String),
    }

    match Option::<Score>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Score::Number(n)) => Ok(Some(n)),
        Some(Score::Text(s)) if s.trim().is_empty() => Ok(None),
        Some(Score::Text(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Per-job processing failure. The job ends `failed` with this message.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum JobError {
    #[error("Missing image paths in job payload")]
    MissingImagePaths,

    #[error("invalid job payload: {0}")]
    InvalidPayload(String),
}

/// A unit of deferred comparison work tied to one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonJob {
    pub id: JobId,
    pub transaction_id: TransactionId,
    /// Raw payload snapshot; never mutated after creation.
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Lower is more urgent.
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub result: Option<AnalysisResult>,
    pub error_message: Option<String>,
}

impl ComparisonJob {
    /// Create a new pending job.
    pub fn new(transaction_id: TransactionId, payload: &JobPayload, priority: i32) -> Self {
        Self::from_raw_payload(transaction_id, payload.to_value(), priority)
    }

    /// Create a new pending job from an already-serialized payload.
    pub fn from_raw_payload(
        transaction_id: TransactionId,
        payload: serde_json::Value,
        priority: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            transaction_id,
            payload,
            status: JobStatus::Pending,
            priority,
            created_at: now,
            updated_at: now,
            processed_at: None,
            result: None,
            error_message: None,
        }
    }

    /// Decode and validate the payload snapshot.
    pub fn payload(&self) -> Result<JobPayload, JobError> {
        if !self.payload.is_object() {
            return Err(JobError::InvalidPayload("payload is not a JSON object".to_string()));
        }
        serde_json::from_value::<JobPayload>(self.payload.clone())
            .map_err(|e| JobError::InvalidPayload(e.to_string()))?
            .validate()
    }

    /// Queue ordering: priority ascending, then oldest first.
    pub fn queue_key(&self) -> (i32, DateTime<Utc>) {
        (self.priority, self.created_at)
    }

    fn transition(&mut self, next: JobStatus, now: DateTime<Utc>) -> Result<(), JobStoreError> {
        if !self.status.can_transition_to(next) {
            return Err(JobStoreError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_processing(&mut self, now: DateTime<Utc>) -> Result<(), JobStoreError> {
        self.transition(JobStatus::Processing, now)
    }

    pub fn mark_completed(
        &mut self,
        result: AnalysisResult,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        self.transition(JobStatus::Completed, now)?;
        self.processed_at = Some(now);
        self.result = Some(result);
        self.error_message = None;
        Ok(())
    }

    pub fn mark_failed(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        self.transition(JobStatus::Failed, now)?;
        self.error_message = Some(error.into());
        Ok(())
    }
}
