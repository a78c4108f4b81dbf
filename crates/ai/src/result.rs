use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Similarity judgment returned by the external image comparator.
///
/// This is an *input* to blending, never persisted on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    /// Similarity between reference and returned photo, in \[0, 100\].
    pub similarity_score: f64,

    /// Model confidence in \[0, 1\].
    pub confidence: f64,

    /// Human-readable issues, highest priority first.
    pub detected_issues: Vec<String>,

    /// Machine labels for the detected issues (e.g. `scratch`, `missing_part`).
    pub issue_labels: Vec<String>,

    /// Version tag reported by the model, if any.
    pub model_version: Option<String>,
}

impl ComparisonResult {
    pub fn new(similarity_score: f64, confidence: f64) -> Self {
        Self {
            similarity_score,
            confidence,
            detected_issues: Vec::new(),
            issue_labels: Vec::new(),
            model_version: None,
        }
    }

    pub fn with_issues<I, S>(mut self, issues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.detected_issues = issues.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.issue_labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_model_version(mut self, version: impl Into<String>) -> Self {
        self.model_version = Some(version.into());
        self
    }

    /// Reject scores outside \[0, 100\] and confidences outside \[0, 1\].
    pub fn validate(self) -> Result<Self, ComparatorError> {
        if !self.similarity_score.is_finite() || !(0.0..=100.0).contains(&self.similarity_score) {
            return Err(ComparatorError::InvalidOutput(format!(
                "similarity score out of range: {}",
                self.similarity_score
            )));
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(ComparatorError::InvalidOutput(format!(
                "confidence out of range: {}",
                self.confidence
            )));
        }
        Ok(self)
    }
}

/// Reasons the comparator could not produce a usable judgment.
///
/// Every variant means "comparator unavailable": callers fall back to the
/// offline score instead of failing the job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComparatorError {
    #[error("AI comparison disabled")]
    Disabled,

    #[error("image not found: {0}")]
    MissingImage(String),

    #[error("AI comparison timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("AI script produced no output")]
    EmptyOutput,

    #[error("failed to parse AI output: {0}")]
    InvalidOutput(String),

    /// The comparator ran but reported an error of its own.
    #[error("AI inference failed: {0}")]
    Reported(String),

    #[error("failed to run AI comparator: {0}")]
    Io(String),
}
