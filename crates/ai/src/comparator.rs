use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::result::{ComparatorError, ComparisonResult};

/// Black-box image similarity capability.
///
/// Implementations may shell out to a script, call an RPC service or bind a
/// model in-process. Callers enforce the wall-clock timeout; implementations
/// must release their resources when the returned future is dropped.
#[async_trait]
pub trait ImageComparator: Send + Sync + 'static {
    /// Compare the reference photo against the photo taken at return time.
    async fn compare(
        &self,
        reference_path: &Path,
        return_path: &Path,
    ) -> Result<ComparisonResult, ComparatorError>;
}

#[async_trait]
impl<T: ImageComparator + ?Sized> ImageComparator for Arc<T> {
    async fn compare(
        &self,
        reference_path: &Path,
        return_path: &Path,
    ) -> Result<ComparisonResult, ComparatorError> {
        (**self).compare(reference_path, return_path).await
    }
}

/// Comparator used when AI inference is administratively switched off.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledComparator;

#[async_trait]
impl ImageComparator for DisabledComparator {
    async fn compare(
        &self,
        _reference_path: &Path,
        _return_path: &Path,
    ) -> Result<ComparisonResult, ComparatorError> {
        Err(ComparatorError::Disabled)
    }
}

/// Wire shape printed by the comparison script (one JSON object on stdout).
#[derive(Debug, Deserialize)]
struct RawComparatorOutput {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    ai_similarity_score: Option<f64>,
    #[serde(default)]
    ai_confidence: Option<f64>,
    #[serde(default)]
    ai_detected_issues: Vec<String>,
    #[serde(default)]
    ai_issue_labels: Vec<String>,
    #[serde(default)]
    model_version: Option<String>,
}

/// Parse the comparator's stdout into a [`ComparisonResult`].
///
/// Empty output, malformed JSON, an `error` field and a missing similarity
/// score are all reported as [`ComparatorError`]s.
pub fn parse_comparator_output(stdout: &str) -> Result<ComparisonResult, ComparatorError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(ComparatorError::EmptyOutput);
    }

    let raw: RawComparatorOutput = serde_json::from_str(trimmed)
        .map_err(|e| ComparatorError::InvalidOutput(e.to_string()))?;

    if let Some(error) = raw.error {
        return Err(ComparatorError::Reported(error));
    }

    let similarity_score = raw
        .ai_similarity_score
        .ok_or_else(|| ComparatorError::InvalidOutput("missing ai_similarity_score".to_string()))?;

    ComparisonResult {
        similarity_score,
        confidence: raw.ai_confidence.unwrap_or(0.0),
        detected_issues: raw.ai_detected_issues,
        issue_labels: raw.ai_issue_labels,
        model_version: raw.model_version,
    }
    .validate()
}
