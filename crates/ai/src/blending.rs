//! Score blending: combine the offline heuristic with the AI judgment.
//!
//! Model:
//! - Low AI confidence: ignore the AI score entirely.
//! - Otherwise: weighted mean, leaning more on the AI score as confidence rises.
//! - Severity is bucketed from the final score with fixed thresholds.

use serde::{Deserialize, Serialize};

use lendkiosk_core::SeverityLevel;

/// Tunables for blending and severity bucketing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlendConfig {
    /// Below this AI confidence the offline score is used as-is.
    pub min_confidence: f64,
    /// At or above this AI confidence the high-confidence weights apply.
    pub high_confidence: f64,
    /// Offline weight when confidence >= `high_confidence`.
    pub high_confidence_offline_weight: f64,
    /// Offline weight when `min_confidence` <= confidence < `high_confidence`.
    pub medium_confidence_offline_weight: f64,
    /// Absolute score gap that flags a disagreement for manual review.
    pub mismatch_threshold: f64,
    /// Scores below this are `high` severity.
    pub severity_high_threshold: f64,
    /// Scores at or above this are `none` severity.
    pub severity_medium_threshold: f64,
    /// Used when a successful comparator result carries no version tag.
    pub default_model_version: String,
}

impl Default for BlendConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            high_confidence: 0.8,
            high_confidence_offline_weight: 0.6,
            medium_confidence_offline_weight: 0.7,
            mismatch_threshold: 20.0,
            severity_high_threshold: 50.0,
            severity_medium_threshold: 70.0,
            default_model_version: "clip-vit-base-patch32-v1.0".to_string(),
        }
    }
}

impl BlendConfig {
    pub fn with_min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    pub fn with_mismatch_threshold(mut self, threshold: f64) -> Self {
        self.mismatch_threshold = threshold;
        self
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlendMethod {
    OfflineOnly,
    Blended,
}

impl BlendMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlendMethod::OfflineOnly => "offline_only",
            BlendMethod::Blended => "blended",
        }
    }
}

/// Outcome of blending one offline score with one AI score.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blend {
    pub final_score: f64,
    pub method: BlendMethod,
    pub offline_weight: f64,
    pub ai_weight: f64,
}

/// Stateless blending engine parameterised by a [`BlendConfig`].
#[derive(Debug, Clone, Default)]
pub struct ScoreBlender {
    config: BlendConfig,
}

impl ScoreBlender {
    pub fn new(config: BlendConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BlendConfig {
        &self.config
    }

    /// Blend the offline score with the AI score according to AI confidence.
    ///
    /// A non-finite confidence counts as below the minimum.
    pub fn blend(&self, offline_score: f64, ai_score: f64, ai_confidence: f64) -> Blend {
        if !ai_confidence.is_finite() || ai_confidence < self.config.min_confidence {
            return Blend {
                final_score: offline_score,
                method: BlendMethod::OfflineOnly,
                offline_weight: 1.0,
                ai_weight: 0.0,
            };
        }

        let offline_weight = if ai_confidence >= self.config.high_confidence {
            self.config.high_confidence_offline_weight
        } else {
            self.config.medium_confidence_offline_weight
        };
        let ai_weight = 1.0 - offline_weight;

        Blend {
            final_score: round2(offline_weight * offline_score + ai_weight * ai_score),
            method: BlendMethod::Blended,
            offline_weight,
            ai_weight,
        }
    }

    /// True when the two scores disagree by at least the mismatch threshold.
    pub fn detect_mismatch(&self, offline_score: f64, ai_score: f64) -> bool {
        (offline_score - ai_score).abs() >= self.config.mismatch_threshold
    }

    /// Bucket a similarity score into a severity level.
    pub fn severity_from_score(&self, score: f64) -> SeverityLevel {
        if score >= self.config.severity_medium_threshold {
            SeverityLevel::None
        } else if score >= self.config.severity_high_threshold {
            SeverityLevel::Medium
        } else {
            SeverityLevel::High
        }
    }
}

/// Merge AI issues with newline-separated offline issues.
///
/// Every non-blank AI issue is kept, in order. An offline line is appended only
/// when it is not a case-insensitive substring of an entry already kept and
/// does not contain one.
pub fn merge_issue_list<S: AsRef<str>>(offline_issues: &str, ai_issues: &[S]) -> Vec<String> {
    let mut merged: Vec<String> = ai_issues
        .iter()
        .map(|s| s.as_ref().trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    let mut folded: Vec<String> = merged.iter().map(|s| s.to_lowercase()).collect();

    for line in offline_issues.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let lower = trimmed.to_lowercase();
        let redundant = folded
            .iter()
            .any(|existing| existing.contains(&lower) || lower.contains(existing.as_str()));
        if !redundant {
            merged.push(trimmed.to_string());
            folded.push(lower);
        }
    }

    merged
}

/// [`merge_issue_list`] joined into the newline-separated text form.
pub fn merge_issues<S: AsRef<str>>(offline_issues: &str, ai_issues: &[S]) -> String {
    merge_issue_list(offline_issues, ai_issues).join("\n")
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
