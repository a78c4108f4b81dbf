//! Per-job damage analysis: turn a comparator outcome into the persisted result blob.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lendkiosk_core::SeverityLevel;

use crate::blending::{BlendMethod, ScoreBlender, merge_issue_list};
use crate::result::{ComparatorError, ComparisonResult};

/// Issue recorded when the comparator could not be used.
pub const FALLBACK_ISSUE: &str = "AI inference unavailable - using offline results";

/// Model version recorded when the comparator could not be used.
pub const FALLBACK_MODEL_VERSION: &str = "offline-fallback";

/// Warning prepended when offline and AI scores disagree.
pub const MISMATCH_WARNING: &str =
    "⚠️ AI and offline scores differ significantly - manual review recommended";

/// Offline heuristic computed at return time, snapshotted into the job payload.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct AnalysisInput {
    pub offline_similarity: f64,
    pub offline_severity: SeverityLevel,
}

/// Final analysis persisted on the job and mirrored onto the transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Raw comparator score, or the offline score when the comparator was unavailable.
    pub ai_similarity_score: f64,
    pub final_blended_score: f64,
    pub ai_confidence: f64,
    pub ai_severity_level: SeverityLevel,
    /// Newline-joined form of `ai_detected_issues_list`.
    pub ai_detected_issues: String,
    pub ai_detected_issues_list: Vec<String>,
    pub model_version: String,
    pub blend_method: BlendMethod,
    pub offline_score: f64,
    pub processed_at: DateTime<Utc>,
    /// Why the comparator was skipped, when it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}

impl AnalysisResult {
    pub fn used_fallback(&self) -> bool {
        self.fallback_reason.is_some()
    }
}

/// Combine the offline snapshot with the comparator outcome.
///
/// - Comparator unavailable: offline score and severity pass through unchanged.
/// - Comparator succeeded: scores are blended, severity is recomputed from the
///   blended score, and a mismatch warning leads the issue list when the two
///   scores disagree.
pub fn analyze(
    blender: &ScoreBlender,
    input: AnalysisInput,
    outcome: Result<&ComparisonResult, &ComparatorError>,
    processed_at: DateTime<Utc>,
) -> AnalysisResult {
    match outcome {
        Err(reason) => {
            let issues = vec![FALLBACK_ISSUE.to_string()];
            AnalysisResult {
                ai_similarity_score: input.offline_similarity,
                final_blended_score: input.offline_similarity,
                ai_confidence: 0.0,
                ai_severity_level: input.offline_severity,
                ai_detected_issues: issues.join("\n"),
                ai_detected_issues_list: issues,
                model_version: FALLBACK_MODEL_VERSION.to_string(),
                blend_method: BlendMethod::OfflineOnly,
                offline_score: input.offline_similarity,
                processed_at,
                fallback_reason: Some(reason.to_string()),
            }
        }
        Ok(ai) => {
            let blend = blender.blend(input.offline_similarity, ai.similarity_score, ai.confidence);

            // Offline issues are already stored on the transaction; only AI issues are merged here.
            let mut issues = merge_issue_list("", &ai.detected_issues);
            if blender.detect_mismatch(input.offline_similarity, ai.similarity_score) {
                issues.insert(0, MISMATCH_WARNING.to_string());
            }

            let model_version = ai
                .model_version
                .clone()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| blender.config().default_model_version.clone());

            AnalysisResult {
                ai_similarity_score: ai.similarity_score,
                final_blended_score: blend.final_score,
                ai_confidence: ai.confidence,
                ai_severity_level: blender.severity_from_score(blend.final_score),
                ai_detected_issues: issues.join("\n"),
                ai_detected_issues_list: issues,
                model_version,
                blend_method: blend.method,
                offline_score: input.offline_similarity,
                processed_at,
                fallback_reason: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(offline_similarity: f64, offline_severity: SeverityLevel) -> AnalysisInput {
        AnalysisInput {
            offline_similarity,
            offline_severity,
        }
    }

    #[test]
    fn unavailable_comparator_passes_offline_results_through() {
        let now = Utc::now();
        let result = analyze(
            &ScoreBlender::default(),
            input(42.0, SeverityLevel::Medium),
            Err(&ComparatorError::Timeout { elapsed_ms: 30_000 }),
            now,
        );

        assert_eq!(result.final_blended_score, 42.0);
        assert_eq!(result.ai_similarity_score, 42.0);
        // Passed through, not recomputed (42 would bucket as high).
        assert_eq!(result.ai_severity_level, SeverityLevel::Medium);
        assert_eq!(result.ai_detected_issues_list, vec![FALLBACK_ISSUE]);
        assert_eq!(result.ai_confidence, 0.0);
        assert_eq!(result.model_version, FALLBACK_MODEL_VERSION);
        assert_eq!(result.blend_method, BlendMethod::OfflineOnly);
        assert_eq!(result.processed_at, now);
        assert!(result.used_fallback());
    }

    #[test]
    fn successful_comparison_is_blended_and_severity_recomputed() {
        let ai = ComparisonResult::new(90.0, 0.9)
            .with_issues(["Light scuffing on base"])
            .with_model_version("clip-v2");

        let result = analyze(
            &ScoreBlender::default(),
            input(60.0, SeverityLevel::Medium),
            Ok(&ai),
            Utc::now(),
        );

        assert_eq!(result.final_blended_score, 72.0);
        assert_eq!(result.ai_similarity_score, 90.0);
        assert_eq!(result.ai_severity_level, SeverityLevel::None);
        assert_eq!(result.blend_method, BlendMethod::Blended);
        assert_eq!(result.model_version, "clip-v2");
        // |60 - 90| >= 20
        assert_eq!(
            result.ai_detected_issues_list,
            vec![MISMATCH_WARNING, "Light scuffing on base"]
        );
        assert_eq!(
            result.ai_detected_issues,
            format!("{MISMATCH_WARNING}\nLight scuffing on base")
        );
        assert!(!result.used_fallback());
    }

    #[test]
    fn nested_ai_issues_reach_both_list_and_text() {
        let ai = ComparisonResult::new(40.0, 0.9).with_issues(["Scratch", "Deep scratch on lid"]);

        let result = analyze(
            &ScoreBlender::default(),
            input(80.0, SeverityLevel::None),
            Ok(&ai),
            Utc::now(),
        );

        assert!(result.ai_detected_issues_list[0].starts_with("⚠️ "));
        assert_eq!(
            result.ai_detected_issues_list[1..],
            ["Scratch", "Deep scratch on lid"]
        );
        assert_eq!(
            result.ai_detected_issues,
            format!("{MISMATCH_WARNING}\nScratch\nDeep scratch on lid")
        );
    }

    #[test]
    fn agreeing_scores_carry_no_warning_and_default_model_version() {
        let ai = ComparisonResult::new(75.0, 0.6).with_issues(["  ", "Sticker residue"]);

        let result = analyze(
            &ScoreBlender::default(),
            input(70.0, SeverityLevel::None),
            Ok(&ai),
            Utc::now(),
        );

        assert_eq!(result.final_blended_score, 71.5);
        assert_eq!(result.ai_detected_issues, "Sticker residue");
        assert_eq!(result.model_version, "clip-vit-base-patch32-v1.0");
    }

    #[test]
    fn low_confidence_success_still_recomputes_severity() {
        let ai = ComparisonResult::new(20.0, 0.3);

        let result = analyze(
            &ScoreBlender::default(),
            input(55.0, SeverityLevel::None),
            Ok(&ai),
            Utc::now(),
        );

        assert_eq!(result.blend_method, BlendMethod::OfflineOnly);
        assert_eq!(result.final_blended_score, 55.0);
        assert_eq!(result.ai_severity_level, SeverityLevel::Medium);
        assert_eq!(result.ai_detected_issues_list, vec![MISMATCH_WARNING]);
    }

    #[test]
    fn result_blob_uses_snake_case_wire_names() {
        let result = analyze(
            &ScoreBlender::default(),
            input(50.0, SeverityLevel::High),
            Err(&ComparatorError::Disabled),
            Utc::now(),
        );

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["blend_method"], "offline_only");
        assert_eq!(json["ai_severity_level"], "high");
        assert_eq!(json["model_version"], "offline-fallback");
        assert_eq!(json["fallback_reason"], "AI comparison disabled");
    }
}
