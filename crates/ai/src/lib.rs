//! `lendkiosk-ai`
//!
//! **Responsibility:** AI-assisted damage comparison boundary.
//!
//! This crate is intentionally **pure**:
//! - It does not touch storage or spawn processes.
//! - The external model is reached only through the [`ImageComparator`] port;
//!   adapters live in `lendkiosk-infra`.
//! - Blending and the per-job analysis are deterministic functions of their inputs.

pub mod analysis;
pub mod blending;
pub mod comparator;
pub mod result;

pub use analysis::{AnalysisInput, AnalysisResult, analyze, FALLBACK_ISSUE, FALLBACK_MODEL_VERSION, MISMATCH_WARNING};
pub use blending::{Blend, BlendConfig, BlendMethod, ScoreBlender, merge_issue_list, merge_issues};
pub use comparator::{DisabledComparator, ImageComparator, parse_comparator_output};
pub use result::{ComparatorError, ComparisonResult};
