//! Adapters for external services.

pub mod subprocess_comparator;

pub use subprocess_comparator::{ComparatorConfig, SubprocessComparator};
