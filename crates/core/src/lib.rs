//! `lendkiosk-core`: shared building blocks for the equipment-return analysis pipeline.
//!
//! This crate contains **pure** primitives (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod severity;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, TransactionId};
pub use severity::SeverityLevel;
