//! Comparison jobs: the job model, intake and the batch dispatcher.
//!
//! ## Lifecycle
//!
//! `pending --claim--> processing --> completed | failed`
//!
//! Terminal states are final. A comparator that is disabled, times out or
//! returns unusable output does not fail the job; the offline score is used.
//!
//! ## Components
//!
//! - `ComparisonJob`: one unit of comparison work for a transaction
//! - `queue_comparison`: enqueue a job and mark the transaction pending
//! - `JobDispatcher`: claims a bounded batch and records each outcome

pub mod dispatcher;
pub mod intake;
pub mod types;

pub use dispatcher::{BatchSummary, DispatchError, DispatcherConfig, JobDispatcher, PROCESSING_MESSAGE};
pub use intake::{DEFAULT_PRIORITY, QUEUED_MESSAGE, queue_comparison};
pub use types::{ComparisonJob, DEFAULT_OFFLINE_SIMILARITY, JobError, JobPayload, JobStatus};
