//! Infrastructure layer: job persistence, the batch dispatcher, the external
//! comparator adapter and worker configuration.

pub mod config;
pub mod external;
pub mod jobs;
pub mod store;

pub use config::{ConfigError, WorkerConfig};
pub use external::{ComparatorConfig, SubprocessComparator};
pub use jobs::{BatchSummary, ComparisonJob, DispatchError, DispatcherConfig, JobDispatcher, JobPayload, JobStatus};
pub use store::{AnalysisStore, InMemoryAnalysisStore, JobStore, PostgresAnalysisStore, TransactionStatusSink};
