//! Comparison job persistence and the transaction status mirror.
//!
//! - `JobStore`: durable queue of comparison jobs
//! - `TransactionStatusSink`: analysis columns on the originating transaction
//! - `AnalysisStore`: both of the above behind one transaction boundary

pub mod r#trait;
pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryAnalysisStore;
pub use postgres::{PostgresAnalysisStore, ensure_schema};
pub use r#trait::{
    AiAnalysisStatus, AnalysisStore, JobOutcome, JobStats, JobStore, JobStoreError,
    PersistenceError, SinkError, StatusUpdate, TransactionAnalysis, TransactionStatusSink,
};
