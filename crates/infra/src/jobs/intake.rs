//! Queueing comparison work when a return is logged.

use tracing::info;

use lendkiosk_core::{JobId, TransactionId};

use super::types::{ComparisonJob, JobPayload};
use crate::store::{AnalysisStore, PersistenceError, StatusUpdate};

/// Transaction message while a job waits in the queue.
pub const QUEUED_MESSAGE: &str = "Analyzing Equipment for damages";

/// Priority used by return logging and backfill.
pub const DEFAULT_PRIORITY: i32 = 3;

/// Enqueue a comparison job for `transaction_id` and mark the transaction pending.
///
/// Any previous analysis on the transaction is cleared. No deduplication is done;
/// see [`JobStore::open_job_for_transaction`](crate::store::JobStore::open_job_for_transaction).
pub async fn queue_comparison<S: AnalysisStore + ?Sized>(
    store: &S,
    transaction_id: TransactionId,
    payload: &JobPayload,
    priority: i32,
) -> Result<JobId, PersistenceError> {
    let job = ComparisonJob::new(transaction_id, payload, priority);
    let job_id = store.enqueue(job).await?;

    store
        .record_status(
            transaction_id,
            &StatusUpdate::Pending {
                message: QUEUED_MESSAGE.to_string(),
            },
        )
        .await?;

    info!(job_id = %job_id, transaction_id = %transaction_id, priority, "queued comparison job");
    Ok(job_id)
}
