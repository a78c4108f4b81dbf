//! Batch-run entry point: process up to one batch of pending comparison jobs,
//! print the summary as JSON and exit. Meant to be invoked by cron or a systemd
//! timer.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use lendkiosk_ai::{DisabledComparator, ImageComparator, ScoreBlender};
use lendkiosk_infra::store::ensure_schema;
use lendkiosk_infra::{JobDispatcher, PostgresAnalysisStore, SubprocessComparator, WorkerConfig};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    lendkiosk_observability::init();

    let config = WorkerConfig::from_env().context("invalid worker configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;
    ensure_schema(&pool).await.context("failed to prepare schema")?;

    let comparator: Arc<dyn ImageComparator> = if config.comparator.enabled {
        Arc::new(SubprocessComparator::new(config.comparator.clone()))
    } else {
        info!("AI comparison disabled, jobs will use offline results");
        Arc::new(DisabledComparator)
    };

    let dispatcher = JobDispatcher::new(PostgresAnalysisStore::new(pool), comparator)
        .with_blender(ScoreBlender::new(config.blend.clone()))
        .with_config(config.dispatcher.clone());

    let summary = match dispatcher.run_batch().await {
        Ok(summary) => summary,
        Err(e) => {
            error!(error = %e, retryable = e.is_retryable(), "dispatcher run failed");
            return Err(e.into());
        }
    };

    println!("{}", serde_json::to_string(&summary)?);
    if !summary.unpersisted.is_empty() {
        anyhow::bail!("{} job outcome(s) could not be persisted", summary.unpersisted.len());
    }
    Ok(())
}
