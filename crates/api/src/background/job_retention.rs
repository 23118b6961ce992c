//! Periodic removal of finished jobs.
//!
//! Terminal jobs and their committed results are dropped once they are
//! older than the configured retention period. Runs on a fixed interval
//! using `tokio::time::interval`.

use std::sync::Arc;
use std::time::Duration;

use murmur_engine::Orchestrator;
use tokio_util::sync::CancellationToken;

/// How often the sweep runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(3600); // 1 hour

/// Run the retention loop until `cancel` is triggered.
pub async fn run(
    orchestrator: Arc<Orchestrator>,
    retention: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    tracing::info!(
        retention_secs = retention.as_secs(),
        interval_secs = interval.as_secs(),
        "Job retention sweeper started"
    );

    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Job retention sweeper stopping");
                break;
            }
            _ = ticker.tick() => {
                match orchestrator.purge_expired(retention).await {
                    Ok(purged) => {
                        if purged > 0 {
                            tracing::info!(purged, "Job retention: removed expired jobs");
                        } else {
                            tracing::debug!("Job retention: nothing to remove");
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Job retention: sweep failed");
                    }
                }
            }
        }
    }
}
