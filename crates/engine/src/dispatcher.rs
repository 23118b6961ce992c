//! Background job dispatcher.
//!
//! A single long-lived Tokio task that takes queued jobs in FIFO order and
//! hands each to the [`Supervisor`], never running more than
//! `max_concurrent_jobs` at once. A slot is a semaphore permit; the
//! supervisor task holds it until cleanup has run.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::active::ActiveJobs;
use crate::queue::IntakeQueue;
use crate::supervisor::Supervisor;

pub struct JobDispatcher {
    queue: Arc<IntakeQueue>,
    active: Arc<ActiveJobs>,
    supervisor: Arc<Supervisor>,
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl JobDispatcher {
    pub fn new(
        queue: Arc<IntakeQueue>,
        active: Arc<ActiveJobs>,
        supervisor: Arc<Supervisor>,
        capacity: usize,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue,
            active,
            supervisor,
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Run the dispatcher loop until the cancellation token is triggered,
    /// then wait for running supervisors to finish.
    ///
    /// Running jobs are interrupted through their own tokens, which are
    /// children of the same shutdown token.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(capacity = self.capacity, "Job dispatcher started");
        let mut running = JoinSet::new();

        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Supervisor task failed");
                    }
                    continue;
                }
                permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let id = tokio::select! {
                _ = cancel.cancelled() => break,
                id = self.queue.pop() => id,
            };

            let Some(token) = self.active.register(id).await else {
                tracing::warn!(job_id = %id, "Job already running, skipping duplicate dispatch");
                continue;
            };

            tracing::debug!(job_id = %id, "Dispatching job");
            let supervisor = Arc::clone(&self.supervisor);
            let active = Arc::clone(&self.active);
            running.spawn(async move {
                let outcome = supervisor.run(id, token).await;
                active.remove(id).await;
                drop(permit);
                tracing::debug!(job_id = %id, ?outcome, "Slot released");
            });
        }

        tracing::info!(running = running.len(), "Job dispatcher shutting down");
        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Supervisor task failed");
            }
        }
    }
}
