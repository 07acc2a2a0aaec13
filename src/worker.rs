use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::handler::Handler;
use crate::job::{Job, JobId};
use crate::queue::{queue_order, QueueDef};
use crate::registry::RegistryKind;
use crate::store::{self, Store};

/// One worker: claims jobs across the configured queues in priority/weight
/// order, runs the handler, and routes the outcome.
pub struct Worker {
    store: Arc<dyn Store>,
    handler: Handler,
    queues: Vec<QueueDef>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        store: Arc<dyn Store>,
        handler: Handler,
        queues: Vec<QueueDef>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            handler,
            queues,
            poll_interval,
        }
    }

    /// Run until the shutdown token fires. Shutdown is only observed at
    /// the idle point: a claimed job is always seen through to completion
    /// or failure routing, never abandoned mid-claim.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("worker started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            if !self.poll_once().await {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }

        info!("worker shutting down");
    }

    /// One dequeue attempt. The visitation order is recomputed every time
    /// so queue weights keep balancing statistically. Returns whether a
    /// job was claimed.
    pub(crate) async fn poll_once(&self) -> bool {
        let order = queue_order(&self.queues);
        match self.store.dequeue(&order, Utc::now()).await {
            Ok(Some(id)) => {
                self.process(id).await;
                true
            }
            Ok(None) => false,
            Err(e) => {
                error!(error = %e, "dequeue failed");
                false
            }
        }
    }

    async fn process(&self, id: JobId) {
        let job = match self.store.get_job(&id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id = %id, "claimed job has no record; dropping claim");
                if let Err(e) = self.store.purge(RegistryKind::InFlight, &id).await {
                    error!(job_id = %id, error = %e, "failed to drop orphaned claim");
                }
                return;
            }
            Err(e) => {
                error!(job_id = %id, error = %e, "failed to load claimed job");
                return;
            }
        };

        debug!(job_id = %job.id, queue = %job.queue, "processing job");

        match self.execute(job.clone()).await {
            Ok(result) => {
                info!(job_id = %job.id, queue = %job.queue, "job complete");
                if let Err(e) = self.store.complete(&job.id, Some(result), Utc::now()).await {
                    error!(job_id = %job.id, error = %e, "failed to record completion");
                }
            }
            Err(msg) => {
                warn!(job_id = %job.id, queue = %job.queue, error = %msg, "job failed");
                if let Err(e) = self.route_failure(&job, &msg).await {
                    error!(job_id = %job.id, error = %e, "failed to route job failure");
                }
            }
        }
    }

    /// The handler runs on its own task so a panic is contained and
    /// reported as an ordinary failure.
    async fn execute(&self, job: Job) -> Result<Value, String> {
        let future = (self.handler)(job);
        match tokio::spawn(future).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) if e.is_panic() => Err("handler panicked".to_string()),
            Err(_) => Err("handler cancelled".to_string()),
        }
    }

    async fn route_failure(&self, job: &Job, error: &str) -> store::Result<()> {
        if job.retry_budget_left() {
            info!(
                job_id = %job.id,
                retries = job.retries + 1,
                max_retries = job.max_retries.unwrap_or(0),
                "retrying job"
            );
            self.store.retry(&job.id, error).await
        } else {
            warn!(job_id = %job.id, "job failed permanently");
            self.store.dead_letter(&job.id, error, Utc::now()).await
        }
    }
}
