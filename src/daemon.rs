use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::Context;
use crate::error::Error;
use crate::registry::Registry;
use crate::store::{self, Store};

/// Members examined per registry per tick; leftovers are picked up next
/// tick in ascending-score order, so nothing starves.
const SWEEP_BATCH: usize = 200;

/// Background reconciler: reconciles every registry against wall-clock
/// time (requeue stale claims, activate due scheduled jobs, drop lapsed
/// terminal records) and fires due recurring jobs.
pub struct RecoveryDaemon {
    store: Arc<dyn Store>,
    registries: Vec<Registry>,
    poll_interval: Duration,
    default_max_retries: u32,
}

impl RecoveryDaemon {
    pub fn new(context: &Context) -> Self {
        Self {
            store: context.store(),
            registries: context.registries().to_vec(),
            poll_interval: context.config().sweep_interval,
            default_max_retries: context.config().default_max_retries,
        }
    }

    /// Run until the shutdown token fires. The sleep between ticks is the
    /// only cancellation point; a tick in progress always finishes.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("recovery daemon started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            self.tick(Utc::now()).await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!("recovery daemon shutting down");
    }

    pub(crate) async fn tick(&self, now: DateTime<Utc>) {
        for registry in &self.registries {
            if let Err(e) = self.sweep(registry, now).await {
                error!(registry = registry.kind.name(), error = %e, "registry sweep failed");
            }
        }

        if let Err(e) = self.promote_recurring(now).await {
            error!(error = %e, "recurring promotion failed");
        }
    }

    /// Apply one registry's cleanup policy to its due members. A failure
    /// on one member is logged and skipped; the rest of the batch and
    /// subsequent ticks proceed regardless.
    pub(crate) async fn sweep(&self, registry: &Registry, now: DateTime<Utc>) -> store::Result<usize> {
        let due = self
            .store
            .due_members(registry.kind, registry.cutoff(now), SWEEP_BATCH)
            .await?;

        let mut applied = 0;
        for id in due {
            match registry.apply(self.store.as_ref(), &id).await {
                Ok(()) => {
                    debug!(job_id = %id, registry = registry.kind.name(), "applied cleanup");
                    applied += 1;
                }
                Err(e) => {
                    warn!(
                        job_id = %id,
                        registry = registry.kind.name(),
                        error = %e,
                        "cleanup failed for member; skipping"
                    );
                }
            }
        }
        Ok(applied)
    }

    async fn promote_recurring(&self, now: DateTime<Utc>) -> store::Result<()> {
        for recurring in self.store.due_recurring(now).await? {
            let next = match next_occurrence(&recurring.cron, now) {
                Ok(next) => next,
                Err(e) => {
                    error!(
                        recurring_id = %recurring.id,
                        cron = %recurring.cron,
                        error = %e,
                        "invalid cron expression"
                    );
                    continue;
                }
            };

            // Advance first so a concurrent daemon cannot fire the same
            // occurrence; only the winner pushes the job.
            let advanced = match self
                .store
                .advance_recurring(&recurring.id, recurring.next_run, next)
                .await
            {
                Ok(advanced) => advanced,
                Err(e) => {
                    error!(recurring_id = %recurring.id, error = %e, "failed to advance recurring job");
                    false
                }
            };

            if !advanced {
                debug!(recurring_id = %recurring.id, "recurring job already claimed");
                continue;
            }

            let mut job = recurring.to_job();
            job.normalize(self.default_max_retries);
            match self.store.push(&job).await {
                Ok(()) => {
                    debug!(recurring_id = %recurring.id, job_id = %job.id, "fired recurring job");
                }
                Err(e) => {
                    error!(recurring_id = %recurring.id, error = %e, "failed to push recurring job");
                }
            }
        }
        Ok(())
    }
}

/// Next cron occurrence strictly after `after`.
pub(crate) fn next_occurrence(cron_expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, Error> {
    let schedule = Schedule::from_str(cron_expr).map_err(|e| Error::Cron(e.to_string()))?;
    schedule
        .after(&after)
        .next()
        .ok_or_else(|| Error::Cron("no upcoming occurrence".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Config;
    use crate::job::{Job, JobStatus, RecurringJob};
    use crate::registry::RegistryKind;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn setup() -> (Arc<MemoryStore>, RecoveryDaemon) {
        let store = Arc::new(MemoryStore::new(&Config::default()));
        let context = Context::with_store(Config::default(), store.clone() as Arc<dyn Store>);
        (store, RecoveryDaemon::new(&context))
    }

    fn job_on(queue: &str) -> Job {
        let mut job = Job::new(queue, json!(null));
        job.normalize(3);
        job
    }

    #[tokio::test]
    async fn stale_in_flight_claims_are_requeued() {
        let (store, daemon) = setup();
        let job = job_on("q");
        store.push(&job).await.unwrap();

        let claimed_at = Utc::now();
        store.dequeue(&["q".to_string()], claimed_at).await.unwrap();

        // Before the staleness threshold the claim is left alone.
        daemon.tick(claimed_at + chrono::Duration::minutes(5)).await;
        assert_eq!(
            store.registry_members(RegistryKind::InFlight),
            vec![job.id.0.clone()]
        );

        // Past it, the orphaned claim goes back onto its queue.
        daemon.tick(claimed_at + chrono::Duration::minutes(11)).await;
        assert!(store.registry_members(RegistryKind::InFlight).is_empty());
        assert_eq!(store.queue_contents("q"), vec![job.id.0.clone()]);
        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.retries, 0, "crash recovery consumes no retry budget");
    }

    #[tokio::test]
    async fn due_scheduled_jobs_are_activated() {
        let (store, daemon) = setup();
        let job = job_on("q");
        let due_at = Utc::now() + chrono::Duration::minutes(5);
        store.schedule(&job, due_at).await.unwrap();

        daemon.tick(due_at - chrono::Duration::seconds(1)).await;
        assert!(store.queue_contents("q").is_empty(), "not due yet");

        daemon.tick(due_at + chrono::Duration::seconds(1)).await;
        assert_eq!(store.queue_contents("q"), vec![job.id.0.clone()]);
        assert!(store.registry_members(RegistryKind::Scheduled).is_empty());
        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn lapsed_completed_records_are_deleted() {
        let (store, daemon) = setup();
        let job = job_on("q");
        store.push(&job).await.unwrap();
        let now = Utc::now();
        store.dequeue(&["q".to_string()], now).await.unwrap();
        store.complete(&job.id, None, now).await.unwrap();

        daemon.tick(now + chrono::Duration::hours(1)).await;
        assert_eq!(
            store.registry_members(RegistryKind::Completed),
            vec![job.id.0.clone()],
            "retention has not lapsed"
        );

        daemon.tick(now + chrono::Duration::hours(25)).await;
        assert!(store.registry_members(RegistryKind::Completed).is_empty());
        assert!(store.get_job(&job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn one_bad_member_does_not_halt_a_sweep() {
        let (store, daemon) = setup();
        let now = Utc::now();

        // Two due scheduled jobs; the older one's record is gone, so its
        // activation fails.
        let broken = job_on("q");
        store
            .schedule(&broken, now - chrono::Duration::minutes(2))
            .await
            .unwrap();
        store.delete_job(&broken.id).await.unwrap();

        let healthy = job_on("q");
        store
            .schedule(&healthy, now - chrono::Duration::minutes(1))
            .await
            .unwrap();

        daemon.tick(now).await;
        assert_eq!(
            store.queue_contents("q"),
            vec![healthy.id.0.clone()],
            "healthy member still activated"
        );
    }

    #[tokio::test]
    async fn due_recurring_jobs_fire_once_and_advance() {
        let (store, daemon) = setup();
        let mut recurring = RecurringJob::new("tick", "* * * * * *", "q", json!({"n": 1}));
        let now = Utc::now();
        recurring.next_run = now - chrono::Duration::seconds(1);
        store.upsert_recurring(&recurring).await.unwrap();

        daemon.tick(now).await;
        assert_eq!(store.queue_contents("q").len(), 1, "fired exactly once");

        // The schedule advanced past `now`, so a second tick at the same
        // instant finds nothing due.
        daemon.tick(now).await;
        assert_eq!(store.queue_contents("q").len(), 1);
    }

    #[test]
    fn next_occurrence_follows_the_cron_schedule() {
        let after = Utc::now();
        let next = next_occurrence("0 0 * * * *", after).unwrap();
        assert!(next > after);
        assert_eq!(next.timestamp() % 3600, 0, "top of the hour");

        assert!(next_occurrence("not a cron", after).is_err());
    }
}
