use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use super::{score, Result, Store, StoreError};
use crate::context::Config;
use crate::job::{Job, JobId, JobStatus, RecurringJob};
use crate::registry::RegistryKind;

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, Job>,
    // job id -> epoch millis after which the record reads as gone
    expiries: HashMap<String, i64>,
    queues: HashMap<String, VecDeque<String>>,
    known_queues: BTreeSet<String>,
    registries: HashMap<RegistryKind, HashMap<String, i64>>,
    recurring: HashMap<String, RecurringJob>,
}

impl Inner {
    fn registry(&mut self, kind: RegistryKind) -> &mut HashMap<String, i64> {
        self.registries.entry(kind).or_default()
    }

    fn push_queued(&mut self, id: &str, queue: &str) {
        self.known_queues.insert(queue.to_string());
        self.queues
            .entry(queue.to_string())
            .or_default()
            .push_front(id.to_string());
    }

    fn job_mut(&mut self, id: &JobId) -> Result<&mut Job> {
        self.jobs
            .get_mut(&id.0)
            .ok_or_else(|| StoreError::MissingJob(id.0.clone()))
    }
}

/// In-memory store for development and tests.
///
/// The entire state sits behind one mutex, so each trait method is atomic
/// by construction — the same guarantee the Redis backend gets from its
/// transactions and scripts. Record TTLs are emulated lazily at read time.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    completed_ttl: Duration,
    dead_letter_ttl: Duration,
}

impl MemoryStore {
    pub fn new(config: &Config) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            completed_ttl: config.completed_ttl,
            dead_letter_ttl: config.dead_letter_ttl,
        }
    }

    /// Registry membership, for assertions in tests.
    pub fn registry_members(&self, kind: RegistryKind) -> Vec<String> {
        let mut inner = self.inner.lock();
        let mut members: Vec<_> = inner.registry(kind).keys().cloned().collect();
        members.sort();
        members
    }

    /// Pending ids on a queue, head first.
    pub fn queue_contents(&self, queue: &str) -> Vec<String> {
        let inner = self.inner.lock();
        inner
            .queues
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_job(&self, job: &Job) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.jobs.insert(job.id.0.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        let mut inner = self.inner.lock();
        let deadline = inner.expiries.get(&id.0).copied();
        if let Some(deadline) = deadline {
            if score(Utc::now()) >= deadline {
                inner.jobs.remove(&id.0);
                inner.expiries.remove(&id.0);
                return Ok(None);
            }
        }
        Ok(inner.jobs.get(&id.0).cloned())
    }

    async fn delete_job(&self, id: &JobId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.jobs.remove(&id.0);
        inner.expiries.remove(&id.0);
        Ok(())
    }

    async fn push(&self, job: &Job) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut record = job.clone();
        record.status = JobStatus::Queued;
        inner.push_queued(&record.id.0, &record.queue);
        inner.jobs.insert(record.id.0.clone(), record);
        Ok(())
    }

    async fn dequeue(&self, queues: &[String], now: DateTime<Utc>) -> Result<Option<JobId>> {
        let mut inner = self.inner.lock();
        for name in queues {
            let popped = inner.queues.get_mut(name).and_then(|q| q.pop_back());
            if let Some(id) = popped {
                inner.registry(RegistryKind::InFlight).insert(id.clone(), score(now));
                if let Some(job) = inner.jobs.get_mut(&id) {
                    job.status = JobStatus::InFlight;
                }
                return Ok(Some(JobId(id)));
            }
        }
        Ok(None)
    }

    async fn complete(&self, id: &JobId, result: Option<Value>, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock();
        let job = inner.job_mut(id)?;
        job.status = JobStatus::Complete;
        job.result = result;
        job.completed_at = Some(now);
        inner.registry(RegistryKind::InFlight).remove(&id.0);
        inner.registry(RegistryKind::Completed).insert(id.0.clone(), score(now));
        let deadline = score(now + chrono::Duration::from_std(self.completed_ttl).unwrap_or_default());
        inner.expiries.insert(id.0.clone(), deadline);
        Ok(())
    }

    async fn retry(&self, id: &JobId, error: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let job = inner.job_mut(id)?;
        job.retries += 1;
        job.last_error = Some(error.to_string());
        job.status = JobStatus::Queued;
        let queue = job.queue.clone();
        inner.registry(RegistryKind::InFlight).remove(&id.0);
        inner.push_queued(&id.0, &queue);
        Ok(())
    }

    async fn dead_letter(&self, id: &JobId, error: &str, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock();
        let job = inner.job_mut(id)?;
        job.status = JobStatus::DeadLetter;
        job.last_error = Some(error.to_string());
        inner.registry(RegistryKind::InFlight).remove(&id.0);
        inner.registry(RegistryKind::DeadLetter).insert(id.0.clone(), score(now));
        let deadline =
            score(now + chrono::Duration::from_std(self.dead_letter_ttl).unwrap_or_default());
        inner.expiries.insert(id.0.clone(), deadline);
        Ok(())
    }

    async fn requeue(&self, id: &JobId) -> Result<()> {
        let mut inner = self.inner.lock();
        let job = inner.job_mut(id)?;
        job.status = JobStatus::Queued;
        let queue = job.queue.clone();
        inner.registry(RegistryKind::InFlight).remove(&id.0);
        inner.push_queued(&id.0, &queue);
        Ok(())
    }

    async fn schedule(&self, job: &Job, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut record = job.clone();
        record.status = JobStatus::Scheduled;
        record.run_at = Some(at);
        inner.registry(RegistryKind::Scheduled).insert(record.id.0.clone(), score(at));
        inner.jobs.insert(record.id.0.clone(), record);
        Ok(())
    }

    async fn activate(&self, id: &JobId) -> Result<()> {
        let mut inner = self.inner.lock();
        let job = inner.job_mut(id)?;
        job.status = JobStatus::Queued;
        job.run_at = None;
        let queue = job.queue.clone();
        inner.registry(RegistryKind::Scheduled).remove(&id.0);
        inner.push_queued(&id.0, &queue);
        Ok(())
    }

    async fn due_members(
        &self,
        registry: RegistryKind,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobId>> {
        let mut inner = self.inner.lock();
        let cutoff = score(cutoff);
        let mut due: Vec<(i64, String)> = inner
            .registry(registry)
            .iter()
            .filter(|(_, &s)| s <= cutoff)
            .map(|(id, &s)| (s, id.clone()))
            .collect();
        due.sort();
        due.truncate(limit);
        Ok(due.into_iter().map(|(_, id)| JobId(id)).collect())
    }

    async fn purge(&self, registry: RegistryKind, id: &JobId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.registry(registry).remove(&id.0);
        inner.jobs.remove(&id.0);
        inner.expiries.remove(&id.0);
        Ok(())
    }

    async fn known_queues(&self) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        Ok(inner.known_queues.iter().cloned().collect())
    }

    async fn upsert_recurring(&self, job: &RecurringJob) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.recurring.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn delete_recurring(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.recurring.remove(id);
        Ok(())
    }

    async fn due_recurring(&self, now: DateTime<Utc>) -> Result<Vec<RecurringJob>> {
        let inner = self.inner.lock();
        let mut due: Vec<RecurringJob> = inner
            .recurring
            .values()
            .filter(|r| r.next_run <= now)
            .cloned()
            .collect();
        due.sort_by_key(|r| r.next_run);
        Ok(due)
    }

    async fn advance_recurring(
        &self,
        id: &str,
        seen: DateTime<Utc>,
        next: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.recurring.get_mut(id) {
            Some(recurring) if recurring.next_run == seen => {
                recurring.next_run = next;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn store() -> MemoryStore {
        MemoryStore::new(&Config::default())
    }

    fn job_on(queue: &str) -> Job {
        let mut job = Job::new(queue, json!({"k": "v"}));
        job.normalize(3);
        job
    }

    #[tokio::test]
    async fn push_sets_status_and_registers_queue() {
        let store = store();
        let job = job_on("emails");
        store.push(&job).await.unwrap();

        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(store.known_queues().await.unwrap(), vec!["emails"]);
        assert_eq!(store.queue_contents("emails"), vec![job.id.0]);
    }

    #[tokio::test]
    async fn dequeue_is_fifo_within_a_queue() {
        let store = store();
        let first = job_on("q");
        let second = job_on("q");
        store.push(&first).await.unwrap();
        store.push(&second).await.unwrap();

        let queues = vec!["q".to_string()];
        let now = Utc::now();
        assert_eq!(store.dequeue(&queues, now).await.unwrap(), Some(first.id));
        assert_eq!(store.dequeue(&queues, now).await.unwrap(), Some(second.id));
        assert_eq!(store.dequeue(&queues, now).await.unwrap(), None);
    }

    #[tokio::test]
    async fn dequeue_falls_through_to_first_nonempty_queue() {
        let store = store();
        let job = job_on("b");
        store.push(&job).await.unwrap();

        let order = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let claimed = store.dequeue(&order, Utc::now()).await.unwrap().unwrap();
        assert_eq!(claimed, job.id);
    }

    #[tokio::test]
    async fn claim_moves_job_into_in_flight_atomically() {
        let store = store();
        let job = job_on("q");
        store.push(&job).await.unwrap();

        let claimed = store
            .dequeue(&["q".to_string()], Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed, job.id);
        assert!(store.queue_contents("q").is_empty());
        assert_eq!(
            store.registry_members(RegistryKind::InFlight),
            vec![job.id.0.clone()]
        );
        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::InFlight);
    }

    #[tokio::test]
    async fn concurrent_claims_never_lose_or_duplicate() {
        let store = Arc::new(store());
        let mut ids = Vec::new();
        for _ in 0..50 {
            let job = job_on("q");
            ids.push(job.id.0.clone());
            store.push(&job).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let queues = vec!["q".to_string()];
                let mut claimed = Vec::new();
                while let Some(id) = store.dequeue(&queues, Utc::now()).await.unwrap() {
                    claimed.push(id.0);
                }
                claimed
            }));
        }

        let mut all: Vec<String> = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(all, expected, "every job claimed exactly once");
    }

    #[tokio::test]
    async fn complete_moves_to_completed_registry() {
        let store = store();
        let job = job_on("q");
        store.push(&job).await.unwrap();
        store.dequeue(&["q".to_string()], Utc::now()).await.unwrap();

        let now = Utc::now();
        store
            .complete(&job.id, Some(json!({"ok": true})), now)
            .await
            .unwrap();

        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Complete);
        assert_eq!(stored.result, Some(json!({"ok": true})));
        assert_eq!(stored.completed_at, Some(now));
        assert!(store.registry_members(RegistryKind::InFlight).is_empty());
        assert_eq!(
            store.registry_members(RegistryKind::Completed),
            vec![job.id.0]
        );
    }

    #[tokio::test]
    async fn retry_increments_counter_and_requeues() {
        let store = store();
        let job = job_on("q");
        store.push(&job).await.unwrap();
        store.dequeue(&["q".to_string()], Utc::now()).await.unwrap();

        store.retry(&job.id, "transient").await.unwrap();

        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.retries, 1);
        assert_eq!(stored.last_error.as_deref(), Some("transient"));
        assert!(store.registry_members(RegistryKind::InFlight).is_empty());
        assert_eq!(store.queue_contents("q"), vec![job.id.0]);
    }

    #[tokio::test]
    async fn dead_letter_records_error() {
        let store = store();
        let job = job_on("q");
        store.push(&job).await.unwrap();
        store.dequeue(&["q".to_string()], Utc::now()).await.unwrap();

        store
            .dead_letter(&job.id, "handler exploded", Utc::now())
            .await
            .unwrap();

        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::DeadLetter);
        assert_eq!(stored.last_error.as_deref(), Some("handler exploded"));
        assert!(store.registry_members(RegistryKind::InFlight).is_empty());
        assert_eq!(
            store.registry_members(RegistryKind::DeadLetter),
            vec![job.id.0]
        );
    }

    #[tokio::test]
    async fn requeue_does_not_touch_retry_counter() {
        let store = store();
        let job = job_on("q");
        store.push(&job).await.unwrap();
        store.dequeue(&["q".to_string()], Utc::now()).await.unwrap();

        store.requeue(&job.id).await.unwrap();

        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.retries, 0);
        assert_eq!(store.queue_contents("q"), vec![job.id.0]);
    }

    #[tokio::test]
    async fn schedule_and_activate() {
        let store = store();
        let job = job_on("q");
        let at = Utc::now() + chrono::Duration::minutes(5);
        store.schedule(&job, at).await.unwrap();

        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Scheduled);
        assert_eq!(stored.run_at, Some(at));
        assert!(store.queue_contents("q").is_empty());

        // Not due before the timestamp, due at it.
        let early = store
            .due_members(RegistryKind::Scheduled, at - chrono::Duration::seconds(1), 10)
            .await
            .unwrap();
        assert!(early.is_empty());
        let due = store
            .due_members(RegistryKind::Scheduled, at, 10)
            .await
            .unwrap();
        assert_eq!(due, vec![job.id.clone()]);

        store.activate(&job.id).await.unwrap();
        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert!(store.registry_members(RegistryKind::Scheduled).is_empty());
        assert_eq!(store.queue_contents("q"), vec![job.id.0]);
    }

    #[tokio::test]
    async fn due_members_orders_by_score_and_honors_limit() {
        let store = store();
        let now = Utc::now();
        for minutes in [3i64, 1, 2] {
            let job = job_on("q");
            store
                .schedule(&job, now - chrono::Duration::minutes(minutes))
                .await
                .unwrap();
        }

        let due = store
            .due_members(RegistryKind::Scheduled, now, 2)
            .await
            .unwrap();
        assert_eq!(due.len(), 2);
        let oldest = store.get_job(&due[0]).await.unwrap().unwrap();
        let next = store.get_job(&due[1]).await.unwrap().unwrap();
        assert!(oldest.run_at < next.run_at, "oldest score first");
    }

    #[tokio::test]
    async fn purge_removes_membership_and_record() {
        let store = store();
        let job = job_on("q");
        store.push(&job).await.unwrap();
        store.dequeue(&["q".to_string()], Utc::now()).await.unwrap();
        store.complete(&job.id, None, Utc::now()).await.unwrap();

        store.purge(RegistryKind::Completed, &job.id).await.unwrap();

        assert!(store.registry_members(RegistryKind::Completed).is_empty());
        assert!(store.get_job(&job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_records_read_as_gone() {
        let mut config = Config::default();
        config.completed_ttl = Duration::ZERO;
        let store = MemoryStore::new(&config);
        let job = job_on("q");
        store.push(&job).await.unwrap();
        store.dequeue(&["q".to_string()], Utc::now()).await.unwrap();
        store.complete(&job.id, None, Utc::now()).await.unwrap();

        assert!(store.get_job(&job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recurring_advance_is_optimistic() {
        let store = store();
        let mut recurring = RecurringJob::new("tick", "* * * * * *", "q", json!(null));
        let seen = Utc::now();
        recurring.next_run = seen;
        store.upsert_recurring(&recurring).await.unwrap();

        let due = store.due_recurring(Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1);

        let next = seen + chrono::Duration::seconds(60);
        assert!(store.advance_recurring("tick", seen, next).await.unwrap());
        // Second daemon observing the stale next_run loses the race.
        assert!(!store.advance_recurring("tick", seen, next).await.unwrap());

        store.delete_recurring("tick").await.unwrap();
        assert!(store.due_recurring(Utc::now() + chrono::Duration::days(1)).await.unwrap().is_empty());
    }
}
