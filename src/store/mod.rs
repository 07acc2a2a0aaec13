pub mod memory;
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::job::{Job, JobId, RecurringJob};
use crate::registry::RegistryKind;

pub use memory::MemoryStore;
pub use redis::RedisStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] deadpool_redis::redis::RedisError),

    #[error("connection pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    #[error("failed to build connection pool: {0}")]
    CreatePool(#[from] deadpool_redis::CreatePoolError),

    #[error("job not found: {0}")]
    MissingJob(String),

    #[error("corrupt job record {0}: {1}")]
    Corrupt(String, String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// The transactional store boundary.
///
/// Every method is one atomic unit: either all of its side effects commit
/// or none do. Workers and the recovery daemon coordinate exclusively
/// through these operations; no in-process state is shared.
#[async_trait]
pub trait Store: Send + Sync {
    /// Persist a job's full record.
    async fn save_job(&self, job: &Job) -> Result<()>;

    /// Fetch a job record. Returns `None` for unknown or expired ids.
    async fn get_job(&self, id: &JobId) -> Result<Option<Job>>;

    /// Hard-remove a job record.
    async fn delete_job(&self, id: &JobId) -> Result<()>;

    /// Atomically: record the queue name as known, prepend the job id to
    /// the queue list, persist the record with status `queued`.
    async fn push(&self, job: &Job) -> Result<()>;

    /// Atomically claim the oldest job from the first non-empty queue:
    /// pop from the queue tail and add the id to the in-flight registry
    /// scored by `now`, in one indivisible step, then mark the record
    /// `in_flight`. Returns `None` without side effects if every candidate
    /// queue is empty.
    async fn dequeue(&self, queues: &[String], now: DateTime<Utc>) -> Result<Option<JobId>>;

    /// Atomically: status `complete`, store result and completion time,
    /// move the id from the in-flight registry to the completed registry,
    /// and start the retention expiry on the record.
    async fn complete(&self, id: &JobId, result: Option<Value>, now: DateTime<Utc>) -> Result<()>;

    /// Atomically: increment the retry counter, record the error, and move
    /// the id from the in-flight registry back onto its queue.
    async fn retry(&self, id: &JobId, error: &str) -> Result<()>;

    /// Atomically: status `dead_letter`, record the error, move the id from
    /// the in-flight registry to the dead-letter registry scored by `now`,
    /// and start the (longer) dead-letter expiry on the record.
    async fn dead_letter(&self, id: &JobId, error: &str, now: DateTime<Utc>) -> Result<()>;

    /// Crash recovery: move a stale claim from the in-flight registry back
    /// onto its queue with status `queued`. Does not touch the retry
    /// counter.
    async fn requeue(&self, id: &JobId) -> Result<()>;

    /// Persist the job with status `scheduled` and add it to the scheduled
    /// registry scored by its due time.
    async fn schedule(&self, job: &Job, at: DateTime<Utc>) -> Result<()>;

    /// Move a due job from the scheduled registry onto its target queue.
    async fn activate(&self, id: &JobId) -> Result<()>;

    /// Members of a registry with score at or below `cutoff`, ascending by
    /// score, at most `limit` of them.
    async fn due_members(
        &self,
        registry: RegistryKind,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobId>>;

    /// Remove a member from a registry and delete its job record.
    async fn purge(&self, registry: RegistryKind, id: &JobId) -> Result<()>;

    /// Every queue name ever pushed to.
    async fn known_queues(&self) -> Result<Vec<String>>;

    /// Insert or replace a recurring job definition.
    async fn upsert_recurring(&self, job: &RecurringJob) -> Result<()>;

    /// Remove a recurring job definition.
    async fn delete_recurring(&self, id: &str) -> Result<()>;

    /// Recurring jobs whose next run is at or before `now`.
    async fn due_recurring(&self, now: DateTime<Utc>) -> Result<Vec<RecurringJob>>;

    /// Advance a recurring job's next-run time, but only if it still reads
    /// `seen` — the optimistic guard that keeps concurrent daemons from
    /// double-firing one schedule. Returns whether the advance won.
    async fn advance_recurring(
        &self,
        id: &str,
        seen: DateTime<Utc>,
        next: DateTime<Utc>,
    ) -> Result<bool>;
}

/// Registry scores are epoch milliseconds.
pub(crate) fn score(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}
