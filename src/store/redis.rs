use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::redis::{self, AsyncCommands, Script};
use deadpool_redis::{Connection, Pool};
use serde_json::Value;

use super::{score, Result, Store, StoreError};
use crate::context::Config;
use crate::job::{Job, JobId, JobStatus, RecurringJob};
use crate::registry::RegistryKind;

/// Cross-queue dequeue. Plain transactions cannot branch on the contents
/// of multiple keys, so the claim runs server-side: pop the tail of the
/// first non-empty queue and record the claim in the in-flight registry in
/// the same indivisible step. KEYS = queue lists in visitation order
/// followed by the in-flight registry key; ARGV[1] = claim timestamp.
const DEQUEUE_SCRIPT: &str = r#"
for i = 1, #KEYS - 1 do
    local id = redis.call('RPOP', KEYS[i])
    if id then
        redis.call('ZADD', KEYS[#KEYS], ARGV[1], id)
        return id
    end
end
return false
"#;

/// Advance a recurring job's next-run score only if it still holds the
/// value the caller read. KEYS[1] = recurring zset; ARGV = id, seen, next.
const ADVANCE_SCRIPT: &str = r#"
local current = redis.call('ZSCORE', KEYS[1], ARGV[1])
if current == ARGV[2] then
    redis.call('ZADD', KEYS[1], ARGV[3], ARGV[1])
    return 1
end
return 0
"#;

struct Keys {
    prefix: String,
}

impl Keys {
    fn job(&self, id: &str) -> String {
        format!("{}job:{}", self.prefix, id)
    }

    fn queue(&self, name: &str) -> String {
        format!("{}queue:{}", self.prefix, name)
    }

    fn queues(&self) -> String {
        format!("{}queues", self.prefix)
    }

    fn registry(&self, kind: RegistryKind) -> String {
        format!("{}registry:{}", self.prefix, kind.name())
    }

    fn recurring(&self) -> String {
        format!("{}recurring", self.prefix)
    }

    fn recurring_job(&self, id: &str) -> String {
        format!("{}recurring:{}", self.prefix, id)
    }
}

/// Redis-backed store. Multi-key writes go through MULTI/EXEC pipelines;
/// the two operations that must branch on key contents run as Lua scripts.
pub struct RedisStore {
    pool: Pool,
    keys: Keys,
    dequeue_script: Script,
    advance_script: Script,
    completed_ttl: Duration,
    dead_letter_ttl: Duration,
}

impl RedisStore {
    pub fn new(pool: Pool, config: &Config) -> Self {
        Self {
            pool,
            keys: Keys {
                prefix: config.prefix.clone(),
            },
            dequeue_script: Script::new(DEQUEUE_SCRIPT),
            advance_script: Script::new(ADVANCE_SCRIPT),
            completed_ttl: config.completed_ttl,
            dead_letter_ttl: config.dead_letter_ttl,
        }
    }

    async fn conn(&self) -> Result<Connection> {
        Ok(self.pool.get().await?)
    }

    async fn queue_of(&self, conn: &mut Connection, id: &JobId) -> Result<String> {
        let queue: Option<String> = conn.hget(self.keys.job(&id.0), "queue").await?;
        queue.ok_or_else(|| StoreError::MissingJob(id.0.clone()))
    }
}

fn json_field(id: &str, value: &Value) -> Result<String> {
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt(id.to_string(), e.to_string()))
}

fn job_fields(job: &Job) -> Result<Vec<(&'static str, String)>> {
    let mut fields = vec![
        ("queue", job.queue.clone()),
        ("payload", json_field(&job.id.0, &job.payload)?),
        ("status", job.status.as_str().to_string()),
        ("created_at", job.created_at.to_rfc3339()),
        ("retries", job.retries.to_string()),
    ];
    if let Some(max_retries) = job.max_retries {
        fields.push(("max_retries", max_retries.to_string()));
    }
    if let Some(result) = &job.result {
        fields.push(("result", json_field(&job.id.0, result)?));
    }
    if let Some(error) = &job.last_error {
        fields.push(("last_error", error.clone()));
    }
    if let Some(completed_at) = job.completed_at {
        fields.push(("completed_at", completed_at.to_rfc3339()));
    }
    if let Some(run_at) = job.run_at {
        fields.push(("run_at", run_at.to_rfc3339()));
    }
    Ok(fields)
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn job_from_hash(id: &str, map: HashMap<String, String>) -> Result<Job> {
    let queue = map
        .get("queue")
        .cloned()
        .ok_or_else(|| StoreError::Corrupt(id.to_string(), "missing queue field".to_string()))?;
    let status = map
        .get("status")
        .and_then(|s| JobStatus::parse(s))
        .ok_or_else(|| StoreError::Corrupt(id.to_string(), "bad status field".to_string()))?;
    let payload = map
        .get("payload")
        .map(|s| serde_json::from_str(s))
        .transpose()
        .map_err(|e| StoreError::Corrupt(id.to_string(), e.to_string()))?
        .unwrap_or(Value::Null);
    let result = map
        .get("result")
        .map(|s| serde_json::from_str(s))
        .transpose()
        .map_err(|e| StoreError::Corrupt(id.to_string(), e.to_string()))?;

    Ok(Job {
        id: JobId(id.to_string()),
        queue,
        payload,
        status,
        result,
        last_error: map.get("last_error").cloned(),
        created_at: map
            .get("created_at")
            .and_then(|s| parse_ts(s))
            .unwrap_or_else(Utc::now),
        completed_at: map.get("completed_at").and_then(|s| parse_ts(s)),
        run_at: map.get("run_at").and_then(|s| parse_ts(s)),
        retries: map.get("retries").and_then(|s| s.parse().ok()).unwrap_or(0),
        max_retries: map.get("max_retries").and_then(|s| s.parse().ok()),
    })
}

#[async_trait]
impl Store for RedisStore {
    async fn save_job(&self, job: &Job) -> Result<()> {
        let mut conn = self.conn().await?;
        let fields = job_fields(job)?;
        let _: () = conn.hset_multiple(self.keys.job(&job.id.0), &fields).await?;
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        let mut conn = self.conn().await?;
        let map: HashMap<String, String> = conn.hgetall(self.keys.job(&id.0)).await?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(job_from_hash(&id.0, map)?))
    }

    async fn delete_job(&self, id: &JobId) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.del(self.keys.job(&id.0)).await?;
        Ok(())
    }

    async fn push(&self, job: &Job) -> Result<()> {
        let mut conn = self.conn().await?;
        let mut record = job.clone();
        record.status = JobStatus::Queued;
        let fields = job_fields(&record)?;
        let _: () = redis::pipe()
            .atomic()
            .sadd(self.keys.queues(), &record.queue)
            .ignore()
            .lpush(self.keys.queue(&record.queue), &record.id.0)
            .ignore()
            .hset_multiple(self.keys.job(&record.id.0), &fields)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn dequeue(&self, queues: &[String], now: DateTime<Utc>) -> Result<Option<JobId>> {
        if queues.is_empty() {
            return Ok(None);
        }
        let mut conn = self.conn().await?;
        let mut invocation = self.dequeue_script.prepare_invoke();
        for queue in queues {
            invocation.key(self.keys.queue(queue));
        }
        invocation.key(self.keys.registry(RegistryKind::InFlight));
        invocation.arg(score(now).to_string());

        let popped: Option<String> = invocation.invoke_async(&mut conn).await?;
        match popped {
            Some(id) => {
                // The claim itself is already durable in the in-flight
                // registry; the status flip follows it.
                let _: () = conn
                    .hset(self.keys.job(&id), "status", JobStatus::InFlight.as_str())
                    .await?;
                Ok(Some(JobId(id)))
            }
            None => Ok(None),
        }
    }

    async fn complete(&self, id: &JobId, result: Option<Value>, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn().await?;
        let key = self.keys.job(&id.0);
        let ttl = self.completed_ttl.as_secs().max(1) as i64;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(&key, "status", JobStatus::Complete.as_str())
            .ignore()
            .hset(&key, "completed_at", now.to_rfc3339())
            .ignore()
            .zrem(self.keys.registry(RegistryKind::InFlight), &id.0)
            .ignore()
            .zadd(self.keys.registry(RegistryKind::Completed), &id.0, score(now))
            .ignore()
            .expire(&key, ttl)
            .ignore();
        if let Some(result) = &result {
            pipe.hset(&key, "result", json_field(&id.0, result)?).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn retry(&self, id: &JobId, error: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let queue = self.queue_of(&mut conn, id).await?;
        let key = self.keys.job(&id.0);
        let _: () = redis::pipe()
            .atomic()
            .zrem(self.keys.registry(RegistryKind::InFlight), &id.0)
            .ignore()
            .hincr(&key, "retries", 1)
            .ignore()
            .hset(&key, "last_error", error)
            .ignore()
            .hset(&key, "status", JobStatus::Queued.as_str())
            .ignore()
            .sadd(self.keys.queues(), &queue)
            .ignore()
            .lpush(self.keys.queue(&queue), &id.0)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn dead_letter(&self, id: &JobId, error: &str, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn().await?;
        let key = self.keys.job(&id.0);
        let ttl = self.dead_letter_ttl.as_secs().max(1) as i64;
        let _: () = redis::pipe()
            .atomic()
            .hset(&key, "status", JobStatus::DeadLetter.as_str())
            .ignore()
            .hset(&key, "last_error", error)
            .ignore()
            .zrem(self.keys.registry(RegistryKind::InFlight), &id.0)
            .ignore()
            .zadd(self.keys.registry(RegistryKind::DeadLetter), &id.0, score(now))
            .ignore()
            .expire(&key, ttl)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn requeue(&self, id: &JobId) -> Result<()> {
        let mut conn = self.conn().await?;
        let queue = self.queue_of(&mut conn, id).await?;
        let key = self.keys.job(&id.0);
        let _: () = redis::pipe()
            .atomic()
            .zrem(self.keys.registry(RegistryKind::InFlight), &id.0)
            .ignore()
            .hset(&key, "status", JobStatus::Queued.as_str())
            .ignore()
            .sadd(self.keys.queues(), &queue)
            .ignore()
            .lpush(self.keys.queue(&queue), &id.0)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn schedule(&self, job: &Job, at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn().await?;
        let mut record = job.clone();
        record.status = JobStatus::Scheduled;
        record.run_at = Some(at);
        let fields = job_fields(&record)?;
        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(self.keys.job(&record.id.0), &fields)
            .ignore()
            .zadd(self.keys.registry(RegistryKind::Scheduled), &record.id.0, score(at))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn activate(&self, id: &JobId) -> Result<()> {
        let mut conn = self.conn().await?;
        let queue = self.queue_of(&mut conn, id).await?;
        let key = self.keys.job(&id.0);
        let _: () = redis::pipe()
            .atomic()
            .zrem(self.keys.registry(RegistryKind::Scheduled), &id.0)
            .ignore()
            .hset(&key, "status", JobStatus::Queued.as_str())
            .ignore()
            .hdel(&key, "run_at")
            .ignore()
            .sadd(self.keys.queues(), &queue)
            .ignore()
            .lpush(self.keys.queue(&queue), &id.0)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn due_members(
        &self,
        registry: RegistryKind,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobId>> {
        let mut conn = self.conn().await?;
        let members: Vec<String> = conn
            .zrangebyscore_limit(
                self.keys.registry(registry),
                "-inf",
                score(cutoff),
                0,
                limit as isize,
            )
            .await?;
        Ok(members.into_iter().map(JobId).collect())
    }

    async fn purge(&self, registry: RegistryKind, id: &JobId) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = redis::pipe()
            .atomic()
            .zrem(self.keys.registry(registry), &id.0)
            .ignore()
            .del(self.keys.job(&id.0))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn known_queues(&self) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let mut names: Vec<String> = conn.smembers(self.keys.queues()).await?;
        names.sort();
        Ok(names)
    }

    async fn upsert_recurring(&self, job: &RecurringJob) -> Result<()> {
        let mut conn = self.conn().await?;
        let mut fields = vec![
            ("cron", job.cron.clone()),
            ("queue", job.queue.clone()),
            ("payload", json_field(&job.id, &job.payload)?),
        ];
        if let Some(max_retries) = job.max_retries {
            fields.push(("max_retries", max_retries.to_string()));
        }
        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(self.keys.recurring_job(&job.id), &fields)
            .ignore()
            .zadd(self.keys.recurring(), &job.id, score(job.next_run))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete_recurring(&self, id: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = redis::pipe()
            .atomic()
            .zrem(self.keys.recurring(), id)
            .ignore()
            .del(self.keys.recurring_job(id))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn due_recurring(&self, now: DateTime<Utc>) -> Result<Vec<RecurringJob>> {
        let mut conn = self.conn().await?;
        let due: Vec<(String, i64)> = conn
            .zrangebyscore_withscores(self.keys.recurring(), "-inf", score(now))
            .await?;

        let mut jobs = Vec::with_capacity(due.len());
        for (id, next_run) in due {
            let map: HashMap<String, String> =
                conn.hgetall(self.keys.recurring_job(&id)).await?;
            if map.is_empty() {
                continue;
            }
            let payload = map
                .get("payload")
                .map(|s| serde_json::from_str(s))
                .transpose()
                .map_err(|e| StoreError::Corrupt(id.clone(), e.to_string()))?
                .unwrap_or(Value::Null);
            jobs.push(RecurringJob {
                id: id.clone(),
                cron: map.get("cron").cloned().unwrap_or_default(),
                queue: map.get("queue").cloned().unwrap_or_default(),
                payload,
                max_retries: map.get("max_retries").and_then(|s| s.parse().ok()),
                next_run: DateTime::from_timestamp_millis(next_run).unwrap_or_else(Utc::now),
            });
        }
        Ok(jobs)
    }

    async fn advance_recurring(
        &self,
        id: &str,
        seen: DateTime<Utc>,
        next: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.conn().await?;
        let advanced: i64 = self
            .advance_script
            .key(self.keys.recurring())
            .arg(id)
            .arg(score(seen).to_string())
            .arg(score(next).to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(advanced == 1)
    }
}
