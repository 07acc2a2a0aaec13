use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use parking_lot::RwLock;
use tracing::info;

use crate::daemon;
use crate::error::Error;
use crate::handler::Handler;
use crate::job::{Job, JobId, RecurringJob};
use crate::queue::QueueDef;
use crate::registry::{default_registries, Registry};
use crate::store::{RedisStore, Store};

/// Process configuration. All fields have workable defaults except the
/// handler, which only a consuming process needs.
#[derive(Clone)]
pub struct Config {
    /// Queue metadata; workers visit these in priority/weight order.
    pub queues: Vec<QueueDef>,
    /// Store connection parameters, ignored when `pool` is supplied.
    pub redis_url: String,
    /// Pre-built connection pool, overriding `redis_url`.
    pub pool: Option<Pool>,
    /// Key namespace prefix, so multiple deployments can share a store.
    pub prefix: String,
    /// The job-execution callback.
    pub handler: Option<Handler>,
    /// Worker count.
    pub num_workers: usize,
    /// Idle backoff between empty dequeue attempts.
    pub poll_interval: Duration,
    /// Recovery daemon tick interval.
    pub sweep_interval: Duration,
    /// Age past which an in-flight claim is considered orphaned.
    pub inflight_timeout: Duration,
    /// Retention for completed job records.
    pub completed_ttl: Duration,
    /// Retention for dead-letter job records; kept longer for inspection.
    pub dead_letter_ttl: Duration,
    /// Retry budget applied to jobs that do not set their own.
    pub default_max_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queues: vec![QueueDef::new("default")],
            redis_url: "redis://127.0.0.1:6379".to_string(),
            pool: None,
            prefix: "harrow:".to_string(),
            handler: None,
            num_workers: 2,
            poll_interval: Duration::from_millis(500),
            sweep_interval: Duration::from_secs(1),
            inflight_timeout: Duration::from_secs(600),
            completed_ttl: Duration::from_secs(24 * 60 * 60),
            dead_letter_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            default_max_retries: 3,
        }
    }
}

impl Config {
    pub fn queues(mut self, queues: Vec<QueueDef>) -> Self {
        self.queues = queues;
        self
    }

    pub fn redis_url<S: Into<String>>(mut self, url: S) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn pool(mut self, pool: Pool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn handler(mut self, handler: Handler) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }
}

/// Units accepted by [`Context::run_in`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    fn to_duration(self, delta: u64) -> chrono::Duration {
        match self {
            TimeUnit::Milliseconds => chrono::Duration::milliseconds(delta as i64),
            TimeUnit::Seconds => chrono::Duration::seconds(delta as i64),
            TimeUnit::Minutes => chrono::Duration::minutes(delta as i64),
            TimeUnit::Hours => chrono::Duration::hours(delta as i64),
            TimeUnit::Days => chrono::Duration::days(delta as i64),
        }
    }
}

/// Process-wide handle bundling the store connection, queue configuration,
/// key namespace, handler reference and registry list. Created once,
/// immutable thereafter; every operation borrows it.
pub struct Context {
    config: Config,
    store: Arc<dyn Store>,
    registries: Vec<Registry>,
}

static CURRENT: RwLock<Option<Arc<Context>>> = RwLock::new(None);

impl Context {
    /// Build a context over any [`Store`] backend and install it as the
    /// process-wide current context.
    pub fn with_store(config: Config, store: Arc<dyn Store>) -> Arc<Self> {
        let registries = default_registries(&config);
        let context = Arc::new(Self {
            config,
            store,
            registries,
        });
        *CURRENT.write() = Some(Arc::clone(&context));
        context
    }

    /// Build a context over a Redis store, constructing a connection pool
    /// from `redis_url` unless one was supplied.
    pub fn create(config: Config) -> Result<Arc<Self>, Error> {
        let pool = match &config.pool {
            Some(pool) => pool.clone(),
            None => PoolConfig::from_url(&config.redis_url)
                .create_pool(Some(Runtime::Tokio1))
                .map_err(crate::store::StoreError::from)?,
        };
        let store = Arc::new(RedisStore::new(pool, &config));
        info!(prefix = %config.prefix, "created context");
        Ok(Self::with_store(config, store))
    }

    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    pub fn handler(&self) -> Option<Handler> {
        self.config.handler.clone()
    }

    pub fn queue_defs(&self) -> &[QueueDef] {
        &self.config.queues
    }

    pub fn registries(&self) -> &[Registry] {
        &self.registries
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Persist and enqueue a job for immediate execution.
    pub async fn enqueue(&self, mut job: Job) -> Result<JobId, Error> {
        job.normalize(self.config.default_max_retries);
        job.validate()?;
        self.store.push(&job).await?;
        info!(job_id = %job.id, queue = %job.queue, "enqueued job");
        Ok(job.id)
    }

    /// Persist a job to run at a specific time.
    pub async fn run_at(&self, mut job: Job, at: DateTime<Utc>) -> Result<JobId, Error> {
        job.normalize(self.config.default_max_retries);
        job.validate()?;
        self.store.schedule(&job, at).await?;
        info!(job_id = %job.id, queue = %job.queue, run_at = %at, "scheduled job");
        Ok(job.id)
    }

    /// Persist a job to run after a delay.
    pub async fn run_in(&self, job: Job, delta: u64, unit: TimeUnit) -> Result<JobId, Error> {
        self.run_at(job, Utc::now() + unit.to_duration(delta)).await
    }

    /// Register (or replace) a recurring job. The first firing is the next
    /// cron occurrence after now.
    pub async fn recurring(&self, mut job: RecurringJob) -> Result<(), Error> {
        if job.queue.is_empty() {
            return Err(crate::job::ValidationError::MissingQueue.into());
        }
        job.next_run = daemon::next_occurrence(&job.cron, Utc::now())?;
        self.store.upsert_recurring(&job).await?;
        info!(recurring_id = %job.id, cron = %job.cron, "registered recurring job");
        Ok(())
    }

    /// Remove a recurring job.
    pub async fn remove_recurring(&self, id: &str) -> Result<(), Error> {
        self.store.delete_recurring(id).await?;
        Ok(())
    }
}

/// Build a context from configuration and install it as current.
pub fn create_context(config: Config) -> Result<Arc<Context>, Error> {
    Context::create(config)
}

/// The process-wide current context, if one has been created.
pub fn current_context() -> Option<Arc<Context>> {
    CURRENT.read().clone()
}

/// Enqueue on the current context.
pub async fn enqueue(job: Job) -> Result<JobId, Error> {
    current_context().ok_or(Error::NoContext)?.enqueue(job).await
}

/// Schedule on the current context.
pub async fn run_at(job: Job, at: DateTime<Utc>) -> Result<JobId, Error> {
    current_context().ok_or(Error::NoContext)?.run_at(job, at).await
}

/// Delay-schedule on the current context.
pub async fn run_in(job: Job, delta: u64, unit: TimeUnit) -> Result<JobId, Error> {
    current_context()
        .ok_or(Error::NoContext)?
        .run_in(job, delta, unit)
        .await
}
