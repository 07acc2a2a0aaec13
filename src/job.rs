use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Unique identifier for a job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Current location of a job in its lifecycle.
///
/// The status field must always agree with the job's physical location:
/// a queue list, the in-flight registry, or one of the terminal registries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Scheduled,
    Queued,
    InFlight,
    Complete,
    DeadLetter,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Scheduled => "scheduled",
            JobStatus::Queued => "queued",
            JobStatus::InFlight => "in_flight",
            JobStatus::Complete => "complete",
            JobStatus::DeadLetter => "dead_letter",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(JobStatus::Scheduled),
            "queued" => Some(JobStatus::Queued),
            "in_flight" => Some(JobStatus::InFlight),
            "complete" => Some(JobStatus::Complete),
            "dead_letter" => Some(JobStatus::DeadLetter),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validation failure for a job submitted to an entry point.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("job has no target queue")]
    MissingQueue,
}

/// A background job.
///
/// The payload is opaque business data; the queue engine never interprets
/// it. The result is set on completion and is equally opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    pub payload: Value,
    pub status: JobStatus,
    pub result: Option<Value>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub run_at: Option<DateTime<Utc>>,
    pub retries: u32,
    pub max_retries: Option<u32>,
}

impl Job {
    pub fn new<S: Into<String>>(queue: S, payload: Value) -> Self {
        Self {
            id: JobId::new(),
            queue: queue.into(),
            payload,
            status: JobStatus::Queued,
            result: None,
            last_error: None,
            created_at: Utc::now(),
            completed_at: None,
            run_at: None,
            retries: 0,
            max_retries: None,
        }
    }

    pub fn with_queue<S: Into<String>>(mut self, queue: S) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Fill defaults: generate an identifier if absent and apply the
    /// configured retry budget when the job did not set its own.
    pub fn normalize(&mut self, default_max_retries: u32) {
        if self.id.0.is_empty() {
            self.id = JobId::new();
        }
        if self.max_retries.is_none() {
            self.max_retries = Some(default_max_retries);
        }
    }

    /// Fail fast on a malformed job before any store mutation.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.queue.is_empty() {
            return Err(ValidationError::MissingQueue);
        }
        Ok(())
    }

    /// Remaining retry budget check for the worker's failure routing.
    pub fn retry_budget_left(&self) -> bool {
        self.retries < self.max_retries.unwrap_or(0)
    }
}

/// A recurring job definition: a cron schedule plus the template the
/// recovery daemon instantiates into a fresh one-shot job on each firing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringJob {
    pub id: String,
    pub cron: String,
    pub queue: String,
    pub payload: Value,
    pub max_retries: Option<u32>,
    pub next_run: DateTime<Utc>,
}

impl RecurringJob {
    pub fn new<S1, S2, S3>(id: S1, cron: S2, queue: S3, payload: Value) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
    {
        Self {
            id: id.into(),
            cron: cron.into(),
            queue: queue.into(),
            payload,
            max_retries: None,
            next_run: Utc::now(),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Instantiate the template into a concrete job.
    pub fn to_job(&self) -> Job {
        let mut job = Job::new(self.queue.clone(), self.payload.clone());
        job.max_retries = self.max_retries;
        job
    }
}
