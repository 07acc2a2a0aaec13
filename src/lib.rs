//! Redis-backed background job queue.
//!
//! Producers enqueue jobs onto named priority/weight queues; a pool of
//! workers claims them through an atomic server-side script; a recovery
//! daemon reconciles the in-flight, scheduled, completed and dead-letter
//! registries against the clock for crash recovery, delayed execution and
//! retention cleanup.

mod context;
mod daemon;
mod error;
mod handler;
mod job;
mod queue;
mod registry;
mod server;
mod store;
mod worker;

pub use context::{
    create_context, current_context, enqueue, run_at, run_in, Config, Context, TimeUnit,
};
pub use daemon::RecoveryDaemon;
pub use error::Error;
pub use handler::{handler_fn, Handler, HandlerError, HandlerResult};
pub use job::{Job, JobId, JobStatus, RecurringJob, ValidationError};
pub use queue::{queue_order, QueueDef};
pub use registry::{CleanupAction, Registry, RegistryKind};
pub use server::{start_server, stop_server, Server};
pub use store::{MemoryStore, RedisStore, Store, StoreError};
pub use worker::Worker;
