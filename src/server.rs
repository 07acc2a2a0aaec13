use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::context::{Config, Context};
use crate::daemon::RecoveryDaemon;
use crate::error::Error;
use crate::worker::Worker;

/// A running server: the worker pool plus the recovery daemon, sharing one
/// shutdown token.
pub struct Server {
    context: Arc<Context>,
    shutdown: CancellationToken,
    worker_handles: Vec<JoinHandle<()>>,
    daemon_handle: Option<JoinHandle<()>>,
}

impl Server {
    /// Spawn the configured number of workers and the recovery daemon on
    /// an existing context. Fails if the context has no handler.
    pub fn start(context: Arc<Context>) -> Result<Self, Error> {
        let handler = context
            .handler()
            .ok_or_else(|| Error::Config("starting a server requires a handler".to_string()))?;

        let shutdown = CancellationToken::new();
        let num_workers = context.config().num_workers;

        let mut worker_handles = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let worker = Worker::new(
                context.store(),
                handler.clone(),
                context.queue_defs().to_vec(),
                context.config().poll_interval,
            );
            let token = shutdown.clone();
            worker_handles.push(tokio::spawn(async move {
                worker.run(token).await;
            }));
        }

        let daemon = RecoveryDaemon::new(&context);
        let token = shutdown.clone();
        let daemon_handle = tokio::spawn(async move {
            daemon.run(token).await;
        });

        info!(num_workers, "server started");

        Ok(Self {
            context,
            shutdown,
            worker_handles,
            daemon_handle: Some(daemon_handle),
        })
    }

    pub fn context(&self) -> Arc<Context> {
        Arc::clone(&self.context)
    }

    /// The shutdown token, for wiring into external signal handling.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Broadcast the stop signal and block until every worker and the
    /// daemon have exited. Each finishes its current step first; only then
    /// does the call return.
    pub async fn stop(mut self) {
        info!("initiating shutdown");
        self.shutdown.cancel();

        for handle in self.worker_handles.drain(..) {
            let _ = handle.await;
        }
        if let Some(handle) = self.daemon_handle.take() {
            let _ = handle.await;
        }

        info!("shutdown complete");
    }

    /// Block until Ctrl+C, then shut down cleanly.
    pub async fn wait_for_shutdown(self) {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal");
        }
        self.stop().await;
    }
}

/// Create a context from the configuration and start a server on it.
pub fn start_server(config: Config) -> Result<Server, Error> {
    let context = Context::create(config)?;
    Server::start(context)
}

/// Stop a running server, blocking until every concurrent unit has exited.
pub async fn stop_server(server: Server) {
    server.stop().await;
}
