//! Background timers for the maintenance tasks.
//!
//! Three periodic tasks run per process, each on its own jittered timer:
//! empty-queue cache refresh, registry heartbeat, and the crash-recovery
//! sweep. Task failures are logged and retried on the next tick; they
//! never take the hosting process down. [`Supervisor::stop`] shuts all
//! timers down synchronously via a broadcast channel, waiting for any
//! in-flight tick to finish.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::empty_queues::EmptyQueues;
use crate::error::{ConfigError, StoreError};
use crate::interval::with_jitter;
use crate::resurrector::Resurrector;

/// Errors that can occur while managing the background timers.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Configuration rejected at startup.
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Timers are already running.
    #[error("Supervisor is already running")]
    AlreadyRunning,

    /// Timers are not running.
    #[error("Supervisor is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Handle over the background maintenance timers.
pub struct Supervisor {
    config: Config,
    empty_queues: Arc<EmptyQueues>,
    resurrector: Arc<Resurrector>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
    is_running: AtomicBool,
    shutdown_timeout: Duration,
}

impl Supervisor {
    /// Creates a supervisor over the given components.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::Config` if the configuration is invalid.
    pub fn new(
        config: Config,
        empty_queues: Arc<EmptyQueues>,
        resurrector: Arc<Resurrector>,
    ) -> Result<Self, SupervisorError> {
        config.validate()?;

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            empty_queues,
            resurrector,
            shutdown_tx,
            handles: Vec::new(),
            is_running: AtomicBool::new(false),
            shutdown_timeout: Duration::from_secs(10),
        })
    }

    /// Starts the three maintenance timers. The empty-queue refresh and
    /// the heartbeat also fire once immediately.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::AlreadyRunning` if already started.
    pub fn start(&mut self) -> Result<(), SupervisorError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(SupervisorError::AlreadyRunning);
        }

        let refresh_interval = self.config.empty_queues_refresh_interval;
        let empty_queues = Arc::clone(&self.empty_queues);
        self.handles.push(self.spawn_timer(
            "empty_queues_refresh",
            refresh_interval,
            true,
            move || {
                let empty_queues = Arc::clone(&empty_queues);
                async move { empty_queues.refresh().await.map(|_| ()) }
            },
        ));

        let heartbeat_interval = self.config.heartbeat_interval;
        let resurrector = Arc::clone(&self.resurrector);
        self.handles.push(self.spawn_timer(
            "resurrector_heartbeat",
            heartbeat_interval,
            true,
            move || {
                let resurrector = Arc::clone(&resurrector);
                async move { resurrector.heartbeat().await }
            },
        ));

        let sweep_interval = self.config.sweep_interval;
        let resurrector = Arc::clone(&self.resurrector);
        self.handles
            .push(
                self.spawn_timer("resurrector_sweep", sweep_interval, false, move || {
                    let resurrector = Arc::clone(&resurrector);
                    async move { resurrector.sweep().await.map(|_| ()) }
                }),
            );

        self.is_running.store(true, Ordering::SeqCst);
        info!(identity = %self.config.identity, "Maintenance timers started");
        Ok(())
    }

    /// Stops all timers, waiting for in-flight ticks to finish.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::NotRunning` if not started, or
    /// `ShutdownTimeout` if a tick does not finish in time; in that case
    /// the stuck timer tasks are aborted rather than left detached.
    pub async fn stop(&mut self) -> Result<(), SupervisorError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(SupervisorError::NotRunning);
        }

        // Ignore send error, tasks may have already stopped.
        let _ = self.shutdown_tx.send(());

        let drain = async {
            for handle in self.handles.iter_mut() {
                if let Err(e) = handle.await {
                    error!(error = %e, "Timer task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.shutdown_timeout, drain).await;
        self.is_running.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                self.handles.clear();
                info!("Maintenance timers stopped");
                Ok(())
            }
            Err(_) => {
                for handle in self.handles.drain(..) {
                    handle.abort();
                }
                Err(SupervisorError::ShutdownTimeout(self.shutdown_timeout))
            }
        }
    }

    /// Whether the timers are currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    fn spawn_timer<F, Fut>(
        &self,
        name: &'static str,
        period: Duration,
        run_now: bool,
        mut tick: F,
    ) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), StoreError>> + Send,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            if run_now {
                if let Err(e) = tick().await {
                    warn!(task = name, error = %e, "Maintenance tick failed");
                }
            }

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(with_jitter(period)) => {
                        if let Err(e) = tick().await {
                            warn!(task = name, error = %e, "Maintenance tick failed");
                        }
                    }
                }
            }
        })
    }
}
