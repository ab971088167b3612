//! Dispatcher: the submit/poll boundary
//!
//! Wires admission control, the task registry and the worker pool together.
//! `submit` never waits on solver work and `poll` never blocks; the
//! dispatcher itself holds no task state.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::admission::{AdmissionController, CapacityExceeded};
use crate::config::{ConfigError, DispatcherConfig};
use crate::pool::{ShutdownReport, SlotStatus, WorkerPool, WorkerPoolError};
use crate::registry::TaskRegistry;
use crate::solver::{SolveRequest, SolverBackend};
use crate::task::{InputError, TaskId, TaskInput, TaskView};

/// Errors returned synchronously to the caller
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// Too much outstanding work; retry later
    #[error("capacity exceeded: {outstanding}/{ceiling} tasks outstanding")]
    CapacityExceeded { outstanding: usize, ceiling: usize },

    /// Unknown, malformed or evicted task id
    #[error("task not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("dispatcher is shutting down")]
    ShuttingDown,

    #[error("worker pool error: {0}")]
    Pool(#[from] WorkerPoolError),
}

impl From<CapacityExceeded> for DispatchError {
    fn from(e: CapacityExceeded) -> Self {
        Self::CapacityExceeded {
            outstanding: e.outstanding,
            ceiling: e.ceiling,
        }
    }
}

impl From<InputError> for DispatchError {
    fn from(e: InputError) -> Self {
        Self::InvalidInput(e.to_string())
    }
}

/// Point-in-time load snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    /// PENDING + RUNNING tasks
    pub outstanding: usize,
    /// Admission ceiling
    pub ceiling: usize,
    /// Tasks waiting for a slot
    pub queued: usize,
    /// Solve attempts executing now
    pub in_flight: usize,
    pub workers: usize,
    /// Task records held, terminal ones included
    pub retained: usize,
    pub accepting: bool,
}

/// Asynchronous solve dispatcher
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use turnstile_dispatch::prelude::*;
///
/// let dispatcher = Dispatcher::new(DispatcherConfig::from_env()?, Arc::new(SimulatedBackend::new()))?;
/// dispatcher.start()?;
///
/// let task_id = dispatcher.submit(TaskInput::new("https://example.com", "0x4AAAAAAA"))?;
/// let view = dispatcher.poll(task_id)?;
///
/// dispatcher.shutdown().await?;
/// ```
pub struct Dispatcher {
    config: DispatcherConfig,
    admission: Arc<AdmissionController>,
    registry: Arc<TaskRegistry>,
    pool: WorkerPool,
    shutdown_tx: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Build a dispatcher over `backend`; nothing runs until [`start`](Self::start)
    pub fn new(
        config: DispatcherConfig,
        backend: Arc<dyn SolverBackend>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let admission = Arc::new(AdmissionController::new(config.admission_ceiling));
        let registry = Arc::new(TaskRegistry::new(
            Arc::clone(&admission),
            config.retention_ttl,
            config.pool.retry.max_attempts,
        ));
        let pool = WorkerPool::new(config.pool.clone(), Arc::clone(&registry), backend);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            admission,
            registry,
            pool,
            shutdown_tx,
            sweeper: Mutex::new(None),
        })
    }

    /// Launch the worker slots and the retention sweep
    ///
    /// Must be called from within a Tokio runtime.
    #[instrument(skip(self))]
    pub fn start(&self) -> Result<(), DispatchError> {
        self.pool.start()?;
        *self.sweeper.lock() = Some(self.spawn_sweeper());

        info!(
            workers = self.config.pool.worker_count,
            ceiling = self.config.admission_ceiling,
            retention_secs = self.config.retention_ttl.as_secs(),
            "Dispatcher started"
        );
        Ok(())
    }

    /// Accept a solve request and return its id without waiting for the solve
    pub fn submit(&self, input: TaskInput) -> Result<TaskId, DispatchError> {
        let proxy = input.validate()?;

        if !self.pool.is_accepting() {
            return Err(DispatchError::ShuttingDown);
        }

        if let Err(e) = self.admission.try_acquire() {
            warn!(
                outstanding = e.outstanding,
                ceiling = e.ceiling,
                "Submission rejected: capacity exceeded"
            );
            return Err(e.into());
        }

        let task_id = self.registry.create(input.clone());
        let request = SolveRequest {
            task_id,
            url: input.url,
            sitekey: input.sitekey,
            action: input.options.action,
            cdata: input.options.cdata,
            proxy,
            attempt: 0,
        };

        match self.pool.submit(task_id, request) {
            Ok(()) => {
                debug!(task_id = %task_id, "task submitted");
                Ok(task_id)
            }
            Err(WorkerPoolError::NotAccepting) => Err(DispatchError::ShuttingDown),
            Err(e) => Err(e.into()),
        }
    }

    /// Current snapshot of a task
    pub fn poll(&self, task_id: TaskId) -> Result<TaskView, DispatchError> {
        self.registry
            .get(task_id)
            .map(|task| TaskView::from(&task))
            .ok_or_else(|| DispatchError::NotFound(task_id.to_string()))
    }

    /// Like [`poll`](Self::poll), for an id as received from the outside;
    /// a malformed id is simply not found
    pub fn poll_str(&self, task_id: &str) -> Result<TaskView, DispatchError> {
        let id = task_id
            .parse::<TaskId>()
            .map_err(|_| DispatchError::NotFound(task_id.to_string()))?;
        self.poll(id)
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            outstanding: self.admission.outstanding(),
            ceiling: self.admission.ceiling(),
            queued: self.pool.queued(),
            in_flight: self.pool.in_flight(),
            workers: self.pool.worker_count(),
            retained: self.registry.len(),
            accepting: self.pool.is_accepting(),
        }
    }

    pub fn slot_statuses(&self) -> Vec<SlotStatus> {
        self.pool.slot_statuses()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Stop accepting work, cancel queued tasks, drain in-flight attempts
    /// and release every solver instance
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<ShutdownReport, DispatchError> {
        info!("Dispatcher shutting down");
        self.shutdown_tx.send_replace(true);

        let drained = self.pool.shutdown().await;

        let sweeper = self.sweeper.lock().take();
        if let Some(handle) = sweeper {
            if let Err(e) = handle.await {
                warn!(error = %e, "Sweep loop ended abnormally");
            }
        }

        let report = drained?;
        info!(
            cancelled = report.cancelled,
            abandoned = report.abandoned,
            "Dispatcher stopped"
        );
        Ok(report)
    }

    fn spawn_sweeper(&self) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let interval = self.config.sweep_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = registry.evict_expired();
                        if evicted > 0 {
                            debug!(evicted, "Evicted expired tasks");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Sweep loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("Sweep loop exited");
        })
    }
}
