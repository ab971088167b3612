//! Worker pool for solve execution
//!
//! A fixed arena of `N` slots, each owning one solver instance. Slots pull
//! from a single FIFO queue, so at most `N` solves run at any instant and
//! tasks start in submission order. Retries wait in a delayed heap and are
//! appended to the back of the FIFO once their backoff elapses.

use std::any::Any;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::registry::{RegistryError, TaskRegistry, Transition};
use crate::retry::{FailureClass, RetryPolicy};
use crate::solver::{SlotId, SolveRequest, SolverBackend, SolverError, SolverInstance};
use crate::task::{TaskError, TaskId};

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerPoolConfig {
    /// Number of slots (solver instances)
    pub worker_count: usize,

    /// Hard deadline for a single solve attempt
    #[serde(with = "crate::duration_millis")]
    pub attempt_timeout: Duration,

    /// Deadline for launching a solver instance
    #[serde(with = "crate::duration_millis")]
    pub launch_timeout: Duration,

    /// Deadline for closing a solver instance; a hung close is abandoned
    #[serde(with = "crate::duration_millis")]
    pub close_timeout: Duration,

    /// Graceful shutdown timeout
    #[serde(with = "crate::duration_millis")]
    pub shutdown_timeout: Duration,

    /// Retry policy for failed attempts
    pub retry: RetryPolicy,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            attempt_timeout: Duration::from_secs(60),
            launch_timeout: Duration::from_secs(30),
            close_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(90),
            retry: RetryPolicy::default(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new(worker_count: usize) -> Self {
        Self::default().with_worker_count(worker_count)
    }

    /// Set the number of slots
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_launch_timeout(mut self, timeout: Duration) -> Self {
        self.launch_timeout = timeout;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPoolStatus {
    /// Created, slots not spawned yet
    Idle,
    /// Slots are running and the queue accepts work
    Running,
    /// Queue closed, in-flight attempts finishing
    Draining,
    /// All slots have exited
    Stopped,
}

/// What a slot is doing right now
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SlotStatus {
    /// Waiting for work
    Idle,
    /// Running an attempt for `task_id`
    Busy {
        task_id: TaskId,
        since: DateTime<Utc>,
    },
    /// Launching or relaunching its solver instance
    Recycling,
    /// Exited
    Stopped,
}

/// Worker pool errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("worker pool is already running")]
    AlreadyRunning,

    #[error("worker pool is not accepting work")]
    NotAccepting,

    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Outcome of a completed shutdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Queued tasks that never reached a slot
    pub cancelled: usize,
    /// Running tasks abandoned because the drain timed out
    pub abandoned: usize,
}

#[derive(Debug, Clone)]
struct QueuedJob {
    task_id: TaskId,
    request: SolveRequest,
}

/// Retry waiting for its backoff to elapse
#[derive(Debug)]
struct DelayedJob {
    ready_at: Instant,
    seq: u64,
    job: QueuedJob,
}

impl PartialEq for DelayedJob {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl Eq for DelayedJob {}

impl PartialOrd for DelayedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedJob {
    // Reversed so the BinaryHeap pops the earliest entry first
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
struct RunQueue {
    ready: VecDeque<QueuedJob>,
    delayed: BinaryHeap<DelayedJob>,
    next_seq: u64,
    closed: bool,
}

impl RunQueue {
    fn push(&mut self, job: QueuedJob) {
        self.ready.push_back(job);
    }

    fn push_delayed(&mut self, job: QueuedJob, ready_at: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.delayed.push(DelayedJob { ready_at, seq, job });
    }

    /// Move retries whose backoff has elapsed to the back of the ready queue
    fn promote_due(&mut self, now: Instant) {
        while self.delayed.peek().is_some_and(|d| d.ready_at <= now) {
            if let Some(due) = self.delayed.pop() {
                self.ready.push_back(due.job);
            }
        }
    }

    fn pop_ready(&mut self, now: Instant) -> Option<QueuedJob> {
        self.promote_due(now);
        self.ready.pop_front()
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.peek().map(|d| d.ready_at)
    }

    fn len(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }

    fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.delayed.is_empty()
    }

    fn drain(&mut self) -> Vec<QueuedJob> {
        let mut jobs: Vec<QueuedJob> = self.ready.drain(..).collect();
        let mut delayed = std::mem::take(&mut self.delayed).into_sorted_vec();
        // into_sorted_vec is ascending by Ord, which is latest-first here
        delayed.reverse();
        jobs.extend(delayed.into_iter().map(|d| d.job));
        jobs
    }
}

struct PoolShared {
    config: WorkerPoolConfig,
    registry: Arc<TaskRegistry>,
    backend: Arc<dyn SolverBackend>,
    queue: Mutex<RunQueue>,
    work_available: Notify,
    slots: Vec<Mutex<SlotStatus>>,
    /// Each slot's live solver instance, locked by the slot while it runs
    instances: Vec<AsyncMutex<Option<Box<dyn SolverInstance>>>>,
    in_flight: AtomicUsize,
}

impl PoolShared {
    fn set_slot(&self, slot: SlotId, status: SlotStatus) {
        if let Some(s) = self.slots.get(slot.0) {
            *s.lock() = status;
        }
    }
}

/// Decrements the in-flight counter when the attempt ends, however it ends
struct InFlightGuard<'a>(&'a AtomicUsize);

impl<'a> InFlightGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Bounded pool of solver slots
///
/// # Example
///
/// ```ignore
/// use turnstile_dispatch::{WorkerPool, WorkerPoolConfig};
///
/// let pool = WorkerPool::new(WorkerPoolConfig::new(4), registry, backend);
/// pool.start()?;
///
/// pool.submit(task_id, request)?;
///
/// // ... later, graceful shutdown
/// let report = pool.shutdown().await?;
/// ```
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    status: RwLock<WorkerPoolStatus>,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        registry: Arc<TaskRegistry>,
        backend: Arc<dyn SolverBackend>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let slots = (0..config.worker_count)
            .map(|_| Mutex::new(SlotStatus::Stopped))
            .collect();
        let instances = (0..config.worker_count)
            .map(|_| AsyncMutex::new(None))
            .collect();

        Self {
            shared: Arc::new(PoolShared {
                config,
                registry,
                backend,
                queue: Mutex::new(RunQueue::default()),
                work_available: Notify::new(),
                slots,
                instances,
                in_flight: AtomicUsize::new(0),
            }),
            status: RwLock::new(WorkerPoolStatus::Idle),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn one task per slot
    ///
    /// Must be called from within a Tokio runtime.
    #[instrument(skip(self), fields(workers = self.shared.config.worker_count))]
    pub fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status != WorkerPoolStatus::Idle {
                return Err(WorkerPoolError::AlreadyRunning);
            }
            *status = WorkerPoolStatus::Running;
        }

        info!(
            workers = self.shared.config.worker_count,
            attempt_timeout_ms = self.shared.config.attempt_timeout.as_millis() as u64,
            max_attempts = self.shared.config.retry.max_attempts,
            "Starting worker pool"
        );

        let mut handles = self.handles.lock();
        for index in 0..self.shared.config.worker_count {
            let slot = SlotId(index);
            self.shared.set_slot(slot, SlotStatus::Recycling);
            let shared = Arc::clone(&self.shared);
            let shutdown_rx = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(slot_loop(shared, slot, shutdown_rx)));
        }

        Ok(())
    }

    /// Enqueue a task at the back of the FIFO
    ///
    /// If the pool no longer accepts work the task is cancelled here, so it
    /// never stays PENDING.
    pub fn submit(&self, task_id: TaskId, request: SolveRequest) -> Result<(), WorkerPoolError> {
        {
            let mut queue = self.shared.queue.lock();
            if !queue.closed {
                queue.push(QueuedJob { task_id, request });
                drop(queue);
                self.shared.work_available.notify_one();
                debug!(task_id = %task_id, "task queued");
                return Ok(());
            }
        }

        if let Err(e) = self
            .shared
            .registry
            .transition(task_id, Transition::Cancel("worker pool is shutting down".into()))
        {
            debug!(task_id = %task_id, error = %e, "cancel on rejected submit skipped");
        }
        Err(WorkerPoolError::NotAccepting)
    }

    /// Stop accepting work, cancel what is still queued, let in-flight
    /// attempts finish and close every solver instance
    ///
    /// If the slots do not drain within `shutdown_timeout`, they are aborted,
    /// their tasks are cancelled and `ShutdownTimeout` is returned.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<ShutdownReport, WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status == WorkerPoolStatus::Stopped {
                return Ok(ShutdownReport::default());
            }
            *status = WorkerPoolStatus::Draining;
        }

        info!("Initiating graceful shutdown");

        let queued = {
            let mut queue = self.shared.queue.lock();
            queue.closed = true;
            queue.drain()
        };

        let mut report = ShutdownReport::default();
        for job in queued {
            match self
                .shared
                .registry
                .transition(job.task_id, Transition::Cancel("dispatcher shut down before the task ran".into()))
            {
                Ok(_) => report.cancelled += 1,
                Err(e) => debug!(task_id = %job.task_id, error = %e, "queued task not cancelled"),
            }
        }
        if report.cancelled > 0 {
            info!(count = report.cancelled, "Cancelled queued tasks");
        }

        self.shutdown_tx.send_replace(true);
        self.shared.work_available.notify_waiters();

        let mut handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());

        let drained = tokio::time::timeout(
            self.shared.config.shutdown_timeout,
            futures::future::join_all(handles.iter_mut()),
        )
        .await;

        if drained.is_err() {
            warn!(
                timeout_ms = self.shared.config.shutdown_timeout.as_millis() as u64,
                "Shutdown timeout reached, aborting slots"
            );
            for handle in &handles {
                handle.abort();
            }
            // An aborted slot hands its instance cell back once its future is dropped
            if tokio::time::timeout(
                self.shared.config.close_timeout,
                futures::future::join_all(handles.iter_mut()),
            )
            .await
            .is_err()
            {
                warn!("Aborted slots did not stop in time");
            }
        }

        report.abandoned = self.cancel_busy_slots();
        let orphaned = self.close_orphaned_instances().await;
        if orphaned > 0 {
            info!(count = orphaned, "Closed solver instances of aborted slots");
        }
        *self.status.write() = WorkerPoolStatus::Stopped;

        if drained.is_err() {
            return Err(WorkerPoolError::ShutdownTimeout);
        }

        info!(
            cancelled = report.cancelled,
            abandoned = report.abandoned,
            "Worker pool stopped"
        );
        Ok(report)
    }

    /// Cancel whatever the slots were still running and mark them stopped
    fn cancel_busy_slots(&self) -> usize {
        let mut abandoned = 0;
        for slot in &self.shared.slots {
            let previous = std::mem::replace(&mut *slot.lock(), SlotStatus::Stopped);
            if let SlotStatus::Busy { task_id, .. } = previous {
                let cancel = Transition::Cancel("abandoned at shutdown".into());
                if self.shared.registry.transition(task_id, cancel).is_ok() {
                    warn!(task_id = %task_id, "Abandoned running task at shutdown");
                    abandoned += 1;
                }
            }
        }
        abandoned
    }

    /// Close instances left behind by slots that were aborted
    async fn close_orphaned_instances(&self) -> usize {
        let mut closed = 0;
        for (index, cell) in self.shared.instances.iter().enumerate() {
            let slot = SlotId(index);
            let Ok(mut instance) = cell.try_lock() else {
                warn!(slot = %slot, "Slot still holds its solver instance, leaving it unclosed");
                continue;
            };
            if let Some(inst) = instance.take() {
                close_instance(&self.shared, slot, inst).await;
                closed += 1;
            }
        }
        closed
    }

    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    /// Whether `submit` will currently enqueue work
    pub fn is_accepting(&self) -> bool {
        matches!(
            self.status(),
            WorkerPoolStatus::Idle | WorkerPoolStatus::Running
        ) && !self.shared.queue.lock().closed
    }

    /// Tasks waiting for a slot, including retries in backoff
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Solve attempts executing right now
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    pub fn worker_count(&self) -> usize {
        self.shared.config.worker_count
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.shared.config
    }

    pub fn slot_statuses(&self) -> Vec<SlotStatus> {
        self.shared.slots.iter().map(|s| s.lock().clone()).collect()
    }
}

async fn slot_loop(shared: Arc<PoolShared>, slot: SlotId, mut shutdown_rx: watch::Receiver<bool>) {
    let Some(cell) = shared.instances.get(slot.0) else {
        return;
    };
    let mut instance = cell.lock().await;
    *instance = launch_instance(&shared, slot).await.ok();
    shared.set_slot(slot, SlotStatus::Idle);

    while let Some(job) = next_job(&shared, &mut shutdown_rx).await {
        run_job(&shared, slot, &mut instance, job).await;
    }

    if let Some(inst) = instance.take() {
        close_instance(&shared, slot, inst).await;
    }
    shared.set_slot(slot, SlotStatus::Stopped);
    debug!(slot = %slot, "Slot loop exited");
}

/// Wait for the next runnable job; `None` once the queue is closed
async fn next_job(shared: &PoolShared, shutdown_rx: &mut watch::Receiver<bool>) -> Option<QueuedJob> {
    loop {
        let notified = shared.work_available.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let next_due = {
            let mut queue = shared.queue.lock();
            if queue.closed {
                return None;
            }
            if let Some(job) = queue.pop_ready(Instant::now()) {
                let more = !queue.is_empty();
                drop(queue);
                if more {
                    // Keep another idle slot watching the rest of the queue
                    shared.work_available.notify_one();
                }
                return Some(job);
            }
            queue.next_due()
        };

        let backoff = async {
            match next_due {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = &mut notified => {}
            _ = backoff => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    return None;
                }
            }
        }
    }
}

#[instrument(level = "debug", skip_all, fields(slot = %slot, task_id = %job.task_id))]
async fn run_job(
    shared: &PoolShared,
    slot: SlotId,
    instance: &mut Option<Box<dyn SolverInstance>>,
    mut job: QueuedJob,
) {
    let task_id = job.task_id;
    shared.set_slot(
        slot,
        SlotStatus::Busy {
            task_id,
            since: Utc::now(),
        },
    );

    let attempt = match shared.registry.transition(task_id, Transition::Start) {
        Ok(applied) => applied.attempt_count,
        Err(RegistryError::AttemptCeilingReached { attempts, .. }) => {
            settle(
                shared,
                task_id,
                Transition::Fail(TaskError::solver_transient(format!(
                    "retry ceiling reached after {attempts} attempts"
                ))),
            );
            shared.set_slot(slot, SlotStatus::Idle);
            return;
        }
        Err(e) => {
            debug!(error = %e, "dequeued task not started");
            shared.set_slot(slot, SlotStatus::Idle);
            return;
        }
    };
    job.request.attempt = attempt;
    debug!(attempt, "attempt started");

    let launched = match instance.take() {
        Some(inst) => inst,
        None => match launch_instance(shared, slot).await {
            Ok(inst) => inst,
            Err(e) => {
                settle_failure(shared, job, attempt, e);
                shared.set_slot(slot, SlotStatus::Idle);
                return;
            }
        },
    };
    let inst = instance.insert(launched);

    let deadline = Instant::now() + shared.config.attempt_timeout;
    let outcome = {
        let _guard = InFlightGuard::enter(&shared.in_flight);
        let solve = AssertUnwindSafe(inst.solve(&job.request, deadline)).catch_unwind();
        tokio::time::timeout_at(deadline, solve).await
    };

    let recycle = match outcome {
        Ok(Ok(Ok(solution))) => {
            if settle(shared, task_id, Transition::Succeed(solution)) {
                info!(attempt, "Task succeeded");
            }
            false
        }
        Ok(Ok(Err(e))) => {
            settle_failure(shared, job, attempt, e);
            false
        }
        Ok(Err(payload)) => {
            let message = panic_message(&*payload);
            error!(attempt, panic = %message, "Solver panicked, recycling solver instance");
            settle(
                shared,
                task_id,
                Transition::Fail(TaskError::solver_permanent(format!(
                    "solver panicked: {message}"
                ))),
            );
            true
        }
        Err(_) => {
            warn!(
                attempt,
                timeout_ms = shared.config.attempt_timeout.as_millis() as u64,
                "Solve attempt timed out, recycling solver instance"
            );
            settle_timeout(shared, job, attempt);
            true
        }
    };

    // A hung or panicked instance is not trusted with another task
    if recycle {
        shared.set_slot(slot, SlotStatus::Recycling);
        if let Some(inst) = instance.take() {
            close_instance(shared, slot, inst).await;
        }
        *instance = launch_instance(shared, slot).await.ok();
    }

    shared.set_slot(slot, SlotStatus::Idle);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Apply a terminal transition, logging a rejected one
fn settle(shared: &PoolShared, task_id: TaskId, transition: Transition) -> bool {
    match shared.registry.transition(task_id, transition) {
        Ok(_) => true,
        Err(e) => {
            debug!(task_id = %task_id, error = %e, "outcome discarded");
            false
        }
    }
}

fn settle_failure(shared: &PoolShared, job: QueuedJob, attempt: u32, error: SolverError) {
    let retry = &shared.config.retry;
    match retry.classify(&error) {
        FailureClass::Terminal => {
            info!(attempt, code = %error.code, error = %error, "Task failed permanently");
            settle(
                shared,
                job.task_id,
                Transition::Fail(TaskError::solver_permanent(error.to_string())),
            );
        }
        FailureClass::Retryable if retry.has_attempts_remaining(attempt) => {
            debug!(attempt, error = %error, "transient failure, retrying");
            schedule_retry(shared, job, attempt);
        }
        FailureClass::Retryable => {
            info!(attempt, error = %error, "Task failed, retries exhausted");
            settle(
                shared,
                job.task_id,
                Transition::Fail(TaskError::solver_transient(format!(
                    "{error} (after {attempt} attempts)"
                ))),
            );
        }
    }
}

fn settle_timeout(shared: &PoolShared, job: QueuedJob, attempt: u32) {
    let retry = &shared.config.retry;
    if retry.retry_on_timeout && retry.has_attempts_remaining(attempt) {
        schedule_retry(shared, job, attempt);
        return;
    }

    let message = format!(
        "attempt {attempt} exceeded {}ms",
        shared.config.attempt_timeout.as_millis()
    );
    if settle(shared, job.task_id, Transition::TimeOut(TaskError::timeout(message))) {
        info!(attempt, "Task timed out");
    }
}

fn schedule_retry(shared: &PoolShared, job: QueuedJob, attempt: u32) {
    let delay = shared.config.retry.delay_for_attempt(attempt + 1);
    let task_id = job.task_id;

    {
        let mut queue = shared.queue.lock();
        if !queue.closed {
            queue.push_delayed(job, Instant::now() + delay);
            drop(queue);
            shared.work_available.notify_one();
            debug!(task_id = %task_id, delay_ms = delay.as_millis() as u64, "retry scheduled");
            return;
        }
    }

    settle(
        shared,
        task_id,
        Transition::Cancel("dispatcher shut down before the retry ran".into()),
    );
}

async fn launch_instance(
    shared: &PoolShared,
    slot: SlotId,
) -> Result<Box<dyn SolverInstance>, SolverError> {
    let launch = AssertUnwindSafe(shared.backend.launch(slot)).catch_unwind();
    let launched = match tokio::time::timeout(shared.config.launch_timeout, launch).await {
        Ok(Ok(result)) => result,
        Ok(Err(payload)) => Err(SolverError::transient(
            "launch_panicked",
            format!("solver launch panicked: {}", panic_message(&*payload)),
        )),
        Err(_) => Err(SolverError::transient(
            "launch_timeout",
            format!(
                "solver instance did not launch within {}ms",
                shared.config.launch_timeout.as_millis()
            ),
        )),
    };

    match &launched {
        Ok(_) => debug!(slot = %slot, "solver instance launched"),
        Err(e) => error!(slot = %slot, error = %e, "Failed to launch solver instance"),
    }
    launched
}

async fn close_instance(shared: &PoolShared, slot: SlotId, instance: Box<dyn SolverInstance>) {
    let close = AssertUnwindSafe(instance.close()).catch_unwind();
    match tokio::time::timeout(shared.config.close_timeout, close).await {
        Ok(Ok(())) => debug!(slot = %slot, "solver instance closed"),
        Ok(Err(payload)) => warn!(
            slot = %slot,
            panic = %panic_message(&*payload),
            "Solver instance panicked while closing"
        ),
        Err(_) => warn!(slot = %slot, "Solver instance did not close in time, abandoning it"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionController;
    use crate::solver::simulated::{SimulatedBackend, SimulatedStep};
    use crate::task::{TaskErrorKind, TaskInput, TaskState};

    fn request(task_id: TaskId, sitekey: &str) -> SolveRequest {
        SolveRequest {
            task_id,
            url: "https://example.com".into(),
            sitekey: sitekey.into(),
            action: None,
            cdata: None,
            proxy: None,
            attempt: 0,
        }
    }

    struct Harness {
        registry: Arc<TaskRegistry>,
        admission: Arc<AdmissionController>,
        pool: WorkerPool,
    }

    impl Harness {
        fn new(config: WorkerPoolConfig, backend: Arc<SimulatedBackend>) -> Self {
            let admission = Arc::new(AdmissionController::new(100));
            let registry = Arc::new(TaskRegistry::new(
                admission.clone(),
                Duration::from_secs(60),
                config.retry.max_attempts,
            ));
            let pool = WorkerPool::new(config, registry.clone(), backend);
            Self {
                registry,
                admission,
                pool,
            }
        }

        fn submit(&self, sitekey: &str) -> TaskId {
            self.admission.try_acquire().unwrap();
            let id = self
                .registry
                .create(TaskInput::new("https://example.com", sitekey));
            self.pool.submit(id, request(id, sitekey)).unwrap();
            id
        }

        async fn wait_terminal(&self, id: TaskId) -> crate::task::Task {
            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                let task = self.registry.get(id).unwrap();
                if task.state.is_terminal() {
                    return task;
                }
                assert!(Instant::now() < deadline, "task {id} never settled");
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }

    #[test]
    fn test_default_config() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.attempt_timeout, Duration::from_secs(60));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(90));
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_config_builder() {
        let config = WorkerPoolConfig::new(0)
            .with_attempt_timeout(Duration::from_secs(5))
            .with_close_timeout(Duration::from_millis(200))
            .with_retry(RetryPolicy::no_retry());

        assert_eq!(config.worker_count, 1);
        assert_eq!(config.attempt_timeout, Duration::from_secs(5));
        assert_eq!(config.close_timeout, Duration::from_millis(200));
        assert_eq!(config.retry.max_attempts, 1);
    }

    #[test]
    fn test_run_queue_is_fifo_and_promotes_retries_to_back() {
        let mut queue = RunQueue::default();
        let now = Instant::now();
        let (a, b, c) = (TaskId::new(), TaskId::new(), TaskId::new());

        queue.push(QueuedJob { task_id: a, request: request(a, "k") });
        queue.push_delayed(QueuedJob { task_id: c, request: request(c, "k") }, now);
        queue.push(QueuedJob { task_id: b, request: request(b, "k") });

        assert_eq!(queue.pop_ready(now).unwrap().task_id, a);
        assert_eq!(queue.pop_ready(now).unwrap().task_id, b);
        assert_eq!(queue.pop_ready(now).unwrap().task_id, c);
        assert!(queue.pop_ready(now).is_none());
    }

    #[test]
    fn test_run_queue_holds_back_future_retries() {
        let mut queue = RunQueue::default();
        let now = Instant::now();
        let later = now + Duration::from_secs(1);
        let (a, b) = (TaskId::new(), TaskId::new());

        queue.push_delayed(QueuedJob { task_id: b, request: request(b, "k") }, later);
        queue.push_delayed(QueuedJob { task_id: a, request: request(a, "k") }, now);

        assert_eq!(queue.next_due(), Some(now));
        assert_eq!(queue.pop_ready(now).unwrap().task_id, a);
        assert!(queue.pop_ready(now).is_none());
        assert_eq!(queue.next_due(), Some(later));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop_ready(later).unwrap().task_id, b);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let harness = Harness::new(WorkerPoolConfig::new(1), Arc::new(SimulatedBackend::new()));
        harness.pool.start().unwrap();
        assert_eq!(harness.pool.start(), Err(WorkerPoolError::AlreadyRunning));
        harness.pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_solves_and_releases_capacity() {
        let backend = Arc::new(SimulatedBackend::new());
        let harness = Harness::new(WorkerPoolConfig::new(2), backend.clone());
        harness.pool.start().unwrap();

        let id = harness.submit("0x4AAA");
        let task = harness.wait_terminal(id).await;

        assert_eq!(task.state, TaskState::Succeeded);
        assert_eq!(task.attempt_count, 1);
        assert_eq!(harness.admission.outstanding(), 0);

        harness.pool.shutdown().await.unwrap();
        assert_eq!(backend.launches(), 2);
        assert_eq!(backend.closes(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_recycles_instance() {
        let backend = Arc::new(
            SimulatedBackend::new().script("hang", vec![SimulatedStep::Hang]),
        );
        let config = WorkerPoolConfig::new(1).with_attempt_timeout(Duration::from_millis(50));
        let harness = Harness::new(config, backend.clone());
        harness.pool.start().unwrap();

        let hung = harness.submit("hang");
        let next = harness.submit("fine");

        let task = harness.wait_terminal(hung).await;
        assert_eq!(task.state, TaskState::TimedOut);
        assert_eq!(task.attempt_count, 1);

        let task = harness.wait_terminal(next).await;
        assert_eq!(task.state, TaskState::Succeeded);

        // initial launch plus the relaunch after the hang
        assert_eq!(backend.launches(), 2);
        assert_eq!(backend.closes(), 1);

        harness.pool.shutdown().await.unwrap();
        assert_eq!(backend.closes(), 2);
    }

    #[tokio::test]
    async fn test_solver_panic_fails_task_and_keeps_slot() {
        let backend = Arc::new(
            SimulatedBackend::new().script("boom", vec![SimulatedStep::Panic("solver bug".into())]),
        );
        let harness = Harness::new(WorkerPoolConfig::new(1), backend.clone());
        harness.pool.start().unwrap();

        let boom = harness.submit("boom");
        let next = harness.submit("fine");

        let task = harness.wait_terminal(boom).await;
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.attempt_count, 1);
        let error = task.error.unwrap();
        assert_eq!(error.kind, TaskErrorKind::SolverPermanent);
        assert!(error.message.contains("solver bug"));

        // the single slot survives on a fresh instance
        let task = harness.wait_terminal(next).await;
        assert_eq!(task.state, TaskState::Succeeded);
        assert_eq!(harness.admission.outstanding(), 0);
        assert_eq!(backend.launches(), 2);
        assert_eq!(backend.closes(), 1);
        assert_eq!(harness.pool.in_flight(), 0);

        harness.pool.shutdown().await.unwrap();
        assert_eq!(backend.closes(), 2);
    }

    #[tokio::test]
    async fn test_failed_launch_consumes_attempt() {
        let backend = Arc::new(SimulatedBackend::new().fail_next_launches(2));
        let config = WorkerPoolConfig::new(1)
            .with_retry(RetryPolicy::fixed(Duration::from_millis(5), 3));
        let harness = Harness::new(config, backend.clone());
        harness.pool.start().unwrap();

        let id = harness.submit("0x4AAA");
        let task = harness.wait_terminal(id).await;

        // eager launch fails, lazy launch for attempt 1 fails, attempt 2 launches
        assert_eq!(task.state, TaskState::Succeeded);
        assert_eq!(task.attempt_count, 2);
        harness.pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_cancels_queued_tasks() {
        let backend = Arc::new(SimulatedBackend::new().with_latency(Duration::from_millis(100)));
        let harness = Harness::new(WorkerPoolConfig::new(1), backend.clone());
        harness.pool.start().unwrap();

        let running = harness.submit("a");
        let queued = harness.submit("b");
        while harness.registry.get(running).unwrap().state != TaskState::Running {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let report = harness.pool.shutdown().await.unwrap();
        assert_eq!(report.cancelled, 1);
        assert_eq!(report.abandoned, 0);

        assert_eq!(harness.registry.get(running).unwrap().state, TaskState::Succeeded);
        assert_eq!(harness.registry.get(queued).unwrap().state, TaskState::Cancelled);
        assert_eq!(harness.admission.outstanding(), 0);
        assert_eq!(harness.pool.status(), WorkerPoolStatus::Stopped);
        assert!(harness
            .pool
            .slot_statuses()
            .iter()
            .all(|s| *s == SlotStatus::Stopped));
        assert_eq!(backend.launches(), backend.closes());
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_cancels_task() {
        let harness = Harness::new(WorkerPoolConfig::new(1), Arc::new(SimulatedBackend::new()));
        harness.pool.start().unwrap();
        harness.pool.shutdown().await.unwrap();
        assert!(!harness.pool.is_accepting());

        harness.admission.try_acquire().unwrap();
        let id = harness.registry.create(TaskInput::new("https://example.com", "k"));
        assert_eq!(
            harness.pool.submit(id, request(id, "k")),
            Err(WorkerPoolError::NotAccepting)
        );
        assert_eq!(harness.registry.get(id).unwrap().state, TaskState::Cancelled);
        assert_eq!(harness.admission.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_timeout_abandons_running_task() {
        let backend = Arc::new(SimulatedBackend::new().script("hang", vec![SimulatedStep::Hang]));
        let config = WorkerPoolConfig::new(1)
            .with_attempt_timeout(Duration::from_secs(30))
            .with_shutdown_timeout(Duration::from_millis(50));
        let harness = Harness::new(config, backend.clone());
        harness.pool.start().unwrap();

        let id = harness.submit("hang");
        while harness.registry.get(id).unwrap().state != TaskState::Running {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        assert_eq!(
            harness.pool.shutdown().await,
            Err(WorkerPoolError::ShutdownTimeout)
        );
        let task = harness.registry.get(id).unwrap();
        assert_eq!(task.state, TaskState::Cancelled);
        assert_eq!(harness.admission.outstanding(), 0);
        assert_eq!(harness.pool.status(), WorkerPoolStatus::Stopped);

        // the aborted slot's instance is still closed
        assert_eq!(backend.launches(), 1);
        assert_eq!(backend.closes(), 1);
    }
}
