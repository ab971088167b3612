//! Deterministic solver backend for tests and demos
//!
//! Produces tokens without a browser. Outcomes can be scripted per sitekey,
//! and counters expose how the pool used the backend.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{SlotId, SolveRequest, SolverBackend, SolverError, SolverInstance};
use crate::task::{Solution, TaskId};

/// Scripted outcome of one solve call
#[derive(Debug, Clone)]
pub enum SimulatedStep {
    /// Return this token
    Succeed(String),
    /// Return this error
    Fail(SolverError),
    /// Never return, ignoring the deadline
    Hang,
    /// Panic inside the solve call
    Panic(String),
}

/// A solve call observed by the backend
#[derive(Debug, Clone)]
pub struct SolveCall {
    pub task_id: TaskId,
    pub sitekey: String,
    pub attempt: u32,
    pub slot: SlotId,
    pub started_at: Instant,
}

#[derive(Default)]
struct SimState {
    latency: Mutex<Duration>,
    default_step: Mutex<Option<SimulatedStep>>,
    scripts: Mutex<HashMap<String, VecDeque<SimulatedStep>>>,
    failing_launches: AtomicUsize,
    launches: AtomicUsize,
    closes: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    calls: Mutex<Vec<SolveCall>>,
}

impl SimState {
    fn next_step(&self, sitekey: &str) -> Option<SimulatedStep> {
        self.scripts
            .lock()
            .get_mut(sitekey)
            .and_then(VecDeque::pop_front)
            .or_else(|| self.default_step.lock().clone())
    }
}

/// In-process solver backend
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use turnstile_dispatch::solver::simulated::{SimulatedBackend, SimulatedStep};
/// use turnstile_dispatch::SolverError;
///
/// let backend = SimulatedBackend::new()
///     .with_latency(Duration::from_millis(20))
///     .script("0xBAD", vec![SimulatedStep::Fail(SolverError::permanent("invalid_sitekey", "rejected"))]);
/// ```
#[derive(Clone, Default)]
pub struct SimulatedBackend {
    state: Arc<SimState>,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time every solve call takes before producing its outcome
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.state.latency.lock() = latency;
        self
    }

    /// Outcome for calls with no scripted step left
    ///
    /// Without one, calls succeed with a generated token.
    pub fn with_default_step(self, step: SimulatedStep) -> Self {
        *self.state.default_step.lock() = Some(step);
        self
    }

    /// Queue outcomes for calls on `sitekey`, consumed in order
    pub fn script(self, sitekey: impl Into<String>, steps: Vec<SimulatedStep>) -> Self {
        self.state
            .scripts
            .lock()
            .entry(sitekey.into())
            .or_default()
            .extend(steps);
        self
    }

    /// Make the next `count` launches fail with a transient error
    pub fn fail_next_launches(self, count: usize) -> Self {
        self.state.failing_launches.store(count, Ordering::Release);
        self
    }

    /// Successful launches so far
    pub fn launches(&self) -> usize {
        self.state.launches.load(Ordering::Acquire)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::Acquire)
    }

    /// Solve calls executing right now
    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::Acquire)
    }

    /// Highest number of concurrent solve calls ever observed
    pub fn peak_in_flight(&self) -> usize {
        self.state.peak_in_flight.load(Ordering::Acquire)
    }

    /// Every solve call, in the order they started
    pub fn calls(&self) -> Vec<SolveCall> {
        self.state.calls.lock().clone()
    }
}

#[async_trait]
impl SolverBackend for SimulatedBackend {
    async fn launch(&self, slot: SlotId) -> Result<Box<dyn SolverInstance>, SolverError> {
        let failed = self
            .state
            .failing_launches
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(SolverError::transient(
                "launch_failed",
                format!("simulated launch failure on {slot}"),
            ));
        }

        self.state.launches.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(SimulatedInstance {
            slot,
            state: Arc::clone(&self.state),
        }))
    }
}

struct SimulatedInstance {
    slot: SlotId,
    state: Arc<SimState>,
}

struct CallGuard<'a>(&'a AtomicUsize);

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[async_trait]
impl SolverInstance for SimulatedInstance {
    async fn solve(
        &mut self,
        request: &SolveRequest,
        _deadline: Instant,
    ) -> Result<Solution, SolverError> {
        let state = &self.state;
        let current = state.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        let _guard = CallGuard(&state.in_flight);
        state.peak_in_flight.fetch_max(current, Ordering::AcqRel);

        state.calls.lock().push(SolveCall {
            task_id: request.task_id,
            sitekey: request.sitekey.clone(),
            attempt: request.attempt,
            slot: self.slot,
            started_at: Instant::now(),
        });
        let step = state.next_step(&request.sitekey);

        let latency = *state.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match step {
            Some(SimulatedStep::Succeed(token)) => Ok(Solution::new(token)),
            Some(SimulatedStep::Fail(error)) => Err(error),
            Some(SimulatedStep::Hang) => std::future::pending().await,
            Some(SimulatedStep::Panic(message)) => panic!("{message}"),
            None => Ok(Solution::new(format!(
                "0.sim-{}-{}",
                request.task_id, request.attempt
            ))
            .with_user_agent("Mozilla/5.0 (X11; Linux x86_64) SimulatedSolver")),
        }
    }

    async fn close(self: Box<Self>) {
        self.state.closes.fetch_add(1, Ordering::AcqRel);
    }
}
