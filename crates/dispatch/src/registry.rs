//! Task registry
//!
//! Single source of truth for task state. Every state change goes through
//! [`TaskRegistry::transition`], which enforces the forward-only lifecycle
//! and hands the admission slot back when a task settles.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use crate::admission::AdmissionController;
use crate::task::{Solution, Task, TaskError, TaskId, TaskInput, TaskState};

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("task {id} is already terminal ({state})")]
    AlreadyTerminal { id: TaskId, state: TaskState },

    #[error("task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskState,
        to: TaskState,
    },

    #[error("task {id} already used {attempts} attempts")]
    AttemptCeilingReached { id: TaskId, attempts: u32 },
}

/// A requested state change
#[derive(Debug, Clone)]
pub(crate) enum Transition {
    /// Begin an attempt (first or retry)
    Start,
    Succeed(Solution),
    Fail(TaskError),
    TimeOut(TaskError),
    Cancel(String),
}

impl Transition {
    fn target(&self) -> TaskState {
        match self {
            Self::Start => TaskState::Running,
            Self::Succeed(_) => TaskState::Succeeded,
            Self::Fail(_) => TaskState::Failed,
            Self::TimeOut(_) => TaskState::TimedOut,
            Self::Cancel(_) => TaskState::Cancelled,
        }
    }
}

/// Outcome of an applied transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TransitionApplied {
    pub state: TaskState,
    pub attempt_count: u32,
}

/// Number of retained tasks per state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub cancelled: usize,
}

impl TaskCounts {
    pub fn outstanding(&self) -> usize {
        self.pending + self.running
    }

    pub fn total(&self) -> usize {
        self.outstanding() + self.succeeded + self.failed + self.timed_out + self.cancelled
    }
}

/// In-memory task store with TTL-based retention of terminal tasks
pub struct TaskRegistry {
    tasks: RwLock<HashMap<TaskId, Task>>,
    admission: Arc<AdmissionController>,
    retention: Duration,
    max_attempts: u32,
}

impl TaskRegistry {
    /// Create a registry that retains terminal tasks for `retention` and
    /// allows at most `max_attempts` solver invocations per task
    pub fn new(admission: Arc<AdmissionController>, retention: Duration, max_attempts: u32) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            admission,
            retention,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Insert a new PENDING task
    ///
    /// The caller must already hold an admission slot for it.
    pub(crate) fn create(&self, input: TaskInput) -> TaskId {
        let now = Utc::now();
        let mut tasks = self.tasks.write();

        let mut id = TaskId::new();
        while tasks.contains_key(&id) {
            id = TaskId::new();
        }

        tasks.insert(id, Task::new(id, input, now));
        debug!(task_id = %id, "task created");
        id
    }

    /// Snapshot of a task, if it exists and has not expired
    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.get_at(id, Utc::now())
    }

    /// Like [`get`](Self::get), evaluating retention against `now`
    pub fn get_at(&self, id: TaskId, now: DateTime<Utc>) -> Option<Task> {
        let tasks = self.tasks.read();
        tasks
            .get(&id)
            .filter(|task| !self.is_expired(task, now))
            .cloned()
    }

    /// Apply a state change
    ///
    /// Rejected changes leave the task untouched.
    pub(crate) fn transition(
        &self,
        id: TaskId,
        transition: Transition,
    ) -> Result<TransitionApplied, RegistryError> {
        let now = Utc::now();
        let target = transition.target();
        let mut tasks = self.tasks.write();

        let task = tasks.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        let from = task.state;

        if from.is_terminal() {
            warn!(task_id = %id, from = %from, to = %target, "transition on terminal task rejected");
            return Err(RegistryError::AlreadyTerminal { id, state: from });
        }
        if !from.can_transition_to(target) {
            warn!(task_id = %id, from = %from, to = %target, "invalid task transition rejected");
            return Err(RegistryError::InvalidTransition {
                id,
                from,
                to: target,
            });
        }

        match transition {
            Transition::Start => {
                if task.attempt_count >= self.max_attempts {
                    warn!(task_id = %id, attempts = task.attempt_count, "attempt ceiling reached");
                    return Err(RegistryError::AttemptCeilingReached {
                        id,
                        attempts: task.attempt_count,
                    });
                }
                task.begin_attempt(now);
            }
            Transition::Succeed(solution) => task.succeed(solution, now),
            Transition::Fail(error) | Transition::TimeOut(error) => task.fail(target, error, now),
            Transition::Cancel(reason) => task.fail(target, TaskError::cancelled(reason), now),
        }

        if target.is_terminal() {
            // Capacity becomes visible no later than the terminal state.
            self.admission.release();
        }

        debug!(
            task_id = %id,
            from = %from,
            to = %target,
            attempt = task.attempt_count,
            "task transitioned"
        );

        Ok(TransitionApplied {
            state: task.state,
            attempt_count: task.attempt_count,
        })
    }

    /// Drop terminal tasks whose retention has elapsed
    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(Utc::now())
    }

    /// Like [`evict_expired`](Self::evict_expired), evaluating retention against `now`
    pub fn evict_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut tasks = self.tasks.write();
        let before = tasks.len();
        tasks.retain(|_, task| !self.is_expired(task, now));
        let evicted = before - tasks.len();

        if evicted > 0 {
            debug!(evicted, retained = tasks.len(), "evicted expired tasks");
        }
        evicted
    }

    /// Number of tasks held, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }

    pub fn count_by_state(&self) -> TaskCounts {
        let tasks = self.tasks.read();
        let mut counts = TaskCounts::default();
        for task in tasks.values() {
            match task.state {
                TaskState::Pending => counts.pending += 1,
                TaskState::Running => counts.running += 1,
                TaskState::Succeeded => counts.succeeded += 1,
                TaskState::Failed => counts.failed += 1,
                TaskState::TimedOut => counts.timed_out += 1,
                TaskState::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn is_expired(&self, task: &Task, now: DateTime<Utc>) -> bool {
        let Some(finished) = task.finished_at else {
            return false;
        };
        now.signed_duration_since(finished)
            .to_std()
            .map(|age| age >= self.retention)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskErrorKind;

    fn registry(ceiling: usize) -> (TaskRegistry, Arc<AdmissionController>) {
        let admission = Arc::new(AdmissionController::new(ceiling));
        let registry = TaskRegistry::new(admission.clone(), Duration::from_secs(60), 3);
        (registry, admission)
    }

    fn admit(registry: &TaskRegistry, admission: &AdmissionController) -> TaskId {
        admission.try_acquire().unwrap();
        registry.create(TaskInput::new("https://example.com", "0x4AAA"))
    }

    #[test]
    fn test_create_is_pending() {
        let (registry, admission) = registry(10);
        let id = admit(&registry, &admission);

        let task = registry.get(id).unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.attempt_count, 0);
        assert!(task.result.is_none());
        assert!(task.error.is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_id_is_absent() {
        let (registry, _) = registry(10);
        let id = TaskId::new();
        assert!(registry.get(id).is_none());
        assert_eq!(
            registry.transition(id, Transition::Start),
            Err(RegistryError::NotFound(id))
        );
    }

    #[test]
    fn test_success_path_releases_capacity() {
        let (registry, admission) = registry(10);
        let id = admit(&registry, &admission);
        assert_eq!(admission.outstanding(), 1);

        let applied = registry.transition(id, Transition::Start).unwrap();
        assert_eq!(applied.state, TaskState::Running);
        assert_eq!(applied.attempt_count, 1);
        assert_eq!(admission.outstanding(), 1);

        registry
            .transition(id, Transition::Succeed(Solution::new("tok")))
            .unwrap();
        assert_eq!(admission.outstanding(), 0);

        let task = registry.get(id).unwrap();
        assert_eq!(task.state, TaskState::Succeeded);
        assert_eq!(task.result.unwrap().token, "tok");
        assert!(task.error.is_none());
        assert!(task.started_at.is_some());
        assert!(task.finished_at.is_some());
    }

    #[test]
    fn test_terminal_is_immutable() {
        let (registry, admission) = registry(10);
        let id = admit(&registry, &admission);
        registry.transition(id, Transition::Start).unwrap();
        registry
            .transition(id, Transition::Fail(TaskError::solver_permanent("bad key")))
            .unwrap();

        let err = registry
            .transition(id, Transition::Succeed(Solution::new("late")))
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::AlreadyTerminal {
                id,
                state: TaskState::Failed
            }
        );

        let task = registry.get(id).unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert!(task.result.is_none());
        assert_eq!(task.error.unwrap().kind, TaskErrorKind::SolverPermanent);
        // released exactly once
        assert_eq!(admission.outstanding(), 0);
    }

    #[test]
    fn test_pending_cannot_finish_without_running() {
        let (registry, admission) = registry(10);
        let id = admit(&registry, &admission);

        let err = registry
            .transition(id, Transition::Succeed(Solution::new("tok")))
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));
        assert_eq!(registry.get(id).unwrap().state, TaskState::Pending);
        assert_eq!(admission.outstanding(), 1);
    }

    #[test]
    fn test_pending_can_be_cancelled() {
        let (registry, admission) = registry(10);
        let id = admit(&registry, &admission);

        registry
            .transition(id, Transition::Cancel("shutting down".into()))
            .unwrap();

        let task = registry.get(id).unwrap();
        assert_eq!(task.state, TaskState::Cancelled);
        assert_eq!(task.error.unwrap().kind, TaskErrorKind::Cancelled);
        assert_eq!(task.attempt_count, 0);
        assert_eq!(admission.outstanding(), 0);
    }

    #[test]
    fn test_attempt_ceiling() {
        let (registry, admission) = registry(10);
        let id = admit(&registry, &admission);

        for attempt in 1..=3 {
            let applied = registry.transition(id, Transition::Start).unwrap();
            assert_eq!(applied.attempt_count, attempt);
        }

        let err = registry.transition(id, Transition::Start).unwrap_err();
        assert_eq!(err, RegistryError::AttemptCeilingReached { id, attempts: 3 });
        assert_eq!(registry.get(id).unwrap().state, TaskState::Running);
    }

    #[test]
    fn test_started_at_set_once() {
        let (registry, admission) = registry(10);
        let id = admit(&registry, &admission);

        registry.transition(id, Transition::Start).unwrap();
        let first = registry.get(id).unwrap().started_at;
        registry.transition(id, Transition::Start).unwrap();
        assert_eq!(registry.get(id).unwrap().started_at, first);
    }

    #[test]
    fn test_retention_expiry() {
        let (registry, admission) = registry(10);
        let id = admit(&registry, &admission);
        registry.transition(id, Transition::Start).unwrap();
        registry
            .transition(id, Transition::TimeOut(TaskError::timeout("deadline")))
            .unwrap();

        let finished = registry.get(id).unwrap().finished_at.unwrap();
        let just_before = finished + chrono::Duration::seconds(59);
        let at_ttl = finished + chrono::Duration::seconds(60);

        assert!(registry.get_at(id, just_before).is_some());
        assert!(registry.get_at(id, at_ttl).is_none());

        assert_eq!(registry.evict_expired_at(just_before), 0);
        assert_eq!(registry.evict_expired_at(at_ttl), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_non_terminal_tasks_never_expire() {
        let (registry, admission) = registry(10);
        let id = admit(&registry, &admission);

        let far_future = Utc::now() + chrono::Duration::days(365);
        assert!(registry.get_at(id, far_future).is_some());
        assert_eq!(registry.evict_expired_at(far_future), 0);
    }

    #[test]
    fn test_count_by_state() {
        let (registry, admission) = registry(10);
        let a = admit(&registry, &admission);
        let b = admit(&registry, &admission);
        let _c = admit(&registry, &admission);

        registry.transition(a, Transition::Start).unwrap();
        registry.transition(b, Transition::Start).unwrap();
        registry
            .transition(b, Transition::Succeed(Solution::new("tok")))
            .unwrap();

        let counts = registry.count_by_state();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.running, 1);
        assert_eq!(counts.succeeded, 1);
        assert_eq!(counts.outstanding(), 2);
        assert_eq!(counts.total(), 3);
        assert_eq!(admission.outstanding(), 2);
    }

    #[test]
    fn test_snapshots_are_detached() {
        let (registry, admission) = registry(10);
        let id = admit(&registry, &admission);

        let mut snapshot = registry.get(id).unwrap();
        snapshot.state = TaskState::Succeeded;
        assert_eq!(registry.get(id).unwrap().state, TaskState::Pending);
    }
}
