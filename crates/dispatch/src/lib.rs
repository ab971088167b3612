//! # Turnstile Solve Dispatch
//!
//! Asynchronous dispatch core for CAPTCHA solve requests. Callers submit a
//! solve request, get a `task_id` back immediately, and poll for the result
//! while a fixed pool of solver instances works through the queue.
//!
//! ## Features
//!
//! - **Admission control**: a hard ceiling on outstanding (pending + running) tasks
//! - **Bounded worker pool**: exactly `N` slots, each bound to one solver instance
//! - **Deadlines and retries**: per-attempt timeouts, classified retries with backoff
//! - **Retention**: terminal results stay queryable for a TTL, then get evicted
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Dispatcher                            │
//! │        submit(input) -> task_id      poll(task_id)           │
//! └─────────────────────────────────────────────────────────────┘
//!          │                    │                    │
//!          ▼                    ▼                    ▼
//! ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────┐
//! │   Admission     │  │  TaskRegistry   │◄─│   WorkerPool    │
//! │   Controller    │◄─│ (state, TTL)    │  │ (FIFO + slots)  │
//! └─────────────────┘  └─────────────────┘  └─────────────────┘
//!                                                    │
//!                                                    ▼
//!                                  ┌─────────────────────────────┐
//!                                  │ SolverBackend / Instance    │
//!                                  │ (one browser per slot)      │
//!                                  └─────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use turnstile_dispatch::prelude::*;
//!
//! let config = DispatcherConfig::default().with_worker_count(4);
//! let dispatcher = Dispatcher::new(config, Arc::new(SimulatedBackend::new()))?;
//! dispatcher.start()?;
//!
//! let task_id = dispatcher.submit(TaskInput::new("https://example.com", "0x4AAAAAAA"))?;
//! let view = dispatcher.poll(task_id)?;
//! ```

pub mod admission;
pub mod config;
pub mod dispatcher;
pub mod pool;
pub mod registry;
pub mod retry;
pub mod solver;
pub mod task;
pub mod telemetry;

mod duration_millis;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{ConfigError, DispatcherConfig};
    pub use crate::dispatcher::{DispatchError, Dispatcher, DispatcherStats};
    pub use crate::pool::{ShutdownReport, WorkerPoolConfig};
    pub use crate::retry::RetryPolicy;
    pub use crate::solver::simulated::{SimulatedBackend, SimulatedStep};
    pub use crate::solver::{
        SlotId, SolveRequest, SolverBackend, SolverError, SolverErrorKind, SolverInstance,
    };
    pub use crate::task::{
        Solution, SolveOptions, TaskError, TaskErrorKind, TaskId, TaskInput, TaskState, TaskView,
    };
}

// Re-export key types at crate root
pub use admission::{AdmissionController, CapacityExceeded};
pub use config::{ConfigError, DispatcherConfig};
pub use dispatcher::{DispatchError, Dispatcher, DispatcherStats};
pub use pool::{
    ShutdownReport, SlotStatus, WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus,
};
pub use registry::{RegistryError, TaskCounts, TaskRegistry};
pub use retry::{FailureClass, RetryPolicy};
pub use solver::{SlotId, SolveRequest, SolverBackend, SolverError, SolverErrorKind, SolverInstance};
pub use task::{
    InputError, ProxyConfig, Solution, SolutionCookie, SolveOptions, Task, TaskError,
    TaskErrorKind, TaskId, TaskInput, TaskState, TaskView,
};
