//! Solver port
//!
//! The dispatch core never drives a browser itself. Each worker slot owns one
//! [`SolverInstance`], obtained from a [`SolverBackend`], and hands it one
//! request at a time. Implementations must honor the deadline they are given
//! and report failures as either transient or permanent; the pool enforces
//! the deadline independently in case they don't.

pub mod simulated;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::task::{ProxyConfig, Solution, TaskId};

/// Index of a worker slot, stable for the lifetime of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId(pub usize);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

/// Whether a solver failure is worth another attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverErrorKind {
    /// Page glitch, network blip, widget did not render in time
    Transient,
    /// Invalid sitekey, blocked domain, rejected proxy
    Permanent,
}

/// Failure reported by a solver instance or backend
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct SolverError {
    pub kind: SolverErrorKind,
    /// Short machine-readable code, matched by retry policy lists
    pub code: String,
    pub message: String,
}

impl SolverError {
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: SolverErrorKind::Transient,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: SolverErrorKind::Permanent,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == SolverErrorKind::Transient
    }
}

/// One solve attempt as seen by a solver instance
#[derive(Debug, Clone)]
pub struct SolveRequest {
    pub task_id: TaskId,
    pub url: String,
    pub sitekey: String,
    pub action: Option<String>,
    pub cdata: Option<String>,
    pub proxy: Option<ProxyConfig>,
    /// 1-based attempt number
    pub attempt: u32,
}

/// A launched solver bound to a single worker slot
///
/// Never invoked concurrently: the owning slot calls `solve` for one request
/// at a time.
#[async_trait]
pub trait SolverInstance: Send {
    /// Solve a single request, giving up by `deadline`
    async fn solve(
        &mut self,
        request: &SolveRequest,
        deadline: Instant,
    ) -> Result<Solution, SolverError>;

    /// Release the underlying resources (browser context, pages)
    async fn close(self: Box<Self>);
}

/// Factory for solver instances
#[async_trait]
pub trait SolverBackend: Send + Sync {
    /// Launch the instance that will serve `slot`
    async fn launch(&self, slot: SlotId) -> Result<Box<dyn SolverInstance>, SolverError>;
}
