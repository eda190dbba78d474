//! Units of work handed to a pool.

use std::fmt;

use ulid::Ulid;

use super::ExecutionMode;
use crate::cancel::CancellationToken;
use crate::errors::ExecResult;

/// Identifier of one task, sortable by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(Ulid);

impl TaskId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub(crate) type Work<R> = Box<dyn FnOnce() -> ExecResult<R> + Send>;

pub struct Task<R> {
    pub(crate) id: TaskId,
    pub(crate) route: String,
    pub(crate) mode: ExecutionMode,
    pub(crate) cancellation: Option<CancellationToken>,
    pub(crate) work: Work<R>,
}

impl<R: Send + 'static> Task<R> {
    pub fn new<F>(route: impl Into<String>, mode: ExecutionMode, work: F) -> Self
    where
        F: FnOnce() -> ExecResult<R> + Send + 'static,
    {
        Self::with_id(TaskId::new(), route, mode, work)
    }

    pub(crate) fn with_id<F>(id: TaskId, route: impl Into<String>, mode: ExecutionMode, work: F) -> Self
    where
        F: FnOnce() -> ExecResult<R> + Send + 'static,
    {
        Self {
            id,
            route: route.into(),
            mode,
            cancellation: None,
            work: Box::new(work),
        }
    }

    /// Skip the work if `token` is cancelled before a pool thread picks
    /// the task up.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }
}

impl<R> fmt::Debug for Task<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("route", &self.route)
            .field("mode", &self.mode)
            .field("cancellable", &self.cancellation.is_some())
            .finish()
    }
}
