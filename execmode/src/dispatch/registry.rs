//! Route → handler table.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{ExecutionMode, Reply, TaskId};
use crate::errors::{ExecError, ExecResult};
use crate::runtime::ExecContext;

/// What a handler gets to see about the call it serves.
#[derive(Debug, Clone)]
pub struct Request {
    task_id: TaskId,
    route: String,
    mode: ExecutionMode,
    context: ExecContext,
}

impl Request {
    pub(crate) fn new(task_id: TaskId, route: &str, mode: ExecutionMode, context: ExecContext) -> Self {
        Self {
            task_id,
            route: route.to_string(),
            mode,
            context,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn context(&self) -> &ExecContext {
        &self.context
    }
}

/// A request handler. Runs on the pool its registration names and returns
/// either a finished body or a pipeline for the dispatcher to drive.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: &Request) -> ExecResult<Reply>;
}

impl<F> Handler for F
where
    F: Fn(&Request) -> ExecResult<Reply> + Send + Sync + 'static,
{
    fn handle(&self, request: &Request) -> ExecResult<Reply> {
        self(request)
    }
}

#[derive(Clone)]
pub struct Registration {
    route: String,
    mode: ExecutionMode,
    handler: Arc<dyn Handler>,
}

impl Registration {
    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub(crate) fn handler(&self) -> Arc<dyn Handler> {
        Arc::clone(&self.handler)
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("route", &self.route)
            .field("mode", &self.mode)
            .finish()
    }
}

#[derive(Default)]
pub struct HandlerRegistry {
    routes: RwLock<BTreeMap<String, Registration>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `route`. A route can only be registered
    /// once.
    pub fn register<H: Handler>(
        &self,
        route: &str,
        mode: ExecutionMode,
        handler: H,
    ) -> ExecResult<()> {
        if route.is_empty() || route.chars().any(char::is_whitespace) {
            return Err(ExecError::InvalidArgument(format!(
                "invalid route name: {:?}",
                route
            )));
        }

        let mut routes = self.routes.write();
        if routes.contains_key(route) {
            return Err(ExecError::InvalidArgument(format!(
                "route already registered: {}",
                route
            )));
        }
        routes.insert(
            route.to_string(),
            Registration {
                route: route.to_string(),
                mode,
                handler: Arc::new(handler),
            },
        );
        tracing::debug!(route = %route, mode = %mode, "registered handler");
        Ok(())
    }

    pub fn resolve(&self, route: &str) -> ExecResult<Registration> {
        self.routes
            .read()
            .get(route)
            .cloned()
            .ok_or_else(|| ExecError::NotFound(format!("no handler for route: {}", route)))
    }

    /// Registered routes and their modes, sorted by route.
    pub fn routes(&self) -> Vec<(String, ExecutionMode)> {
        self.routes
            .read()
            .values()
            .map(|r| (r.route.clone(), r.mode))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("routes", &self.routes())
            .finish()
    }
}
