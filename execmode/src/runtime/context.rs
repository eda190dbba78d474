//! Execution context: everything a pipeline needs to run.
//!
//! A context is cheap to clone and is what handlers, pipelines and timers
//! carry around instead of the dispatcher itself. Pool threads can find
//! the context of the pools they belong to through [`ExecContext::current`].

use std::fmt;
use std::sync::{Arc, Weak};

use super::pools::{self, PoolHandles, PoolKind};
use crate::clock::Clock;
use crate::dispatch::Dispatcher;
use crate::errors::{ExecError, ExecResult};
use crate::metrics::DispatchMetricsStorage;
use crate::options::BlockingPolicy;
use crate::pipeline::Instrumentation;

/// Handle to the pools, clock and hooks of one dispatcher.
///
/// **Architecture**: Created once per dispatcher, after its pools. Pool
/// threads hold a `Weak` back-reference to it, so a context never keeps its
/// own pools alive.
///
/// **Cloning**: Cheaply cloneable via `Arc` - all clones share the same
/// pools, clock, instrumentation and metrics.
#[derive(Clone)]
pub struct ExecContext {
    inner: Arc<ContextInner>,
}

pub(crate) struct ContextInner {
    pools: PoolHandles,
    clock: Clock,
    instrumentation: Arc<dyn Instrumentation>,
    metrics: Arc<DispatchMetricsStorage>,
    blocking_policy: BlockingPolicy,
}

/// How the calling thread is allowed to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockingPermit {
    /// Not an event-loop thread: block directly.
    Direct,
    /// Event-loop thread under `BlockingPolicy::Warn`: block after handing
    /// the thread's queued work to a replacement thread.
    InPlace,
}

impl ExecContext {
    pub(crate) fn new(
        pools: PoolHandles,
        instrumentation: Arc<dyn Instrumentation>,
        metrics: Arc<DispatchMetricsStorage>,
        blocking_policy: BlockingPolicy,
    ) -> Self {
        let clock = Clock::new(pools.event_loop().clone());
        Self {
            inner: Arc::new(ContextInner {
                pools,
                clock,
                instrumentation,
                metrics,
                blocking_policy,
            }),
        }
    }

    /// Context of the pool the calling thread belongs to, falling back to
    /// the default dispatcher if one was initialized.
    pub fn current() -> Option<Self> {
        pools::current_context_inner()
            .map(|inner| Self { inner })
            .or_else(|| Dispatcher::try_default().map(|d| d.context().clone()))
    }

    pub(crate) fn downgrade(&self) -> Weak<ContextInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn pools(&self) -> &PoolHandles {
        &self.inner.pools
    }

    pub fn clock(&self) -> &Clock {
        &self.inner.clock
    }

    pub fn instrumentation(&self) -> &dyn Instrumentation {
        self.inner.instrumentation.as_ref()
    }

    pub fn metrics(&self) -> &DispatchMetricsStorage {
        &self.inner.metrics
    }

    pub fn blocking_policy(&self) -> BlockingPolicy {
        self.inner.blocking_policy
    }

    /// Decide whether the calling thread may perform an indefinite wait.
    ///
    /// Every attempt from an event-loop thread is counted and reported to
    /// the instrumentation hook, whatever the policy.
    pub(crate) fn blocking_permit(&self) -> ExecResult<BlockingPermit> {
        if pools::current_pool() != Some(PoolKind::EventLoop) {
            return Ok(BlockingPermit::Direct);
        }

        let thread = std::thread::current()
            .name()
            .unwrap_or("unnamed")
            .to_string();
        self.metrics().record_illegal_blocking();
        self.instrumentation().on_illegal_blocking(&thread);

        match self.blocking_policy() {
            BlockingPolicy::Reject => {
                tracing::error!(thread = %thread, "rejected indefinite wait on event-loop thread");
                Err(ExecError::IllegalBlockingUse { thread })
            }
            BlockingPolicy::Warn => {
                tracing::warn!(thread = %thread, "blocking an event-loop thread");
                Ok(BlockingPermit::InPlace)
            }
        }
    }
}

impl fmt::Debug for ExecContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecContext")
            .field("blocking_policy", &self.inner.blocking_policy)
            .finish()
    }
}
