//! The two thread pools every dispatcher owns.
//!
//! - **event loop**: fixed, small (one thread per core by default). Runs
//!   handler bodies, pipeline interpreters and timer callbacks. Must never
//!   block.
//! - **worker**: elastic, bounded. Runs handlers declared blocking and
//!   stages pinned to it with `emit_on`.
//!
//! Each pool thread records which pool it belongs to in a thread-local so
//! blocking primitives can tell whether they are allowed to wait.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::{JoinError, JoinHandle};

use super::context::ContextInner;
use crate::errors::{ExecError, ExecResult};
use crate::options::ExecmodeOptions;

/// Which pool a thread, a task or a stage belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolKind {
    EventLoop,
    Worker,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolKind::EventLoop => write!(f, "event-loop"),
            PoolKind::Worker => write!(f, "worker"),
        }
    }
}

/// Late-bound pointer from pool threads back to their execution context.
///
/// Threads start while the runtimes are still being built, before the
/// context exists, so the slot is filled afterwards. Weak, so the runtimes
/// do not keep their own context alive.
pub(crate) type ContextSlot = Arc<OnceLock<Weak<ContextInner>>>;

#[derive(Clone)]
struct ThreadTag {
    kind: PoolKind,
    context: ContextSlot,
}

thread_local! {
    static THREAD_TAG: RefCell<Option<ThreadTag>> = const { RefCell::new(None) };
}

/// The pool the calling thread belongs to, if any.
pub fn current_pool() -> Option<PoolKind> {
    THREAD_TAG.with(|tag| tag.borrow().as_ref().map(|t| t.kind))
}

pub(crate) fn current_context_inner() -> Option<Arc<ContextInner>> {
    THREAD_TAG.with(|tag| {
        tag.borrow()
            .as_ref()
            .and_then(|t| t.context.get())
            .and_then(Weak::upgrade)
    })
}

fn tag_thread(kind: PoolKind, context: ContextSlot) -> impl Fn() + Send + Sync + 'static {
    move || {
        THREAD_TAG.with(|tag| {
            *tag.borrow_mut() = Some(ThreadTag {
                kind,
                context: context.clone(),
            });
        });
    }
}

fn untag_thread() {
    THREAD_TAG.with(|tag| tag.borrow_mut().take());
}

fn thread_names(prefix: &'static str) -> impl Fn() -> String + Send + Sync + 'static {
    let next = Arc::new(AtomicUsize::new(0));
    move || format!("{}-{}", prefix, next.fetch_add(1, Ordering::Relaxed))
}

/// Cloneable submission side of the pools.
#[derive(Clone, Debug)]
pub struct PoolHandles {
    event_loop: Handle,
    worker: Handle,
}

impl PoolHandles {
    pub fn event_loop(&self) -> &Handle {
        &self.event_loop
    }

    /// Spawn a non-blocking future on the event loop.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.event_loop.spawn(future)
    }

    /// Run a synchronous function on the named pool.
    ///
    /// On the event loop `f` runs inside a task and must not block; on the
    /// worker pool it gets a dedicated thread and may wait freely.
    pub fn run_on<F, R>(&self, kind: PoolKind, f: F) -> BoxFuture<'static, ExecResult<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let handle = match kind {
            PoolKind::EventLoop => self.event_loop.spawn(async move { f() }),
            PoolKind::Worker => self.worker.spawn_blocking(f),
        };
        Box::pin(async move { handle.await.map_err(join_error) })
    }
}

fn join_error(e: JoinError) -> ExecError {
    if e.is_panic() {
        ExecError::from_panic(e.into_panic())
    } else {
        ExecError::Rejected("pool is shut down".into())
    }
}

/// Owner of both runtimes.
///
/// **Architecture**: Two tokio runtimes. The event loop is a multi-thread
/// scheduler with `event_loop_threads` workers. The worker pool keeps one
/// scheduler thread and runs its jobs through `spawn_blocking`, bounded by
/// `worker_threads`.
///
/// **Shutdown**: Dropping it shuts both runtimes down without waiting;
/// [`Pools::shutdown_timeout`] waits.
pub(crate) struct Pools {
    event_loop: Option<Runtime>,
    worker: Option<Runtime>,
    handles: PoolHandles,
}

impl Pools {
    pub(crate) fn build(options: &ExecmodeOptions, context: ContextSlot) -> ExecResult<Self> {
        let event_loop = Builder::new_multi_thread()
            .worker_threads(options.event_loop_threads)
            .thread_name_fn(thread_names("event-loop"))
            .on_thread_start(tag_thread(PoolKind::EventLoop, context.clone()))
            .on_thread_stop(untag_thread)
            .enable_all()
            .build()
            .map_err(|e| ExecError::Internal(format!("Failed to build event-loop pool: {}", e)))?;

        // One scheduler thread; the blocking threads are the pool proper.
        let worker = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(options.worker_threads)
            .thread_keep_alive(options.worker_keep_alive())
            .thread_name_fn(thread_names("worker"))
            .on_thread_start(tag_thread(PoolKind::Worker, context))
            .on_thread_stop(untag_thread)
            .enable_all()
            .build()
            .map_err(|e| ExecError::Internal(format!("Failed to build worker pool: {}", e)))?;

        tracing::debug!(
            event_loop_threads = options.event_loop_threads,
            worker_threads = options.worker_threads,
            "built thread pools"
        );

        let handles = PoolHandles {
            event_loop: event_loop.handle().clone(),
            worker: worker.handle().clone(),
        };

        Ok(Self {
            event_loop: Some(event_loop),
            worker: Some(worker),
            handles,
        })
    }

    pub(crate) fn handles(&self) -> &PoolHandles {
        &self.handles
    }

    /// Shut down both pools, waiting up to `timeout` for each.
    ///
    /// Must not be called from an async context.
    pub(crate) fn shutdown_timeout(mut self, timeout: Duration) {
        if let Some(rt) = self.event_loop.take() {
            rt.shutdown_timeout(timeout);
        }
        if let Some(rt) = self.worker.take() {
            rt.shutdown_timeout(timeout);
        }
    }
}

impl Drop for Pools {
    fn drop(&mut self) {
        if let Some(rt) = self.event_loop.take() {
            rt.shutdown_background();
        }
        if let Some(rt) = self.worker.take() {
            rt.shutdown_background();
        }
    }
}
