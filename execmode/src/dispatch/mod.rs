//! Execution-mode dispatcher.
//!
//! Resolves a route to its handler, runs the handler on the pool its mode
//! names, then drives whatever it returned: a plain body is answered at
//! once, a `Uni` when it resolves, a `Multi` item by item.
//!
//! ```text
//! dispatch(route)
//!   └─ HandlerRegistry::resolve   route -> handler + mode
//!        └─ submit(Task)          event-loop | worker pool
//!             └─ Reply            Plain | Single(Uni) | Multi(Multi)
//!                  └─ Response    Body | Error | Stream
//! ```

mod mode;
mod registry;
mod response;
mod task;

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use futures::future::{self, BoxFuture};

pub use mode::{CallState, ExecutionMode};
pub use registry::{Handler, HandlerRegistry, Registration, Request};
pub use response::{Reply, Response, SSE_FRAME_BUFFER, StreamResponse, StreamSink};
pub use task::{Task, TaskId};

use crate::errors::{ExecError, ExecResult};
use crate::metrics::{DispatchMetrics, DispatchMetricsStorage};
use crate::options::ExecmodeOptions;
use crate::pipeline::stage::guarded;
use crate::pipeline::{Instrumentation, TracingInstrumentation};
use crate::runtime::{ContextSlot, ExecContext, Pools};

// ============================================================================
// GLOBAL DEFAULT DISPATCHER
// ============================================================================

/// Global default dispatcher (lazy initialization).
static DEFAULT_DISPATCHER: OnceLock<Dispatcher> = OnceLock::new();

// ============================================================================
// PUBLIC API
// ============================================================================

/// Dispatcher routes calls to handlers and drives what they return.
///
/// **Architecture**: Owns two thread pools (event loop and worker) plus the
/// handler registry. Each call resolves its route, runs the handler on the
/// pool named by its `ExecutionMode`, then resolves the `Reply` on the
/// event loop. No lock is held across a suspension point.
///
/// **Shutdown**: The pools stop when the last clone is dropped (without
/// waiting), or through [`Dispatcher::shutdown`] (waiting up to a timeout).
///
/// **Cloning**: Dispatcher is cheaply cloneable via `Arc` - all clones share
/// the same pools, registry and metrics.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    // ========================================================================
    // INTERNALLY SYNCHRONIZED: registry has its own RwLock, metrics are atomic
    // ========================================================================
    registry: HandlerRegistry,
    metrics: Arc<DispatchMetricsStorage>,

    // ========================================================================
    // IMMUTABLE AFTER INIT
    // ========================================================================
    context: ExecContext,
    options: ExecmodeOptions,
    // Declared last so it drops last.
    _pools: Pools,
}

// ============================================================================
// DISPATCHER IMPLEMENTATION
// ============================================================================

impl Dispatcher {
    pub fn new(options: ExecmodeOptions) -> ExecResult<Self> {
        Self::with_instrumentation(options, Arc::new(TracingInstrumentation))
    }

    /// Like [`Dispatcher::new`], reporting `log` taps and blocking
    /// violations to `instrumentation`.
    pub fn with_instrumentation(
        options: ExecmodeOptions,
        instrumentation: Arc<dyn Instrumentation>,
    ) -> ExecResult<Self> {
        options.sanitize()?;

        let slot = ContextSlot::default();
        let pools = Pools::build(&options, slot.clone())?;
        let metrics = Arc::new(DispatchMetricsStorage::new());
        let context = ExecContext::new(
            pools.handles().clone(),
            instrumentation,
            metrics.clone(),
            options.blocking_policy,
        );
        // Threads spawned from here on can find their context.
        let _ = slot.set(context.downgrade());

        tracing::debug!(
            event_loop_threads = options.event_loop_threads,
            worker_threads = options.worker_threads,
            blocking_policy = ?options.blocking_policy,
            "initialized dispatcher"
        );

        Ok(Self {
            inner: Arc::new(DispatcherInner {
                context,
                registry: HandlerRegistry::new(),
                metrics,
                options,
                _pools: pools,
            }),
        })
    }

    pub fn with_defaults() -> ExecResult<Self> {
        Self::new(ExecmodeOptions::default())
    }

    /// Get or initialize the global default dispatcher.
    ///
    /// # Panics
    ///
    /// Panics if the thread pools cannot be created.
    pub fn default_dispatcher() -> &'static Self {
        DEFAULT_DISPATCHER.get_or_init(|| {
            Self::with_defaults().expect("Failed to initialize default Dispatcher")
        })
    }

    /// The default dispatcher, if it has been initialized.
    pub fn try_default() -> Option<&'static Self> {
        DEFAULT_DISPATCHER.get()
    }

    /// Initialize the default dispatcher with custom options. Must run
    /// before the first `default_dispatcher()` call.
    pub fn init_default(options: ExecmodeOptions) -> ExecResult<&'static Self> {
        let dispatcher = Self::new(options)?;
        DEFAULT_DISPATCHER.set(dispatcher).map_err(|_| {
            ExecError::Internal(
                "Default dispatcher already initialized. Call init_default() before any use of default_dispatcher().".into(),
            )
        })?;
        Ok(Self::default_dispatcher())
    }

    pub fn register<H: Handler>(&self, route: &str, mode: ExecutionMode, handler: H) -> ExecResult<()> {
        self.inner.registry.register(route, mode, handler)
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    pub fn context(&self) -> &ExecContext {
        &self.inner.context
    }

    pub fn options(&self) -> &ExecmodeOptions {
        &self.inner.options
    }

    pub fn metrics(&self) -> DispatchMetrics {
        self.inner.metrics.snapshot()
    }

    /// Shut both pools down, waiting up to `timeout` for running work.
    ///
    /// Only the last clone can do this; on any other it returns `false`
    /// and changes nothing. Must not be called from a pool thread.
    pub fn shutdown(self, timeout: Duration) -> bool {
        match Arc::try_unwrap(self.inner) {
            Ok(inner) => {
                let DispatcherInner { _pools: pools, .. } = inner;
                pools.shutdown_timeout(timeout);
                tracing::debug!("dispatcher shut down");
                true
            }
            Err(_) => false,
        }
    }

    /// Run `task` on the pool its mode names.
    ///
    /// A panic in the task becomes a `SideEffect` failure. A task whose
    /// token is cancelled before it starts fails with `Cancelled`.
    pub fn submit<R: Send + 'static>(&self, task: Task<R>) -> BoxFuture<'static, ExecResult<R>> {
        let Task {
            id,
            route,
            mode,
            cancellation,
            work,
        } = task;

        if cancellation.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Box::pin(future::ready(Err(ExecError::Cancelled)));
        }

        tracing::trace!(task_id = %id, route = %route, mode = %mode, "submitting task");
        let running = self.context().pools().run_on(mode.pool(), move || {
            if cancellation.as_ref().is_some_and(|t| t.is_cancelled()) {
                return Err(ExecError::Cancelled);
            }
            guarded(work)
        });
        Box::pin(async move { running.await? })
    }

    /// Serve one call of `route`.
    pub async fn dispatch(&self, route: &str) -> Response {
        let started = Instant::now();
        let task_id = TaskId::new();
        let metrics = &self.inner.metrics;
        metrics.record_received();
        let mut state = CallState::Received;

        let registration = match self.inner.registry.resolve(route) {
            Ok(registration) => registration,
            Err(error) => {
                advance(&mut state, CallState::Failed, task_id);
                tracing::debug!(task_id = %task_id, route = %route, error = %error, "call rejected");
                metrics.record_outcome(true);
                return Response::Error(error);
            }
        };

        let mode = registration.mode();
        metrics.record_mode(mode);
        advance(&mut state, CallState::ModeSelected(mode), task_id);

        let request = Request::new(task_id, route, mode, self.context().clone());
        let handler = registration.handler();
        let task = Task::with_id(task_id, route, mode, move || handler.handle(&request));
        advance(&mut state, CallState::Executing, task_id);

        let response = match self.submit(task).await {
            Err(error) => Response::Error(error),
            Ok(Reply::Plain(body)) => Response::Body(body),
            Ok(Reply::Single(uni)) => match uni.subscribe(self.context()).await {
                Ok(body) => Response::Body(body),
                Err(error) => Response::Error(error),
            },
            Ok(Reply::Multi(multi)) => {
                // Finished (and counted) when the stream terminates.
                metrics.record_stream_opened();
                tracing::debug!(task_id = %task_id, route = %route, mode = %mode, "stream opened");
                return Response::Stream(StreamResponse::new(
                    task_id,
                    route,
                    multi,
                    self.context().clone(),
                    metrics.clone(),
                ));
            }
        };

        let failed = response.is_error();
        metrics.record_outcome(failed);
        advance(
            &mut state,
            if failed { CallState::Failed } else { CallState::Completed },
            task_id,
        );

        match response.error() {
            Some(error) => tracing::warn!(
                task_id = %task_id,
                route = %route,
                mode = %mode,
                status = response.status_code(),
                error = %error,
                "call failed"
            ),
            None => tracing::debug!(
                task_id = %task_id,
                route = %route,
                mode = %mode,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "call completed"
            ),
        }
        response
    }
}

// ============================================================================
// INTERNAL HELPERS
// ============================================================================

fn advance(state: &mut CallState, next: CallState, task_id: TaskId) {
    debug_assert!(
        state.can_advance_to(next),
        "illegal call transition {:?} -> {:?}",
        state,
        next
    );
    tracing::trace!(task_id = %task_id, from = ?state, to = ?next, "call state");
    *state = next;
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.inner.registry)
            .field("options", &self.inner.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    use crate::cancel::CancellationToken;
    use crate::runtime::{PoolKind, current_pool};
    use crate::uni::Uni;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(ExecmodeOptions {
            event_loop_threads: 1,
            worker_threads: 4,
            ..Default::default()
        })
        .unwrap()
    }

    fn pool_reporter(request: &Request) -> ExecResult<Reply> {
        let _ = request.task_id();
        Ok(Reply::Plain(format!("{:?}", current_pool())))
    }

    #[test]
    fn test_mode_selects_pool() {
        let d = dispatcher();
        d.register("loop", ExecutionMode::EventLoop, pool_reporter).unwrap();
        d.register("block", ExecutionMode::Blocking, pool_reporter).unwrap();

        let on_loop = futures::executor::block_on(d.dispatch("loop"));
        assert_eq!(on_loop.body(), Some("Some(EventLoop)"));
        let on_worker = futures::executor::block_on(d.dispatch("block"));
        assert_eq!(on_worker.body(), Some("Some(Worker)"));

        let metrics = d.metrics();
        assert_eq!(metrics.event_loop_dispatches, 1);
        assert_eq!(metrics.blocking_dispatches, 1);
        assert_eq!(metrics.calls_completed, 2);
    }

    #[test]
    fn test_unknown_route_is_not_found() {
        let d = dispatcher();
        let response = futures::executor::block_on(d.dispatch("missing"));
        assert_eq!(response.status_code(), 404);
        assert_eq!(d.metrics().calls_failed, 1);
    }

    #[test]
    fn test_single_reply_resolves_to_body_or_error() {
        let d = dispatcher();
        d.register("ok", ExecutionMode::EventLoop, |_: &Request| -> ExecResult<Reply> {
            Ok(Reply::from(Uni::item("done".to_string())))
        })
        .unwrap();
        d.register("boom", ExecutionMode::EventLoop, |_: &Request| -> ExecResult<Reply> {
            Ok(Reply::from(Uni::<String>::failure(ExecError::Upstream("down".into()))))
        })
        .unwrap();

        assert_eq!(futures::executor::block_on(d.dispatch("ok")).body(), Some("done"));
        let failed = futures::executor::block_on(d.dispatch("boom"));
        assert_eq!(failed.status_code(), 502);
    }

    #[test]
    fn test_handler_panic_becomes_error_response() {
        let d = dispatcher();
        d.register("panics", ExecutionMode::Blocking, |_: &Request| -> ExecResult<Reply> {
            panic!("handler bug")
        })
        .unwrap();
        let response = futures::executor::block_on(d.dispatch("panics"));
        assert_eq!(
            response.error(),
            Some(&ExecError::SideEffect("handler bug".into()))
        );
    }

    #[test]
    fn test_blocking_handler_does_not_stall_event_loop() {
        let d = dispatcher();
        d.register("slow", ExecutionMode::Blocking, |_: &Request| -> ExecResult<Reply> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(Reply::from("slow"))
        })
        .unwrap();
        d.register("fast", ExecutionMode::EventLoop, |_: &Request| -> ExecResult<Reply> {
            Ok(Reply::from("fast"))
        })
            .unwrap();

        let slow = {
            let d = d.clone();
            std::thread::spawn(move || futures::executor::block_on(d.dispatch("slow")))
        };
        std::thread::sleep(Duration::from_millis(20));

        let start = Instant::now();
        let fast = futures::executor::block_on(d.dispatch("fast"));
        assert_eq!(fast.body(), Some("fast"));
        assert!(start.elapsed() < Duration::from_millis(150));

        assert_eq!(slow.join().unwrap().body(), Some("slow"));
    }

    #[test]
    fn test_submit_runs_on_named_pool() {
        let d = dispatcher();
        let task = Task::new("probe", ExecutionMode::Blocking, || Ok(current_pool()));
        assert_eq!(
            futures::executor::block_on(d.submit(task)),
            Ok(Some(PoolKind::Worker))
        );
    }

    #[test]
    fn test_submit_skips_cancelled_task() {
        let d = dispatcher();
        let token = CancellationToken::new();
        token.cancel();
        let task = Task::new("probe", ExecutionMode::EventLoop, || -> ExecResult<u8> {
            panic!("must not run")
        })
        .with_cancellation(token);
        assert_eq!(
            futures::executor::block_on(d.submit(task)),
            Err(ExecError::Cancelled)
        );
    }

    #[test]
    fn test_stream_response_delivers_to_sink() {
        struct Collect(mpsc::Sender<String>);
        impl StreamSink for Collect {
            fn on_emit(&mut self, item: String) {
                let _ = self.0.send(item);
            }
            fn on_complete(&mut self) {
                let _ = self.0.send("<complete>".into());
            }
        }

        let d = dispatcher();
        d.register("letters", ExecutionMode::EventLoop, |_: &Request| -> ExecResult<Reply> {
            Ok(Reply::from(crate::multi::Multi::items(vec![
                "a".to_string(),
                "b".to_string(),
            ])))
        })
        .unwrap();

        let stream = futures::executor::block_on(d.dispatch("letters"))
            .into_stream()
            .unwrap();
        let (tx, rx) = mpsc::channel();
        stream.deliver(Collect(tx));

        let received: Vec<String> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(received, vec!["a", "b", "<complete>"]);

        let metrics = d.metrics();
        assert_eq!(metrics.streams_opened, 1);
        assert_eq!(metrics.stream_items, 2);
        assert_eq!(metrics.in_flight(), 0);
    }

    fn register_letters(d: &Dispatcher, count: usize) {
        d.register("letters", ExecutionMode::EventLoop, move |_: &Request| -> ExecResult<Reply> {
            Ok(Reply::from(crate::multi::Multi::items(
                (0..count).map(|n| format!("letter {}", n)),
            )))
        })
        .unwrap();
    }

    fn wait_for(d: &Dispatcher, done: impl Fn(&DispatchMetrics) -> bool) -> DispatchMetrics {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let metrics = d.metrics();
            if done(&metrics) || Instant::now() > deadline {
                return metrics;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_undelivered_stream_counts_as_cancelled() {
        let d = dispatcher();
        register_letters(&d, 3);

        let response = futures::executor::block_on(d.dispatch("letters"));
        assert_eq!(d.metrics().in_flight(), 1);
        drop(response);

        let metrics = d.metrics();
        assert_eq!(metrics.streams_cancelled, 1);
        assert_eq!(metrics.stream_items, 0);
        assert_eq!(metrics.in_flight(), 0);
    }

    #[test]
    fn test_unread_sse_frames_cancel_when_buffer_is_full() {
        use futures::StreamExt;

        let d = dispatcher();
        register_letters(&d, SSE_FRAME_BUFFER * 4);

        let frames = futures::executor::block_on(d.dispatch("letters"))
            .into_stream()
            .unwrap()
            .sse_frames();

        let metrics = wait_for(&d, |m| m.streams_cancelled == 1);
        assert_eq!(metrics.streams_cancelled, 1);
        assert_eq!(metrics.in_flight(), 0);

        // Only what fit in the buffer was kept; the stream then ends.
        let frames: Vec<String> = futures::executor::block_on(frames.collect());
        assert_eq!(frames.len(), SSE_FRAME_BUFFER);
        assert_eq!(frames[0], "data: letter 0\n\n");
    }

    #[test]
    fn test_shutdown_by_last_clone_only() {
        let d = dispatcher();
        let context = d.context().clone();
        assert!(!d.clone().shutdown(Duration::from_secs(1)));
        assert!(d.shutdown(Duration::from_secs(1)));

        let late = futures::executor::block_on(context.clock().delay(Duration::from_millis(5)));
        assert!(matches!(late, Err(ExecError::Rejected(_))));
    }

    #[test]
    fn test_default_dispatcher_is_shared() {
        let first = Dispatcher::default_dispatcher();
        assert!(Dispatcher::try_default().is_some());
        assert!(Dispatcher::init_default(ExecmodeOptions::default()).is_err());
        assert!(std::ptr::eq(first, Dispatcher::default_dispatcher()));
    }
}
