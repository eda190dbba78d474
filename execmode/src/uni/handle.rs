//! Consuming a `Uni`: non-blocking subscription or a blocking wait.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::{self, Either};
use tokio::sync::oneshot;

use super::Uni;
use super::interpreter;
use crate::cancel::CancellationToken;
use crate::errors::{ExecError, ExecResult};
use crate::pipeline::PipelineMetrics;
use crate::pipeline::stage::{Item, downcast};
use crate::runtime::{BlockingPermit, ExecContext};

const RUNNING: u8 = 0;
const RESOLVED: u8 = 1;
const CANCELLED: u8 = 2;

struct Resolution {
    outcome: ExecResult<Item>,
    metrics: Option<PipelineMetrics>,
}

impl<T: Send + 'static> Uni<T> {
    /// Start the pipeline on the event loop and return immediately.
    pub fn subscribe(self, ctx: &ExecContext) -> UniHandle<T> {
        let token = CancellationToken::new();
        let guard = token.clone();
        let state = Arc::new(AtomicU8::new(RUNNING));
        let settled = state.clone();
        let (tx, rx) = oneshot::channel();
        let parts = self.into_parts();
        let run_ctx = ctx.clone();

        ctx.pools().spawn(async move {
            let resolution = tokio::select! {
                biased;
                _ = guard.cancelled() => Resolution {
                    outcome: Err(ExecError::Cancelled),
                    metrics: None,
                },
                run = interpreter::execute(parts, run_ctx) => {
                    let won = settled
                        .compare_exchange(RUNNING, RESOLVED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok();
                    tracing::debug!(
                        total_ms = run.metrics.total_duration_ms as u64,
                        stages = run.metrics.stages.len(),
                        failed = run.outcome.is_err(),
                        cancelled = !won,
                        "uni resolved"
                    );
                    Resolution {
                        // Lost the race against cancel(): the caller was
                        // promised Cancelled.
                        outcome: if won { run.outcome } else { Err(ExecError::Cancelled) },
                        metrics: Some(run.metrics),
                    }
                }
            };
            let _ = tx.send(resolution);
        });

        UniHandle {
            rx,
            token,
            state,
            _marker: PhantomData,
        }
    }
}

/// A running `Uni`. Resolves to the pipeline's outcome.
///
/// Dropping the handle does not stop the pipeline; call
/// [`UniHandle::cancel`] for that.
#[must_use = "a UniHandle does nothing unless awaited or cancelled"]
pub struct UniHandle<T> {
    rx: oneshot::Receiver<Resolution>,
    token: CancellationToken,
    state: Arc<AtomicU8>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> UniHandle<T> {
    /// Stop the pipeline; pending timers are released and the handle
    /// resolves to `Cancelled`.
    ///
    /// Returns `false`, changing nothing, once the pipeline has resolved or
    /// was already cancelled.
    pub fn cancel(&self) -> bool {
        let cancelled = self
            .state
            .compare_exchange(RUNNING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if cancelled {
            self.token.cancel();
        }
        cancelled
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    /// The outcome together with per-stage timings. Timings are absent
    /// when the run was cancelled.
    pub async fn outcome_with_metrics(self) -> (ExecResult<T>, Option<PipelineMetrics>) {
        let received = self.rx.await;
        settle(received)
    }
}

fn settle<T: 'static>(
    received: Result<Resolution, oneshot::error::RecvError>,
) -> (ExecResult<T>, Option<PipelineMetrics>) {
    match received {
        Ok(Resolution { outcome, metrics }) => (outcome.and_then(downcast::<T>), metrics),
        Err(_) => (
            Err(ExecError::Rejected("event loop is shut down".into())),
            None,
        ),
    }
}

impl<T: 'static> Future for UniHandle<T> {
    type Output = ExecResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| settle(received).0)
    }
}

/// Blocking wait on a `Uni`, see [`Uni::await_blocking`].
///
/// Only legal off the event loop. On an event-loop thread the wait is
/// reported, then rejected or tolerated according to the context's
/// `BlockingPolicy`.
pub struct UniAwait<T> {
    uni: Uni<T>,
    ctx: Option<ExecContext>,
}

impl<T: Send + 'static> UniAwait<T> {
    pub(super) fn new(uni: Uni<T>) -> Self {
        Self { uni, ctx: None }
    }

    /// Run on `ctx` instead of the calling thread's context.
    pub fn with_context(mut self, ctx: &ExecContext) -> Self {
        self.ctx = Some(ctx.clone());
        self
    }

    pub fn indefinitely(self) -> ExecResult<T> {
        self.wait(None)
    }

    /// Give up after `limit` with a `Timeout` failure. The pipeline is
    /// cancelled.
    pub fn at_most(self, limit: Duration) -> ExecResult<T> {
        self.wait(Some(limit))
    }

    fn wait(self, limit: Option<Duration>) -> ExecResult<T> {
        let ctx = match self.ctx {
            Some(ctx) => ctx,
            None => ExecContext::current().ok_or_else(|| {
                ExecError::Internal(
                    "no execution context on this thread and no default dispatcher".into(),
                )
            })?,
        };

        let permit = ctx.blocking_permit()?;
        let handle = self.uni.subscribe(&ctx);
        let waiting = async {
            let Some(limit) = limit else {
                return handle.await;
            };
            match future::select(handle, ctx.clock().delay(limit)).await {
                Either::Left((outcome, _)) => outcome,
                Either::Right((fired, handle)) => {
                    handle.cancel();
                    fired?;
                    Err(ExecError::Timeout(limit))
                }
            }
        };

        match permit {
            BlockingPermit::Direct => futures::executor::block_on(waiting),
            BlockingPermit::InPlace => {
                tokio::task::block_in_place(|| futures::executor::block_on(waiting))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use crate::dispatch::Dispatcher;
    use crate::options::{BlockingPolicy, ExecmodeOptions};
    use crate::pipeline::RecordingInstrumentation;
    use crate::runtime::{PoolKind, current_pool};

    fn dispatcher_with(policy: BlockingPolicy) -> (Dispatcher, Arc<RecordingInstrumentation>) {
        let recorder = Arc::new(RecordingInstrumentation::new());
        let options = ExecmodeOptions {
            event_loop_threads: 2,
            worker_threads: 4,
            blocking_policy: policy,
            ..Default::default()
        };
        let dispatcher = Dispatcher::with_instrumentation(options, recorder.clone()).unwrap();
        (dispatcher, recorder)
    }

    fn dispatcher() -> Dispatcher {
        dispatcher_with(BlockingPolicy::Reject).0
    }

    fn run<T: Send + 'static>(uni: Uni<T>, dispatcher: &Dispatcher) -> ExecResult<T> {
        futures::executor::block_on(uni.subscribe(dispatcher.context()))
    }

    #[test]
    fn test_transform_applies_to_value() {
        let d = dispatcher();
        let uni = Uni::item(2_u32).on_item().transform(|n| n * 3);
        assert_eq!(run(uni, &d), Ok(6));
    }

    #[test]
    fn test_failure_skips_transform_and_is_recovered() {
        let d = dispatcher();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();

        let uni = Uni::<String>::failure(ExecError::Upstream("down".into()))
            .on_item()
            .transform(move |s| {
                counted.fetch_add(1, Ordering::SeqCst);
                s.to_uppercase()
            })
            .on_failure()
            .recover_with_item("fallback".to_string());

        assert_eq!(run(uni, &d), Ok("fallback".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_recover_leaves_values_alone() {
        let d = dispatcher();
        let uni = Uni::item(5_i32).on_failure().recover_with_item(-1);
        assert_eq!(run(uni, &d), Ok(5));

        let uni = Uni::<i32>::failure(ExecError::Timeout(Duration::from_millis(3)))
            .on_failure()
            .recover_with(|e| e.status_code() as i32);
        assert_eq!(run(uni, &d), Ok(504));
    }

    #[test]
    fn test_delay_does_not_block_subscriber() {
        let d = dispatcher();
        let start = Instant::now();
        let handle = Uni::item("late")
            .on_item()
            .delay_it()
            .by(Duration::from_millis(100))
            .subscribe(d.context());
        assert!(start.elapsed() < Duration::from_millis(50));

        assert_eq!(futures::executor::block_on(handle), Ok("late"));
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_failure_is_not_delayed() {
        let d = dispatcher();
        let start = Instant::now();
        let uni = Uni::<u8>::failure(ExecError::Cancelled)
            .on_item()
            .delay_it()
            .by(Duration::from_secs(5));
        assert_eq!(run(uni, &d), Err(ExecError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_invoke_panic_becomes_side_effect() {
        let d = dispatcher();
        let uni = Uni::item(1_u8)
            .on_item()
            .invoke(|_| panic!("logger exploded"))
            .on_item()
            .transform(|n| n + 1);
        assert_eq!(
            run(uni, &d),
            Err(ExecError::SideEffect("logger exploded".into()))
        );
    }

    #[test]
    fn test_try_invoke_error_is_recoverable() {
        let d = dispatcher();
        let uni = Uni::item(1_u8)
            .on_item()
            .try_invoke(|_| Err("disk full"))
            .on_failure()
            .recover_with(|e| {
                assert_eq!(e, ExecError::SideEffect("disk full".into()));
                9
            });
        assert_eq!(run(uni, &d), Ok(9));
    }

    #[test]
    fn test_emitter_first_completion_wins() {
        let d = dispatcher();
        let uni = Uni::emitter(|emitter| {
            assert!(emitter.complete("first"));
            assert!(!emitter.complete("second"));
            assert!(!emitter.fail(ExecError::Cancelled));
        });
        assert_eq!(run(uni, &d), Ok("first"));
    }

    #[test]
    fn test_emitter_completed_from_timer() {
        let d = dispatcher();
        let clock = d.context().clock().clone();
        let uni = Uni::emitter(move |emitter| {
            clock.after(Duration::from_millis(20), move || {
                emitter.complete(42_u64);
            });
        });
        assert_eq!(run(uni, &d), Ok(42));
    }

    #[test]
    fn test_dropped_emitter_fails() {
        let d = dispatcher();
        let uni = Uni::<u8>::emitter(drop);
        assert!(matches!(run(uni, &d), Err(ExecError::Internal(_))));
    }

    #[test]
    fn test_from_future_and_transform_to_uni() {
        let d = dispatcher();
        let uni = Uni::from_future(|| async { Ok::<_, ExecError>(20_u32) })
            .on_item()
            .transform_to_uni(|n| Uni::item(n + 1).on_item().transform(|n| n * 2));
        assert_eq!(run(uni, &d), Ok(42));
    }

    #[test]
    fn test_emit_on_moves_stages_to_worker_pool() {
        let d = dispatcher();
        let uni = Uni::item(())
            .on_item()
            .transform(|()| current_pool())
            .emit_on(PoolKind::Worker)
            .on_item()
            .transform(|before| (before, current_pool()));

        let (result, metrics) =
            futures::executor::block_on(uni.subscribe(d.context()).outcome_with_metrics());
        assert_eq!(
            result,
            Ok((Some(PoolKind::EventLoop), Some(PoolKind::Worker)))
        );
        let metrics = metrics.unwrap();
        assert_eq!(
            metrics.affinities(),
            vec![PoolKind::EventLoop, PoolKind::Worker, PoolKind::Worker]
        );
    }

    #[test]
    fn test_metrics_time_the_delay_stage() {
        let d = dispatcher();
        let uni = Uni::item(1_u8)
            .on_item()
            .delay_it()
            .by(Duration::from_millis(60));
        let (result, metrics) =
            futures::executor::block_on(uni.subscribe(d.context()).outcome_with_metrics());
        assert_eq!(result, Ok(1));
        assert!(metrics.unwrap().stage_duration_ms("delay").unwrap() >= 60);
    }

    #[test]
    fn test_log_taps_report_signals() {
        let (d, recorder) = dispatcher_with(BlockingPolicy::Reject);
        let uni = Uni::item("Hello!".to_string())
            .log("step-1")
            .on_item()
            .transform(|s| s.to_uppercase())
            .log("step-2");
        assert_eq!(run(uni, &d), Ok("HELLO!".to_string()));

        assert_eq!(
            recorder.events_for("step-1"),
            vec!["step-1.onSubscribe()", "step-1.onItem(\"Hello!\")"]
        );
        assert_eq!(
            recorder.events_for("step-2"),
            vec!["step-2.onSubscribe()", "step-2.onItem(\"HELLO!\")"]
        );
    }

    #[test]
    fn test_cancel_releases_pending_delay() {
        let d = dispatcher();
        let reached = Arc::new(AtomicUsize::new(0));
        let flag = reached.clone();
        let handle = Uni::item(1_u8)
            .on_item()
            .delay_it()
            .by(Duration::from_secs(10))
            .on_item()
            .invoke(move |_| {
                flag.fetch_add(1, Ordering::SeqCst);
            })
            .subscribe(d.context());

        assert!(handle.cancel());
        assert!(!handle.cancel());
        let start = Instant::now();
        assert_eq!(
            futures::executor::block_on(handle),
            Err(ExecError::Cancelled)
        );
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(reached.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_after_resolution_is_a_no_op() {
        let d = dispatcher();
        let handle = Uni::item(1_u8).subscribe(d.context());
        std::thread::sleep(Duration::from_millis(200));

        assert!(!handle.cancel());
        assert!(!handle.is_cancelled());
        assert_eq!(futures::executor::block_on(handle), Ok(1));
    }

    #[test]
    fn test_await_blocking_off_event_loop() {
        let d = dispatcher();
        let value = Uni::item("Woops")
            .on_item()
            .delay_it()
            .by(Duration::from_millis(30))
            .await_blocking()
            .with_context(d.context())
            .indefinitely();
        assert_eq!(value, Ok("Woops"));
    }

    #[test]
    fn test_await_blocking_at_most_times_out() {
        let d = dispatcher();
        let result = Uni::item(1_u8)
            .on_item()
            .delay_it()
            .by(Duration::from_secs(10))
            .await_blocking()
            .with_context(d.context())
            .at_most(Duration::from_millis(50));
        assert_eq!(result, Err(ExecError::Timeout(Duration::from_millis(50))));
    }

    #[test]
    fn test_await_blocking_on_event_loop_is_rejected() {
        let (d, recorder) = dispatcher_with(BlockingPolicy::Reject);
        let result = futures::executor::block_on(d.context().pools().run_on(
            PoolKind::EventLoop,
            || Uni::item(1_u8).await_blocking().indefinitely(),
        ))
        .unwrap();

        assert!(result.unwrap_err().is_illegal_blocking());
        assert_eq!(d.metrics().illegal_blocking_uses, 1);
        assert_eq!(recorder.illegal_blocking().len(), 1);
    }

    #[test]
    fn test_await_blocking_on_event_loop_tolerated_under_warn() {
        let (d, recorder) = dispatcher_with(BlockingPolicy::Warn);
        let result = futures::executor::block_on(d.context().pools().run_on(
            PoolKind::EventLoop,
            || {
                Uni::item(7_u8)
                    .on_item()
                    .delay_it()
                    .by(Duration::from_millis(20))
                    .await_blocking()
                    .indefinitely()
            },
        ))
        .unwrap();

        assert_eq!(result, Ok(7));
        assert_eq!(recorder.illegal_blocking().len(), 1);
    }

    #[test]
    fn test_await_blocking_on_worker_is_allowed() {
        let d = dispatcher();
        let result = futures::executor::block_on(d.context().pools().run_on(
            PoolKind::Worker,
            || Uni::item(3_u8).await_blocking().indefinitely(),
        ))
        .unwrap();
        assert_eq!(result, Ok(3));
        assert_eq!(d.metrics().illegal_blocking_uses, 0);
    }
}
