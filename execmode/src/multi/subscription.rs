//! Driving one subscription of a `Multi`.

use std::fmt;
use std::marker::PhantomData;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use super::{Multi, MultiSource, MultiStage};
use crate::cancel::CancellationToken;
use crate::errors::ExecError;
use crate::pipeline::stage::{Item, Stage, Tap, boxed, downcast, guarded};
use crate::runtime::ExecContext;

const ACTIVE: u8 = 0;
const COMPLETED: u8 = 1;
const FAILED: u8 = 2;
const CANCELLED: u8 = 3;

/// Receives the events of one subscription, on an event-loop thread.
///
/// Items arrive strictly in order; afterwards at most one of
/// `on_failure`, `on_completion` or `on_cancel` is called, and nothing
/// after that.
pub trait MultiSubscriber<T>: Send + 'static {
    fn on_item(&mut self, item: T);

    fn on_failure(&mut self, _error: ExecError) {}

    fn on_completion(&mut self) {}

    fn on_cancel(&mut self) {}
}

/// Consumer side of a running subscription.
#[derive(Clone)]
pub struct Subscription {
    state: Arc<AtomicU8>,
    token: CancellationToken,
}

impl Subscription {
    fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(ACTIVE)),
            token: CancellationToken::new(),
        }
    }

    /// Stop the stream and release its timer.
    ///
    /// Returns `true` if this call cancelled the stream; `false` if it had
    /// already terminated or been cancelled. An emission already in flight
    /// may still be delivered, but no new one starts.
    pub fn cancel(&self) -> bool {
        let cancelled = self
            .state
            .compare_exchange(ACTIVE, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        self.token.cancel();
        cancelled
    }

    pub fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) == ACTIVE
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state.load(Ordering::Acquire) {
            ACTIVE => "active",
            COMPLETED => "completed",
            FAILED => "failed",
            _ => "cancelled",
        };
        f.debug_struct("Subscription").field("state", &state).finish()
    }
}

impl<T: Send + 'static> Multi<T> {
    /// Start a new run of the stream, delivering to `subscriber`.
    pub fn subscribe<S>(self, ctx: &ExecContext, subscriber: S) -> Subscription
    where
        S: MultiSubscriber<T>,
    {
        let subscription = Subscription::new();
        let taken = vec![0; self.stages.len()];
        let mut driver = Driver {
            stages: self.stages,
            taken,
            subscriber,
            subscription: subscription.clone(),
            ctx: ctx.clone(),
            notified: false,
            _marker: PhantomData::<fn(T)>,
        };

        for stage in &driver.stages {
            if let MultiStage::Log(tap) = &stage.kind {
                tap.subscribed(ctx.instrumentation());
            }
        }

        let empty = driver
            .stages
            .iter()
            .any(|stage| matches!(stage.kind, MultiStage::Take(0)));

        match self.source {
            _ if empty => {
                ctx.pools().spawn(async move { driver.complete() });
            }
            MultiSource::Ticks(interval) => {
                let token = subscription.token.clone();
                ctx.clock()
                    .every_until(interval, token, move |n| driver.emit(boxed(n)));
            }
            MultiSource::Items(items) => {
                ctx.pools().spawn(async move {
                    for item in items() {
                        if driver.emit(item).is_break() {
                            return;
                        }
                        tokio::task::yield_now().await;
                    }
                    driver.complete();
                });
            }
            MultiSource::Failure(error) => {
                ctx.pools().spawn(async move { driver.fail(None, error) });
            }
        }

        subscription
    }
}

/// Owned by whatever produces items (a timer callback or a task); dropped
/// with it.
struct Driver<T, S>
where
    T: Send + 'static,
    S: MultiSubscriber<T>,
{
    stages: Vec<Stage<MultiStage>>,
    taken: Vec<u64>,
    subscriber: S,
    subscription: Subscription,
    ctx: ExecContext,
    notified: bool,
    _marker: PhantomData<fn(T)>,
}

impl<T, S> Driver<T, S>
where
    T: Send + 'static,
    S: MultiSubscriber<T>,
{
    fn emit(&mut self, mut item: Item) -> ControlFlow<()> {
        if !self.subscription.is_active() {
            return ControlFlow::Break(());
        }

        let mut exhausted = false;
        for index in 0..self.stages.len() {
            let step = match &self.stages[index].kind {
                MultiStage::Transform(f) => guarded(|| f(item)),
                MultiStage::Invoke(f) => guarded(|| f(&item)).map(|()| item),
                MultiStage::Log(tap) => {
                    tap.item(self.ctx.instrumentation(), &item);
                    Ok(item)
                }
                MultiStage::Take(n) => {
                    self.taken[index] += 1;
                    exhausted |= self.taken[index] >= *n;
                    Ok(item)
                }
            };
            match step {
                Ok(next) => item = next,
                Err(error) => {
                    self.fail(Some(index), error);
                    return ControlFlow::Break(());
                }
            }
        }

        match downcast::<T>(item) {
            Ok(value) => self.subscriber.on_item(value),
            Err(error) => {
                self.fail(None, error);
                return ControlFlow::Break(());
            }
        }

        if exhausted {
            self.complete();
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    fn finish(&mut self, state: u8) -> bool {
        let won = self
            .subscription
            .state
            .compare_exchange(ACTIVE, state, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.notified = true;
            self.subscription.token.cancel();
        }
        won
    }

    fn notify_taps(&self, from: usize, signal: impl Fn(&Tap)) {
        for stage in &self.stages[from..] {
            if let MultiStage::Log(tap) = &stage.kind {
                signal(tap);
            }
        }
    }

    fn complete(&mut self) {
        if !self.finish(COMPLETED) {
            return;
        }
        let instrumentation = self.ctx.instrumentation();
        self.notify_taps(0, |tap| tap.completed(instrumentation));
        self.subscriber.on_completion();
    }

    /// `failed_at` is the index of the failing stage; taps up to and
    /// including it never saw the item and are not told.
    fn fail(&mut self, failed_at: Option<usize>, error: ExecError) {
        if !self.finish(FAILED) {
            return;
        }
        let from = failed_at.map_or(0, |index| index + 1);
        let instrumentation = self.ctx.instrumentation();
        self.notify_taps(from, |tap| tap.failure(instrumentation, &error));
        tracing::debug!(error = %error, "multi failed");
        self.subscriber.on_failure(error);
    }
}

impl<T, S> Drop for Driver<T, S>
where
    T: Send + 'static,
    S: MultiSubscriber<T>,
{
    fn drop(&mut self) {
        if self.notified {
            return;
        }

        if self.subscription.is_cancelled() {
            self.notified = true;
            let instrumentation = self.ctx.instrumentation();
            self.notify_taps(0, |tap| tap.cancelled(instrumentation));
            self.subscriber.on_cancel();
        } else {
            // Producer went away while the stream was live: the pools are
            // shutting down.
            self.fail(None, ExecError::Rejected("event loop is shut down".into()));
        }
    }
}
