//! Clock/Timer service.
//!
//! The only primitive asynchronous stages are built on. Timers are tasks on
//! the event-loop pool; callbacks therefore always run on an event-loop
//! thread, never on the thread that scheduled them.

use std::future::Future;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};

use crate::cancel::CancellationToken;
use crate::errors::{ExecError, ExecResult};

const MIN_INTERVAL: Duration = Duration::from_millis(1);
/// Longer intervals are clamped; about 30 years, the same horizon tokio
/// uses for a far-future sleep.
const MAX_INTERVAL: Duration = Duration::from_secs(86400 * 365 * 30);

#[derive(Clone, Debug)]
pub struct Clock {
    handle: Handle,
}

/// Handle to a pending or recurring timer.
#[derive(Clone, Debug)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    /// Deregister the timer. No tick starts after this returns; a callback
    /// already running is allowed to finish.
    pub fn cancel(&self) -> bool {
        self.token.cancel()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Clock {
    pub(crate) fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Fire `callback` once after `delay`.
    pub fn after<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let token = CancellationToken::new();
        let guard = token.clone();
        self.handle.spawn(async move {
            tokio::select! {
                biased;
                _ = guard.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if !guard.is_cancelled() {
                        callback();
                    }
                }
            }
        });
        TimerHandle { token }
    }

    /// Fire `callback(n)` every `interval`, starting one interval from now.
    ///
    /// The callback returning `Break` stops the timer.
    pub fn every<F>(&self, interval: Duration, callback: F) -> TimerHandle
    where
        F: FnMut(u64) -> ControlFlow<()> + Send + 'static,
    {
        self.every_until(interval, CancellationToken::new(), callback)
    }

    /// Like [`Clock::every`], stopped by an externally owned token.
    ///
    /// Tick `n + 1` is not awaited until the callback for tick `n` has
    /// returned. The callback is dropped on the event loop once the timer
    /// stops, whichever way it stops.
    pub fn every_until<F>(
        &self,
        interval: Duration,
        token: CancellationToken,
        mut callback: F,
    ) -> TimerHandle
    where
        F: FnMut(u64) -> ControlFlow<()> + Send + 'static,
    {
        let interval = if interval < MIN_INTERVAL {
            tracing::warn!(
                requested_ms = interval.as_millis() as u64,
                "timer interval too small, clamping to 1ms"
            );
            MIN_INTERVAL
        } else {
            interval.min(MAX_INTERVAL)
        };

        let guard = token.clone();
        self.handle.spawn(async move {
            let now = Instant::now();
            let start = now.checked_add(interval).unwrap_or(now);
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let mut n: u64 = 0;
            loop {
                tokio::select! {
                    biased;
                    _ = guard.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if guard.is_cancelled() {
                    break;
                }
                if callback(n).is_break() {
                    guard.cancel();
                    break;
                }
                n += 1;
            }
            tracing::trace!(ticks = n, "periodic timer stopped");
        });
        TimerHandle { token }
    }

    /// A future that resolves after `duration` without holding a thread.
    pub fn delay(&self, duration: Duration) -> Delay {
        let (tx, rx) = oneshot::channel();
        let timer = self.after(duration, move || {
            let _ = tx.send(());
        });
        Delay { rx, timer }
    }
}

/// Future returned by [`Clock::delay`]. Dropping it deregisters the timer.
#[derive(Debug)]
pub struct Delay {
    rx: oneshot::Receiver<()>,
    timer: TimerHandle,
}

impl Future for Delay {
    type Output = ExecResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|fired| fired.map_err(|_| ExecError::Rejected("clock is shut down".into())))
    }
}

impl Drop for Delay {
    fn drop(&mut self) {
        self.timer.cancel();
    }
}
