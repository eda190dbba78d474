//! Dispatcher-wide counters.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::dispatch::ExecutionMode;

/// Lock-free counter storage shared by the dispatcher and every pipeline it
/// drives.
#[derive(Debug)]
pub struct DispatchMetricsStorage {
    started_at: DateTime<Utc>,
    calls_received: AtomicU64,
    calls_completed: AtomicU64,
    calls_failed: AtomicU64,
    event_loop_dispatches: AtomicU64,
    blocking_dispatches: AtomicU64,
    streams_opened: AtomicU64,
    stream_items: AtomicU64,
    streams_cancelled: AtomicU64,
    illegal_blocking_uses: AtomicU64,
}

impl Default for DispatchMetricsStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchMetricsStorage {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            calls_received: AtomicU64::new(0),
            calls_completed: AtomicU64::new(0),
            calls_failed: AtomicU64::new(0),
            event_loop_dispatches: AtomicU64::new(0),
            blocking_dispatches: AtomicU64::new(0),
            streams_opened: AtomicU64::new(0),
            stream_items: AtomicU64::new(0),
            streams_cancelled: AtomicU64::new(0),
            illegal_blocking_uses: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_received(&self) {
        self.calls_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_mode(&self, mode: ExecutionMode) {
        let counter = match mode {
            ExecutionMode::EventLoop => &self.event_loop_dispatches,
            ExecutionMode::Blocking => &self.blocking_dispatches,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a finished call. Streams finish when they terminate, not when
    /// they are opened.
    pub(crate) fn record_outcome(&self, is_error: bool) {
        if is_error {
            self.calls_failed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.calls_completed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_stream_opened(&self) {
        self.streams_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stream_item(&self) {
        self.stream_items.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stream_cancelled(&self) {
        self.streams_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_illegal_blocking(&self) {
        self.illegal_blocking_uses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchMetrics {
        DispatchMetrics {
            started_at: self.started_at,
            calls_received: self.calls_received.load(Ordering::Relaxed),
            calls_completed: self.calls_completed.load(Ordering::Relaxed),
            calls_failed: self.calls_failed.load(Ordering::Relaxed),
            event_loop_dispatches: self.event_loop_dispatches.load(Ordering::Relaxed),
            blocking_dispatches: self.blocking_dispatches.load(Ordering::Relaxed),
            streams_opened: self.streams_opened.load(Ordering::Relaxed),
            stream_items: self.stream_items.load(Ordering::Relaxed),
            streams_cancelled: self.streams_cancelled.load(Ordering::Relaxed),
            illegal_blocking_uses: self.illegal_blocking_uses.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`DispatchMetricsStorage`].
///
/// Counters are monotonic; deltas are the caller's job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchMetrics {
    pub started_at: DateTime<Utc>,
    pub calls_received: u64,
    pub calls_completed: u64,
    pub calls_failed: u64,
    pub event_loop_dispatches: u64,
    pub blocking_dispatches: u64,
    pub streams_opened: u64,
    pub stream_items: u64,
    pub streams_cancelled: u64,
    pub illegal_blocking_uses: u64,
}

impl DispatchMetrics {
    /// Calls that have not finished yet (including open streams).
    pub fn in_flight(&self) -> u64 {
        self.calls_received
            .saturating_sub(self.calls_completed + self.calls_failed)
    }
}
