//! Instrumentation hooks for `log(label)` taps and blocking violations.
//!
//! Taps are side-channel only: the interpreter calls the hook and carries
//! on with the same value, so swapping the implementation can never change
//! what a pipeline produces.

use parking_lot::Mutex;

use crate::errors::ExecError;

/// What a tap observed.
#[derive(Debug, Clone, Copy)]
pub enum Signal<'a> {
    Subscribe,
    Item(&'a str),
    Failure(&'a ExecError),
    Completion,
    Cancel,
}

/// `label.onItem(value)`-style rendering shared by the built-in hooks.
pub fn describe(label: &str, signal: Signal<'_>) -> String {
    match signal {
        Signal::Subscribe => format!("{label}.onSubscribe()"),
        Signal::Item(value) => format!("{label}.onItem({value})"),
        Signal::Failure(error) => format!("{label}.onFailure({error})"),
        Signal::Completion => format!("{label}.onCompletion()"),
        Signal::Cancel => format!("{label}.cancel()"),
    }
}

pub trait Instrumentation: Send + Sync + 'static {
    fn on_signal(&self, label: &str, signal: Signal<'_>);

    /// Called when an indefinite wait is attempted on an event-loop thread.
    fn on_illegal_blocking(&self, thread: &str) {
        let _ = thread;
    }
}

/// Default hook: one `tracing` event per signal.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingInstrumentation;

impl Instrumentation for TracingInstrumentation {
    fn on_signal(&self, label: &str, signal: Signal<'_>) {
        match signal {
            Signal::Failure(_) => {
                tracing::warn!(target: "execmode::log", "{}", describe(label, signal))
            }
            _ => tracing::info!(target: "execmode::log", "{}", describe(label, signal)),
        }
    }

    fn on_illegal_blocking(&self, thread: &str) {
        tracing::error!(
            target: "execmode::log",
            thread = %thread,
            "the current thread cannot be blocked"
        );
    }
}

/// Hook that keeps every signal in memory, for tests and diagnostics.
#[derive(Debug, Default)]
pub struct RecordingInstrumentation {
    events: Mutex<Vec<String>>,
    illegal_blocking: Mutex<Vec<String>>,
}

impl RecordingInstrumentation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    /// Events recorded for one label, in order.
    pub fn events_for(&self, label: &str) -> Vec<String> {
        let prefix = format!("{label}.");
        self.events
            .lock()
            .iter()
            .filter(|e| e.starts_with(&prefix))
            .cloned()
            .collect()
    }

    /// Names of threads that attempted an illegal blocking wait.
    pub fn illegal_blocking(&self) -> Vec<String> {
        self.illegal_blocking.lock().clone()
    }
}

impl Instrumentation for RecordingInstrumentation {
    fn on_signal(&self, label: &str, signal: Signal<'_>) {
        self.events.lock().push(describe(label, signal));
    }

    fn on_illegal_blocking(&self, thread: &str) {
        self.illegal_blocking.lock().push(thread.to_string());
    }
}
