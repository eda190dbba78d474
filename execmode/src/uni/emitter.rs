//! Producer-side handle for `Uni::emitter`.

use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::errors::{ExecError, ExecResult};
use crate::pipeline::stage::{Item, boxed};

pub(crate) type EmitterSlot = Arc<Mutex<Option<oneshot::Sender<ExecResult<Item>>>>>;

pub(crate) fn slot() -> (EmitterSlot, oneshot::Receiver<ExecResult<Item>>) {
    let (tx, rx) = oneshot::channel();
    (Arc::new(Mutex::new(Some(tx))), rx)
}

/// Resolves a `Uni` from producer code, exactly once.
///
/// Clones share the same slot. The first `complete` or `fail` wins; later
/// calls are ignored and return `false`.
pub struct UniEmitter<T> {
    slot: EmitterSlot,
    _marker: PhantomData<fn(T)>,
}

impl<T> Clone for UniEmitter<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
            _marker: PhantomData,
        }
    }
}

impl<T: Send + 'static> UniEmitter<T> {
    pub(crate) fn new(slot: EmitterSlot) -> Self {
        Self {
            slot,
            _marker: PhantomData,
        }
    }

    pub fn complete(&self, value: T) -> bool {
        self.resolve(Ok(boxed(value)))
    }

    pub fn fail(&self, error: ExecError) -> bool {
        self.resolve(Err(error))
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.lock().is_none()
    }

    fn resolve(&self, outcome: ExecResult<Item>) -> bool {
        let Some(tx) = self.slot.lock().take() else {
            tracing::trace!("ignoring repeated resolution of a uni emitter");
            return false;
        };
        // The subscriber may already be gone (cancelled); the resolution
        // still counts as the one and only.
        let _ = tx.send(outcome);
        true
    }
}
