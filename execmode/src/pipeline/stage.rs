//! Stage definitions shared by single-value and multi-value pipelines.
//!
//! Pipelines are not nested closures: they are an ordered list of tagged
//! stages that an interpreter walks. Values travel between stages
//! type-erased; the typed builders in `uni` and `multi` guarantee each
//! stage receives the type the previous one produced.

use std::any::Any;
use std::fmt::{self, Debug};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::errors::{ExecError, ExecResult};
use crate::pipeline::instrument::{Instrumentation, Signal};
use crate::runtime::PoolKind;

/// A value in flight between stages.
pub(crate) type Item = Box<dyn Any + Send>;

pub(crate) fn boxed<T: Send + 'static>(value: T) -> Item {
    Box::new(value)
}

pub(crate) fn downcast<T: 'static>(item: Item) -> ExecResult<T> {
    item.downcast::<T>().map(|value| *value).map_err(|_| {
        ExecError::Internal(format!(
            "pipeline item is not a {}",
            std::any::type_name::<T>()
        ))
    })
}

pub(crate) fn downcast_ref<T: 'static>(item: &Item) -> ExecResult<&T> {
    item.downcast_ref::<T>().ok_or_else(|| {
        ExecError::Internal(format!(
            "pipeline item is not a {}",
            std::any::type_name::<T>()
        ))
    })
}

/// Run user code, turning a panic into a `SideEffect` failure.
pub(crate) fn guarded<R>(f: impl FnOnce() -> ExecResult<R>) -> ExecResult<R> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| Err(ExecError::from_panic(payload)))
}

/// Human-readable stage kind, used in metrics and logs.
pub(crate) trait StageKind {
    fn name(&self) -> &'static str;
}

/// One link in a pipeline: what to do, and which pool may do it.
///
/// Stages are immutable once attached. The affinity is fixed at attach
/// time from the pipeline's current `emit_on` target.
#[derive(Clone)]
pub(crate) struct Stage<K> {
    pub kind: K,
    pub affinity: PoolKind,
}

impl<K> Stage<K> {
    pub fn new(kind: K, affinity: PoolKind) -> Self {
        Self { kind, affinity }
    }
}

impl<K: StageKind> Debug for Stage<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("kind", &self.kind.name())
            .field("affinity", &self.affinity)
            .finish()
    }
}

/// A `log(label)` checkpoint.
///
/// Renders items with the `Debug` impl of the type flowing through the
/// pipeline at the point the tap was attached. Never changes the value.
#[derive(Clone)]
pub(crate) struct Tap {
    label: Arc<str>,
    render: Arc<dyn Fn(&Item) -> String + Send + Sync>,
}

impl Tap {
    pub fn new<T: Debug + 'static>(label: &str) -> Self {
        Self {
            label: Arc::from(label),
            render: Arc::new(|item: &Item| match item.downcast_ref::<T>() {
                Some(value) => format!("{:?}", value),
                None => "<opaque>".to_string(),
            }),
        }
    }

    pub fn subscribed(&self, instrumentation: &dyn Instrumentation) {
        instrumentation.on_signal(&self.label, Signal::Subscribe);
    }

    pub fn item(&self, instrumentation: &dyn Instrumentation, item: &Item) {
        let rendered = (self.render)(item);
        instrumentation.on_signal(&self.label, Signal::Item(&rendered));
    }

    pub fn failure(&self, instrumentation: &dyn Instrumentation, error: &ExecError) {
        instrumentation.on_signal(&self.label, Signal::Failure(error));
    }

    pub fn outcome(&self, instrumentation: &dyn Instrumentation, outcome: &ExecResult<Item>) {
        match outcome {
            Ok(item) => self.item(instrumentation, item),
            Err(e) => self.failure(instrumentation, e),
        }
    }

    pub fn completed(&self, instrumentation: &dyn Instrumentation) {
        instrumentation.on_signal(&self.label, Signal::Completion);
    }

    pub fn cancelled(&self, instrumentation: &dyn Instrumentation) {
        instrumentation.on_signal(&self.label, Signal::Cancel);
    }
}
