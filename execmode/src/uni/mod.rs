//! Single-value pipelines.
//!
//! A [`Uni`] resolves exactly once, to a value or to a failure. Building
//! one does nothing: the source is only started when the pipeline is
//! subscribed (or awaited), and every subscription runs it again.
//!
//! ```ignore
//! let greeting = Uni::item("Hello!".to_string())
//!     .log("step-1")
//!     .on_item().delay_it().by(Duration::from_secs(5))
//!     .on_item().transform(|s| s.to_uppercase())
//!     .log("step-2");
//! ```

mod emitter;
mod handle;
mod interpreter;

use std::fmt::{Debug, Display};
use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

use futures::future::BoxFuture;

pub use emitter::UniEmitter;
pub use handle::{UniAwait, UniHandle};

use crate::errors::{ExecError, ExecResult};
use crate::pipeline::stage::{Item, Stage, StageKind, Tap, boxed, downcast, downcast_ref};
use crate::runtime::PoolKind;
use emitter::EmitterSlot;

type Producer = Box<dyn FnOnce() -> BoxFuture<'static, ExecResult<Item>> + Send>;

pub(crate) enum UniSource {
    Item(Item),
    Failure(ExecError),
    Deferred(Producer),
    Emitter(Box<dyn FnOnce(EmitterSlot) + Send>),
}

pub(crate) enum UniStage {
    Transform(Box<dyn FnOnce(Item) -> ExecResult<Item> + Send>),
    Chain(Box<dyn FnOnce(Item) -> ExecResult<UniParts> + Send>),
    Delay(Duration),
    Invoke(Box<dyn FnOnce(&Item) -> ExecResult<()> + Send>),
    Recover(Box<dyn FnOnce(ExecError) -> ExecResult<Item> + Send>),
    Log(Tap),
    EmitOn(PoolKind),
}

impl StageKind for UniStage {
    fn name(&self) -> &'static str {
        match self {
            UniStage::Transform(_) => "transform",
            UniStage::Chain(_) => "transform-to-uni",
            UniStage::Delay(_) => "delay",
            UniStage::Invoke(_) => "invoke",
            UniStage::Recover(_) => "recover",
            UniStage::Log(_) => "log",
            UniStage::EmitOn(_) => "emit-on",
        }
    }
}

/// Untyped pipeline, as handed to the interpreter.
pub(crate) struct UniParts {
    source: UniSource,
    stages: Vec<Stage<UniStage>>,
}

/// A lazily evaluated single value.
pub struct Uni<T> {
    source: UniSource,
    stages: Vec<Stage<UniStage>>,
    affinity: PoolKind,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Debug for Uni<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uni")
            .field("type", &std::any::type_name::<T>())
            .field("stages", &self.stages)
            .finish()
    }
}

impl<T: Send + 'static> Uni<T> {
    fn from_source(source: UniSource) -> Self {
        Self {
            source,
            stages: Vec::new(),
            affinity: PoolKind::EventLoop,
            _marker: PhantomData,
        }
    }

    /// Already resolved to `value`.
    pub fn item(value: T) -> Self {
        Self::from_source(UniSource::Item(boxed(value)))
    }

    /// Already resolved to `error`.
    pub fn failure(error: ExecError) -> Self {
        Self::from_source(UniSource::Failure(error))
    }

    /// Resolved by an async producer, started on subscription.
    pub fn from_future<F, Fut>(producer: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ExecResult<T>> + Send + 'static,
    {
        Self::from_source(UniSource::Deferred(Box::new(
            move || -> BoxFuture<'static, ExecResult<Item>> {
                let future = producer();
                Box::pin(async move { future.await.map(boxed) })
            },
        )))
    }

    /// Resolved by whoever holds the emitter, started on subscription.
    ///
    /// If every clone of the emitter is dropped unresolved, the pipeline
    /// fails with an internal error.
    pub fn emitter<F>(producer: F) -> Self
    where
        F: FnOnce(UniEmitter<T>) + Send + 'static,
    {
        Self::from_source(UniSource::Emitter(Box::new(move |slot: EmitterSlot| {
            producer(UniEmitter::new(slot))
        })))
    }

    pub fn on_item(self) -> UniOnItem<T> {
        UniOnItem { uni: self }
    }

    pub fn on_failure(self) -> UniOnFailure<T> {
        UniOnFailure { uni: self }
    }

    /// Run every stage attached after this one on `pool`.
    pub fn emit_on(mut self, pool: PoolKind) -> Self {
        self.affinity = pool;
        self.attach(UniStage::EmitOn(pool))
    }

    /// Report subscription and the outcome under `label`.
    pub fn log(self, label: &str) -> Self
    where
        T: Debug,
    {
        self.attach(UniStage::Log(Tap::new::<T>(label)))
    }

    /// Wait for the outcome on the calling thread.
    pub fn await_blocking(self) -> UniAwait<T> {
        UniAwait::new(self)
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub(crate) fn into_parts(self) -> UniParts {
        UniParts {
            source: self.source,
            stages: self.stages,
        }
    }

    fn attach<U>(mut self, kind: UniStage) -> Uni<U> {
        self.stages.push(Stage::new(kind, self.affinity));
        Uni {
            source: self.source,
            stages: self.stages,
            affinity: self.affinity,
            _marker: PhantomData,
        }
    }
}

/// Stages applied to the value; failures skip them.
pub struct UniOnItem<T> {
    uni: Uni<T>,
}

impl<T: Send + 'static> UniOnItem<T> {
    pub fn transform<U, F>(self, f: F) -> Uni<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.try_transform(move |value| Ok(f(value)))
    }

    /// Like `transform`, but the mapping may fail.
    pub fn try_transform<U, F>(self, f: F) -> Uni<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> ExecResult<U> + Send + 'static,
    {
        self.uni.attach(UniStage::Transform(Box::new(move |item: Item| {
            f(downcast::<T>(item)?).map(boxed)
        })))
    }

    /// Continue with the pipeline `f` builds from the value.
    pub fn transform_to_uni<U, F>(self, f: F) -> Uni<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Uni<U> + Send + 'static,
    {
        self.uni.attach(UniStage::Chain(Box::new(move |item: Item| {
            Ok(f(downcast::<T>(item)?).into_parts())
        })))
    }

    pub fn delay_it(self) -> UniDelay<T> {
        UniDelay { uni: self.uni }
    }

    /// Observe the value without changing it.
    pub fn invoke<F>(self, f: F) -> Uni<T>
    where
        F: FnOnce(&T) + Send + 'static,
    {
        self.try_invoke(move |value| {
            f(value);
            Ok::<(), ExecError>(())
        })
    }

    /// Observe the value; an error from `f` fails the pipeline.
    pub fn try_invoke<F, E>(self, f: F) -> Uni<T>
    where
        F: FnOnce(&T) -> Result<(), E> + Send + 'static,
        E: Display,
    {
        self.uni.attach(UniStage::Invoke(Box::new(move |item: &Item| {
            f(downcast_ref::<T>(item)?).map_err(|e| ExecError::SideEffect(e.to_string()))
        })))
    }
}

pub struct UniDelay<T> {
    uni: Uni<T>,
}

impl<T: Send + 'static> UniDelay<T> {
    /// Deliver the value `duration` later. Failures are not delayed.
    pub fn by(self, duration: Duration) -> Uni<T> {
        self.uni.attach(UniStage::Delay(duration))
    }
}

/// Stages applied to the failure; values skip them.
pub struct UniOnFailure<T> {
    uni: Uni<T>,
}

impl<T: Send + 'static> UniOnFailure<T> {
    pub fn recover_with_item(self, fallback: T) -> Uni<T> {
        self.recover_with(move |_| fallback)
    }

    pub fn recover_with<F>(self, f: F) -> Uni<T>
    where
        F: FnOnce(ExecError) -> T + Send + 'static,
    {
        self.uni.attach(UniStage::Recover(Box::new(move |error: ExecError| {
            Ok(boxed(f(error)))
        })))
    }
}
