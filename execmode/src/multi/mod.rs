//! Multi-value pipelines.
//!
//! A [`Multi`] is a reusable description of a stream of values: nothing
//! runs until it is subscribed, and every subscription gets its own source
//! (a fresh tick sequence starting at 0, a fresh pass over the items).
//! Stages run on the event loop, in attachment order, once per item.

mod stream;
mod subscription;

use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

pub use stream::MultiStream;
pub use subscription::{MultiSubscriber, Subscription};

use crate::errors::{ExecError, ExecResult};
use crate::pipeline::stage::{Item, Stage, StageKind, Tap, boxed, downcast, downcast_ref};
use crate::runtime::PoolKind;

type ItemsFn = Arc<dyn Fn() -> Vec<Item> + Send + Sync>;

#[derive(Clone)]
pub(crate) enum MultiSource {
    Ticks(Duration),
    Items(ItemsFn),
    Failure(ExecError),
}

#[derive(Clone)]
pub(crate) enum MultiStage {
    Transform(Arc<dyn Fn(Item) -> ExecResult<Item> + Send + Sync>),
    Invoke(Arc<dyn Fn(&Item) -> ExecResult<()> + Send + Sync>),
    Log(Tap),
    Take(u64),
}

impl StageKind for MultiStage {
    fn name(&self) -> &'static str {
        match self {
            MultiStage::Transform(_) => "transform",
            MultiStage::Invoke(_) => "invoke",
            MultiStage::Log(_) => "log",
            MultiStage::Take(_) => "take",
        }
    }
}

pub struct Multi<T> {
    source: MultiSource,
    stages: Vec<Stage<MultiStage>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Multi<T> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            stages: self.stages.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> Debug for Multi<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match &self.source {
            MultiSource::Ticks(interval) => format!("ticks every {:?}", interval),
            MultiSource::Items(_) => "items".to_string(),
            MultiSource::Failure(e) => format!("failure({})", e),
        };
        f.debug_struct("Multi")
            .field("source", &source)
            .field("stages", &self.stages)
            .finish()
    }
}

impl Multi<u64> {
    pub fn ticks() -> MultiTicks {
        MultiTicks
    }
}

pub struct MultiTicks;

impl MultiTicks {
    /// 0, 1, 2, ... one per `interval`, the first after one interval.
    /// Never completes on its own.
    pub fn every(self, interval: Duration) -> Multi<u64> {
        Multi::from_source(MultiSource::Ticks(interval))
    }
}

impl<T: Send + 'static> Multi<T> {
    fn from_source(source: MultiSource) -> Self {
        Self {
            source,
            stages: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Emit each item, then complete.
    pub fn items<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Clone + Sync,
    {
        let items: Arc<[T]> = items.into_iter().collect();
        Self::from_source(MultiSource::Items(Arc::new(move || {
            items.iter().cloned().map(boxed).collect()
        })))
    }

    /// Fail every subscriber immediately.
    pub fn failure(error: ExecError) -> Self {
        Self::from_source(MultiSource::Failure(error))
    }

    pub fn on_item(self) -> MultiOnItem<T> {
        MultiOnItem { multi: self }
    }

    pub fn select(self) -> MultiSelect<T> {
        MultiSelect { multi: self }
    }

    /// Report subscription, items and the terminal signal under `label`.
    pub fn log(self, label: &str) -> Self
    where
        T: Debug,
    {
        self.attach(MultiStage::Log(Tap::new::<T>(label)))
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    fn attach<U>(mut self, kind: MultiStage) -> Multi<U> {
        self.stages.push(Stage::new(kind, PoolKind::EventLoop));
        Multi {
            source: self.source,
            stages: self.stages,
            _marker: PhantomData,
        }
    }
}

pub struct MultiOnItem<T> {
    multi: Multi<T>,
}

impl<T: Send + 'static> MultiOnItem<T> {
    pub fn transform<U, F>(self, f: F) -> Multi<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        self.multi
            .attach(MultiStage::Transform(Arc::new(move |item: Item| {
                downcast::<T>(item).map(|value| boxed(f(value)))
            })))
    }

    /// Observe each item; a panic fails the stream.
    pub fn invoke<F>(self, f: F) -> Multi<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.multi
            .attach(MultiStage::Invoke(Arc::new(move |item: &Item| {
                f(downcast_ref::<T>(item)?);
                Ok(())
            })))
    }
}

pub struct MultiSelect<T> {
    multi: Multi<T>,
}

impl<T: Send + 'static> MultiSelect<T> {
    /// Complete after `n` items, stopping the source.
    pub fn first(self, n: u64) -> Multi<T> {
        self.multi.attach(MultiStage::Take(n))
    }
}
