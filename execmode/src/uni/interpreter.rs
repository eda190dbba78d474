//! Walks a `Uni` stage list.
//!
//! The source is resolved first, then every stage is applied in attachment
//! order. A stage only touches the outcome kind it cares about (transforms
//! see values, recoveries see failures); everything else passes through.
//! User code runs on the stage's pool, inline when the interpreter is
//! already there.

use std::panic::AssertUnwindSafe;
use std::time::Instant;

use futures::FutureExt;
use futures::future::BoxFuture;

use super::emitter;
use super::{UniParts, UniSource, UniStage};
use crate::errors::{ExecError, ExecResult};
use crate::pipeline::stage::{Item, Stage, StageKind, guarded};
use crate::pipeline::{PipelineMetrics, StageMetrics};
use crate::runtime::{ExecContext, PoolKind, current_pool};

/// Outcome of one run plus its timings.
pub(crate) struct UniRun {
    pub outcome: ExecResult<Item>,
    pub metrics: PipelineMetrics,
}

pub(crate) fn execute(parts: UniParts, ctx: ExecContext) -> BoxFuture<'static, UniRun> {
    Box::pin(async move {
        let total_start = Instant::now();
        let UniParts { source, stages } = parts;

        for stage in &stages {
            if let UniStage::Log(tap) = &stage.kind {
                tap.subscribed(ctx.instrumentation());
            }
        }

        let source_start = Instant::now();
        let mut outcome = resolve_source(source).await;
        let source_duration_ms = source_start.elapsed().as_millis();

        let mut stage_metrics = Vec::with_capacity(stages.len());
        for (index, stage) in stages.into_iter().enumerate() {
            let kind = stage.kind.name();
            let affinity = stage.affinity;
            let stage_start = Instant::now();

            outcome = apply(stage, outcome, &ctx).await;

            stage_metrics.push(StageMetrics {
                index,
                kind,
                affinity,
                duration_ms: stage_start.elapsed().as_millis(),
            });
        }

        UniRun {
            outcome,
            metrics: PipelineMetrics {
                total_duration_ms: total_start.elapsed().as_millis(),
                source_duration_ms,
                stages: stage_metrics,
            },
        }
    })
}

async fn resolve_source(source: UniSource) -> ExecResult<Item> {
    match source {
        UniSource::Item(item) => Ok(item),
        UniSource::Failure(error) => Err(error),
        UniSource::Deferred(producer) => {
            let future = guarded(|| Ok(producer()))?;
            AssertUnwindSafe(future)
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(ExecError::from_panic(payload)))
        }
        UniSource::Emitter(producer) => {
            let (slot, rx) = emitter::slot();
            guarded(|| {
                producer(slot);
                Ok(())
            })?;
            rx.await.unwrap_or_else(|_| {
                Err(ExecError::Internal(
                    "emitter dropped without completing".into(),
                ))
            })
        }
    }
}

async fn apply(
    stage: Stage<UniStage>,
    outcome: ExecResult<Item>,
    ctx: &ExecContext,
) -> ExecResult<Item> {
    let affinity = stage.affinity;
    match (stage.kind, outcome) {
        (UniStage::Transform(f), Ok(item)) => run_stage(ctx, affinity, move || f(item)).await,
        (UniStage::Invoke(f), Ok(item)) => {
            run_stage(ctx, affinity, move || f(&item).map(|()| item)).await
        }
        (UniStage::Chain(f), Ok(item)) => {
            let inner = run_stage(ctx, affinity, move || f(item)).await?;
            execute(inner, ctx.clone()).await.outcome
        }
        (UniStage::Recover(f), Err(error)) => run_stage(ctx, affinity, move || f(error)).await,
        (UniStage::Delay(duration), Ok(item)) => {
            ctx.clock().delay(duration).await?;
            Ok(item)
        }
        (UniStage::Log(tap), outcome) => {
            tap.outcome(ctx.instrumentation(), &outcome);
            outcome
        }
        (_, outcome) => outcome,
    }
}

async fn run_stage<R, F>(ctx: &ExecContext, affinity: PoolKind, f: F) -> ExecResult<R>
where
    F: FnOnce() -> ExecResult<R> + Send + 'static,
    R: Send + 'static,
{
    if current_pool() == Some(affinity) {
        return guarded(f);
    }
    ctx.pools().run_on(affinity, move || guarded(f)).await?
}
