//! Building blocks shared by both pipeline shapes.
//!
//! ## Architecture
//!
//! ```text
//! Uni / Multi (typed builders)
//!   └─ Vec<Stage<K>>       tagged stage kinds + pool affinity
//!        └─ interpreter    walks the stages in attachment order
//!             └─ Tap       log(label) checkpoints -> Instrumentation
//! ```

pub(crate) mod instrument;
mod metrics;
pub(crate) mod stage;

pub use instrument::{
    Instrumentation, RecordingInstrumentation, Signal, TracingInstrumentation, describe,
};
pub use metrics::{PipelineMetrics, StageMetrics};
