//! Thread pools and the execution context built on them.

mod context;
mod pools;

pub use context::ExecContext;
pub use pools::{PoolHandles, PoolKind, current_pool};

pub(crate) use context::BlockingPermit;
pub(crate) use pools::{ContextSlot, Pools};
