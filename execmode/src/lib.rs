//! execmode: run request handlers on the right pool.
//!
//! A [`Dispatcher`] owns two thread pools: a small event loop that must
//! never block and an elastic worker pool for handlers that may. Each
//! registered handler declares which one it runs on, and returns either a
//! plain body, a single eventually-available value ([`Uni`]) or a stream
//! of values ([`Multi`]). The dispatcher drives the pipeline and hands the
//! result back to the caller.
//!
//! ```no_run
//! use execmode::{Dispatcher, ExecutionMode, ExecmodeOptions, Reply, Request, Uni};
//! use std::time::Duration;
//!
//! let dispatcher = Dispatcher::new(ExecmodeOptions::default())?;
//! dispatcher.register("hello", ExecutionMode::EventLoop, |_: &Request| -> execmode::ExecResult<Reply> {
//!     Ok(Uni::item("Hello!".to_string())
//!         .on_item().delay_it().by(Duration::from_secs(1))
//!         .into())
//! })?;
//! let response = futures::executor::block_on(dispatcher.dispatch("hello"));
//! assert_eq!(response.body(), Some("Hello!"));
//! # Ok::<(), execmode::ExecError>(())
//! ```

pub mod api;
pub mod cancel;
pub mod clock;
pub mod dispatch;
pub mod errors;
pub mod logging;
pub mod metrics;
pub mod multi;
pub mod options;
pub mod outbound;
pub mod pipeline;
pub mod runtime;
pub mod uni;

pub use cancel::CancellationToken;
pub use clock::{Clock, Delay, TimerHandle};
pub use dispatch::{
    CallState, Dispatcher, ExecutionMode, Handler, HandlerRegistry, Reply, Request, Response,
    StreamResponse, StreamSink, Task, TaskId,
};
pub use errors::{ExecError, ExecResult};
pub use logging::init_logging;
pub use metrics::DispatchMetrics;
pub use multi::{Multi, MultiStream, MultiSubscriber, Subscription};
pub use options::{BlockingPolicy, ExecmodeOptions};
pub use outbound::{HttpClient, OutboundClient, StaticClient};
pub use runtime::{ExecContext, PoolKind, current_pool};
pub use uni::{Uni, UniEmitter, UniHandle};
