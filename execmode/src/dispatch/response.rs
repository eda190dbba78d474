//! What handlers return and what callers get back.

use std::fmt;
use std::sync::{Arc, OnceLock};

use futures::Stream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::TaskId;
use crate::errors::ExecError;
use crate::metrics::DispatchMetricsStorage;
use crate::multi::{Multi, MultiSubscriber, Subscription};
use crate::runtime::ExecContext;
use crate::uni::Uni;

/// A handler's result: finished, eventually finished, or streaming.
pub enum Reply {
    Plain(String),
    Single(Uni<String>),
    Multi(Multi<String>),
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Plain(body) => f.debug_tuple("Plain").field(body).finish(),
            Reply::Single(uni) => f.debug_tuple("Single").field(uni).finish(),
            Reply::Multi(multi) => f.debug_tuple("Multi").field(multi).finish(),
        }
    }
}

impl From<String> for Reply {
    fn from(body: String) -> Self {
        Reply::Plain(body)
    }
}

impl From<&str> for Reply {
    fn from(body: &str) -> Self {
        Reply::Plain(body.to_string())
    }
}

impl From<Uni<String>> for Reply {
    fn from(uni: Uni<String>) -> Self {
        Reply::Single(uni)
    }
}

impl From<Multi<String>> for Reply {
    fn from(multi: Multi<String>) -> Self {
        Reply::Multi(multi)
    }
}

/// Outcome of a dispatched call.
#[derive(Debug)]
pub enum Response {
    Body(String),
    Error(ExecError),
    Stream(StreamResponse),
}

impl Response {
    pub fn status_code(&self) -> u16 {
        match self {
            Response::Body(_) | Response::Stream(_) => 200,
            Response::Error(error) => error.status_code(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error(_))
    }

    pub fn body(&self) -> Option<&str> {
        match self {
            Response::Body(body) => Some(body),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ExecError> {
        match self {
            Response::Error(error) => Some(error),
            _ => None,
        }
    }

    pub fn into_stream(self) -> Option<StreamResponse> {
        match self {
            Response::Stream(stream) => Some(stream),
            _ => None,
        }
    }
}

/// Incremental delivery target for a streaming response.
///
/// Called on an event-loop thread; must not block.
pub trait StreamSink: Send + 'static {
    fn on_emit(&mut self, item: String);

    fn on_complete(&mut self) {}

    fn on_cancel(&mut self) {}

    fn on_failure(&mut self, _error: ExecError) {}
}

/// Frames buffered for an SSE client before the stream is cancelled as too
/// slow.
pub const SSE_FRAME_BUFFER: usize = 64;

/// A stream ready to be delivered. Nothing runs until it is.
///
/// Dropping it undelivered finishes the call as cancelled.
pub struct StreamResponse {
    task_id: TaskId,
    route: String,
    multi: Multi<String>,
    context: ExecContext,
    metrics: Arc<DispatchMetricsStorage>,
    delivered: bool,
}

impl StreamResponse {
    pub(crate) fn new(
        task_id: TaskId,
        route: &str,
        multi: Multi<String>,
        context: ExecContext,
        metrics: Arc<DispatchMetricsStorage>,
    ) -> Self {
        Self {
            task_id,
            route: route.to_string(),
            multi,
            context,
            metrics,
            delivered: false,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Start the stream, pushing every emission into `sink`. Cancel the
    /// returned subscription to stop it.
    pub fn deliver<S: StreamSink>(mut self, sink: S) -> Subscription {
        self.delivered = true;
        let metered = MeteredSink {
            sink,
            task_id: self.task_id,
            route: self.route.clone(),
            metrics: self.metrics.clone(),
        };
        self.multi.clone().subscribe(&self.context, metered)
    }

    /// Start the stream as server-sent-event frames. Dropping the returned
    /// stream cancels it.
    ///
    /// At most [`SSE_FRAME_BUFFER`] frames wait for the reader; one more
    /// cancels the stream.
    pub fn sse_frames(self) -> impl Stream<Item = String> + Send + 'static {
        let (tx, mut rx) = mpsc::channel(SSE_FRAME_BUFFER);
        let subscription = Arc::new(OnceLock::new());
        let sink = FrameSink {
            tx,
            subscription: subscription.clone(),
        };
        let delivered = self.deliver(sink);
        let _ = subscription.set(delivered.clone());
        let guard = CancelOnDrop(delivered);
        async_stream::stream! {
            let _guard = guard;
            while let Some(frame) = rx.recv().await {
                yield frame;
            }
        }
    }
}

impl Drop for StreamResponse {
    fn drop(&mut self) {
        if self.delivered {
            return;
        }
        tracing::debug!(task_id = %self.task_id, route = %self.route, "stream dropped undelivered");
        self.metrics.record_stream_cancelled();
        self.metrics.record_outcome(false);
    }
}

impl fmt::Debug for StreamResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamResponse")
            .field("task_id", &self.task_id)
            .field("route", &self.route)
            .field("multi", &self.multi)
            .finish()
    }
}

struct MeteredSink<S> {
    sink: S,
    task_id: TaskId,
    route: String,
    metrics: Arc<DispatchMetricsStorage>,
}

impl<S: StreamSink> MultiSubscriber<String> for MeteredSink<S> {
    fn on_item(&mut self, item: String) {
        self.metrics.record_stream_item();
        self.sink.on_emit(item);
    }

    fn on_failure(&mut self, error: ExecError) {
        tracing::warn!(task_id = %self.task_id, route = %self.route, error = %error, "stream failed");
        self.metrics.record_outcome(true);
        self.sink.on_failure(error);
    }

    fn on_completion(&mut self) {
        tracing::debug!(task_id = %self.task_id, route = %self.route, "stream completed");
        self.metrics.record_outcome(false);
        self.sink.on_complete();
    }

    fn on_cancel(&mut self) {
        tracing::debug!(task_id = %self.task_id, route = %self.route, "stream cancelled");
        self.metrics.record_stream_cancelled();
        self.metrics.record_outcome(false);
        self.sink.on_cancel();
    }
}

struct FrameSink {
    tx: mpsc::Sender<String>,
    // Filled right after delivery starts, before the first emission.
    subscription: Arc<OnceLock<Subscription>>,
}

impl StreamSink for FrameSink {
    fn on_emit(&mut self, item: String) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(format!("data: {}\n\n", item)) {
            tracing::warn!(buffered = SSE_FRAME_BUFFER, "SSE reader too slow, cancelling stream");
            if let Some(subscription) = self.subscription.get() {
                subscription.cancel();
            }
        }
    }

    fn on_failure(&mut self, error: ExecError) {
        let _ = self.tx.try_send(format!("event: error\ndata: {}\n\n", error));
    }
}

struct CancelOnDrop(Subscription);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}
