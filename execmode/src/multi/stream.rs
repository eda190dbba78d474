//! `futures::Stream` adapter over a subscription.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{Multi, MultiSubscriber, Subscription};
use crate::errors::{ExecError, ExecResult};
use crate::runtime::ExecContext;

struct Forwarder<T> {
    tx: mpsc::UnboundedSender<ExecResult<T>>,
}

impl<T: Send + 'static> MultiSubscriber<T> for Forwarder<T> {
    fn on_item(&mut self, item: T) {
        let _ = self.tx.send(Ok(item));
    }

    fn on_failure(&mut self, error: ExecError) {
        let _ = self.tx.send(Err(error));
    }
}

/// Items of one subscription as a stream. A failure is yielded as the last
/// element; completion and cancellation simply end the stream.
///
/// Dropping the stream cancels the subscription.
pub struct MultiStream<T> {
    items: UnboundedReceiverStream<ExecResult<T>>,
    subscription: Subscription,
}

impl<T: Send + 'static> Multi<T> {
    pub fn into_stream(self, ctx: &ExecContext) -> MultiStream<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(ctx, Forwarder { tx });
        MultiStream {
            items: UnboundedReceiverStream::new(rx),
            subscription,
        }
    }
}

impl<T> MultiStream<T> {
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }
}

impl<T> Stream for MultiStream<T> {
    type Item = ExecResult<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.items).poll_next(cx)
    }
}

impl<T> Drop for MultiStream<T> {
    fn drop(&mut self) {
        self.subscription.cancel();
    }
}
