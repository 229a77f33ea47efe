use crate::error::{Error, Result};
use futures::ready;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Completes the `ReplyFuture` of a work item.
pub struct ReplySender<T> {
    tx: oneshot::Sender<Result<T>>,
}

impl<T> ReplySender<T> {
    #[inline]
    pub fn send(self, res: T) {
        if self.tx.send(Ok(res)).is_err() {
            trace!("Reply dropped, requester went away");
        }
    }

    #[inline]
    pub fn send_err(self, e: Error) {
        if self.tx.send(Err(e)).is_err() {
            trace!("Error reply dropped, requester went away");
        }
    }
}

/// Waits for the range server worker to answer a work item.
///
/// There is no timeout: a worker that never answers leaves the future
/// pending forever.
pub struct ReplyFuture<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Future for ReplyFuture<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<T>> {
        match ready!(Pin::new(&mut self.rx).poll(cx)) {
            Ok(res) => Poll::Ready(res),
            Err(_) => {
                error!("Encountered cancellation, worker dropped the reply");
                Poll::Ready(Err(Error::Closed))
            }
        }
    }
}

pub fn channel<T>() -> (ReplySender<T>, ReplyFuture<T>) {
    let (tx, rx) = oneshot::channel();
    (ReplySender { tx }, ReplyFuture { rx })
}
