use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::progress::{ProgressEvent, ProgressListener, Transfer};
use crate::util::lock_unpoisoned;

/// Cancels the call it was taken from. Cloneable; cancelling twice is a
/// no-op.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Runs `future` until it completes or `token` is cancelled, whichever comes
/// first. Cancellation wins when both are ready.
pub(crate) async fn until_cancelled<F>(token: &CancellationToken, future: F) -> Option<F::Output>
where
    F: Future,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => None,
        output = future => Some(output),
    }
}

/// Handle of a single-shot call.
///
/// Resolves to the call outcome, or to [`Error::Cancelled`] once the call was
/// cancelled, even if the pipeline finished concurrently. Dropping the handle
/// cancels the call.
#[must_use = "dropping a call cancels it"]
pub struct Call<T> {
    task: JoinHandle<Result<T, Error>>,
    token: CancellationToken,
}

impl<T> Call<T>
where
    T: Send + 'static,
{
    pub(crate) fn spawn<F>(token: CancellationToken, future: F) -> Self
    where
        F: Future<Output = Result<T, Error>> + Send + 'static,
    {
        Self {
            task: tokio::spawn(future),
            token,
        }
    }

    /// A call that fails with `error` without dispatching anything.
    pub(crate) fn failed(error: Error) -> Self {
        Self::spawn(CancellationToken::new(), async move { Err(error) })
    }
}

impl<T> Call<T> {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle::new(self.token.clone())
    }
}

impl<T> Future for Call<T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.token.is_cancelled() {
            return Poll::Ready(Err(Error::Cancelled));
        }
        match Pin::new(&mut self.task).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(outcome)) => {
                if self.token.is_cancelled() {
                    return Poll::Ready(Err(Error::Cancelled));
                }
                Poll::Ready(outcome)
            }
            Poll::Ready(Err(join_error)) => {
                if join_error.is_panic() {
                    std::panic::resume_unwind(join_error.into_panic());
                }
                Poll::Ready(Err(Error::Cancelled))
            }
        }
    }
}

impl<T> Drop for Call<T> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl<T> std::fmt::Debug for Call<T> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Call")
            .field("cancelled", &self.token.is_cancelled())
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

type EventSender<E> = mpsc::UnboundedSender<Result<E, Error>>;

/// Producer side of a [`ProgressStream`].
///
/// The sender is taken out when the terminal item is sent, so nothing can
/// follow it.
pub(crate) struct ProgressEmitter<E> {
    sender: Arc<Mutex<Option<EventSender<E>>>>,
}

impl<E> Clone for ProgressEmitter<E> {
    fn clone(&self) -> Self {
        Self {
            sender: Arc::clone(&self.sender),
        }
    }
}

impl<E: ProgressEvent> ProgressEmitter<E> {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Result<E, Error>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let emitter = Self {
            sender: Arc::new(Mutex::new(Some(sender))),
        };
        (emitter, receiver)
    }

    fn emit(&self, event: E) {
        if let Some(sender) = lock_unpoisoned(&self.sender).as_ref() {
            let _ = sender.send(Ok(event));
        }
    }

    /// Sends the terminal item. Returns `false` when it could not be
    /// delivered.
    pub(crate) fn finish(&self, outcome: Result<E, Error>) -> bool {
        let sender = lock_unpoisoned(&self.sender).take();
        match sender {
            Some(sender) => sender.send(outcome).is_ok(),
            None => false,
        }
    }

    pub(crate) fn close(&self) {
        lock_unpoisoned(&self.sender).take();
    }

    pub(crate) fn upload_listener(&self) -> Arc<dyn ProgressListener> {
        let emitter = self.clone();
        Arc::new(move |transfer: Transfer| emitter.emit(E::uploading(transfer)))
    }

    pub(crate) fn download_listener(&self) -> Arc<dyn ProgressListener> {
        let emitter = self.clone();
        Arc::new(move |transfer: Transfer| emitter.emit(E::downloading(transfer)))
    }
}

/// Handle of a progress call: transfer events, then exactly one terminal
/// item (the completion event or an error).
///
/// After [`cancel`](ProgressStream::cancel) the stream yields `None`.
/// Dropping the stream cancels the call. A panic in the pipeline is raised
/// in the task polling the stream once the events run out.
#[must_use = "streams do nothing unless polled"]
pub struct ProgressStream<E> {
    events: mpsc::UnboundedReceiver<Result<E, Error>>,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<E> ProgressStream<E> {
    pub(crate) fn new(
        events: mpsc::UnboundedReceiver<Result<E, Error>>,
        token: CancellationToken,
    ) -> Self {
        Self {
            events,
            token,
            task: None,
        }
    }

    /// Runs `pipeline` on its own task, feeding `events`.
    pub(crate) fn spawn<F>(
        events: mpsc::UnboundedReceiver<Result<E, Error>>,
        token: CancellationToken,
        pipeline: F,
    ) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            events,
            token,
            task: Some(tokio::spawn(pipeline)),
        }
    }

    /// A stream whose only item is `error`.
    pub(crate) fn failed(error: Error) -> Self {
        let (sender, events) = mpsc::unbounded_channel();
        let _ = sender.send(Err(error));
        Self::new(events, CancellationToken::new())
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle::new(self.token.clone())
    }
}

impl<E> Stream for ProgressStream<E> {
    type Item = Result<E, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.token.is_cancelled() {
            this.events.close();
            return Poll::Ready(None);
        }
        match this.events.poll_recv(cx) {
            Poll::Ready(None) => {}
            polled => return polled,
        }

        // Channel closed: the pipeline sent its terminal item or died.
        let Some(task) = this.task.as_mut() else {
            return Poll::Ready(None);
        };
        let joined = match Pin::new(task).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(joined) => joined,
        };
        this.task = None;
        if let Err(join_error) = joined
            && join_error.is_panic()
        {
            std::panic::resume_unwind(join_error.into_panic());
        }
        Poll::Ready(None)
    }
}

impl<E> Drop for ProgressStream<E> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl<E> std::fmt::Debug for ProgressStream<E> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ProgressStream")
            .field("cancelled", &self.token.is_cancelled())
            .field("running", &self.task.as_ref().is_some_and(|task| !task.is_finished()))
            .finish()
    }
}
