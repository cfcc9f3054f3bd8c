use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Buf;
use http_body::{Body, Frame, SizeHint};

/// Byte counters of one transfer direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transfer {
    pub bytes_completed: u64,
    /// `None` when the transport could not size the body in advance.
    pub bytes_total: Option<u64>,
}

impl Transfer {
    pub const fn new(bytes_completed: u64, bytes_total: Option<u64>) -> Self {
        Self {
            bytes_completed,
            bytes_total,
        }
    }

    /// Completed share in `0.0..=1.0`, or `None` when the total is unknown.
    pub fn fraction(&self) -> Option<f64> {
        match self.bytes_total {
            None => None,
            Some(0) => Some(1.0),
            Some(total) => Some(self.bytes_completed as f64 / total as f64),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_total
            .is_some_and(|total| self.bytes_completed >= total)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    Uploading(Transfer),
    Downloading(Transfer),
    Complete,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProgressWithResult<T> {
    Uploading(Transfer),
    Downloading(Transfer),
    Complete(T),
}

impl<T> ProgressWithResult<T> {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }

    pub fn into_result(self) -> Option<T> {
        match self {
            Self::Complete(value) => Some(value),
            Self::Uploading(_) | Self::Downloading(_) => None,
        }
    }
}

/// Event types a progress stream can carry.
pub(crate) trait ProgressEvent: Send + 'static {
    fn uploading(transfer: Transfer) -> Self;
    fn downloading(transfer: Transfer) -> Self;
}

impl ProgressEvent for Progress {
    fn uploading(transfer: Transfer) -> Self {
        Self::Uploading(transfer)
    }

    fn downloading(transfer: Transfer) -> Self {
        Self::Downloading(transfer)
    }
}

impl<T: Send + 'static> ProgressEvent for ProgressWithResult<T> {
    fn uploading(transfer: Transfer) -> Self {
        Self::Uploading(transfer)
    }

    fn downloading(transfer: Transfer) -> Self {
        Self::Downloading(transfer)
    }
}

pub trait ProgressListener: Send + Sync {
    fn on_progress(&self, transfer: Transfer);
}

impl<F> ProgressListener for F
where
    F: Fn(Transfer) + Send + Sync,
{
    fn on_progress(&self, transfer: Transfer) {
        self(transfer)
    }
}

/// Pass-through body that reports how many bytes went through it.
///
/// Once the running count reaches the declared total the listener is not
/// called again, even if the transport keeps polling the body.
pub struct ProgressBody<B> {
    inner: B,
    listener: Arc<dyn ProgressListener>,
    bytes_completed: u64,
    bytes_total: Option<u64>,
    completed: bool,
}

impl<B> ProgressBody<B> {
    pub fn new(inner: B, bytes_total: Option<u64>, listener: Arc<dyn ProgressListener>) -> Self {
        Self {
            inner,
            listener,
            bytes_completed: 0,
            bytes_total,
            completed: false,
        }
    }

    pub fn bytes_completed(&self) -> u64 {
        self.bytes_completed
    }

    pub fn into_inner(self) -> B {
        self.inner
    }

    fn record(&mut self, len: usize) {
        if len == 0 {
            return;
        }
        self.bytes_completed = self.bytes_completed.saturating_add(len as u64);
        if self.completed {
            return;
        }
        let transfer = Transfer::new(self.bytes_completed, self.bytes_total);
        self.completed = transfer.is_complete();
        self.listener.on_progress(transfer);
    }
}

impl<B> Body for ProgressBody<B>
where
    B: Body + Unpin,
    B::Data: Buf,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        if let Poll::Ready(Some(Ok(frame))) = &polled
            && let Some(data) = frame.data_ref()
        {
            this.record(data.remaining());
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
