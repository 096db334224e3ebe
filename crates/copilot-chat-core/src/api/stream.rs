//! The consumer side of a streamed reply.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::ApiError;

/// Ordered text increments of one reply.
///
/// A background task reads the network and hands increments over a bounded
/// queue, so it stops reading ahead when the consumer falls behind. The
/// stream ends after the last increment, after an error item, or once
/// cancelled. Dropping the stream cancels it.
pub struct ChatStream {
    rx: mpsc::Receiver<Result<String, ApiError>>,
    cancel: CancellationToken,
}

impl ChatStream {
    pub(crate) fn new(
        rx: mpsc::Receiver<Result<String, ApiError>>,
        cancel: CancellationToken,
    ) -> Self {
        Self { rx, cancel }
    }

    /// Stop the reply. The connection is closed and no further increments
    /// are produced; increments already received stay valid.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token that cancels this stream, for use from another task.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drain the stream into the full reply text.
    pub async fn collect_text(mut self) -> Result<String, ApiError> {
        let mut text = String::new();
        while let Some(item) = self.next().await {
            text.push_str(&item?);
        }
        Ok(text)
    }
}

impl Stream for ChatStream {
    type Item = Result<String, ApiError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        // Queued increments are discarded once cancelled
        if self.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        self.rx.poll_recv(cx)
    }
}

impl Drop for ChatStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
