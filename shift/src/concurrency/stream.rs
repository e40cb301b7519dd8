use core::pin::Pin;
use core::task::{Context, Poll};
use futures::{Future, Stream, ready};
use pin_project_lite::pin_project;
use shift_config::shared::SyncConfig;
use std::time::Duration;
use tracing::debug;

use crate::concurrency::shutdown::{ShutdownResult, ShutdownRx};

/// Size and time limits of the batches produced by a [`TimeoutBatchStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_size: usize,
    pub max_fill: Duration,
}

impl From<&SyncConfig> for BatchLimits {
    fn from(config: &SyncConfig) -> Self {
        Self {
            max_size: config.batch_size.max(1),
            max_fill: config.batch_max_fill(),
        }
    }
}

// Adapted from tokio-stream's `chunks_timeout` adapter.
pin_project! {
    /// Groups the items of a stream into batches.
    ///
    /// A batch is emitted as soon as it holds `max_size` items, or once `max_fill` has elapsed
    /// since the batch was started and it holds at least one item. On shutdown the items gathered
    /// so far are returned as [`ShutdownResult::Shutdown`] and the stream ends.
    #[must_use = "streams do nothing unless polled"]
    #[derive(Debug)]
    pub struct TimeoutBatchStream<B, S: Stream<Item = B>> {
        #[pin]
        stream: S,
        #[pin]
        deadline: Option<tokio::time::Sleep>,
        shutdown_rx: ShutdownRx,
        items: Vec<S::Item>,
        limits: BatchLimits,
        reset_timer: bool,
        finished: bool,
    }
}

impl<B, S: Stream<Item = B>> TimeoutBatchStream<B, S> {
    pub fn wrap(stream: S, limits: BatchLimits, shutdown_rx: ShutdownRx) -> Self {
        TimeoutBatchStream {
            stream,
            deadline: None,
            shutdown_rx,
            items: Vec::with_capacity(limits.max_size),
            limits,
            reset_timer: true,
            finished: false,
        }
    }
}

impl<B, S: Stream<Item = B>> Stream for TimeoutBatchStream<B, S> {
    type Item = ShutdownResult<Vec<S::Item>, Vec<S::Item>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.as_mut().project();

        if *this.finished {
            return Poll::Ready(None);
        }

        loop {
            if this.shutdown_rx.has_changed().unwrap_or(true) {
                debug!("batch stream stopped by shutdown");

                *this.finished = true;
                this.shutdown_rx.mark_unchanged();

                return Poll::Ready(Some(ShutdownResult::Shutdown(std::mem::take(this.items))));
            }

            if *this.reset_timer {
                this.deadline
                    .set(Some(tokio::time::sleep(this.limits.max_fill)));
                *this.reset_timer = false;
            }

            if this.items.is_empty() {
                this.items.reserve_exact(this.limits.max_size);
            }

            match this.stream.as_mut().poll_next(cx) {
                Poll::Pending => break,
                Poll::Ready(Some(item)) => {
                    this.items.push(item);

                    if this.items.len() >= this.limits.max_size {
                        *this.reset_timer = true;
                        return Poll::Ready(Some(ShutdownResult::Ok(std::mem::take(this.items))));
                    }
                }
                Poll::Ready(None) => {
                    *this.finished = true;
                    if this.items.is_empty() {
                        return Poll::Ready(None);
                    }

                    return Poll::Ready(Some(ShutdownResult::Ok(std::mem::take(this.items))));
                }
            }
        }

        if !this.items.is_empty()
            && let Some(deadline) = this.deadline.as_pin_mut()
        {
            ready!(deadline.poll(cx));
            *this.reset_timer = true;

            return Poll::Ready(Some(ShutdownResult::Ok(std::mem::take(this.items))));
        }

        Poll::Pending
    }
}
