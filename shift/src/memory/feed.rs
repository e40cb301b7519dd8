use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::watch;

use crate::error::ErrorKind;
use crate::memory::database::Inner;
use crate::shift_error;
use crate::storage::FeedStream;
use crate::types::{FeedMessage, Position};

/// Maximum number of changes buffered by a subscription in one pass over the log.
const MAX_CHANGES_PER_READ: usize = 512;

struct Subscription {
    database: Arc<Inner>,
    table: String,
    cursor: Position,
    position_rx: watch::Receiver<Position>,
    pending: VecDeque<FeedMessage>,
    broken: bool,
}

impl Subscription {
    fn take_injected_failure(&self) -> bool {
        self.database
            .feed_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                count.checked_sub(1)
            })
            .is_ok()
    }

    /// Buffers the changes of the subscribed table committed after the cursor, followed by a
    /// heartbeat for the last position scanned. Returns `false` if nothing new was committed.
    async fn read_log(&mut self) -> bool {
        let state = self.database.state.lock().await;
        let live = state.live_position();
        if live <= self.cursor {
            return false;
        }

        let mut changes = 0;
        let mut scanned = self.cursor;
        // The change at position `p` lives at index `p - 1`.
        for event in &state.log[self.cursor.0 as usize..] {
            scanned = event.position;
            if event.table == self.table {
                self.pending.push_back(FeedMessage::Change(event.clone()));
                changes += 1;
                if changes >= MAX_CHANGES_PER_READ {
                    break;
                }
            }
        }

        let last_change = self.pending.back().map(FeedMessage::position);
        if last_change != Some(scanned) {
            self.pending.push_back(FeedMessage::Heartbeat(scanned));
        }
        self.cursor = scanned;

        true
    }
}

/// Builds the stream of a subscription to `table` starting after `from`.
pub(super) fn feed_stream(database: Arc<Inner>, table: String, from: Position) -> FeedStream {
    let position_rx = database.position_tx.subscribe();
    let subscription = Subscription {
        database,
        table,
        cursor: from,
        position_rx,
        pending: VecDeque::new(),
        broken: false,
    };

    futures::stream::unfold(subscription, |mut subscription| async move {
        loop {
            if subscription.broken {
                return None;
            }

            if let Some(message) = subscription.pending.pop_front() {
                return Some((Ok(message), subscription));
            }

            if subscription.take_injected_failure() {
                subscription.broken = true;
                let err = shift_error!(
                    ErrorKind::FeedTransientError,
                    "Change feed read failed",
                    format!("subscription to table `{}`", subscription.table)
                );
                return Some((Err(err), subscription));
            }

            subscription.position_rx.mark_unchanged();
            if !subscription.read_log().await
                && subscription.position_rx.changed().await.is_err()
            {
                return None;
            }
        }
    })
    .boxed()
}
