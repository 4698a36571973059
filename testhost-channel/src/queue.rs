//! Single-slot inbound queue between the reader task and the channel owner.
//!
//! Capacity is fixed at one message. While the owner has not taken the previous
//! message the reader blocks in [`QueueSender::put`], stops reading the socket,
//! and the peer eventually observes TCP backpressure.

use std::time::Duration;

use tokio::sync::{Mutex, mpsc};

use crate::bridge::protocol::Message;

pub const QUEUE_CAPACITY: usize = 1;

/// Returned by [`QueueSender::put`] once the consumer side has closed.
/// Hands the rejected message back.
#[derive(Debug, thiserror::Error)]
#[error("inbound queue closed")]
pub struct QueueClosed(pub Message);

/// Outcome of a bounded wait on the queue.
#[derive(Debug)]
pub enum Take {
    Item(Message),
    /// Closed for writes and fully drained.
    Closed,
    TimedOut,
}

/// Create the producer/consumer pair.
pub fn inbound_queue() -> (QueueSender, ReceiveQueue) {
    let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
    (
        QueueSender { tx },
        ReceiveQueue {
            rx: Mutex::new(rx),
        },
    )
}

/// Producer end, owned by the reader task. Dropping it completes adding.
#[derive(Debug)]
pub struct QueueSender {
    tx: mpsc::Sender<Message>,
}

impl QueueSender {
    /// Wait for the slot to free up, then enqueue.
    pub async fn put(&self, message: Message) -> Result<(), QueueClosed> {
        self.tx
            .send(message)
            .await
            .map_err(|mpsc::error::SendError(message)| QueueClosed(message))
    }

    /// Mark the queue complete. Buffered items stay available to the consumer.
    pub fn close(self) {
        drop(self);
    }
}

/// Consumer end, shared with the channel owner.
#[derive(Debug)]
pub struct ReceiveQueue {
    rx: Mutex<mpsc::Receiver<Message>>,
}

impl ReceiveQueue {
    /// Wait for the next message. `None` once the queue is closed and empty.
    pub async fn take(&self) -> Option<Message> {
        self.rx.lock().await.recv().await
    }

    /// Like [`take`](Self::take) but gives up after `timeout`, including time
    /// spent waiting behind another consumer.
    pub async fn take_timeout(&self, timeout: Duration) -> Take {
        let next = async { self.rx.lock().await.recv().await };
        match tokio::time::timeout(timeout, next).await {
            Ok(Some(message)) => Take::Item(message),
            Ok(None) => Take::Closed,
            Err(_) => Take::TimedOut,
        }
    }

    /// Refuse further puts. Already buffered messages can still be taken.
    ///
    /// Returns false when a consumer is parked in `take` and holds the queue; that
    /// consumer keeps the slot moving so the producer cannot wedge on it.
    pub fn close(&self) -> bool {
        match self.rx.try_lock() {
            Ok(mut rx) => {
                rx.close();
                true
            }
            Err(_) => false,
        }
    }
}
