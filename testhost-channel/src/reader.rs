//! Background reader: turns the inbound byte stream into queued messages.
//!
//! One task per channel. It decodes frames, pushes each message through the
//! single-slot queue, and stops after the test host's acknowledgement, a decode
//! failure, EOF, or an explicit stop request. The final state is published on a
//! `watch` channel so any number of observers can wait for it.

use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::MessageCodec;
use crate::queue::{QueueClosed, QueueSender};

/// Lifecycle of the reader task. Everything except `Running` is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderState {
    Running,
    /// The test host sent `TestHost.Acknowledge`.
    Acknowledged,
    /// Clean EOF at a frame boundary.
    Disconnected,
    /// Decode or socket error; the reason is the error's display text.
    Failed(String),
    /// Stopped by the channel before any terminal message arrived.
    Stopped,
}

impl ReaderState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

pub(crate) struct Reader<R> {
    frames: FramedRead<R, MessageCodec>,
    queue: QueueSender,
    state: watch::Sender<ReaderState>,
    stop: CancellationToken,
}

/// Start the reader task. The returned receiver observes its state.
pub(crate) fn spawn_reader<R>(
    read_half: R,
    codec: MessageCodec,
    queue: QueueSender,
    stop: CancellationToken,
) -> (JoinHandle<()>, watch::Receiver<ReaderState>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (state, state_rx) = watch::channel(ReaderState::Running);
    let reader = Reader {
        frames: FramedRead::new(read_half, codec),
        queue,
        state,
        stop,
    };
    (tokio::spawn(reader.run()), state_rx)
}

impl<R> Reader<R>
where
    R: AsyncRead + Unpin,
{
    async fn run(mut self) {
        let mut received: u64 = 0;
        let final_state = loop {
            let next = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break ReaderState::Stopped,
                next = self.frames.next() => next,
            };

            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    tracing::error!(error = %e, received, "Failed to read message from test host");
                    break ReaderState::Failed(e.to_string());
                }
                None => {
                    tracing::info!(received, "Test host closed the connection");
                    break ReaderState::Disconnected;
                }
            };
            received += 1;

            let is_ack = message.is_acknowledge();
            tracing::debug!(message_type = %message.message_type, "Received message");

            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break ReaderState::Stopped,
                result = self.queue.put(message) => {
                    // Consumer closed the queue during shutdown. Keep reading so
                    // the acknowledgement is still observed.
                    if let Err(QueueClosed(dropped)) = result {
                        tracing::trace!(message_type = %dropped.message_type, "Inbound queue closed, dropping message");
                    }
                }
            }

            if is_ack {
                tracing::debug!(received, "Acknowledgement received, reader exiting");
                break ReaderState::Acknowledged;
            }
        };

        let Reader { queue, state, .. } = self;
        state.send_replace(final_state);
        queue.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::Message;
    use crate::queue::inbound_queue;
    use futures::SinkExt;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, duplex};
    use tokio_util::codec::FramedWrite;

    async fn wait_terminal(mut rx: watch::Receiver<ReaderState>) -> ReaderState {
        rx.wait_for(ReaderState::is_terminal).await.unwrap().clone()
    }

    #[tokio::test]
    async fn forwards_messages_and_stops_on_ack() {
        let (client, server) = duplex(1024);
        let (tx, queue) = inbound_queue();
        let (handle, state) = spawn_reader(server, MessageCodec::new(), tx, CancellationToken::new());

        let mut peer = FramedWrite::new(client, MessageCodec::new());
        peer.send(Message::new("Hello", json!({}))).await.unwrap();
        peer.send(Message::acknowledge()).await.unwrap();
        // Anything after the ack is never read.
        peer.send(Message::new("After", json!({}))).await.unwrap();

        assert_eq!(queue.take().await.unwrap().message_type, "Hello");
        assert!(queue.take().await.unwrap().is_acknowledge());
        assert!(queue.take().await.is_none());

        handle.await.unwrap();
        assert_eq!(wait_terminal(state).await, ReaderState::Acknowledged);
    }

    #[tokio::test]
    async fn decode_failure_closes_queue() {
        let (mut client, server) = duplex(1024);
        let (tx, queue) = inbound_queue();
        let (handle, state) = spawn_reader(server, MessageCodec::new(), tx, CancellationToken::new());

        client.write_all(&[3, b'{', b'x', b'}']).await.unwrap();

        assert!(queue.take().await.is_none());
        handle.await.unwrap();
        assert!(matches!(wait_terminal(state).await, ReaderState::Failed(_)));
    }

    #[tokio::test]
    async fn eof_mid_frame_is_a_failure() {
        let (mut client, server) = duplex(1024);
        let (tx, queue) = inbound_queue();
        let (_handle, state) = spawn_reader(server, MessageCodec::new(), tx, CancellationToken::new());

        client.write_all(&[40, b'{']).await.unwrap();
        drop(client);

        assert!(queue.take().await.is_none());
        assert!(matches!(wait_terminal(state).await, ReaderState::Failed(_)));
    }

    #[tokio::test]
    async fn clean_eof_is_a_disconnect() {
        let (client, server) = duplex(1024);
        let (tx, queue) = inbound_queue();
        let (_handle, state) = spawn_reader(server, MessageCodec::new(), tx, CancellationToken::new());

        let mut peer = FramedWrite::new(client, MessageCodec::new());
        peer.send(Message::new("Only", json!(null))).await.unwrap();
        drop(peer);

        assert_eq!(queue.take().await.unwrap().message_type, "Only");
        assert!(queue.take().await.is_none());
        assert_eq!(wait_terminal(state).await, ReaderState::Disconnected);
    }

    #[tokio::test]
    async fn stop_interrupts_blocked_put() {
        let (client, server) = duplex(1024);
        let (tx, queue) = inbound_queue();
        let stop = CancellationToken::new();
        let (handle, state) = spawn_reader(server, MessageCodec::new(), tx, stop.clone());

        let mut peer = FramedWrite::new(client, MessageCodec::new());
        peer.send(Message::new("One", json!(1))).await.unwrap();
        peer.send(Message::new("Two", json!(2))).await.unwrap();

        // Slot holds "One"; the reader is parked trying to put "Two".
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*state.borrow(), ReaderState::Running);

        stop.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(wait_terminal(state).await, ReaderState::Stopped);

        assert_eq!(queue.take().await.unwrap().message_type, "One");
        assert!(queue.take().await.is_none());
    }

    #[tokio::test]
    async fn ack_seen_after_consumer_closes_queue() {
        let (client, server) = duplex(1024);
        let (tx, queue) = inbound_queue();
        let (handle, state) = spawn_reader(server, MessageCodec::new(), tx, CancellationToken::new());
        assert!(queue.close());

        let mut peer = FramedWrite::new(client, MessageCodec::new());
        peer.send(Message::new("Ignored", json!({}))).await.unwrap();
        peer.send(Message::acknowledge()).await.unwrap();

        handle.await.unwrap();
        assert_eq!(wait_terminal(state).await, ReaderState::Acknowledged);
    }
}
