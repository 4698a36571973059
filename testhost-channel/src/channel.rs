//! Channel facade: the supervisor's end of the test host connection.
//!
//! Flow:
//! 1. Bind a loopback listener and hand its port to the test host launcher
//! 2. Accept exactly one connection, spawn the reader task
//! 3. Send under a write mutex, consume inbound messages from the queue
//! 4. Close: drain the queue, wait for `TestHost.Acknowledge`, release the socket

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::SinkExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::{CodecError, DEFAULT_MAX_FRAME_LENGTH, MessageCodec};
use crate::bridge::protocol::Message;
use crate::bridge::transport::{accept_one, bind_loopback};
use crate::queue::{ReceiveQueue, Take, inbound_queue};
use crate::reader::{ReaderState, spawn_reader};

/// How long `close` waits for the acknowledgement by default.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-item wait while draining the queue on close.
pub const DEFAULT_DRAIN_ITEM_TIMEOUT: Duration = Duration::from_millis(100);

/// Bound on flushing and shutting down the write half once the handshake ends.
pub const DEFAULT_RELEASE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub ack_timeout: Duration,
    pub drain_item_timeout: Duration,
    pub release_timeout: Duration,
    /// `None` waits for the test host indefinitely.
    pub accept_timeout: Option<Duration>,
    pub max_frame_length: usize,
    pub nodelay: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            drain_item_timeout: DEFAULT_DRAIN_ITEM_TIMEOUT,
            release_timeout: DEFAULT_RELEASE_TIMEOUT,
            accept_timeout: None,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            nodelay: true,
        }
    }
}

impl ChannelConfig {
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_drain_item_timeout(mut self, timeout: Duration) -> Self {
        self.drain_item_timeout = timeout;
        self
    }

    pub fn with_release_timeout(mut self, timeout: Duration) -> Self {
        self.release_timeout = timeout;
        self
    }

    pub fn with_accept_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.accept_timeout = timeout;
        self
    }

    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    fn codec(&self) -> MessageCodec {
        MessageCodec::new().with_max_frame_length(self.max_frame_length)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("failed to bind 127.0.0.1:{port}: {source}")]
    Bind { port: u16, source: io::Error },
    #[error("failed to accept test host connection: {0}")]
    Connection(#[source] io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[source] CodecError),
    #[error("failed to send message: {0}")]
    Send(#[source] io::Error),
    #[error("channel is closed")]
    Closed,
}

impl From<CodecError> for ChannelError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Io(io) => Self::Send(io),
            other => Self::Protocol(other),
        }
    }
}

/// How `close` ended. Closing never fails; these only describe the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The test host acknowledged before the timeout.
    Acknowledged,
    /// No acknowledgement within the timeout.
    TimedOut,
    /// The reader ended without an acknowledgement (EOF or protocol error).
    PeerGone,
    /// An earlier `close` already released the connection.
    AlreadyClosed,
}

/// A bound listener waiting for the test host.
///
/// Dropping it (including dropping a pending [`accept`](Self::accept)) releases
/// the port.
#[derive(Debug)]
pub struct ChannelListener {
    listener: TcpListener,
    config: ChannelConfig,
}

impl ChannelListener {
    /// Bind `127.0.0.1:<port>`. Must be called inside a tokio runtime.
    pub fn bind(port: u16, config: ChannelConfig) -> Result<Self, ChannelError> {
        let listener =
            bind_loopback(port).map_err(|source| ChannelError::Bind { port, source })?;
        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The bound port, to pass to the test host.
    pub fn port(&self) -> io::Result<u16> {
        Ok(self.local_addr()?.port())
    }

    /// Accept the one test host connection and start reading from it.
    pub async fn accept(self) -> Result<Channel, ChannelError> {
        let port = self.port().unwrap_or_default();
        tracing::info!(port, "Waiting for test host to connect");
        let (stream, peer) = accept_one(&self.listener, self.config.accept_timeout)
            .await
            .map_err(|e| {
                tracing::error!(port, error = %e, "Failed to accept test host connection");
                ChannelError::Connection(e)
            })?;
        tracing::info!(%peer, "Test host connected");
        drop(self.listener);
        Channel::from_stream(stream, self.config)
    }
}

/// Supervisor end of an established test host connection.
///
/// Share it behind an `Arc` to send from several tasks; frames never interleave.
#[derive(Debug)]
pub struct Channel {
    writer: Mutex<Option<FramedWrite<OwnedWriteHalf, MessageCodec>>>,
    queue: Arc<ReceiveQueue>,
    reader_state: watch::Receiver<ReaderState>,
    reader: StdMutex<Option<JoinHandle<()>>>,
    stop: CancellationToken,
    closed: AtomicBool,
    config: ChannelConfig,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl Channel {
    /// Bind, accept one connection, and return a ready channel.
    pub async fn listen_and_accept(port: u16, config: ChannelConfig) -> Result<Self, ChannelError> {
        ChannelListener::bind(port, config)?.accept().await
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: TcpStream, config: ChannelConfig) -> Result<Self, ChannelError> {
        if config.nodelay {
            stream.set_nodelay(true).map_err(ChannelError::Connection)?;
        }
        let local_addr = stream.local_addr().map_err(ChannelError::Connection)?;
        let peer_addr = stream.peer_addr().map_err(ChannelError::Connection)?;

        let (read_half, write_half) = stream.into_split();
        let (queue_tx, queue) = inbound_queue();
        let stop = CancellationToken::new();
        let (reader, reader_state) =
            spawn_reader(read_half, config.codec(), queue_tx, stop.clone());

        Ok(Self {
            writer: Mutex::new(Some(FramedWrite::new(write_half, config.codec()))),
            queue: Arc::new(queue),
            reader_state,
            reader: StdMutex::new(Some(reader)),
            stop,
            closed: AtomicBool::new(false),
            config,
            local_addr,
            peer_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Write one message. Concurrent callers are serialized per frame.
    ///
    /// A write stuck on a peer that stopped reading is abandoned with
    /// [`ChannelError::Closed`] once the channel releases the connection.
    pub async fn send(&self, message: Message) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let mut guard = tokio::select! {
            biased;
            _ = self.stop.cancelled() => return Err(ChannelError::Closed),
            guard = self.writer.lock() => guard,
        };
        let writer = guard.as_mut().ok_or(ChannelError::Closed)?;
        let message_type = message.message_type.clone();
        let result = tokio::select! {
            biased;
            _ = self.stop.cancelled() => {
                tracing::debug!(%message_type, "Send abandoned, channel released");
                return Err(ChannelError::Closed);
            }
            result = writer.send(message) => result,
        };
        result.map_err(|e| {
            tracing::warn!(%message_type, error = %e, "Failed to send message to test host");
            ChannelError::from(e)
        })?;
        tracing::debug!(%message_type, "Sent message");
        Ok(())
    }

    /// Send an `"Error"` message carrying `text`.
    pub async fn send_error(&self, text: impl Into<String>) -> Result<(), ChannelError> {
        self.send(Message::error(text)).await
    }

    /// Send an `"Error"` message describing `err` and its source chain.
    pub async fn send_error_from(
        &self,
        err: &(dyn std::error::Error + 'static),
    ) -> Result<(), ChannelError> {
        self.send_error(error_chain(err)).await
    }

    /// Consumer handle for inbound messages.
    pub fn receive_queue(&self) -> Arc<ReceiveQueue> {
        Arc::clone(&self.queue)
    }

    /// Shorthand for `receive_queue().take()`.
    pub async fn recv(&self) -> Option<Message> {
        self.queue.take().await
    }

    pub fn reader_state(&self) -> ReaderState {
        self.reader_state.borrow().clone()
    }

    /// Resolve once the reader has stopped, with its final state.
    pub async fn reader_finished(&self) -> ReaderState {
        let mut rx = self.reader_state.clone();
        match rx.wait_for(ReaderState::is_terminal).await {
            Ok(state) => state.clone(),
            // Sender dropped without a terminal state: the task panicked.
            Err(_) => ReaderState::Failed("reader task ended unexpectedly".to_string()),
        }
    }

    /// Shut down: drain, wait for the acknowledgement, release the connection.
    ///
    /// Only the first call does anything; later calls return
    /// [`CloseOutcome::AlreadyClosed`].
    pub async fn close(&self) -> CloseOutcome {
        if self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!("Channel already closed");
            return CloseOutcome::AlreadyClosed;
        }

        let drained = self.drain().await;
        if drained > 0 {
            tracing::debug!(drained, "Discarded undelivered messages");
        }

        let ack_timeout = self.config.ack_timeout;
        let outcome = match tokio::time::timeout(ack_timeout, self.reader_finished()).await {
            Ok(ReaderState::Acknowledged) => CloseOutcome::Acknowledged,
            Ok(state) => {
                tracing::warn!(?state, "Test host connection ended without acknowledgement");
                CloseOutcome::PeerGone
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = ack_timeout.as_millis() as u64,
                    "Timed out waiting for test host acknowledgement"
                );
                CloseOutcome::TimedOut
            }
        };

        self.release().await;
        tracing::info!(?outcome, "Channel closed");
        outcome
    }

    async fn drain(&self) -> usize {
        let mut drained = 0;
        loop {
            match self.queue.take_timeout(self.config.drain_item_timeout).await {
                Take::Item(message) => {
                    tracing::trace!(message_type = %message.message_type, "Draining message");
                    drained += 1;
                }
                Take::Closed | Take::TimedOut => break,
            }
        }
        // Stop accepting so a full slot cannot hide the acknowledgement.
        if !self.queue.close() {
            tracing::trace!("Queue busy with a consumer, leaving it open");
        }
        drained
    }

    async fn release(&self) {
        // Wakes any send parked on the writer so the lock frees up.
        self.stop.cancel();

        let limit = self.config.release_timeout;
        match tokio::time::timeout(limit, self.writer.lock()).await {
            Ok(mut guard) => {
                if let Some(mut writer) = guard.take() {
                    // Flush whatever a cancelled send left buffered, then shut down.
                    match tokio::time::timeout(limit, SinkExt::close(&mut writer)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => tracing::debug!(error = %e, "Write shutdown failed"),
                        Err(_) => tracing::debug!("Peer not reading, dropping unflushed output"),
                    }
                }
            }
            Err(_) => tracing::warn!("Writer still busy at release, leaving it to drop"),
        }

        let reader = match self.reader.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = reader
            && let Err(e) = handle.await
        {
            tracing::error!(error = %e, "Reader task failed");
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if !self.is_closed() {
            tracing::debug!("Channel dropped without close, stopping reader");
        }
        self.stop.cancel();
    }
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}
