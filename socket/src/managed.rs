//! Managed socket: framing-aware (or raw) wrapper around a duplex channel.
//!
//! A [`ManagedSocket`] owns one connected [`IoStream`] and nothing else: no
//! connect or reconnect policy, no liveness checks. It serializes writes,
//! runs a single listen loop that delivers received payloads over a channel,
//! and records the first close reason observed. Client and server sockets
//! compose it with their own lifecycles.

use std::io;

use anyhow::anyhow;
use bytes::Bytes;
use tokio::io::{split, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use msgsock_wire::{encode_frame, FramingBuffer, WireError, HEADER_SIZE};

use crate::transport::IoStream;

/// Framing mode of a managed socket
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketMode {
    /// Bytes pass through verbatim in both directions
    Raw,
    /// Each message carries a length prefix and is reassembled on receive
    Messaging,
}

/// Options shared by client and server managed sockets
#[derive(Clone, Debug)]
pub struct SocketOptions {
    /// Framing mode
    pub mode: SocketMode,
    /// Initial capacity of the reassembly buffer
    pub buffer_size: usize,
    /// Hard ceiling for a single declared message length
    pub extreme_message_size: usize,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            mode: SocketMode::Messaging,
            buffer_size: msgsock_wire::DEFAULT_BUFFER_SIZE,
            extreme_message_size: 16 * 1024 * 1024,
        }
    }
}

/// Outcome of a send attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendStatus {
    /// The full message reached the transport
    Sent,
    /// The caller's cancellation was observed before completion
    Canceled,
    /// The socket was closed before or during the write
    Closed,
}

/// How a connection ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseStatus {
    /// The local side initiated closure
    ClosedLocal,
    /// The peer closed the channel
    ClosedRemote,
    /// Protocol violation or unexpected I/O failure
    Error,
}

/// Result of a completed listen loop
#[derive(Debug)]
pub struct SocketCloseResult {
    /// How the connection ended
    pub status: CloseStatus,
    /// Underlying failure for [`CloseStatus::Error`] closes
    pub error: Option<anyhow::Error>,
}

impl SocketCloseResult {
    fn local() -> Self {
        Self {
            status: CloseStatus::ClosedLocal,
            error: None,
        }
    }

    fn remote() -> Self {
        Self {
            status: CloseStatus::ClosedRemote,
            error: None,
        }
    }

    fn error(error: anyhow::Error) -> Self {
        Self {
            status: CloseStatus::Error,
            error: Some(error),
        }
    }

    fn from_status(status: CloseStatus) -> Self {
        Self {
            status,
            error: None,
        }
    }
}

/// Events surfaced to the application by client and server sockets
#[derive(Debug)]
pub enum SocketEvent {
    /// A connection was established
    Connected,
    /// The connection ended with the given status
    Disconnected {
        /// How the connection ended
        status: CloseStatus,
    },
    /// A payload arrived (one framed message, or one raw chunk)
    Received(Bytes),
    /// A connect attempt or connection failed
    Error(anyhow::Error),
}

/// Framing-aware wrapper around one connected duplex byte channel.
pub struct ManagedSocket {
    options: SocketOptions,
    reader: Mutex<ReadHalf<IoStream>>,
    writer: Mutex<WriteHalf<IoStream>>,
    closed_tx: watch::Sender<Option<CloseStatus>>,
    closed_rx: watch::Receiver<Option<CloseStatus>>,
}

impl ManagedSocket {
    /// Wrap an already-connected stream.
    pub fn new(stream: IoStream, options: SocketOptions) -> Self {
        let (reader, writer) = split(stream);
        let (closed_tx, closed_rx) = watch::channel(None);
        Self {
            options,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed_tx,
            closed_rx,
        }
    }

    /// Options this socket was built with.
    pub fn options(&self) -> &SocketOptions {
        &self.options
    }

    /// True once a close reason has been recorded.
    pub fn is_closed(&self) -> bool {
        self.closed_rx.borrow().is_some()
    }

    /// The recorded close reason, if any.
    pub fn close_status(&self) -> Option<CloseStatus> {
        *self.closed_rx.borrow()
    }

    /// Wait until the socket closes and return the recorded reason.
    pub async fn when_closed(&self) -> CloseStatus {
        let mut rx = self.closed_rx.clone();
        loop {
            if let Some(status) = *rx.borrow_and_update() {
                return status;
            }
            if rx.changed().await.is_err() {
                return CloseStatus::ClosedLocal;
            }
        }
    }

    /// Record a close reason. The first recorded reason wins.
    pub(crate) fn close_with(&self, status: CloseStatus) -> bool {
        self.closed_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(status);
                true
            } else {
                false
            }
        })
    }

    /// Close the channel from the local side.
    pub async fn disconnect(&self) {
        if self.close_with(CloseStatus::ClosedLocal) {
            debug!("socket disconnected locally");
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    /// Send one message (or raw chunk) to the peer.
    ///
    /// In messaging mode the length prefix and body go out as one contiguous
    /// write. A cancellation observed after the write started leaves the wire
    /// in an unrecoverable state, so the socket is closed; a token that is
    /// already canceled on entry returns [`SendStatus::Canceled`] without
    /// touching the connection.
    pub async fn send(&self, payload: &[u8], cancel: &CancellationToken) -> SendStatus {
        if cancel.is_cancelled() {
            return SendStatus::Canceled;
        }
        if self.is_closed() {
            return SendStatus::Closed;
        }

        let frame: Bytes = match self.options.mode {
            SocketMode::Raw => Bytes::copy_from_slice(payload),
            SocketMode::Messaging => {
                match encode_frame(payload, self.options.extreme_message_size) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, "refusing to send extreme message; closing socket");
                        self.close_with(CloseStatus::Error);
                        return SendStatus::Closed;
                    }
                }
            }
        };

        let mut writer = tokio::select! {
            biased;
            _ = cancel.cancelled() => return SendStatus::Canceled,
            guard = self.writer.lock() => guard,
        };
        if self.is_closed() {
            return SendStatus::Closed;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // The write may have put a partial frame on the wire; the
                // peer cannot resynchronize, so the connection must die.
                warn!("send canceled mid-write; closing socket");
                self.close_with(CloseStatus::ClosedLocal);
                SendStatus::Canceled
            }
            result = writer.write_all(&frame) => match result {
                Ok(()) => {
                    trace!(len = frame.len(), "sent frame");
                    SendStatus::Sent
                }
                Err(e) => {
                    debug!(error = %e, "write failed; closing socket");
                    self.close_with(close_status_for_io(&e));
                    SendStatus::Closed
                }
            },
        }
    }

    /// Run the receive loop until the channel closes, the token fires, or a
    /// framing violation occurs.
    ///
    /// Payloads are delivered in wire order over `received`. The loop returns
    /// a [`SocketCloseResult`] describing why it stopped; the reason is also
    /// recorded on the socket for [`when_closed`](Self::when_closed) waiters.
    pub async fn listen(
        &self,
        received: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
    ) -> SocketCloseResult {
        let mut reader = self.reader.lock().await;
        let mut closed_rx = self.closed_rx.clone();

        let result = match self.options.mode {
            SocketMode::Raw => {
                self.listen_raw(&mut reader, &received, &cancel, &mut closed_rx)
                    .await
            }
            SocketMode::Messaging => {
                self.listen_messaging(&mut reader, &received, &cancel, &mut closed_rx)
                    .await
            }
        };

        debug!(status = ?result.status, "listen loop finished");
        result
    }

    async fn listen_raw(
        &self,
        reader: &mut ReadHalf<IoStream>,
        received: &mpsc::Sender<Bytes>,
        cancel: &CancellationToken,
        closed_rx: &mut watch::Receiver<Option<CloseStatus>>,
    ) -> SocketCloseResult {
        let mut chunk = vec![0u8; self.options.buffer_size];
        loop {
            let n = match self.read_step(reader, &mut chunk, cancel, closed_rx).await {
                Ok(n) => n,
                Err(result) => return result,
            };

            if received
                .send(Bytes::copy_from_slice(&chunk[..n]))
                .await
                .is_err()
            {
                self.close_with(CloseStatus::ClosedLocal);
                return SocketCloseResult::local();
            }
        }
    }

    async fn listen_messaging(
        &self,
        reader: &mut ReadHalf<IoStream>,
        received: &mpsc::Sender<Bytes>,
        cancel: &CancellationToken,
        closed_rx: &mut watch::Receiver<Option<CloseStatus>>,
    ) -> SocketCloseResult {
        let limit = self.options.extreme_message_size;
        let mut buffer = FramingBuffer::with_capacity(self.options.buffer_size);

        loop {
            // Drain every complete frame before touching the transport again.
            loop {
                if let Some(declared) = buffer.pending_message_len() {
                    if declared > limit {
                        error!(declared, limit, "extreme message length declared by peer");
                        self.close_with(CloseStatus::Error);
                        return SocketCloseResult::error(anyhow!(WireError::Extreme {
                            declared,
                            limit,
                        }));
                    }
                }
                if !buffer.contains_full_message() {
                    break;
                }

                let message = Bytes::copy_from_slice(buffer.message());
                buffer.reset();
                trace!(len = message.len(), "message reassembled");

                if received.send(message).await.is_err() {
                    self.close_with(CloseStatus::ClosedLocal);
                    return SocketCloseResult::local();
                }
            }

            // A partial frame can outgrow the region; make room before the
            // next read, up to the ceiling derived from the message limit.
            if buffer.is_full() {
                if buffer.capacity() >= limit + HEADER_SIZE {
                    error!(
                        capacity = buffer.capacity(),
                        limit, "framing buffer at ceiling without a complete message"
                    );
                    self.close_with(CloseStatus::Error);
                    return SocketCloseResult::error(anyhow!(
                        "framing buffer reached {} bytes without a complete message",
                        buffer.capacity()
                    ));
                }
                if let Err(e) = buffer.grow() {
                    self.close_with(CloseStatus::Error);
                    return SocketCloseResult::error(anyhow!(e));
                }
            }

            let n = match self
                .read_step(reader, buffer.free_space(), cancel, closed_rx)
                .await
            {
                Ok(n) => n,
                Err(result) => return result,
            };
            if let Err(e) = buffer.track_data(n) {
                self.close_with(CloseStatus::Error);
                return SocketCloseResult::error(anyhow!(e));
            }
        }
    }

    /// One read from the transport, racing cancellation and recorded closes.
    ///
    /// `Ok(n)` carries a positive byte count; every terminal condition comes
    /// back as `Err` with the close reason already recorded on the socket.
    async fn read_step(
        &self,
        reader: &mut ReadHalf<IoStream>,
        buf: &mut [u8],
        cancel: &CancellationToken,
        closed_rx: &mut watch::Receiver<Option<CloseStatus>>,
    ) -> Result<usize, SocketCloseResult> {
        if let Some(status) = *closed_rx.borrow_and_update() {
            return Err(SocketCloseResult::from_status(status));
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.close_with(CloseStatus::ClosedLocal);
                Err(SocketCloseResult::local())
            }
            _ = closed_rx.changed() => {
                let status = (*closed_rx.borrow()).unwrap_or(CloseStatus::ClosedLocal);
                Err(SocketCloseResult::from_status(status))
            }
            result = reader.read(buf) => match result {
                Ok(0) => {
                    debug!("remote closed the channel");
                    self.close_with(CloseStatus::ClosedRemote);
                    Err(SocketCloseResult::remote())
                }
                Ok(n) => Ok(n),
                Err(e) if is_remote_close(&e) => {
                    debug!(error = %e, "connection reset by peer");
                    self.close_with(CloseStatus::ClosedRemote);
                    Err(SocketCloseResult::remote())
                }
                Err(e) => {
                    error!(error = %e, "read failed");
                    self.close_with(CloseStatus::Error);
                    Err(SocketCloseResult::error(e.into()))
                }
            },
        }
    }
}

fn is_remote_close(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

fn close_status_for_io(e: &io::Error) -> CloseStatus {
    if is_remote_close(e) {
        CloseStatus::ClosedRemote
    } else {
        CloseStatus::Error
    }
}
