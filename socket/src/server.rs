//! Server socket: the accepted-connection counterpart of the client.
//!
//! A [`ServerSocket`] wraps one channel already accepted by an external
//! listener. There is no reconnect: once the connection ends, the socket is
//! terminally disconnected.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::driver;
use crate::managed::{
    CloseStatus, ManagedSocket, SendStatus, SocketCloseResult, SocketEvent, SocketOptions,
};
use crate::monitor::MonitorOptions;
use crate::transport::IoStream;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Server socket configuration
#[derive(Clone, Debug, Default)]
pub struct ServerOptions {
    /// Managed-socket options (mode, buffer sizes)
    pub socket: SocketOptions,
    /// Liveness monitoring; requires messaging mode
    pub monitor: Option<MonitorOptions>,
}

/// One accepted connection, driven to completion.
pub struct ServerSocket {
    socket: Arc<ManagedSocket>,
    monitor: Option<MonitorOptions>,
    events: mpsc::Sender<SocketEvent>,
    shutdown: CancellationToken,
}

impl ServerSocket {
    /// Wrap an accepted stream and return the socket plus its event stream.
    ///
    /// Fails fast on invalid option combinations.
    pub fn new(
        stream: IoStream,
        options: ServerOptions,
    ) -> anyhow::Result<(Self, mpsc::Receiver<SocketEvent>)> {
        driver::validate_options(&options.socket, options.monitor.as_ref())?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Ok((
            Self {
                socket: Arc::new(ManagedSocket::new(stream, options.socket)),
                monitor: options.monitor,
                events: events_tx,
                shutdown: CancellationToken::new(),
            },
            events_rx,
        ))
    }

    /// Drive the connection until it ends.
    ///
    /// Emits `Connected` up front and `Disconnected` with the close status
    /// on the way out; the close result is also returned to the accept loop.
    pub async fn run(&self) -> SocketCloseResult {
        self.events.send(SocketEvent::Connected).await.ok();

        let result =
            driver::drive(self.socket.clone(), self.monitor, &self.events, &self.shutdown).await;

        info!(status = ?result.status, "server connection ended");
        self.events
            .send(SocketEvent::Disconnected {
                status: result.status,
            })
            .await
            .ok();
        result
    }

    /// Send one message to the connected peer.
    pub async fn send(&self, payload: &[u8], cancel: &CancellationToken) -> SendStatus {
        self.socket.send(payload, cancel).await
    }

    /// True once the connection has ended.
    pub fn is_closed(&self) -> bool {
        self.socket.is_closed()
    }

    /// Close the connection. Terminal: a server socket never reconnects.
    pub async fn disconnect(&self) {
        self.shutdown.cancel();
        self.socket.disconnect().await;
    }

    /// Wait until the connection ends, or until `cancel` fires.
    ///
    /// Cancellation resolves the wait without closing the connection;
    /// `None` means the caller gave up before the socket closed.
    pub async fn when_disconnected(&self, cancel: &CancellationToken) -> Option<CloseStatus> {
        tokio::select! {
            _ = cancel.cancelled() => None,
            status = self.socket.when_closed() => Some(status),
        }
    }
}
