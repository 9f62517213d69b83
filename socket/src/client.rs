//! Client socket: connect/reconnect lifecycle over a managed socket.
//!
//! A [`ClientSocket`] is an explicit state machine
//! (`Disconnected -> Connecting -> Connected`) driven by one supervising
//! task. The supervisor opens the transport, wraps it in a
//! [`ManagedSocket`], drives the connection to completion, and, when
//! configured, schedules the next attempt after the reconnect delay.
//! An explicit [`disconnect`](ClientSocket::disconnect) suppresses any
//! further reconnection.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::driver;
use crate::managed::{
    CloseStatus, ManagedSocket, SendStatus, SocketEvent, SocketOptions,
};
use crate::monitor::MonitorOptions;
use crate::transport::{self, IoStream};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// TLS settings for an outbound connection
#[cfg(feature = "tls")]
#[derive(Clone)]
pub struct TlsClientConfig {
    /// Rustls client configuration
    pub client_config: rustls::ClientConfig,
    /// Server name for SNI
    pub server_name: String,
}

/// TLS settings for an outbound connection (disabled build)
#[cfg(not(feature = "tls"))]
#[derive(Clone)]
pub struct TlsClientConfig;

/// Where and how to connect
#[derive(Clone)]
pub struct Endpoint {
    /// Target address
    pub addr: SocketAddr,
    /// Wrap the connection in TLS when set
    pub tls: Option<TlsClientConfig>,
}

impl Endpoint {
    /// Plain TCP endpoint.
    pub fn plain(addr: SocketAddr) -> Self {
        Self { addr, tls: None }
    }
}

/// Client socket configuration
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Managed-socket options (mode, buffer sizes)
    pub socket: SocketOptions,
    /// Liveness monitoring; requires messaging mode
    pub monitor: Option<MonitorOptions>,
    /// Delay before reconnecting after an unexpected close or a failed
    /// attempt; `None` disables auto-reconnect
    pub reconnect_delay: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            socket: SocketOptions::default(),
            monitor: None,
            reconnect_delay: Some(Duration::from_secs(1)),
        }
    }
}

/// Connection lifecycle states
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    /// No connection and no attempt in flight
    Disconnected,
    /// An attempt (or retry cycle) is in flight
    Connecting,
    /// A managed socket is live
    Connected,
}

struct Lifecycle {
    shutdown: CancellationToken,
    supervisor: JoinHandle<()>,
}

struct ClientShared {
    state: Mutex<ClientState>,
    current: Mutex<Option<Arc<ManagedSocket>>>,
    events: mpsc::Sender<SocketEvent>,
}

impl ClientShared {
    fn set_state(&self, next: ClientState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != next {
            debug!(from = ?*state, to = ?next, "client state transition");
            *state = next;
        }
    }

    fn set_current(&self, socket: Option<Arc<ManagedSocket>>) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = socket;
    }

    fn current(&self) -> Option<Arc<ManagedSocket>> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Connecting socket with automatic reconnection.
pub struct ClientSocket {
    options: ClientOptions,
    shared: Arc<ClientShared>,
    lifecycle: Mutex<Option<Lifecycle>>,
}

impl ClientSocket {
    /// Build a client socket and the event stream it reports on.
    ///
    /// Fails fast on invalid option combinations (for example a connection
    /// monitor on a raw-mode socket).
    pub fn new(options: ClientOptions) -> anyhow::Result<(Self, mpsc::Receiver<SocketEvent>)> {
        driver::validate_options(&options.socket, options.monitor.as_ref())?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(ClientShared {
            state: Mutex::new(ClientState::Disconnected),
            current: Mutex::new(None),
            events: events_tx,
        });

        Ok((
            Self {
                options,
                shared,
                lifecycle: Mutex::new(None),
            },
            events_rx,
        ))
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        *self
            .shared
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Start connecting to `endpoint`.
    ///
    /// Only valid while [`ClientState::Disconnected`]. Returns once the
    /// supervising task is running; success and failure arrive as events.
    pub fn connect(&self, endpoint: Endpoint) -> anyhow::Result<()> {
        {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if *state != ClientState::Disconnected {
                anyhow::bail!("connect is only valid while disconnected (state: {:?})", *state);
            }
            *state = ClientState::Connecting;
        }

        let shutdown = CancellationToken::new();
        let supervisor = tokio::spawn(run_client(
            self.options.clone(),
            endpoint,
            self.shared.clone(),
            shutdown.clone(),
        ));

        *self.lifecycle.lock().unwrap_or_else(|e| e.into_inner()) = Some(Lifecycle {
            shutdown,
            supervisor,
        });
        Ok(())
    }

    /// Send one message over the current connection.
    ///
    /// Returns [`SendStatus::Closed`] immediately when no connection is live.
    pub async fn send(&self, payload: &[u8], cancel: &CancellationToken) -> SendStatus {
        match self.shared.current() {
            Some(socket) => socket.send(payload, cancel).await,
            None => SendStatus::Closed,
        }
    }

    /// Close the connection and suppress further reconnection.
    pub async fn disconnect(&self) {
        let lifecycle = self
            .lifecycle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(lifecycle) = lifecycle else { return };

        lifecycle.shutdown.cancel();
        if let Some(socket) = self.shared.current() {
            socket.disconnect().await;
        }
        let _ = lifecycle.supervisor.await;
        self.shared.set_state(ClientState::Disconnected);
    }
}

/// Supervising loop: one connect attempt (and connection) at a time.
async fn run_client(
    options: ClientOptions,
    endpoint: Endpoint,
    shared: Arc<ClientShared>,
    shutdown: CancellationToken,
) {
    loop {
        shared.set_state(ClientState::Connecting);

        let attempt = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            result = open_endpoint(&endpoint) => result,
        };

        match attempt {
            Ok(stream) => {
                let socket = Arc::new(ManagedSocket::new(stream, options.socket.clone()));
                shared.set_current(Some(socket.clone()));
                shared.set_state(ClientState::Connected);
                info!(addr = %endpoint.addr, "client connected");
                shared.events.send(SocketEvent::Connected).await.ok();

                let result =
                    driver::drive(socket, options.monitor, &shared.events, &shutdown).await;

                shared.set_current(None);
                shared.set_state(ClientState::Disconnected);
                info!(addr = %endpoint.addr, status = ?result.status, "client disconnected");

                if let Some(error) = result.error {
                    shared.events.send(SocketEvent::Error(error)).await.ok();
                }
                shared
                    .events
                    .send(SocketEvent::Disconnected {
                        status: result.status,
                    })
                    .await
                    .ok();

                // A local close is intentional; it never triggers reconnect.
                if result.status == CloseStatus::ClosedLocal || shutdown.is_cancelled() {
                    break;
                }
            }
            Err(error) => {
                warn!(addr = %endpoint.addr, error = %error, "connect attempt failed");
                shared.events.send(SocketEvent::Error(error)).await.ok();

                if options.reconnect_delay.is_none() {
                    shared.set_state(ClientState::Disconnected);
                    shared
                        .events
                        .send(SocketEvent::Disconnected {
                            status: CloseStatus::Error,
                        })
                        .await
                        .ok();
                    break;
                }
            }
        }

        let Some(delay) = options.reconnect_delay else { break };
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    shared.set_current(None);
    shared.set_state(ClientState::Disconnected);
}

/// Open the transport for an endpoint: plain TCP, optionally TLS-wrapped.
async fn open_endpoint(endpoint: &Endpoint) -> anyhow::Result<IoStream> {
    let tcp = transport::connect_tcp(endpoint.addr)
        .await
        .with_context(|| format!("failed to connect to {}", endpoint.addr))?;

    match &endpoint.tls {
        #[cfg(feature = "tls")]
        Some(tls) => {
            transport::tls::connect_tls(tls.client_config.clone(), tcp, &tls.server_name).await
        }
        #[cfg(not(feature = "tls"))]
        Some(_) => anyhow::bail!(
            "TLS requested for {} but this build has no TLS support",
            endpoint.addr
        ),
        None => Ok(IoStream::Plain(tcp)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::managed::SocketMode;
    use crate::transport::listen_tcp;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    /// Accepts connections forever and echoes every framed message back.
    fn spawn_echo_server(listener: TcpListener) {
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let socket = Arc::new(ManagedSocket::new(
                        IoStream::Plain(stream),
                        SocketOptions::default(),
                    ));
                    let (tx, mut rx) = mpsc::channel(16);
                    let listen = {
                        let socket = socket.clone();
                        tokio::spawn(
                            async move { socket.listen(tx, CancellationToken::new()).await },
                        )
                    };
                    let cancel = CancellationToken::new();
                    while let Some(msg) = rx.recv().await {
                        if socket.send(&msg, &cancel).await != SendStatus::Sent {
                            break;
                        }
                    }
                    let _ = listen.await;
                });
            }
        });
    }

    async fn bound_listener() -> (TcpListener, SocketAddr) {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = listen_tcp(addr).await.unwrap();
        let bound = listener.local_addr().unwrap();
        (listener, bound)
    }

    async fn next_event(rx: &mut mpsc::Receiver<SocketEvent>) -> SocketEvent {
        timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    async fn wait_connected(rx: &mut mpsc::Receiver<SocketEvent>) {
        loop {
            if matches!(next_event(rx).await, SocketEvent::Connected) {
                return;
            }
        }
    }

    async fn next_received(rx: &mut mpsc::Receiver<SocketEvent>) -> bytes::Bytes {
        loop {
            if let SocketEvent::Received(payload) = next_event(rx).await {
                return payload;
            }
        }
    }

    #[tokio::test]
    async fn test_monitor_on_raw_socket_is_rejected() {
        let options = ClientOptions {
            socket: SocketOptions {
                mode: SocketMode::Raw,
                ..SocketOptions::default()
            },
            monitor: Some(MonitorOptions::default()),
            reconnect_delay: None,
        };
        assert!(ClientSocket::new(options).is_err());
    }

    #[tokio::test]
    async fn test_send_while_disconnected_returns_closed() {
        let (client, _events) = ClientSocket::new(ClientOptions::default()).unwrap();
        let cancel = CancellationToken::new();
        assert_eq!(client.send(b"nobody", &cancel).await, SendStatus::Closed);
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[cfg(not(feature = "tls"))]
    #[tokio::test]
    async fn test_tls_endpoint_fails_without_tls_support() {
        use tokio::io::AsyncReadExt;

        let (listener, addr) = bound_listener().await;
        let peer = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            stream.read(&mut buf).await.unwrap()
        });

        let options = ClientOptions {
            reconnect_delay: None,
            ..ClientOptions::default()
        };
        let (client, mut events) = ClientSocket::new(options).unwrap();
        client
            .connect(Endpoint {
                addr,
                tls: Some(TlsClientConfig),
            })
            .unwrap();

        // The attempt must fail outright rather than fall back to cleartext.
        assert!(matches!(next_event(&mut events).await, SocketEvent::Error(_)));
        assert!(matches!(
            next_event(&mut events).await,
            SocketEvent::Disconnected {
                status: CloseStatus::Error,
            }
        ));
        assert_eq!(client.state(), ClientState::Disconnected);

        // The peer sees the raw connection close with nothing written to it.
        assert_eq!(timeout(WAIT, peer).await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_connect_echo_and_explicit_disconnect() {
        let (listener, addr) = bound_listener().await;
        spawn_echo_server(listener);

        let options = ClientOptions {
            reconnect_delay: None,
            ..ClientOptions::default()
        };
        let (client, mut events) = ClientSocket::new(options).unwrap();
        client.connect(Endpoint::plain(addr)).unwrap();

        wait_connected(&mut events).await;
        assert_eq!(client.state(), ClientState::Connected);
        assert!(client.connect(Endpoint::plain(addr)).is_err());

        let cancel = CancellationToken::new();
        assert_eq!(client.send(b"hello", &cancel).await, SendStatus::Sent);
        assert_eq!(&next_received(&mut events).await[..], b"hello");

        client.disconnect().await;
        assert_eq!(client.state(), ClientState::Disconnected);
        loop {
            match next_event(&mut events).await {
                SocketEvent::Disconnected { status } => {
                    assert_eq!(status, CloseStatus::ClosedLocal);
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_explicit_disconnect_suppresses_reconnect() {
        let (listener, addr) = bound_listener().await;
        spawn_echo_server(listener);

        let options = ClientOptions {
            reconnect_delay: Some(Duration::from_millis(20)),
            ..ClientOptions::default()
        };
        let (client, mut events) = ClientSocket::new(options).unwrap();

        client.connect(Endpoint::plain(addr)).unwrap();
        wait_connected(&mut events).await;
        client.disconnect().await;

        // No reconnect may be scheduled after an explicit disconnect.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.state(), ClientState::Disconnected);

        // A fresh connect works and the echo arrives exactly once.
        client.connect(Endpoint::plain(addr)).unwrap();
        wait_connected(&mut events).await;

        let cancel = CancellationToken::new();
        assert_eq!(client.send(b"again", &cancel).await, SendStatus::Sent);
        assert_eq!(&next_received(&mut events).await[..], b"again");
        assert!(
            timeout(Duration::from_millis(100), events.recv())
                .await
                .is_err(),
            "no residual message from the prior connection may appear"
        );

        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_server_close_propagates_closed_remote() {
        let (listener, addr) = bound_listener().await;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // Close immediately after accepting.
            drop(stream);
        });

        let options = ClientOptions {
            reconnect_delay: None,
            ..ClientOptions::default()
        };
        let (client, mut events) = ClientSocket::new(options).unwrap();
        client.connect(Endpoint::plain(addr)).unwrap();

        wait_connected(&mut events).await;
        loop {
            match next_event(&mut events).await {
                SocketEvent::Disconnected { status } => {
                    assert_eq!(status, CloseStatus::ClosedRemote);
                    break;
                }
                SocketEvent::Error(e) => panic!("unexpected error event: {e}"),
                _ => continue,
            }
        }
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[tokio::test]
    async fn test_monitor_declares_silent_peer_dead() {
        let (listener, addr) = bound_listener().await;
        // Accept and hold the connection open, but never answer pings.
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let options = ClientOptions {
            monitor: Some(MonitorOptions {
                ping_interval: Duration::from_millis(20),
                max_ping_delay: Duration::from_millis(60),
            }),
            reconnect_delay: None,
            ..ClientOptions::default()
        };
        let (client, mut events) = ClientSocket::new(options).unwrap();
        client.connect(Endpoint::plain(addr)).unwrap();

        wait_connected(&mut events).await;
        loop {
            if let SocketEvent::Disconnected { status } = next_event(&mut events).await {
                assert_eq!(status, CloseStatus::ClosedRemote);
                break;
            }
        }
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[tokio::test]
    async fn test_monitored_connection_stays_alive() {
        use crate::server::{ServerOptions, ServerSocket};

        let (listener, addr) = bound_listener().await;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (server, mut server_events) =
                ServerSocket::new(IoStream::Plain(stream), ServerOptions::default()).unwrap();
            // The server driver answers pings; just drain its events.
            tokio::spawn(async move { while server_events.recv().await.is_some() {} });
            let _ = server.run().await;
        });

        let options = ClientOptions {
            monitor: Some(MonitorOptions {
                ping_interval: Duration::from_millis(20),
                max_ping_delay: Duration::from_millis(60),
            }),
            reconnect_delay: None,
            ..ClientOptions::default()
        };
        let (client, mut events) = ClientSocket::new(options).unwrap();
        client.connect(Endpoint::plain(addr)).unwrap();

        wait_connected(&mut events).await;
        // Several deadline windows pass without a dead-link verdict.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(client.state(), ClientState::Connected);
        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(event, SocketEvent::Disconnected { .. }),
                "monitored connection must stay alive while pongs flow"
            );
        }

        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_unexpected_close_reconnects_after_delay() {
        let (listener, addr) = bound_listener().await;
        tokio::spawn(async move {
            // First connection dies immediately, later ones echo.
            let (first, _) = listener.accept().await.unwrap();
            drop(first);
            spawn_echo_server(listener);
        });

        let options = ClientOptions {
            reconnect_delay: Some(Duration::from_millis(20)),
            ..ClientOptions::default()
        };
        let (client, mut events) = ClientSocket::new(options).unwrap();
        client.connect(Endpoint::plain(addr)).unwrap();

        // First lifecycle: connected, then dropped by the peer.
        wait_connected(&mut events).await;
        loop {
            if let SocketEvent::Disconnected { status } = next_event(&mut events).await {
                assert_eq!(status, CloseStatus::ClosedRemote);
                break;
            }
        }

        // Second lifecycle arrives on its own and is fully usable.
        wait_connected(&mut events).await;
        let cancel = CancellationToken::new();
        assert_eq!(client.send(b"back", &cancel).await, SendStatus::Sent);
        assert_eq!(&next_received(&mut events).await[..], b"back");

        client.disconnect().await;
    }
}
