//! Managed TCP/TLS message sockets for msgsock.
//!
//! This crate layers connection management over the length-prefixed framing
//! in `msgsock-wire`:
//!
//! - [`ManagedSocket`]: raw or messaging wrapper around one connected duplex
//!   channel, with serialized sends and a single receive loop.
//! - [`ConnectionMonitor`]: ping/pong liveness detection above a messaging
//!   socket.
//! - [`ClientSocket`]: connect/reconnect state machine composing a managed
//!   socket and an optional monitor.
//! - [`ServerSocket`]: the accepted-connection counterpart, with no
//!   reconnect.
//!
//! Failures inside the socket loops never surface as errors to the
//! application; they arrive as [`SocketEvent`]s and [`SendStatus`] /
//! [`CloseStatus`] values. The one exception is invalid configuration,
//! which fails fast at construction.
//!
//! ## Example
//!
//! ```rust,no_run
//! use msgsock_socket::{ClientOptions, ClientSocket, Endpoint, SocketEvent};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let (client, mut events) = ClientSocket::new(ClientOptions::default())?;
//! client.connect(Endpoint::plain("127.0.0.1:9000".parse()?))?;
//!
//! let cancel = CancellationToken::new();
//! while let Some(event) = events.recv().await {
//!     match event {
//!         SocketEvent::Connected => {
//!             client.send(b"hello", &cancel).await;
//!         }
//!         SocketEvent::Received(payload) => {
//!             println!("received {} bytes", payload.len());
//!         }
//!         SocketEvent::Disconnected { status } => {
//!             println!("disconnected: {status:?}");
//!         }
//!         SocketEvent::Error(e) => {
//!             eprintln!("socket error: {e:#}");
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
mod driver;
pub mod managed;
pub mod monitor;
pub mod server;
pub mod transport;

pub use client::{ClientOptions, ClientSocket, ClientState, Endpoint, TlsClientConfig};
pub use managed::{
    CloseStatus, ManagedSocket, SendStatus, SocketCloseResult, SocketEvent, SocketMode,
    SocketOptions,
};
pub use monitor::{ConnectionMonitor, MonitorOptions};
pub use server::{ServerOptions, ServerSocket};
pub use transport::{connect_tcp, listen_tcp, IoStream};

#[cfg(feature = "tls")]
pub use transport::tls::{accept_tls, connect_tls, make_client_config, make_server_config};
