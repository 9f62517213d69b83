//! TCP and TLS byte-channel transport.
//!
//! Managed sockets consume an [`IoStream`]: an already-connected duplex byte
//! channel that is either plain TCP or TLS-wrapped. Handshake mechanics live
//! here; everything above this module only reads, writes, and shuts down.

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};

/// Unified stream type that can be either plain TCP or TLS
pub enum IoStream {
    /// Plain TCP stream
    Plain(TcpStream),
    /// TLS stream on the accepting side
    #[cfg(feature = "tls")]
    Tls(tokio_rustls::server::TlsStream<TcpStream>),
    /// TLS stream on the connecting side
    #[cfg(feature = "tls")]
    TlsClient(tokio_rustls::client::TlsStream<TcpStream>),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl IoStream {
    /// Get the peer address of the underlying stream
    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            IoStream::Plain(stream) => stream.peer_addr(),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => stream.get_ref().0.peer_addr(),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => stream.get_ref().0.peer_addr(),
        }
    }
}

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: SocketAddr) -> tokio::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Connect to a TCP address
pub async fn connect_tcp(addr: SocketAddr) -> tokio::io::Result<TcpStream> {
    TcpStream::connect(addr).await
}

// TLS-specific functionality
#[cfg(feature = "tls")]
/// TLS transport built on rustls
pub mod tls {
    use super::*;
    use anyhow::{Context as AnyhowContext, Result};
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
    use rustls::{ClientConfig, RootCertStore, ServerConfig};
    use std::sync::Arc;
    use tokio_rustls::{TlsAcceptor, TlsConnector};
    use tracing::debug;

    /// Build a TLS server configuration from PEM-encoded material.
    pub fn make_server_config(cert_chain_pem: &str, private_key_pem: &str) -> Result<ServerConfig> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let cert_results: Result<Vec<_>, _> =
            rustls_pemfile::certs(&mut cert_chain_pem.as_bytes()).collect();
        let certs = cert_results
            .context("failed to parse certificate chain")?
            .into_iter()
            .map(CertificateDer::from)
            .collect::<Vec<_>>();

        if certs.is_empty() {
            anyhow::bail!("no certificates found in certificate chain");
        }

        let key = {
            let key_results: Result<Vec<_>, _> =
                rustls_pemfile::pkcs8_private_keys(&mut private_key_pem.as_bytes()).collect();
            let mut keys = key_results.context("failed to parse private key")?;
            if keys.is_empty() {
                anyhow::bail!("no private key found");
            }
            PrivateKeyDer::from(keys.remove(0))
        };

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("failed to configure server certificate")?;

        Ok(config)
    }

    /// Build a TLS client configuration trusting the given PEM CA bundle.
    pub fn make_client_config(ca_pem: &str) -> Result<ClientConfig> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut roots = RootCertStore::empty();
        let ca_results: Result<Vec<_>, _> = rustls_pemfile::certs(&mut ca_pem.as_bytes()).collect();
        let ca_certs = ca_results.context("failed to parse CA certificates")?;

        for ca_cert in ca_certs {
            roots
                .add(CertificateDer::from(ca_cert))
                .context("failed to add CA certificate to root store")?;
        }

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(config)
    }

    /// Accept a TLS connection on an already-accepted TCP stream.
    pub async fn accept_tls(config: Arc<ServerConfig>, tcp_stream: TcpStream) -> Result<IoStream> {
        let peer_addr = tcp_stream.peer_addr().ok();
        let acceptor = TlsAcceptor::from(config);

        let tls_stream = acceptor
            .accept(tcp_stream)
            .await
            .with_context(|| format!("TLS handshake failed with {peer_addr:?}"))?;

        debug!(peer = ?peer_addr, "TLS connection accepted");
        Ok(IoStream::Tls(tls_stream))
    }

    /// Connect via TLS over an established TCP stream.
    pub async fn connect_tls(
        config: ClientConfig,
        tcp_stream: TcpStream,
        server_name: &str,
    ) -> Result<IoStream> {
        let peer_addr = tcp_stream.peer_addr().ok();

        let connector = TlsConnector::from(Arc::new(config));
        let sni = ServerName::try_from(server_name.to_owned())
            .map_err(|_| anyhow::anyhow!("invalid server name: {server_name}"))?;

        let tls_stream = connector
            .connect(sni, tcp_stream)
            .await
            .with_context(|| format!("TLS handshake failed with {peer_addr:?} (SNI {server_name})"))?;

        debug!(peer = ?peer_addr, "TLS connection established");
        Ok(IoStream::TlsClient(tls_stream))
    }
}
