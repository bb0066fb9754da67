//! TLS-terminating listener for `axum::serve`.
//!
//! Every accepted TCP connection is handshaken in its own task, so a slow or
//! hostile peer never blocks the accept loop.  Completed connections are
//! handed to axum through a bounded channel, carrying the peer's certificate
//! chain as [`PeerCertificates`] connect info.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::connect_info::Connected;
use axum::serve::{IncomingStream, Listener};
use rustls::pki_types::CertificateDer;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tracing::{debug, warn};

use crate::identity::CertIdentity;

/// Upper bound on one TLS handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Handshaken connections waiting for axum to pick them up.
const READY_BACKLOG: usize = 128;

/// Back-off after a failed `accept(2)` (e.g. file descriptor exhaustion).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

// ─────────────────────────────────────────────────────────────────────────────
// Connect info
// ─────────────────────────────────────────────────────────────────────────────

/// Certificate chain the peer presented during the handshake (leaf first).
///
/// Empty when the client connected without a certificate.
#[derive(Debug, Clone)]
pub struct PeerCertificates {
    /// Remote socket address.
    pub remote_addr: SocketAddr,
    chain: Arc<[CertificateDer<'static>]>,
}

impl PeerCertificates {
    /// Wrap a verified chain.
    #[must_use]
    pub fn new(remote_addr: SocketAddr, chain: Vec<CertificateDer<'static>>) -> Self {
        Self {
            remote_addr,
            chain: chain.into(),
        }
    }

    /// A connection without a client certificate.
    #[must_use]
    pub fn anonymous(remote_addr: SocketAddr) -> Self {
        Self::new(remote_addr, Vec::new())
    }

    /// The full chain.
    #[must_use]
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// The end-entity certificate, if any.
    #[must_use]
    pub fn leaf(&self) -> Option<&CertificateDer<'static>> {
        self.chain.first()
    }

    /// Whether no certificate was presented.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Common Name of the leaf.
    #[must_use]
    pub fn common_name(&self) -> Option<String> {
        self.leaf().and_then(|der| CertIdentity::common_name_of(der))
    }
}

impl<'a> Connected<IncomingStream<'a, MtlsListener>> for PeerCertificates {
    fn connect_info(target: IncomingStream<'a, MtlsListener>) -> Self {
        target.io().peer().clone()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stream
// ─────────────────────────────────────────────────────────────────────────────

/// A server-side TLS stream and the peer identity captured at handshake.
pub struct MtlsStream {
    inner: TlsStream<TcpStream>,
    peer: PeerCertificates,
}

impl MtlsStream {
    fn new(inner: TlsStream<TcpStream>, remote_addr: SocketAddr) -> Self {
        let (_, conn) = inner.get_ref();
        let chain = conn
            .peer_certificates()
            .map(<[CertificateDer<'static>]>::to_vec)
            .unwrap_or_default();
        Self {
            inner,
            peer: PeerCertificates::new(remote_addr, chain),
        }
    }

    /// Peer identity captured at handshake.
    #[must_use]
    pub fn peer(&self) -> &PeerCertificates {
        &self.peer
    }
}

impl AsyncRead for MtlsStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MtlsStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Listener
// ─────────────────────────────────────────────────────────────────────────────

/// Listener yielding TLS-terminated connections.
pub struct MtlsListener {
    local_addr: SocketAddr,
    ready: mpsc::Receiver<(MtlsStream, SocketAddr)>,
    accept_task: JoinHandle<()>,
}

impl MtlsListener {
    /// Start accepting on `tcp`.  Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket's local address cannot be read.
    pub fn new(tcp: TcpListener, acceptor: TlsAcceptor) -> io::Result<Self> {
        let local_addr = tcp.local_addr()?;
        let (tx, ready) = mpsc::channel(READY_BACKLOG);
        let accept_task = tokio::spawn(accept_loop(tcp, acceptor, tx));
        Ok(Self {
            local_addr,
            ready,
            accept_task,
        })
    }

    /// Address the socket was bound to.
    #[must_use]
    pub fn bound_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for MtlsListener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl Listener for MtlsListener {
    type Io = MtlsStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.ready.recv().await {
            Some(conn) => conn,
            // The accept loop only ends when the listener itself is dropped.
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

async fn accept_loop(
    tcp: TcpListener,
    acceptor: TlsAcceptor,
    ready: mpsc::Sender<(MtlsStream, SocketAddr)>,
) {
    loop {
        let (stream, addr) = match tcp.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "TCP accept failed");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
        };
        if ready.is_closed() {
            return;
        }

        let acceptor = acceptor.clone();
        let ready = ready.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => {
                    let stream = MtlsStream::new(tls, addr);
                    debug!(
                        peer_addr = %addr,
                        client_cert = !stream.peer().is_empty(),
                        "TLS connection established"
                    );
                    // Receiver gone means the server is shutting down.
                    let _ = ready.send((stream, addr)).await;
                }
                Ok(Err(e)) => {
                    warn!(peer_addr = %addr, error = %e, "TLS handshake failed");
                }
                Err(_) => {
                    warn!(peer_addr = %addr, timeout = ?HANDSHAKE_TIMEOUT, "TLS handshake timed out");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::{AltNames, CertificateAuthority, KeyRole};

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn anonymous_peer_has_no_identity() {
        let peer = PeerCertificates::anonymous(addr());
        assert!(peer.is_empty());
        assert!(peer.leaf().is_none());
        assert!(peer.common_name().is_none());
    }

    #[test]
    fn peer_common_name_comes_from_the_leaf() {
        let ca = CertificateAuthority::generate("apiserver", 30).unwrap();
        let leaf = ca.issue(KeyRole::Client, &AltNames::dns("rudro"), 30).unwrap();

        let peer = PeerCertificates::new(addr(), vec![leaf.cert_der().clone(), ca.cert_der().clone()]);

        assert_eq!(peer.chain().len(), 2);
        assert_eq!(peer.common_name().as_deref(), Some("rudro"));
    }
}
