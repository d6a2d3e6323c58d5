//! Per-connection state machine.
//!
//! ```text
//! TlsHandshake ──ok──▶ Classify ──preamble──▶ Bridge ──▶ BridgeHandoff
//!      │                  │
//!      │                  └──other bytes──▶ Http ──▶ Forwarded
//!      └──error / timeout──────────────────────────▶ Rejected
//! ```
//!
//! Transitions are strictly sequential. Every exit path drops the socket.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::Router;
use bytes::{Buf, Bytes};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tower::ServiceExt;
use tracing::debug;

use super::router::ClientAddr;
use crate::gateway::GatewayState;
use crate::tunnel::{TUNNEL_PREAMBLE, TunnelBridge};

/// How a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    /// Served as HTTP until the peer went away.
    Forwarded,
    /// Closed without reaching a codec.
    Rejected(String),
    /// Handed to the tunnel bridge, which ran until the session closed.
    BridgeHandoff,
}

enum ConnState<IO> {
    TlsHandshake(IO),
    Classify(TlsStream<IO>),
    Http(PrefixedStream<TlsStream<IO>>),
    Bridge(TlsStream<IO>),
}

/// First bytes after the TLS handshake.
enum Sniffed {
    Tunnel,
    Other(Bytes),
}

/// Protocol multiplexer for the gateway port.
pub struct Multiplexer {
    state: Arc<GatewayState>,
    acceptor: TlsAcceptor,
    router: Router,
}

impl Multiplexer {
    /// Build a multiplexer around a TLS config and the shared state.
    #[must_use]
    pub fn new(state: Arc<GatewayState>, tls_config: Arc<rustls::ServerConfig>) -> Self {
        let router = super::router::create_router(Arc::clone(&state));
        Self {
            state,
            acceptor: TlsAcceptor::from(tls_config),
            router,
        }
    }

    /// Drive one accepted connection to a terminal state.
    pub async fn serve_connection<IO>(&self, io: IO, peer: SocketAddr) -> Terminal
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let limit = self.state.settings.handshake_timeout;
        let mut conn = ConnState::TlsHandshake(io);

        loop {
            conn = match conn {
                ConnState::TlsHandshake(io) => match timeout(limit, self.acceptor.accept(io)).await
                {
                    Ok(Ok(tls)) => ConnState::Classify(tls),
                    Ok(Err(e)) => return rejected(peer, format!("TLS handshake failed: {e}")),
                    Err(_) => return rejected(peer, "TLS handshake timed out".to_string()),
                },

                ConnState::Classify(mut tls) => match timeout(limit, sniff(&mut tls)).await {
                    Ok(Ok(Sniffed::Tunnel)) if self.state.settings.tunnel_secret.is_some() => {
                        ConnState::Bridge(tls)
                    }
                    Ok(Ok(Sniffed::Tunnel)) => {
                        return rejected(peer, "tunnel transport disabled".to_string());
                    }
                    Ok(Ok(Sniffed::Other(prefix))) if prefix.is_empty() => {
                        return rejected(peer, "closed before first request".to_string());
                    }
                    Ok(Ok(Sniffed::Other(prefix))) => {
                        ConnState::Http(PrefixedStream::new(prefix, tls))
                    }
                    Ok(Err(e)) => return rejected(peer, format!("read failed: {e}")),
                    Err(_) => return rejected(peer, "no request within handshake timeout".to_string()),
                },

                ConnState::Http(stream) => {
                    self.serve_http(stream, peer).await;
                    return Terminal::Forwarded;
                }

                // The session stays on this connection's task, so server
                // shutdown reaches it like any other connection.
                ConnState::Bridge(tls) => {
                    let bridge = TunnelBridge::new(Arc::clone(&self.state));
                    if let Err(e) = bridge.run(tls, Some(peer)).await {
                        debug!(%peer, error = %e, "Tunnel session ended with error");
                    }
                    return Terminal::BridgeHandoff;
                }
            };
        }
    }

    async fn serve_http<S>(&self, stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let router = self.router.clone();
        let service = hyper::service::service_fn(move |mut request: hyper::Request<Incoming>| {
            request.extensions_mut().insert(ClientAddr(peer));
            router.clone().oneshot(request)
        });

        if let Err(e) = auto::Builder::new(TokioExecutor::new())
            .serve_connection(TokioIo::new(stream), service)
            .await
        {
            debug!(%peer, error = %e, "HTTP connection closed with error");
        }
    }
}

fn rejected(peer: SocketAddr, reason: String) -> Terminal {
    debug!(%peer, reason = %reason, "Connection rejected");
    Terminal::Rejected(reason)
}

/// Read until the bytes either spell the tunnel preamble or diverge from it.
async fn sniff<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<Sniffed> {
    let mut buf = [0u8; TUNNEL_PREAMBLE.len()];
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
        if buf[..filled] != TUNNEL_PREAMBLE[..filled] {
            break;
        }
    }
    if filled == buf.len() && buf == *TUNNEL_PREAMBLE {
        Ok(Sniffed::Tunnel)
    } else {
        Ok(Sniffed::Other(Bytes::copy_from_slice(&buf[..filled])))
    }
}

pin_project! {
    /// A stream that replays already-consumed bytes before reading on.
    pub struct PrefixedStream<S> {
        prefix: Bytes,
        #[pin]
        inner: S,
    }
}

impl<S> PrefixedStream<S> {
    /// Replay `prefix`, then read from `inner`.
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        if this.prefix.is_empty() {
            return this.inner.poll_read(cx, buf);
        }
        let n = this.prefix.len().min(buf.remaining());
        buf.put_slice(&this.prefix[..n]);
        this.prefix.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}
