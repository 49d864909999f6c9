use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf as _, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A stream with already-consumed bytes replayed in front of it.
///
/// Routes that keep their sniffed header (the HTTP fallback) see the
/// connection exactly as the peer sent it.
pub struct PrefixedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }

    pub fn into_inner(self) -> (Bytes, S) {
        (self.prefix, self.inner)
    }
}

impl<S> AsyncRead for PrefixedStream<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.prefix.is_empty() {
            let n = usize::min(this.prefix.len(), buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for PrefixedStream<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[derive(Clone)]
struct Route {
    prefix: Vec<u8>,
    strip: bool,
    tx: mpsc::Sender<PrefixedStream<TcpStream>>,
}

/// Receiving side of one demultiplexed route.
pub struct RoutedListener {
    rx: mpsc::Receiver<PrefixedStream<TcpStream>>,
}

impl RoutedListener {
    /// Next connection routed here, or `None` once the mux is gone.
    pub async fn accept(&mut self) -> Option<PrefixedStream<TcpStream>> {
        self.rx.recv().await
    }
}

/// Demultiplexes a TCP listener by the first bytes of each connection.
///
/// Every accepted connection is sniffed on its own task so a slow client
/// cannot stall the accept loop. Connections whose header matches no
/// registered route are dropped.
pub struct ListenMux {
    listener: TcpListener,
    header_len: usize,
    routes: Vec<Route>,
}

impl ListenMux {
    pub fn new(listener: TcpListener, header_len: usize) -> Self {
        Self {
            listener,
            header_len,
            routes: Vec::new(),
        }
    }

    /// Registers a route whose header is consumed before hand-off.
    pub fn route(&mut self, prefix: impl Into<Vec<u8>>) -> RoutedListener {
        self.add_route(prefix.into(), true)
    }

    /// Registers a route whose header is replayed to the handler.
    pub fn route_passthrough(&mut self, prefix: impl Into<Vec<u8>>) -> RoutedListener {
        self.add_route(prefix.into(), false)
    }

    fn add_route(&mut self, prefix: Vec<u8>, strip: bool) -> RoutedListener {
        assert_eq!(
            prefix.len(),
            self.header_len,
            "route prefix length must match the sniffed header length"
        );

        let (tx, rx) = mpsc::channel(1);
        self.routes.push(Route { prefix, strip, tx });
        RoutedListener { rx }
    }

    /// Accepts and routes until `cancel` fires or the listener fails.
    ///
    /// Returning drops the route senders, which ends every
    /// [`RoutedListener`]; in-flight sniffs are aborted.
    pub async fn run(self, cancel: CancellationToken) -> io::Result<()> {
        let ListenMux {
            listener,
            header_len,
            routes,
        } = self;

        let routes = Arc::new(routes);
        let mut sniffers: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, peer_addr) = accepted?;
                    let routes = Arc::clone(&routes);
                    sniffers.spawn(async move {
                        sniff_and_route(stream, peer_addr, header_len, &routes).await;
                    });
                }
                Some(_) = sniffers.join_next(), if !sniffers.is_empty() => {}
            }
        }
    }
}

async fn sniff_and_route(mut stream: TcpStream, peer_addr: SocketAddr, header_len: usize, routes: &[Route]) {
    if let Err(error) = stream.set_nodelay(true) {
        debug!(%error, "set_nodelay on TcpStream failed");
    }

    let mut header = vec![0u8; header_len];
    if let Err(error) = stream.read_exact(&mut header).await {
        debug!(%error, client = %peer_addr, "failed to read connection header");
        return;
    }

    for route in routes {
        if route.prefix == header {
            let prefix = if route.strip { Bytes::new() } else { Bytes::from(header) };

            if route.tx.send(PrefixedStream::new(prefix, stream)).await.is_err() {
                debug!(client = %peer_addr, "route is no longer accepting, dropping connection");
            }
            return;
        }
    }

    debug!(client = %peer_addr, "unknown connection prefix, dropping");
}
