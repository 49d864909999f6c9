//! Multi-protocol transport server.
//!
//! One public stream listener carries three wire protocols told apart by
//! their first eight bytes: RPC over TLS, RPC over Noise, and an optional
//! HTTP/1.1 fallback. The same public address optionally serves QUIC on UDP.
//! A second, private stream listener carries plain RPC for trusted-network
//! callers.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use aster_noise::{KeyAttestation, NoiseStream};
use aster_rpc::{
    EndpointCollection, ListenMux, Mux, PrefixedStream, RoutedListener, HEADER_LEN, HTTP_PREFIX, NOISE_HEADER,
    RPC_HEADER,
};
use aster_task::TaskGroup;
use axum::Router;
use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::identity::Identity;
use crate::tls;

/// How many rebind attempts to make when an ephemeral public port is free
/// for TCP but taken for UDP.
const EPHEMERAL_BIND_RETRIES: u32 = 10;

const LISTEN_BACKLOG: u32 = 1024;

/// The transport server.
///
/// Construction binds every listener; [`Server::run`] serves them until
/// canceled or closed; [`Server::close`] shuts down idempotently and waits
/// for the in-flight `run` to return.
pub struct Server {
    config: ServerConfig,
    identity: Arc<Identity>,
    tls_acceptor: TlsAcceptor,
    noise_config: aster_noise::Config,
    quic_server_config: Option<quinn::ServerConfig>,

    public_tcp: Mutex<Option<TcpListener>>,
    public_udp: Mutex<Option<std::net::UdpSocket>>,
    private_tcp: Mutex<Option<TcpListener>>,

    addr: Option<SocketAddr>,
    private_addr: SocketAddr,
    quic_bound: bool,

    public_endpoints_all: Arc<EndpointCollection>,
    public_endpoints_replay_safe: Arc<EndpointCollection>,
    private_endpoints: Arc<EndpointCollection>,

    http_fallback: Mutex<Option<Router>>,

    lifecycle: Mutex<()>,
    done: CancellationToken,
    runs: TaskTracker,
}

impl Server {
    /// Binds all listeners and derives the per-protocol configurations.
    ///
    /// Must be called within a tokio runtime. Partially acquired listeners
    /// are released on failure.
    pub fn new(identity: Identity, config: ServerConfig) -> anyhow::Result<Self> {
        let noise_config = aster_noise::Config::derive_from_seed(&identity.signing_key().to_bytes());

        let tls_config = tls::build_server_config(&identity)?;
        let tls_acceptor = TlsAcceptor::from(Arc::new(tls_config));

        let quic_server_config = if config.disable_quic {
            None
        } else {
            Some(tls::build_quic_server_config(&identity)?)
        };

        let public_addr = resolve_listen_addr(&config.address).context("invalid public address")?;
        let configured_port = public_addr.port();

        let mut public_tcp = None;
        let mut public_udp = None;

        for attempt in 0u32.. {
            let mut bind_addr = public_addr;

            if !config.disable_tcp {
                let listener = bind_public_tcp(&config, bind_addr)?;
                bind_addr = listener.local_addr().context("failed to read bound TCP address")?;
                public_tcp = Some(listener);
            }

            if !config.disable_quic {
                match std::net::UdpSocket::bind(bind_addr) {
                    Ok(socket) => {
                        socket
                            .set_nonblocking(true)
                            .context("failed to make UDP socket non-blocking")?;
                        public_udp = Some(socket);
                    }
                    Err(error)
                        if error.kind() == io::ErrorKind::AddrInUse
                            && configured_port == 0
                            && attempt < EPHEMERAL_BIND_RETRIES =>
                    {
                        // The OS picked a TCP port whose UDP twin is taken.
                        // Release the TCP listener and try another pair.
                        debug!(attempt, port = bind_addr.port(), "ephemeral UDP port taken, rebinding the pair");
                        public_tcp = None;
                        continue;
                    }
                    Err(error) => {
                        return Err(error).context("failed to bind public UDP socket");
                    }
                }
            }

            break;
        }

        let addr = match (&public_tcp, &public_udp) {
            (Some(listener), _) => Some(listener.local_addr().context("failed to read bound TCP address")?),
            (None, Some(socket)) => Some(socket.local_addr().context("failed to read bound UDP address")?),
            (None, None) => None,
        };

        let private_addr = resolve_listen_addr(&config.private_address).context("invalid private address")?;
        let private_tcp = bind_tcp(private_addr).context("failed to bind private listener")?;
        let private_addr = private_tcp
            .local_addr()
            .context("failed to read bound private address")?;

        let quic_bound = public_udp.is_some();

        info!(
            public = ?addr,
            private = %private_addr,
            quic = quic_bound,
            "transport server listeners bound"
        );

        Ok(Self {
            config,
            identity: Arc::new(identity),
            tls_acceptor,
            noise_config,
            quic_server_config,
            public_tcp: Mutex::new(public_tcp),
            public_udp: Mutex::new(public_udp),
            private_tcp: Mutex::new(Some(private_tcp)),
            addr,
            private_addr,
            quic_bound,
            public_endpoints_all: Arc::new(EndpointCollection::new()),
            public_endpoints_replay_safe: Arc::new(EndpointCollection::new()),
            private_endpoints: Arc::new(EndpointCollection::new()),
            http_fallback: Mutex::new(None),
            lifecycle: Mutex::new(()),
            done: CancellationToken::new(),
            runs: TaskTracker::new(),
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Public bound address; the stream listener's when present, otherwise
    /// the datagram socket's.
    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn private_addr(&self) -> SocketAddr {
        self.private_addr
    }

    /// Registration handle for endpoints served on every public protocol.
    pub fn rpc(&self) -> &Arc<Mux> {
        self.public_endpoints_all.mux()
    }

    /// Registration handle for endpoints that are safe to serve over Noise,
    /// which lacks the replay defense TLS session binding provides.
    pub fn replay_safe_rpc(&self) -> &Arc<Mux> {
        self.public_endpoints_replay_safe.mux()
    }

    /// Registration handle for the private endpoint surface.
    pub fn private_rpc(&self) -> &Arc<Mux> {
        self.private_endpoints.mux()
    }

    /// Whether QUIC is enabled by config and the UDP port was bound.
    pub fn is_quic_enabled(&self) -> bool {
        !self.config.disable_quic && self.quic_bound
    }

    /// Signed attestation over the server's Noise public key.
    pub fn noise_key_attestation(&self) -> KeyAttestation {
        KeyAttestation::sign(
            self.identity.signing_key(),
            self.noise_config.public_key(),
            OffsetDateTime::now_utc(),
        )
    }

    /// Serves `router` to public stream connections that look like HTTP.
    ///
    /// Must be called before [`Server::run`].
    pub fn set_http_fallback(&self, router: Router) {
        *self.http_fallback.lock() = Some(router);
    }

    /// Drives the server until `cancel` fires, [`Server::close`] is called,
    /// or a serving task fails. May be called exactly once per lifetime.
    pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let run = {
            let _lifecycle = self.lifecycle.lock();

            if self.done.is_cancelled() {
                anyhow::bail!("server closed");
            }

            self.runs.track_future(self.run_inner(cancel))
        };

        run.await
    }

    async fn run_inner(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let public_tcp = self.public_tcp.lock().take();
        let public_udp = self.public_udp.lock().take();
        let private_tcp = self
            .private_tcp
            .lock()
            .take()
            .context("server already started")?;
        let http_fallback = self.http_fallback.lock().take();

        let quic_endpoint = match (public_udp, &self.quic_server_config) {
            (Some(socket), Some(server_config)) => Some(
                quinn::Endpoint::new(
                    quinn::EndpointConfig::default(),
                    Some(server_config.clone()),
                    socket,
                    Arc::new(quinn::TokioRuntime),
                )
                .context("failed to create QUIC endpoint")?,
            ),
            _ => None,
        };

        // The demultiplexers run on their own scope, canceled only after
        // every serving task has exited. Otherwise serving tasks would
        // observe their routed listeners closing under them and report
        // spurious errors on shutdown.
        let mux_cancel = CancellationToken::new();
        let mut mux_group = TaskGroup::new();

        let mut public_routes = None;
        if let Some(listener) = public_tcp {
            let mut mux = ListenMux::new(listener, HEADER_LEN);
            let tls_route = mux.route(RPC_HEADER);
            let noise_route = mux.route(NOISE_HEADER);
            let http_route = http_fallback
                .is_some()
                .then(|| mux.route_passthrough(HTTP_PREFIX));

            let mux_cancel = mux_cancel.clone();
            mux_group.spawn(async move { mux.run(mux_cancel).await.context("public listen mux failed") });

            public_routes = Some((tls_route, noise_route, http_route));
        }

        let private_route = {
            let mut mux = ListenMux::new(private_tcp, HEADER_LEN);
            let route = mux.route(RPC_HEADER);

            let mux_cancel = mux_cancel.clone();
            mux_group.spawn(async move { mux.run(mux_cancel).await.context("private listen mux failed") });

            route
        };

        // Everything consuming the routed listeners runs on the inner scope.
        let inner = cancel.child_token();
        let mut group = TaskGroup::new();

        {
            let done = self.done.clone();
            let inner = inner.clone();
            group.spawn(async move {
                tokio::select! {
                    _ = done.cancelled() => inner.cancel(),
                    _ = inner.cancelled() => {}
                }
                Ok(())
            });
        }

        if let Some((tls_route, noise_route, http_route)) = public_routes {
            {
                let inner = inner.clone();
                let acceptor = self.tls_acceptor.clone();
                let endpoints = Arc::clone(&self.public_endpoints_all);
                group.spawn(async move { serve_tls_route(inner, tls_route, acceptor, endpoints).await });
            }

            {
                let inner = inner.clone();
                let noise_config = self.noise_config.clone();
                let endpoints = Arc::clone(&self.public_endpoints_replay_safe);
                group.spawn(async move { serve_noise_route(inner, noise_route, noise_config, endpoints).await });
            }

            if let (Some(http_route), Some(router)) = (http_route, http_fallback) {
                let inner = inner.clone();
                group.spawn(async move { serve_http_route(inner, http_route, router).await });
            }
        }

        if let Some(endpoint) = quic_endpoint {
            let inner = inner.clone();
            let endpoints = Arc::clone(&self.public_endpoints_all);
            group.spawn(async move { serve_quic_endpoint(inner, endpoint, endpoints).await });
        }

        {
            let inner = inner.clone();
            let endpoints = Arc::clone(&self.private_endpoints);
            group.spawn(async move { serve_plain_route(inner, private_route, endpoints).await });
        }

        // Wait for everything using the routed listeners to exit, then shut
        // the demultiplexers down.
        let serve_result = group.wait().await;

        mux_cancel.cancel();
        let mux_result = mux_group.wait().await;

        match (serve_result, mux_result) {
            (Err(serve_error), Err(mux_error)) => {
                warn!(error = format!("{mux_error:#}"), "listen mux failure during shutdown");
                Err(serve_error)
            }
            (Err(error), Ok(())) | (Ok(()), Err(error)) => Err(error),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    /// Shuts the server down and waits for the in-flight [`Server::run`] to
    /// return, then releases any listener `run` never took. Idempotent.
    pub async fn close(&self) {
        {
            let _lifecycle = self.lifecycle.lock();
            self.done.cancel();
            self.runs.close();
        }

        self.runs.wait().await;

        // Release listeners in case run was never called. Shutdown order:
        // the QUIC endpoint owns the UDP socket once run builds it, so the
        // stream side can never outlive the socket here.
        drop(self.public_udp.lock().take());
        drop(self.public_tcp.lock().take());
        drop(self.private_tcp.lock().take());
    }
}

async fn serve_tls_route(
    inner: CancellationToken,
    mut route: RoutedListener,
    acceptor: TlsAcceptor,
    endpoints: Arc<EndpointCollection>,
) -> anyhow::Result<()> {
    let _exit_guard = inner.clone().drop_guard();
    let mut sessions: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = inner.cancelled() => break,
            accepted = route.accept() => {
                let Some(stream) = accepted else { break };

                let acceptor = acceptor.clone();
                let endpoints = Arc::clone(&endpoints);
                let inner = inner.clone();
                sessions.spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            if let Err(error) = endpoints.server().serve_stream(&inner, tls_stream).await {
                                debug!(%error, "TLS RPC session ended with error");
                            }
                        }
                        Err(error) => debug!(%error, "TLS handshake failed"),
                    }
                });
            }
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }

    Ok(())
}

async fn serve_noise_route(
    inner: CancellationToken,
    mut route: RoutedListener,
    noise_config: aster_noise::Config,
    endpoints: Arc<EndpointCollection>,
) -> anyhow::Result<()> {
    let _exit_guard = inner.clone().drop_guard();
    let mut sessions: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = inner.cancelled() => break,
            accepted = route.accept() => {
                let Some(stream) = accepted else { break };

                let noise_config = noise_config.clone();
                let endpoints = Arc::clone(&endpoints);
                let inner = inner.clone();
                sessions.spawn(async move {
                    match NoiseStream::responder(stream, &noise_config).await {
                        Ok(noise_stream) => {
                            if let Err(error) = endpoints.server().serve_stream(&inner, noise_stream).await {
                                debug!(%error, "Noise RPC session ended with error");
                            }
                        }
                        Err(error) => debug!(%error, "Noise handshake failed"),
                    }
                });
            }
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }

    Ok(())
}

async fn serve_plain_route(
    inner: CancellationToken,
    mut route: RoutedListener,
    endpoints: Arc<EndpointCollection>,
) -> anyhow::Result<()> {
    let _exit_guard = inner.clone().drop_guard();
    let mut sessions: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = inner.cancelled() => break,
            accepted = route.accept() => {
                let Some(stream) = accepted else { break };

                let endpoints = Arc::clone(&endpoints);
                let inner = inner.clone();
                sessions.spawn(async move {
                    if let Err(error) = endpoints.server().serve_stream(&inner, stream).await {
                        debug!(%error, "private RPC session ended with error");
                    }
                });
            }
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }

    Ok(())
}

async fn serve_quic_endpoint(
    inner: CancellationToken,
    endpoint: quinn::Endpoint,
    endpoints: Arc<EndpointCollection>,
) -> anyhow::Result<()> {
    let _exit_guard = inner.clone().drop_guard();
    let mut sessions: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = inner.cancelled() => break,
            incoming = endpoint.accept() => {
                let Some(incoming) = incoming else { break };

                let endpoints = Arc::clone(&endpoints);
                let inner = inner.clone();
                sessions.spawn(async move {
                    let connection = match incoming.await {
                        Ok(connection) => connection,
                        Err(error) => {
                            debug!(%error, "QUIC handshake failed");
                            return;
                        }
                    };

                    // One RPC session per connection, over a single
                    // bidirectional stream opened by the client.
                    match connection.accept_bi().await {
                        Ok((send, recv)) => {
                            let stream = tokio::io::join(recv, send);
                            if let Err(error) = endpoints.server().serve_stream(&inner, stream).await {
                                debug!(%error, "QUIC RPC session ended with error");
                            }
                        }
                        Err(error) => debug!(%error, "QUIC stream was not opened"),
                    }
                });
            }
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }

    endpoint.close(0u32.into(), b"server shutdown");
    Ok(())
}

async fn serve_http_route(
    inner: CancellationToken,
    mut route: RoutedListener,
    router: Router,
) -> anyhow::Result<()> {
    let _exit_guard = inner.clone().drop_guard();

    let service = hyper_util::service::TowerToHyperService::new(router);
    let mut sessions: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = inner.cancelled() => break,
            accepted = route.accept() => {
                let Some(stream) = accepted else { break };

                let service = service.clone();
                let inner = inner.clone();
                sessions.spawn(async move {
                    serve_http_connection(inner, stream, service).await;
                });
            }
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }

    Ok(())
}

async fn serve_http_connection(
    inner: CancellationToken,
    stream: PrefixedStream<TcpStream>,
    service: hyper_util::service::TowerToHyperService<Router>,
) {
    let builder = hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new());
    let io = hyper_util::rt::TokioIo::new(stream);

    let connection = builder.serve_connection(io, service);
    tokio::pin!(connection);

    tokio::select! {
        result = connection.as_mut() => {
            if let Err(error) = result {
                debug!(error = format!("{error}"), "HTTP fallback connection ended with error");
            }
        }
        _ = inner.cancelled() => {
            connection.as_mut().graceful_shutdown();
            let _ = connection.as_mut().await;
        }
    }
}

fn bind_public_tcp(config: &ServerConfig, addr: SocketAddr) -> anyhow::Result<TcpListener> {
    let socket = new_tcp_socket(addr)?;

    if config.tcp_fast_open {
        enable_tcp_fast_open(&socket, config.tcp_fast_open_queue);
    }

    socket.bind(addr).context("failed to bind public TCP socket")?;
    socket
        .listen(LISTEN_BACKLOG)
        .context("failed to listen on the bound public TCP socket")
}

fn bind_tcp(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    let socket = new_tcp_socket(addr)?;
    socket.bind(addr).context("failed to bind TCP socket")?;
    socket
        .listen(LISTEN_BACKLOG)
        .context("failed to listen on the bound TCP socket")
}

fn new_tcp_socket(addr: SocketAddr) -> anyhow::Result<TcpSocket> {
    if addr.is_ipv4() {
        TcpSocket::new_v4().context("failed to create IPv4 TCP socket")
    } else {
        TcpSocket::new_v6().context("failed to create IPv6 TCP socket")
    }
}

#[cfg(target_os = "linux")]
fn enable_tcp_fast_open(socket: &TcpSocket, queue: u32) {
    use std::os::fd::AsRawFd as _;

    let queue = libc::c_int::try_from(queue).unwrap_or(libc::c_int::MAX);

    // SAFETY: setsockopt is called with a valid, owned socket fd and an
    // option value of the exact size advertised.
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_FASTOPEN,
            std::ptr::addr_of!(queue).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if rc != 0 {
        info!(
            error = %io::Error::last_os_error(),
            "failed to set TCP fast open for this socket"
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn enable_tcp_fast_open(_socket: &TcpSocket, _queue: u32) {}

/// Resolves a listen address, accepting the `":7777"` all-interfaces
/// shorthand.
fn resolve_listen_addr(address: &str) -> anyhow::Result<SocketAddr> {
    use std::net::ToSocketAddrs as _;

    let address = if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_owned()
    };

    address
        .to_socket_addrs()
        .with_context(|| format!("cannot resolve listen address: {address}"))?
        .next()
        .with_context(|| format!("listen address resolved to nothing: {address}"))
}
