// ABOUTME: Accept loop binding a listener from Config, spawning a Session per connection.
// ABOUTME: Enforces max_connections with a semaphore and listener_backlog via socket2.

use crate::buffer_pool::BufferPool;
use crate::config::Config;
use crate::handshake::{HandshakeListener, Verifier};
use crate::postmaster::Postmaster;
use crate::rpc::{RpcHandler, RpcSessionListener, ServiceRegistry};
use crate::session::{CloseReason, Session, SessionListener};
use crate::Result;
use socket2::{Domain, Socket, Type};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

/// Listens on `config.ip`/`config.port`, handshakes and RPC-dispatches each
/// accepted connection against a shared [`ServiceRegistry`], and enforces
/// `max_connections` with a semaphore permit per live session.
pub struct Server {
    config: Config,
    registry: Arc<ServiceRegistry>,
    verifier: Option<Verifier>,
    listener: Mutex<Option<TcpListener>>,
    buffer_pool: BufferPool,
}

impl Server {
    pub fn new(config: Config) -> Self {
        let buffer_pool = BufferPool::new(
            2 * config.max_connections,
            config.send_and_receive_buffer_size,
        );
        Self {
            config,
            registry: Arc::new(ServiceRegistry::new()),
            verifier: None,
            listener: Mutex::new(None),
            buffer_pool,
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Installs the verifier run against a client's `Authenticate` payload.
    /// Required when `config.require_authentication` is set; ignored
    /// otherwise.
    pub fn with_verifier(mut self, verifier: Verifier) -> Self {
        self.verifier = Some(verifier);
        self
    }

    fn bind_listener(&self) -> Result<TcpListener> {
        let addr = SocketAddr::new(self.config.ip, self.config.port);
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(self.config.listener_backlog as i32)?;
        Ok(TcpListener::from_std(socket.into())?)
    }

    /// Binds the listener ahead of [`Server::run`] and returns the actual
    /// local address — useful in tests that bind to port 0 and need to
    /// learn the ephemeral port before connecting a client.
    pub fn bind(&self) -> Result<SocketAddr> {
        let listener = self.bind_listener()?;
        let addr = listener.local_addr()?;
        *self.listener.lock().unwrap() = Some(listener);
        Ok(addr)
    }

    /// Runs the accept loop forever (until the listener errors). Reuses the
    /// listener from a prior [`Server::bind`] call if present.
    pub async fn run(self) -> Result<()> {
        let listener = match self.listener.lock().unwrap().take() {
            Some(listener) => listener,
            None => self.bind_listener()?,
        };
        let permits = Arc::new(Semaphore::new(self.config.max_connections));
        let postmaster = Postmaster::new(self.config.max_read_write_workers);

        loop {
            let permit = permits.clone().acquire_owned().await.expect("semaphore never closed");
            let (stream, peer) = listener.accept().await?;
            tracing::info!(%peer, "accepted connection");

            let config = self.config.clone();
            let registry = self.registry.clone();
            let verifier = self.verifier.clone();
            let postmaster = postmaster.clone();
            let buffer_pool = self.buffer_pool.clone();

            tokio::spawn(async move {
                let _permit = permit;
                if let Err(err) =
                    serve_connection(stream, config, postmaster, registry, verifier, buffer_pool).await
                {
                    tracing::warn!(%peer, error = %err, "connection ended with error");
                }
            });
        }
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    config: Config,
    postmaster: Postmaster,
    registry: Arc<ServiceRegistry>,
    verifier: Option<Verifier>,
    buffer_pool: BufferPool,
) -> Result<()> {
    let stream = apply_transport_options(stream)?;
    let (read_half, write_half) = stream.into_split();

    let handler = Arc::new(RpcHandler::new(registry));
    let rpc_listener: Arc<dyn SessionListener> = Arc::new(RpcSessionListener::new(handler));
    let verifier = verifier.unwrap_or_else(|| Arc::new(|_: &[u8]| !config.require_authentication));
    let handshake = HandshakeListener::server(config.clone(), verifier, rpc_listener);

    let session = Session::new(config.clone(), postmaster, write_half, handshake.clone())?;

    let watchdog = tokio::spawn(handshake_watchdog(session.clone(), handshake.clone()));
    let reader = tokio::spawn({
        let session = session.clone();
        async move { session.run_reader(read_half, &buffer_pool).await }
    });
    let ping_loop = tokio::spawn({
        let session = session.clone();
        async move { session.run_ping_loop().await }
    });
    let timeout_watchdog = tokio::spawn({
        let session = session.clone();
        async move { session.run_timeout_watchdog().await }
    });

    let _ = reader.await;
    ping_loop.abort();
    timeout_watchdog.abort();
    watchdog.abort();
    Ok(())
}

/// Applies `NO_DELAY=true, DONT_LINGER=true` to an accepted connection.
/// `into_std`/`from_std` round-trip through `socket2` since tokio's
/// `TcpStream` doesn't expose `SO_LINGER` directly.
fn apply_transport_options(stream: tokio::net::TcpStream) -> Result<tokio::net::TcpStream> {
    let std_stream = stream.into_std()?;
    let socket = Socket::from(std_stream);
    socket.set_nodelay(true)?;
    socket.set_linger(Some(Duration::ZERO))?;
    socket.set_nonblocking(true)?;
    Ok(tokio::net::TcpStream::from_std(socket.into())?)
}

/// Closes the session with `AuthenticationFailure` if the handshake hasn't
/// completed by [`HandshakeListener::deadline`].
async fn handshake_watchdog(session: Arc<Session>, handshake: Arc<HandshakeListener>) {
    loop {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if handshake.is_ready() {
            return;
        }
        if let Some(deadline) = handshake.deadline() {
            if Instant::now() >= deadline {
                session.close(CloseReason::AuthenticationFailure);
                return;
            }
        }
    }
}
