// ABOUTME: Default client: connects, drives the client-side handshake, and exposes an RpcProxy.
// ABOUTME: connect() dials, negotiates the handshake, and blocks until the session is ready or the deadline passes.

use crate::buffer_pool::BufferPool;
use crate::client::error::{ClientError, ClientResult};
use crate::codec::{BincodeCodec, Codec};
use crate::config::Config;
use crate::handshake::HandshakeListener;
use crate::postmaster::Postmaster;
use crate::rpc::{RpcHandler, RpcProxy, RpcResult, RpcSessionListener, ServiceRegistry};
use crate::session::{CloseReason, Session, SessionState};
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use socket2::Socket;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpStream, ToSocketAddrs};

/// A connected postmq client: owns the session, the RPC dispatcher (for
/// calls this side also serves), and a proxy for calls this side issues.
pub struct Client<C: Codec + Clone = BincodeCodec> {
    session: Arc<Session>,
    handshake: Arc<HandshakeListener>,
    registry: Arc<ServiceRegistry>,
    proxy: RpcProxy<C>,
}

impl Client<BincodeCodec> {
    /// Connects, performs the handshake, and blocks until the session is
    /// ready for RPC traffic (or the handshake fails / times out).
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
        config: Config,
        auth_data: Option<Bytes>,
    ) -> ClientResult<Self> {
        Self::connect_with_codec(addr, config, auth_data, BincodeCodec).await
    }
}

impl<C: Codec + Clone + Send + Sync + 'static> Client<C> {
    pub async fn connect_with_codec<A: ToSocketAddrs>(
        addr: A,
        config: Config,
        auth_data: Option<Bytes>,
        codec: C,
    ) -> ClientResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        let stream = apply_transport_options(stream)?;
        let (read_half, write_half) = stream.into_split();

        let postmaster = Postmaster::new(config.max_read_write_workers);
        let registry = Arc::new(ServiceRegistry::new());
        let handler = Arc::new(RpcHandler::new(registry.clone()));
        let rpc_listener = Arc::new(RpcSessionListener::new(handler.clone()));
        let handshake = HandshakeListener::client(config.clone(), auth_data, rpc_listener);
        let buffer_pool = BufferPool::new(2, config.send_and_receive_buffer_size);

        let session = Session::new(config.clone(), postmaster, write_half, handshake.clone())?;

        tokio::spawn({
            let session = session.clone();
            async move {
                session.run_reader(read_half, &buffer_pool).await;
            }
        });
        tokio::spawn({
            let session = session.clone();
            async move {
                session.run_ping_loop().await;
            }
        });
        tokio::spawn({
            let session = session.clone();
            async move {
                session.run_timeout_watchdog().await;
            }
        });

        let gate = handshake.clone();
        let is_authenticated: Arc<dyn Fn() -> bool + Send + Sync> = Arc::new(move || gate.is_ready());
        let proxy = RpcProxy::new(&session, handler.wait_table(), codec, is_authenticated);

        let client = Self {
            session,
            handshake,
            registry,
            proxy,
        };
        client.await_handshake(config.connection_timeout).await?;
        Ok(client)
    }

    async fn await_handshake(&self, timeout: Duration) -> ClientResult<()> {
        let deadline = Instant::now() + timeout.max(Duration::from_millis(1));
        loop {
            if self.handshake.is_ready() {
                return Ok(());
            }
            match self.session.state() {
                SessionState::Closed(CloseReason::AuthenticationFailure) => {
                    return Err(ClientError::AuthenticationFailed);
                }
                SessionState::Closed(_) => return Err(ClientError::HandshakeIncomplete),
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(ClientError::HandshakeIncomplete);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Registers a local method so the peer can call back into this side —
    /// postmq connections are symmetric once the handshake completes.
    pub fn register_method2<A, B, R, F, Fut>(&self, service: impl Into<String>, method: impl Into<String>, codec: C, handler: F)
    where
        A: DeserializeOwned + Send + 'static,
        B: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A, B) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<R, crate::rpc::RemoteException>> + Send + 'static,
    {
        self.registry.register_method2(service, method, codec, handler);
    }

    pub async fn call<A, B, R>(
        &self,
        service: &str,
        method: &str,
        arg0: &A,
        arg1: &B,
        cancel: Option<crate::rpc::CancelToken>,
    ) -> RpcResult<R>
    where
        A: Serialize,
        B: Serialize,
        R: DeserializeOwned,
    {
        self.proxy.call(service, method, arg0, arg1, cancel).await
    }

    pub fn call_no_return<A, B>(&self, service: &str, method: &str, arg0: &A, arg1: &B) -> RpcResult<()>
    where
        A: Serialize,
        B: Serialize,
    {
        self.proxy.call_no_return(service, method, arg0, arg1)
    }

    pub fn is_authenticated(&self) -> bool {
        self.handshake.is_ready()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub async fn disconnect(&self) {
        self.session.close(CloseReason::ClientClosing);
    }
}

/// Applies `NO_DELAY=true, DONT_LINGER=true` to the connected socket.
/// `into_std`/`from_std` round-trip through `socket2` since tokio's
/// `TcpStream` doesn't expose `SO_LINGER` directly.
fn apply_transport_options(stream: TcpStream) -> std::io::Result<TcpStream> {
    let std_stream = stream.into_std()?;
    let socket = Socket::from(std_stream);
    socket.set_nodelay(true)?;
    socket.set_linger(Some(Duration::ZERO))?;
    socket.set_nonblocking(true)?;
    TcpStream::from_std(socket.into())
}
