// ABOUTME: Client-facing error kind covering connection, handshake, and RPC failures.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed before the handshake completed")]
    HandshakeIncomplete,

    #[error("server rejected authentication")]
    AuthenticationFailed,

    #[error(transparent)]
    Rpc(#[from] crate::rpc::RpcError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;
