// ABOUTME: RPC-layer error kinds surfaced to proxy callers and call handlers.
// ABOUTME: One thiserror enum at the RPC component boundary, wrapping remote exceptions and local timeouts/cancellation.

use crate::rpc::wire::RemoteException;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("unknown method: {service}.{method}")]
    UnknownMethod { service: String, method: String },

    #[error("call cancelled")]
    Cancelled,

    #[error("call timed out")]
    Timeout,

    #[error("remote exception: {0}")]
    Remote(#[from] RemoteException),

    #[error("call attempted before authentication completed")]
    NotAuthenticated,

    #[error("wire error: {0}")]
    Wire(#[from] crate::rpc::wire::RpcWireError),

    #[error("argument codec error: {0}")]
    Codec(#[from] crate::codec::CodecError),

    #[error("session is not connected")]
    NotConnected,
}

pub type RpcResult<T> = std::result::Result<T, RpcError>;
