pub mod buffer_pool;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod frame;
pub mod frame_builder;
pub mod handshake;
pub mod mailbox;
pub mod message;
pub mod postmaster;
pub mod rpc;
pub mod server;
pub mod session;

#[cfg(test)]
mod tests;

pub use buffer_pool::{BufferPool, PooledBuffer};
pub use client::{Client, ClientBuilder, ClientError, ClientResult};
pub use codec::{BincodeCodec, Codec, CodecError};
pub use config::{Config, ConfigError};
pub use error::{Error, Result};
pub use frame::{Frame, FrameError, FrameType};
pub use frame_builder::FrameBuilder;
pub use handshake::{HandshakeListener, Verifier};
pub use mailbox::{Mailbox, MailboxError};
pub use message::{Message, MessageAssembler, MessageError};
pub use postmaster::{MailboxId, Postmaster};
pub use rpc::{
    CancelToken, RemoteException, RpcCallMessageType, RpcError, RpcHandler, RpcProxy, RpcResult,
    ServiceRegistry, WaitTable, RPC_HANDLER_ID,
};
pub use server::Server;
pub use session::{CloseReason, Session, SessionListener, SessionState};
