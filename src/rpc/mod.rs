// ABOUTME: RPC layer module group: wire encoding, correlation tables, dispatch, and the client-side proxy.
// ABOUTME: Layered as wire -> error -> wait_table -> service -> handler -> proxy.

pub mod error;
pub mod handler;
pub mod proxy;
pub mod service;
pub mod wait_table;
pub mod wire;

pub use error::{RpcError, RpcResult};
pub use handler::{RpcHandler, RpcSessionListener};
pub use proxy::RpcProxy;
pub use service::{MethodEntry, MethodFuture, MethodInvoker, ServiceRegistry};
pub use wait_table::{CancelToken, RemoteCancelTable, WaitOutcome, WaitTable};
pub use wire::{RemoteException, RpcCallMessageType, RpcMessage, RpcWireError, RPC_HANDLER_ID};
