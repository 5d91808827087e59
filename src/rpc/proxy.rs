// ABOUTME: Client-side RPC stub: encodes a call, blocks on a wait handle, decodes the result.
// ABOUTME: Sends a call frame, then either awaits the matching wait handle or races it against cancellation.

use crate::codec::Codec;
use crate::rpc::error::{RpcError, RpcResult};
use crate::rpc::wait_table::{CancelToken, WaitOutcome, WaitTable};
use crate::rpc::wire::RpcMessage;
use crate::session::Session;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::{Arc, Weak};

/// Client-side stub for `(service, method, positional args)` calls.
///
/// Generic over the argument [`Codec`]; `C` defaults to whatever the caller
/// picks (typically [`crate::codec::BincodeCodec`]) to keep the codec
/// pluggable.
pub struct RpcProxy<C: Codec> {
    session: Weak<Session>,
    wait_table: Arc<WaitTable>,
    codec: C,
    is_authenticated: Arc<dyn Fn() -> bool + Send + Sync>,
}

impl<C: Codec + Clone> RpcProxy<C> {
    pub fn new(
        session: &Arc<Session>,
        wait_table: Arc<WaitTable>,
        codec: C,
        is_authenticated: Arc<dyn Fn() -> bool + Send + Sync>,
    ) -> Self {
        Self {
            session: Arc::downgrade(session),
            wait_table,
            codec,
            is_authenticated,
        }
    }

    fn send(&self, message: crate::message::Message) -> RpcResult<()> {
        let session = self.session.upgrade().ok_or(RpcError::NotConnected)?;
        session.send(message);
        Ok(())
    }

    fn require_authenticated(&self) -> RpcResult<()> {
        if (self.is_authenticated)() {
            Ok(())
        } else {
            Err(RpcError::NotAuthenticated)
        }
    }

    /// A two-argument call expecting a response. `cancel`, if provided, is
    /// the caller's cancellation token — it is never serialized; cancelling
    /// it sends `MethodCancel` and this call fails with
    /// [`RpcError::Cancelled`].
    pub async fn call<A, B, R>(
        &self,
        service: &str,
        method: &str,
        arg0: &A,
        arg1: &B,
        cancel: Option<CancelToken>,
    ) -> RpcResult<R>
    where
        A: Serialize,
        B: Serialize,
        R: DeserializeOwned,
    {
        self.require_authenticated()?;

        let encoded0 = self.codec.encode_field(arg0, 0)?;
        let encoded1 = self.codec.encode_field(arg1, 1)?;
        let (return_id, rx) = self.wait_table.allocate();

        self.send(
            RpcMessage::MethodCall {
                return_id,
                service: service.to_string(),
                method: method.to_string(),
                args: vec![encoded0, encoded1],
            }
            .encode(),
        )?;

        let outcome = match cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        self.wait_table.remove(return_id);
                        let _ = self.send(RpcMessage::MethodCancel { return_id }.encode());
                        return Err(RpcError::Cancelled);
                    }
                    outcome = rx => outcome,
                }
            }
            None => rx.await,
        };

        match outcome {
            Ok(WaitOutcome::Returned(bytes)) => Ok(self.codec.decode_field(&bytes, 0)?),
            Ok(WaitOutcome::Excepted(exception)) => Err(RpcError::Remote(exception)),
            // The sender side was dropped without ever resolving the
            // outcome: treat it the same as a timeout.
            Err(_) => Err(RpcError::Timeout),
        }
    }

    /// A two-argument fire-and-forget call: no wait handle is allocated, no
    /// response is expected.
    pub fn call_no_return<A, B>(&self, service: &str, method: &str, arg0: &A, arg1: &B) -> RpcResult<()>
    where
        A: Serialize,
        B: Serialize,
    {
        self.require_authenticated()?;
        let encoded0 = self.codec.encode_field(arg0, 0)?;
        let encoded1 = self.codec.encode_field(arg1, 1)?;
        self.send(
            RpcMessage::MethodCallNoReturn {
                service: service.to_string(),
                method: method.to_string(),
                args: vec![encoded0, encoded1],
            }
            .encode(),
        )
    }
}
