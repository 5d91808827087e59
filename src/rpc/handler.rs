// ABOUTME: Incoming RPC dispatch and outgoing-return resolution for a single session.
// ABOUTME: Invokes user methods on a spawned task so a slow handler never blocks mailbox I/O.

use crate::message::Message;
use crate::rpc::service::ServiceRegistry;
use crate::rpc::wait_table::{RemoteCancelTable, WaitOutcome, WaitTable};
use crate::rpc::wire::{RemoteException, RpcMessage, RpcWireError};
use crate::session::{CloseReason, Session, SessionListener};
use std::sync::Arc;

/// Per-session RPC message processor: dispatches inbound calls against a
/// shared [`ServiceRegistry`], and resolves this session's own outstanding
/// calls via its [`WaitTable`] when a `MethodReturn`/`MethodException`
/// arrives.
pub struct RpcHandler {
    registry: Arc<ServiceRegistry>,
    wait_table: Arc<WaitTable>,
    remote_cancel: Arc<RemoteCancelTable>,
}

impl RpcHandler {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self {
            registry,
            wait_table: Arc::new(WaitTable::new()),
            remote_cancel: Arc::new(RemoteCancelTable::new()),
        }
    }

    pub fn wait_table(&self) -> Arc<WaitTable> {
        self.wait_table.clone()
    }

    /// Feeds one incoming message through the RPC dispatcher. Intended to
    /// be called from a [`crate::session::SessionListener::on_incoming_message`]
    /// once the session is `Ready` (handshake complete).
    pub fn handle_message(&self, session: &Arc<Session>, message: Message) {
        match RpcMessage::decode(&message) {
            Ok(RpcMessage::MethodCall {
                return_id,
                service,
                method,
                args,
            }) => self.dispatch_call(session, Some(return_id), service, method, args),
            Ok(RpcMessage::MethodCallNoReturn {
                service,
                method,
                args,
            }) => self.dispatch_call(session, None, service, method, args),
            Ok(RpcMessage::MethodReturn { return_id, value }) => {
                self.wait_table.resolve(return_id, WaitOutcome::Returned(value));
            }
            Ok(RpcMessage::MethodException {
                return_id,
                exception,
            }) => {
                self.wait_table
                    .resolve(return_id, WaitOutcome::Excepted(exception));
            }
            Ok(RpcMessage::MethodCancel { return_id }) => {
                self.remote_cancel.cancel(return_id);
            }
            Err(RpcWireError::NotRpc) => {
                // Not ours to handle; some other handler (handshake) owns it.
            }
            Err(err) => {
                tracing::warn!(session_id = %session.id(), error = %err, "malformed RPC message");
                session.close(CloseReason::ProtocolError);
            }
        }
    }

    fn dispatch_call(
        &self,
        session: &Arc<Session>,
        return_id: Option<u16>,
        service: String,
        method: String,
        args: Vec<bytes::Bytes>,
    ) {
        let registry = self.registry.clone();
        let remote_cancel = self.remote_cancel.clone();
        let session = session.clone();

        tokio::spawn(async move {
            let entry = match registry.lookup(&service, &method) {
                Ok(entry) => entry,
                Err(err) => {
                    if let Some(return_id) = return_id {
                        let exception = RemoteException {
                            type_name: "RpcError".to_string(),
                            message: err.to_string(),
                            stack: String::new(),
                        };
                        session.send(RpcMessage::MethodException {
                            return_id,
                            exception,
                        }
                        .encode());
                    }
                    return;
                }
            };

            let cancel_token = match return_id {
                Some(return_id) if entry.takes_cancel_token => {
                    Some(remote_cancel.register(return_id))
                }
                _ => None,
            };

            let result = (entry.invoke)(args, cancel_token).await;

            if let Some(return_id) = return_id {
                remote_cancel.remove(return_id);
                let reply = match result {
                    Ok(value) => RpcMessage::MethodReturn { return_id, value },
                    Err(exception) => RpcMessage::MethodException {
                        return_id,
                        exception,
                    },
                };
                session.send(reply.encode());
            }
        });
    }
}

/// Adapts an [`RpcHandler`] to a [`SessionListener`] so it can sit behind
/// (or be wrapped by) a [`crate::handshake::HandshakeListener`] the same way
/// on the client and the server.
pub struct RpcSessionListener {
    handler: Arc<RpcHandler>,
}

impl RpcSessionListener {
    pub fn new(handler: Arc<RpcHandler>) -> Self {
        Self { handler }
    }
}

impl SessionListener for RpcSessionListener {
    fn on_incoming_message(&self, session: &Arc<Session>, message: Message) {
        self.handler.handle_message(session, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BincodeCodec;
    use crate::config::Config;
    use crate::postmaster::Postmaster;
    use crate::session::SessionListener;

    struct NoopListener;
    impl SessionListener for NoopListener {}

    #[tokio::test]
    async fn unknown_service_is_reported_as_method_exception() {
        let registry = Arc::new(ServiceRegistry::new());
        let handler = Arc::new(RpcHandler::new(registry));

        let postmaster = Postmaster::new(2);
        let (client_writer, mut server_reader) = tokio::io::duplex(8192);
        let session =
            Session::new(Config::default(), postmaster, client_writer, Arc::new(NoopListener)).unwrap();

        let call = RpcMessage::MethodCall {
            return_id: 5,
            service: "Missing".to_string(),
            method: "Go".to_string(),
            args: vec![],
        };
        handler.handle_message(&session, call.encode());

        use tokio::io::AsyncReadExt;
        let mut buf = vec![0u8; 512];
        let n = tokio::time::timeout(std::time::Duration::from_secs(2), server_reader.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf.truncate(n);
        // Gather header (3 bytes) + frame header (3 bytes) + RPC payload.
        assert!(buf.len() > 6);
    }

    #[tokio::test]
    async fn method_call_dispatches_and_writes_method_return_to_the_wire() {
        use crate::codec::Codec;
        use crate::frame_builder::FrameBuilder;
        use crate::message::MessageAssembler;
        use tokio::io::AsyncReadExt;

        let registry = Arc::new(ServiceRegistry::new());
        registry.register_method2(
            "Calculator",
            "Add",
            BincodeCodec,
            |a: i32, b: i32| async move { Ok(a + b) },
        );
        let handler = Arc::new(RpcHandler::new(registry));

        let config = Config::default();
        let postmaster = Postmaster::new(2);
        let (client_writer, mut server_reader) = tokio::io::duplex(8192);
        let session =
            Session::new(config.clone(), postmaster, client_writer, Arc::new(NoopListener)).unwrap();

        let codec = BincodeCodec;
        let call = RpcMessage::MethodCall {
            return_id: 11,
            service: "Calculator".to_string(),
            method: "Add".to_string(),
            args: vec![
                codec.encode_field(&100i32, 0).unwrap(),
                codec.encode_field(&200i32, 1).unwrap(),
            ],
        };
        handler.handle_message(&session, call.encode());

        // Read the gather-wrapped frame(s) off the wire and re-assemble the
        // Message the dispatcher sent back.
        let mut raw = vec![0u8; 512];
        let n = tokio::time::timeout(std::time::Duration::from_secs(2), server_reader.read(&mut raw))
            .await
            .unwrap()
            .unwrap();
        raw.truncate(n);
        assert_eq!(raw[0], 0x00, "expected a gather header");
        let gather_len = u16::from_le_bytes([raw[1], raw[2]]) as usize;
        let frame_bytes = &raw[3..3 + gather_len];

        let mut builder = FrameBuilder::new(config.max_frame_data().unwrap());
        builder.write(frame_bytes).unwrap();
        let mut assembler = MessageAssembler::new();
        let mut message = None;
        for frame in builder.frames() {
            if let Some(msg) = assembler.feed(frame) {
                message = Some(msg);
            }
        }
        let message = message.expect("one complete message on the wire");

        match RpcMessage::decode(&message).unwrap() {
            RpcMessage::MethodReturn { return_id, value } => {
                assert_eq!(return_id, 11);
                let result: i32 = codec.decode_field(&value, 0).unwrap();
                assert_eq!(result, 300);
            }
            other => panic!("expected MethodReturn, got {other:?}"),
        }
    }
}
