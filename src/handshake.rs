// ABOUTME: Version exchange and optional client authentication, run as the first messages on a session.
// ABOUTME: Validates each step by matching the next incoming frame against the message type it expects.

use crate::config::Config;
use crate::message::Message;
use crate::session::{CloseReason, Session, SessionListener};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;

/// Reserved handler id for handshake messages, distinct from the RPC
/// handler id (1) used by `rpc::wire`.
pub const HANDSHAKE_HANDLER_ID: u8 = 2;

const ACTION_SERVER_INFO: u8 = 1;
const ACTION_AUTHENTICATE: u8 = 2;
const ACTION_AUTHENTICATION_RESULT: u8 = 3;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("malformed handshake message")]
    Malformed,
    #[error("unknown handshake action {0}")]
    UnknownAction(u8),
}

#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub version: u8,
    pub message: String,
    pub require_authentication: bool,
}

#[derive(Debug, Clone)]
pub struct Authenticate {
    pub auth_data: Bytes,
}

#[derive(Debug, Clone, Copy)]
pub struct AuthenticationResult {
    pub authenticated: bool,
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_string(buf: &mut Bytes) -> Result<String, HandshakeError> {
    if buf.remaining() < 2 {
        return Err(HandshakeError::Malformed);
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return Err(HandshakeError::Malformed);
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| HandshakeError::Malformed)
}

impl ServerInfo {
    pub fn encode(&self) -> Message {
        let mut buf = BytesMut::new();
        buf.put_u8(HANDSHAKE_HANDLER_ID);
        buf.put_u8(ACTION_SERVER_INFO);
        buf.put_u8(self.version);
        buf.put_u8(self.require_authentication as u8);
        put_string(&mut buf, &self.message);
        Message::from_payloads(vec![buf.freeze()])
    }

    fn decode(mut payload: Bytes) -> Result<Self, HandshakeError> {
        if payload.remaining() < 2 {
            return Err(HandshakeError::Malformed);
        }
        let version = payload.get_u8();
        let require_authentication = payload.get_u8() != 0;
        let message = get_string(&mut payload)?;
        Ok(Self {
            version,
            message,
            require_authentication,
        })
    }
}

impl Authenticate {
    pub fn encode(&self) -> Message {
        let mut buf = BytesMut::new();
        buf.put_u8(HANDSHAKE_HANDLER_ID);
        buf.put_u8(ACTION_AUTHENTICATE);
        buf.put_u32_le(self.auth_data.len() as u32);
        buf.put_slice(&self.auth_data);
        Message::from_payloads(vec![buf.freeze()])
    }

    fn decode(mut payload: Bytes) -> Result<Self, HandshakeError> {
        if payload.remaining() < 4 {
            return Err(HandshakeError::Malformed);
        }
        let len = payload.get_u32_le() as usize;
        if payload.remaining() < len {
            return Err(HandshakeError::Malformed);
        }
        Ok(Self {
            auth_data: payload.split_to(len),
        })
    }
}

impl AuthenticationResult {
    pub fn encode(&self) -> Message {
        let mut buf = BytesMut::new();
        buf.put_u8(HANDSHAKE_HANDLER_ID);
        buf.put_u8(ACTION_AUTHENTICATION_RESULT);
        buf.put_u8(self.authenticated as u8);
        Message::from_payloads(vec![buf.freeze()])
    }

    fn decode(mut payload: Bytes) -> Result<Self, HandshakeError> {
        if !payload.has_remaining() {
            return Err(HandshakeError::Malformed);
        }
        Ok(Self {
            authenticated: payload.get_u8() != 0,
        })
    }
}

/// Returns `Some(handler_id)` without consuming, used by dispatchers that
/// need to route between the handshake and RPC handlers.
pub fn peek_handler_id(message: &Message) -> Option<u8> {
    message
        .frames()
        .first()
        .and_then(|f| f.payload())
        .and_then(|b| b.first().copied())
}

enum Decoded {
    ServerInfo(ServerInfo),
    Authenticate(Authenticate),
    AuthenticationResult(AuthenticationResult),
}

fn decode(message: &Message) -> Result<Decoded, HandshakeError> {
    let payload = message
        .frames()
        .first()
        .and_then(|f| f.payload())
        .cloned()
        .ok_or(HandshakeError::Malformed)?;
    if payload.len() < 2 {
        return Err(HandshakeError::Malformed);
    }
    let action = payload[1];
    let body = payload.slice(2..);
    match action {
        ACTION_SERVER_INFO => Ok(Decoded::ServerInfo(ServerInfo::decode(body)?)),
        ACTION_AUTHENTICATE => Ok(Decoded::Authenticate(Authenticate::decode(body)?)),
        ACTION_AUTHENTICATION_RESULT => {
            Ok(Decoded::AuthenticationResult(AuthenticationResult::decode(body)?))
        }
        other => Err(HandshakeError::UnknownAction(other)),
    }
}

/// A user-supplied authentication verifier: given the client's opaque
/// `auth_data`, decides whether the session may proceed.
pub type Verifier = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Decorating [`SessionListener`] that runs the handshake state machine in
/// front of an inner listener. Messages are only forwarded to `inner` once
/// the session reaches `Ready`; handshake messages are intercepted and
/// never forwarded.
pub struct HandshakeListener {
    is_server: bool,
    config: Config,
    verifier: Option<Verifier>,
    client_auth_data: Option<Bytes>,
    ready: AtomicBool,
    deadline: Mutex<Option<Instant>>,
    inner: Arc<dyn SessionListener>,
}

impl HandshakeListener {
    pub fn server(config: Config, verifier: Verifier, inner: Arc<dyn SessionListener>) -> Arc<Self> {
        Arc::new(Self {
            is_server: true,
            config,
            verifier: Some(verifier),
            client_auth_data: None,
            ready: AtomicBool::new(false),
            deadline: Mutex::new(None),
            inner,
        })
    }

    pub fn client(
        config: Config,
        auth_data: Option<Bytes>,
        inner: Arc<dyn SessionListener>,
    ) -> Arc<Self> {
        Arc::new(Self {
            is_server: false,
            config,
            verifier: None,
            client_auth_data: auth_data,
            ready: AtomicBool::new(false),
            deadline: Mutex::new(None),
            inner,
        })
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Deadline by which the handshake must complete, if one has started.
    /// Callers spawn a watchdog that polls this and closes the session with
    /// `AuthenticationFailure` once it passes and the handshake is still
    /// not ready.
    pub fn deadline(&self) -> Option<Instant> {
        *self.deadline.lock().unwrap()
    }
}

impl SessionListener for HandshakeListener {
    fn on_connected(&self, session: &Arc<Session>) {
        if self.is_server {
            let info = ServerInfo {
                version: 1,
                message: "postmq".to_string(),
                require_authentication: self.config.require_authentication,
            };
            *self.deadline.lock().unwrap() = Some(Instant::now() + self.config.connection_timeout);
            session.send(info.encode());
            if !self.config.require_authentication {
                self.ready.store(true, Ordering::SeqCst);
            }
        }
    }

    fn on_incoming_message(&self, session: &Arc<Session>, message: Message) {
        if self.ready.load(Ordering::SeqCst) {
            self.inner.on_incoming_message(session, message);
            return;
        }

        if peek_handler_id(&message) != Some(HANDSHAKE_HANDLER_ID) {
            tracing::warn!(session_id = %session.id(), "message received before handshake completed");
            session.close(CloseReason::ProtocolError);
            return;
        }

        match decode(&message) {
            Ok(Decoded::ServerInfo(info)) => {
                if !self.is_server {
                    if info.require_authentication {
                        let auth_data = self.client_auth_data.clone().unwrap_or_default();
                        session.send(Authenticate { auth_data }.encode());
                        *self.deadline.lock().unwrap() =
                            Some(Instant::now() + self.config.connection_timeout);
                    } else {
                        self.ready.store(true, Ordering::SeqCst);
                    }
                }
            }
            Ok(Decoded::Authenticate(auth)) => {
                if self.is_server {
                    let authenticated = self
                        .verifier
                        .as_ref()
                        .map(|v| v(&auth.auth_data))
                        .unwrap_or(false);
                    session.send(AuthenticationResult { authenticated }.encode());
                    if authenticated {
                        self.ready.store(true, Ordering::SeqCst);
                    } else {
                        session.close(CloseReason::AuthenticationFailure);
                    }
                }
            }
            Ok(Decoded::AuthenticationResult(result)) => {
                if !self.is_server {
                    if result.authenticated {
                        self.ready.store(true, Ordering::SeqCst);
                    } else {
                        session.close(CloseReason::AuthenticationFailure);
                    }
                }
            }
            Err(err) => {
                tracing::warn!(session_id = %session.id(), error = %err, "malformed handshake message");
                session.close(CloseReason::ProtocolError);
            }
        }
    }

    fn on_closed(&self, session: &Arc<Session>, reason: CloseReason) {
        self.inner.on_closed(session, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_info_round_trips() {
        let info = ServerInfo {
            version: 3,
            message: "hello".to_string(),
            require_authentication: true,
        };
        let message = info.encode();
        match decode(&message).unwrap() {
            Decoded::ServerInfo(decoded) => {
                assert_eq!(decoded.version, 3);
                assert_eq!(decoded.message, "hello");
                assert!(decoded.require_authentication);
            }
            _ => panic!("expected ServerInfo"),
        }
    }

    #[test]
    fn authenticate_round_trips() {
        let auth = Authenticate {
            auth_data: Bytes::from_static(&[5, 4, 3, 2, 1]),
        };
        let message = auth.encode();
        match decode(&message).unwrap() {
            Decoded::Authenticate(decoded) => {
                assert_eq!(decoded.auth_data.as_ref(), &[5, 4, 3, 2, 1][..]);
            }
            _ => panic!("expected Authenticate"),
        }
    }

    #[test]
    fn authentication_result_round_trips() {
        let result = AuthenticationResult {
            authenticated: false,
        };
        let message = result.encode();
        match decode(&message).unwrap() {
            Decoded::AuthenticationResult(decoded) => {
                assert!(!decoded.authenticated);
            }
            _ => panic!("expected AuthenticationResult"),
        }
    }

    #[test]
    fn peek_handler_id_reads_first_byte_without_consuming() {
        let info = ServerInfo {
            version: 1,
            message: String::new(),
            require_authentication: false,
        };
        let message = info.encode();
        assert_eq!(peek_handler_id(&message), Some(HANDSHAKE_HANDLER_ID));
    }
}
