// ABOUTME: RPC message layout on top of the MQ transport: handler_id byte, action byte, and per-action payload.
// ABOUTME: RpcCallMessageType is the single canonical action enum shared by both call directions (see DESIGN.md).

use crate::codec::{get_length_prefixed, put_length_prefixed};
use crate::message::Message;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Handler id occupying byte 0 of the first frame of an RPC message, as
/// opposed to the handshake handler id in `crate::handshake`.
pub const RPC_HANDLER_ID: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum RpcCallMessageType {
    MethodCall = 1,
    MethodCallNoReturn = 2,
    MethodReturn = 3,
    MethodException = 4,
    MethodCancel = 5,
}

/// A user method's exception, serialized and re-raised on the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteException {
    pub type_name: String,
    pub message: String,
    pub stack: String,
}

impl std::fmt::Display for RemoteException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

impl std::error::Error for RemoteException {}

#[derive(Debug, Error)]
pub enum RpcWireError {
    #[error("message carries no frames")]
    Empty,
    #[error("message handler id is not the RPC handler")]
    NotRpc,
    #[error("unknown RPC action byte {0}")]
    UnknownAction(u8),
    #[error("malformed RPC message")]
    Malformed,
}

/// A decoded RPC wire message.
#[derive(Debug, Clone)]
pub enum RpcMessage {
    MethodCall {
        return_id: u16,
        service: String,
        method: String,
        args: Vec<Bytes>,
    },
    MethodCallNoReturn {
        service: String,
        method: String,
        args: Vec<Bytes>,
    },
    MethodReturn {
        return_id: u16,
        value: Bytes,
    },
    MethodException {
        return_id: u16,
        exception: RemoteException,
    },
    MethodCancel {
        return_id: u16,
    },
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_string(buf: &mut Bytes) -> Result<String, RpcWireError> {
    if buf.remaining() < 2 {
        return Err(RpcWireError::Malformed);
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return Err(RpcWireError::Malformed);
    }
    String::from_utf8(buf.split_to(len).to_vec()).map_err(|_| RpcWireError::Malformed)
}

fn header(action: RpcCallMessageType) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u8(RPC_HANDLER_ID);
    buf.put_u8(u8::from(action));
    buf
}

impl RpcMessage {
    pub fn encode(&self) -> Message {
        let payload = match self {
            RpcMessage::MethodCall {
                return_id,
                service,
                method,
                args,
            } => {
                let mut buf = header(RpcCallMessageType::MethodCall);
                buf.put_u16_le(*return_id);
                put_string(&mut buf, service);
                put_string(&mut buf, method);
                buf.put_u8(args.len() as u8);
                for arg in args {
                    put_length_prefixed(&mut buf, arg);
                }
                buf
            }
            RpcMessage::MethodCallNoReturn {
                service,
                method,
                args,
            } => {
                let mut buf = header(RpcCallMessageType::MethodCallNoReturn);
                put_string(&mut buf, service);
                put_string(&mut buf, method);
                buf.put_u8(args.len() as u8);
                for arg in args {
                    put_length_prefixed(&mut buf, arg);
                }
                buf
            }
            RpcMessage::MethodReturn { return_id, value } => {
                let mut buf = header(RpcCallMessageType::MethodReturn);
                buf.put_u16_le(*return_id);
                put_length_prefixed(&mut buf, value);
                buf
            }
            RpcMessage::MethodException {
                return_id,
                exception,
            } => {
                let mut buf = header(RpcCallMessageType::MethodException);
                buf.put_u16_le(*return_id);
                let encoded = bincode::serialize(exception).expect("RemoteException always serializes");
                put_length_prefixed(&mut buf, &encoded);
                buf
            }
            RpcMessage::MethodCancel { return_id } => {
                let mut buf = header(RpcCallMessageType::MethodCancel);
                buf.put_u16_le(*return_id);
                buf
            }
        };
        Message::from_payloads(vec![payload.freeze()])
    }

    pub fn decode(message: &Message) -> Result<Self, RpcWireError> {
        let mut payload = message
            .frames()
            .first()
            .and_then(|f| f.payload())
            .cloned()
            .ok_or(RpcWireError::Empty)?;
        if payload.remaining() < 2 {
            return Err(RpcWireError::Malformed);
        }
        if payload.get_u8() != RPC_HANDLER_ID {
            return Err(RpcWireError::NotRpc);
        }
        let action_byte = payload.get_u8();
        let action = RpcCallMessageType::try_from_primitive(action_byte)
            .map_err(|_| RpcWireError::UnknownAction(action_byte))?;

        match action {
            RpcCallMessageType::MethodCall => {
                if payload.remaining() < 2 {
                    return Err(RpcWireError::Malformed);
                }
                let return_id = payload.get_u16_le();
                let service = get_string(&mut payload)?;
                let method = get_string(&mut payload)?;
                let args = decode_args(&mut payload)?;
                Ok(RpcMessage::MethodCall {
                    return_id,
                    service,
                    method,
                    args,
                })
            }
            RpcCallMessageType::MethodCallNoReturn => {
                let service = get_string(&mut payload)?;
                let method = get_string(&mut payload)?;
                let args = decode_args(&mut payload)?;
                Ok(RpcMessage::MethodCallNoReturn {
                    service,
                    method,
                    args,
                })
            }
            RpcCallMessageType::MethodReturn => {
                if payload.remaining() < 2 {
                    return Err(RpcWireError::Malformed);
                }
                let return_id = payload.get_u16_le();
                let value = get_length_prefixed(&mut payload, 0)
                    .map_err(|_| RpcWireError::Malformed)?;
                Ok(RpcMessage::MethodReturn { return_id, value })
            }
            RpcCallMessageType::MethodException => {
                if payload.remaining() < 2 {
                    return Err(RpcWireError::Malformed);
                }
                let return_id = payload.get_u16_le();
                let raw = get_length_prefixed(&mut payload, 0)
                    .map_err(|_| RpcWireError::Malformed)?;
                let exception: RemoteException =
                    bincode::deserialize(&raw).map_err(|_| RpcWireError::Malformed)?;
                Ok(RpcMessage::MethodException {
                    return_id,
                    exception,
                })
            }
            RpcCallMessageType::MethodCancel => {
                if payload.remaining() < 2 {
                    return Err(RpcWireError::Malformed);
                }
                Ok(RpcMessage::MethodCancel {
                    return_id: payload.get_u16_le(),
                })
            }
        }
    }
}

fn decode_args(payload: &mut Bytes) -> Result<Vec<Bytes>, RpcWireError> {
    if !payload.has_remaining() {
        return Err(RpcWireError::Malformed);
    }
    let argc = payload.get_u8();
    let mut args = Vec::with_capacity(argc as usize);
    for i in 0..argc {
        args.push(get_length_prefixed(payload, i).map_err(|_| RpcWireError::Malformed)?);
    }
    Ok(args)
}
