// ABOUTME: Pluggable field codec for RPC argument/return-value encoding with per-field length-prefix framing.
// ABOUTME: Default implementation grounded on bincode+serde, the way t51core pulls in the same pair for its own wire types.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("field {field_index}: {source}")]
    Encode {
        field_index: u8,
        #[source]
        source: bincode::Error,
    },
    #[error("field {field_index}: {source}")]
    Decode {
        field_index: u8,
        #[source]
        source: bincode::Error,
    },
    #[error("field {field_index}: declared length {declared} exceeds available {available} bytes")]
    Truncated {
        field_index: u8,
        declared: usize,
        available: usize,
    },
}

/// External argument/return-value serializer, pluggable.
///
/// Each field is framed independently: `encode_field` returns exactly the
/// payload bytes (no length prefix of its own — the RPC wire layer in
/// `rpc::wire` adds the length prefix), and
/// `decode_field` is handed exactly those payload bytes back.
pub trait Codec: Send + Sync + 'static {
    fn encode_field<T: Serialize>(&self, value: &T, field_index: u8) -> Result<Bytes, CodecError>;
    fn decode_field<T: DeserializeOwned>(
        &self,
        bytes: &[u8],
        field_index: u8,
    ) -> Result<T, CodecError>;
}

/// Default [`Codec`] implementation backed by `bincode`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeCodec;

impl Codec for BincodeCodec {
    fn encode_field<T: Serialize>(&self, value: &T, field_index: u8) -> Result<Bytes, CodecError> {
        let bytes = bincode::serialize(value).map_err(|source| CodecError::Encode {
            field_index,
            source,
        })?;
        Ok(Bytes::from(bytes))
    }

    fn decode_field<T: DeserializeOwned>(
        &self,
        bytes: &[u8],
        field_index: u8,
    ) -> Result<T, CodecError> {
        bincode::deserialize(bytes).map_err(|source| CodecError::Decode {
            field_index,
            source,
        })
    }
}

/// Writes a length-prefixed field (`u32` little-endian length, then the
/// payload) into `buf`, the framing the RPC wire layer requires around every
/// positional argument and return value.
pub fn put_length_prefixed(buf: &mut BytesMut, payload: &[u8]) {
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
}

/// Reads one length-prefixed field out of `buf`, advancing past it.
pub fn get_length_prefixed(buf: &mut Bytes, field_index: u8) -> Result<Bytes, CodecError> {
    if buf.remaining() < 4 {
        return Err(CodecError::Truncated {
            field_index,
            declared: 4,
            available: buf.remaining(),
        });
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(CodecError::Truncated {
            field_index,
            declared: len,
            available: buf.remaining(),
        });
    }
    Ok(buf.split_to(len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[test]
    fn round_trips_a_struct_through_bincode() {
        let codec = BincodeCodec;
        let point = Point { x: 3, y: -4 };
        let encoded = codec.encode_field(&point, 0).unwrap();
        let decoded: Point = codec.decode_field(&encoded, 0).unwrap();
        assert_eq!(point, decoded);
    }

    #[test]
    fn length_prefix_round_trips() {
        let mut buf = BytesMut::new();
        put_length_prefixed(&mut buf, b"hello");
        put_length_prefixed(&mut buf, b"world!");
        let mut frozen = buf.freeze();
        assert_eq!(&get_length_prefixed(&mut frozen, 0).unwrap()[..], b"hello");
        assert_eq!(&get_length_prefixed(&mut frozen, 1).unwrap()[..], b"world!");
    }

    #[test]
    fn truncated_length_prefix_is_an_error() {
        let mut buf = Bytes::from_static(&[5, 0, 0, 0, b'h', b'i']);
        let err = get_length_prefixed(&mut buf, 0).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }
}
