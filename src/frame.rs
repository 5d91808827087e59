// ABOUTME: Typed, length-prefixed binary wire unit (Frame) and its encode/decode.
// ABOUTME: A one-byte type tag, a length prefix, and an optional payload, split across an encode/decode pair.

use bytes::{Buf, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::io::Cursor;
use thiserror::Error;

/// Wire type tag occupying byte 0 of every frame.
///
/// `Ping`, `Empty`, and `EmptyLast` carry no payload and therefore no
/// length field (1-byte header); `More`, `Last`, and `Command` are
/// data-bearing and carry a little-endian `u16` length in bytes 1..2
/// (3-byte header).
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum FrameType {
    Ping = 0,
    Empty = 1,
    EmptyLast = 2,
    More = 3,
    Last = 4,
    Command = 5,
}

impl FrameType {
    /// Data-bearing types carry a 3-byte header; the rest carry 1.
    fn is_data_bearing(self) -> bool {
        matches!(self, FrameType::More | FrameType::Last | FrameType::Command)
    }
}

/// A single typed, length-prefixed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Ping,
    Empty,
    EmptyLast,
    More(Bytes),
    Last(Bytes),
    Command(Bytes),
}

/// Errors produced by frame encode/decode.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Not a hard error: the caller should buffer more bytes and retry.
    #[error("incomplete frame")]
    Incomplete,
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Ping => FrameType::Ping,
            Frame::Empty => FrameType::Empty,
            Frame::EmptyLast => FrameType::EmptyLast,
            Frame::More(_) => FrameType::More,
            Frame::Last(_) => FrameType::Last,
            Frame::Command(_) => FrameType::Command,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Frame::Last(_) | Frame::EmptyLast)
    }

    pub fn payload(&self) -> Option<&Bytes> {
        match self {
            Frame::More(b) | Frame::Last(b) | Frame::Command(b) => Some(b),
            _ => None,
        }
    }

    /// Total wire size of this frame, header included.
    pub fn wire_len(&self) -> usize {
        match self.payload() {
            Some(b) => 3 + b.len(),
            None => 1,
        }
    }

    /// Encodes this frame to its wire representation.
    ///
    /// Zero-length `More`/`Last` payloads are rejected by construction
    /// elsewhere (use `Empty`/`EmptyLast`); encode does not re-validate
    /// that here, it only requires `data_length <= max_frame_data` via the
    /// `max_frame_data` parameter supplied by the caller.
    pub fn encode(&self, max_frame_data: usize) -> Result<Bytes, FrameError> {
        let frame_type = self.frame_type();
        match self.payload() {
            None => {
                let mut buf = BytesMut::with_capacity(1);
                buf.extend_from_slice(&[u8::from(frame_type)]);
                Ok(buf.freeze())
            }
            Some(data) => {
                if data.is_empty() {
                    return Err(FrameError::InvalidFrame(format!(
                        "{frame_type:?} frame must not have an empty payload; use Empty/EmptyLast"
                    )));
                }
                if data.len() > max_frame_data {
                    return Err(FrameError::InvalidFrame(format!(
                        "frame payload {} exceeds max_frame_data {}",
                        data.len(),
                        max_frame_data
                    )));
                }
                let mut buf = BytesMut::with_capacity(3 + data.len());
                buf.extend_from_slice(&[u8::from(frame_type)]);
                buf.extend_from_slice(&(data.len() as u16).to_le_bytes());
                buf.extend_from_slice(data);
                Ok(buf.freeze())
            }
        }
    }

    /// Checks whether a complete frame is available at the cursor's current
    /// position, without consuming it. Returns `Ok(())` if so, or
    /// `Err(FrameError::Incomplete)` if more bytes are needed.
    pub fn check(cursor: &mut Cursor<&[u8]>, max_frame_data: usize) -> Result<(), FrameError> {
        if !cursor.has_remaining() {
            return Err(FrameError::Incomplete);
        }
        let type_byte = peek_u8(cursor)?;
        let frame_type = FrameType::try_from_primitive(type_byte)
            .map_err(|_| FrameError::InvalidFrame(format!("unknown frame type {type_byte}")))?;

        if !frame_type.is_data_bearing() {
            return Ok(());
        }

        if cursor.remaining() < 3 {
            return Err(FrameError::Incomplete);
        }
        let len = peek_u16_at(cursor, 1)? as usize;
        if len > max_frame_data {
            return Err(FrameError::InvalidFrame(format!(
                "declared frame length {len} exceeds max_frame_data {max_frame_data}"
            )));
        }
        if len == 0 {
            return Err(FrameError::InvalidFrame(format!(
                "{frame_type:?} frame declared zero length; use Empty/EmptyLast"
            )));
        }
        if cursor.remaining() < 3 + len {
            return Err(FrameError::Incomplete);
        }
        Ok(())
    }

    /// Parses a frame at the cursor's current position, advancing it past
    /// the frame. The caller must have called `check` successfully first.
    pub fn parse(cursor: &mut Cursor<&[u8]>) -> Result<Frame, FrameError> {
        let type_byte = cursor.get_u8();
        let frame_type = FrameType::try_from_primitive(type_byte)
            .map_err(|_| FrameError::InvalidFrame(format!("unknown frame type {type_byte}")))?;

        match frame_type {
            FrameType::Ping => Ok(Frame::Ping),
            FrameType::Empty => Ok(Frame::Empty),
            FrameType::EmptyLast => Ok(Frame::EmptyLast),
            FrameType::More | FrameType::Last | FrameType::Command => {
                let len = cursor.get_u16_le() as usize;
                let start = cursor.position() as usize;
                let data = Bytes::copy_from_slice(&cursor.get_ref()[start..start + len]);
                cursor.advance(len);
                Ok(match frame_type {
                    FrameType::More => Frame::More(data),
                    FrameType::Last => Frame::Last(data),
                    FrameType::Command => Frame::Command(data),
                    _ => unreachable!(),
                })
            }
        }
    }
}

fn peek_u8(cursor: &Cursor<&[u8]>) -> Result<u8, FrameError> {
    let pos = cursor.position() as usize;
    cursor
        .get_ref()
        .get(pos)
        .copied()
        .ok_or(FrameError::Incomplete)
}

fn peek_u16_at(cursor: &Cursor<&[u8]>, offset: usize) -> Result<u16, FrameError> {
    let pos = cursor.position() as usize + offset;
    let bytes = cursor
        .get_ref()
        .get(pos..pos + 2)
        .ok_or(FrameError::Incomplete)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}
