// ABOUTME: Resumable stream parser turning raw bytes into a queue of complete frames.
// ABOUTME: Runs a Cursor-based check-then-parse loop, feeding back partial data until a full frame is available.

use crate::frame::{Frame, FrameError};
use bytes::{Buf, BytesMut};
use std::collections::VecDeque;
use std::io::Cursor;

/// Parses a byte stream into a sequence of [`Frame`]s, one chunk at a time.
///
/// Holds an internal scratch buffer sized to `max_frame_data + 3` (the
/// largest possible single frame). Partial frames remain buffered across
/// calls to [`write`](Self::write); complete frames accumulate in an output
/// queue drained by [`frames`](Self::frames).
///
/// Any codec violation is a hard [`FrameError::InvalidFrame`]; the caller
/// (the mailbox) must close the session on this error.
pub struct FrameBuilder {
    buffer: BytesMut,
    max_frame_data: usize,
    parsed: VecDeque<Frame>,
}

impl FrameBuilder {
    pub fn new(max_frame_data: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(max_frame_data + 3),
            max_frame_data,
            parsed: VecDeque::new(),
        }
    }

    /// Appends `chunk` to the scratch buffer and drains every complete
    /// frame it can find into the output queue. Any partial frame at the
    /// tail remains buffered for the next call.
    pub fn write(&mut self, chunk: &[u8]) -> Result<(), FrameError> {
        self.buffer.extend_from_slice(chunk);

        loop {
            let mut cursor = Cursor::new(&self.buffer[..]);
            match Frame::check(&mut cursor, self.max_frame_data) {
                Ok(()) => {
                    let frame = Frame::parse(&mut cursor)?;
                    let consumed = cursor.position() as usize;
                    self.buffer.advance(consumed);
                    self.parsed.push_back(frame);
                }
                Err(FrameError::Incomplete) => break,
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }

    /// Drains every frame parsed so far.
    pub fn frames(&mut self) -> impl Iterator<Item = Frame> + '_ {
        self.parsed.drain(..)
    }

    /// Number of frames currently queued but not yet drained.
    pub fn pending_frame_count(&self) -> usize {
        self.parsed.len()
    }

    /// Bytes buffered but not yet parsed into a complete frame.
    pub fn buffered_byte_count(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    const MAX: usize = 16 * 1024 - 3;

    #[test]
    fn parses_a_frame_delivered_in_one_chunk() {
        let mut builder = FrameBuilder::new(MAX);
        let wire = Frame::Last(Bytes::from_static(&[1, 2, 3]))
            .encode(MAX)
            .unwrap();
        builder.write(&wire).unwrap();
        let frames: Vec<_> = builder.frames().collect();
        assert_eq!(frames, vec![Frame::Last(Bytes::from_static(&[1, 2, 3]))]);
    }

    #[test]
    fn parses_a_frame_split_across_many_chunks() {
        let mut builder = FrameBuilder::new(MAX);
        let wire = Frame::Last(Bytes::from_static(&[1, 2, 3, 4, 5]))
            .encode(MAX)
            .unwrap();
        for byte in wire.iter() {
            builder.write(&[*byte]).unwrap();
        }
        let frames: Vec<_> = builder.frames().collect();
        assert_eq!(
            frames,
            vec![Frame::Last(Bytes::from_static(&[1, 2, 3, 4, 5]))]
        );
    }

    #[test]
    fn parses_multiple_frames_delivered_together() {
        let mut builder = FrameBuilder::new(MAX);
        let mut wire = Vec::new();
        wire.extend_from_slice(&Frame::More(Bytes::from_static(&[1])).encode(MAX).unwrap());
        wire.extend_from_slice(&Frame::Last(Bytes::from_static(&[2])).encode(MAX).unwrap());
        wire.extend_from_slice(&Frame::Ping.encode(MAX).unwrap());
        builder.write(&wire).unwrap();
        let frames: Vec<_> = builder.frames().collect();
        assert_eq!(
            frames,
            vec![
                Frame::More(Bytes::from_static(&[1])),
                Frame::Last(Bytes::from_static(&[2])),
                Frame::Ping,
            ]
        );
    }

    #[test]
    fn leaves_a_trailing_partial_frame_buffered() {
        let mut builder = FrameBuilder::new(MAX);
        let wire = Frame::Last(Bytes::from_static(&[1, 2, 3]))
            .encode(MAX)
            .unwrap();
        builder.write(&wire[..2]).unwrap();
        assert_eq!(builder.frames().count(), 0);
        assert!(builder.buffered_byte_count() > 0);
        builder.write(&wire[2..]).unwrap();
        assert_eq!(builder.frames().count(), 1);
    }

    #[test]
    fn invalid_frame_is_a_hard_error() {
        let mut builder = FrameBuilder::new(MAX);
        let err = builder.write(&[0xFF]).unwrap_err();
        assert!(matches!(err, FrameError::InvalidFrame(_)));
    }
}
