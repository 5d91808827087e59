// ABOUTME: Ordered frame sequences terminated by Last/EmptyLast, and the assembler that builds them.
// ABOUTME: Ping frames never reach here; the mailbox consumes them before assembly.

use crate::frame::Frame;
use bytes::Bytes;
use thiserror::Error;

/// An ordered, immutable sequence of frames whose terminal frame is
/// `Last` or `EmptyLast` and whose interior frames are all `More`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    frames: Vec<Frame>,
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("message must contain at least one frame")]
    Empty,
    #[error("message must terminate in Last or EmptyLast, found {0:?}")]
    NotTerminated(Frame),
    #[error("interior frame must be More, found {0:?} at index {1}")]
    InteriorNotMore(Frame, usize),
}

impl Message {
    /// Builds a message from an already-ordered frame sequence, validating
    /// the structural invariant: every interior frame is
    /// `More`, the terminal frame is `Last` or `EmptyLast`.
    pub fn from_frames(frames: Vec<Frame>) -> Result<Self, MessageError> {
        let (last, interior) = frames.split_last().ok_or(MessageError::Empty)?;
        if !last.is_terminal() {
            return Err(MessageError::NotTerminated(last.clone()));
        }
        for (idx, frame) in interior.iter().enumerate() {
            if !matches!(frame, Frame::More(_)) {
                return Err(MessageError::InteriorNotMore(frame.clone(), idx));
            }
        }
        Ok(Self { frames })
    }

    /// Builds a message carrying the given payload chunks: all but the last
    /// become `More` frames, the last becomes `Last`. An empty chunk list
    /// produces a single `EmptyLast` frame.
    pub fn from_payloads(payloads: Vec<Bytes>) -> Self {
        let mut iter = payloads.into_iter().peekable();
        if iter.peek().is_none() {
            return Self {
                frames: vec![Frame::EmptyLast],
            };
        }
        let mut frames = Vec::new();
        while let Some(payload) = iter.next() {
            if iter.peek().is_some() {
                frames.push(Frame::More(payload));
            } else {
                frames.push(Frame::Last(payload));
            }
        }
        Self { frames }
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn into_frames(self) -> Vec<Frame> {
        self.frames
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Total wire size, header bytes included, across all frames.
    pub fn size(&self) -> usize {
        self.frames.iter().map(Frame::wire_len).sum()
    }
}

/// Incrementally assembles frames (drained from a [`FrameBuilder`]) into
/// [`Message`]s. Holds exactly one in-progress message at a time.
///
/// [`FrameBuilder`]: crate::frame_builder::FrameBuilder
#[derive(Default)]
pub struct MessageAssembler {
    in_progress: Vec<Frame>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one non-`Ping` frame. Returns `Some(Message)` when this frame
    /// completed the in-progress message.
    pub fn feed(&mut self, frame: Frame) -> Option<Message> {
        let terminal = frame.is_terminal();
        self.in_progress.push(frame);
        if terminal {
            Some(Message {
                frames: std::mem::take(&mut self.in_progress),
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_a_single_frame_message() {
        let mut assembler = MessageAssembler::new();
        let msg = assembler
            .feed(Frame::Last(Bytes::from_static(&[1, 2, 3])))
            .expect("terminal frame completes the message");
        assert_eq!(msg.frame_count(), 1);
    }

    #[test]
    fn assembles_a_multi_frame_message_in_order() {
        let mut assembler = MessageAssembler::new();
        assert!(assembler.feed(Frame::More(Bytes::from_static(&[0]))).is_none());
        assert!(assembler.feed(Frame::More(Bytes::from_static(&[1]))).is_none());
        let msg = assembler
            .feed(Frame::Last(Bytes::from_static(&[2])))
            .unwrap();
        assert_eq!(msg.frame_count(), 3);
        assert_eq!(
            msg.frames()[0].payload().unwrap().as_ref(),
            &[0][..]
        );
        assert_eq!(
            msg.frames()[2].payload().unwrap().as_ref(),
            &[2][..]
        );
    }

    #[test]
    fn starts_a_fresh_message_after_completion() {
        let mut assembler = MessageAssembler::new();
        assembler.feed(Frame::EmptyLast).unwrap();
        assert!(assembler.feed(Frame::More(Bytes::from_static(&[9]))).is_none());
        let msg = assembler.feed(Frame::EmptyLast).unwrap();
        assert_eq!(msg.frame_count(), 2);
    }

    #[test]
    fn from_frames_rejects_untermianted_sequence() {
        let err = Message::from_frames(vec![Frame::More(Bytes::from_static(&[1]))]).unwrap_err();
        assert!(matches!(err, MessageError::NotTerminated(_)));
    }

    #[test]
    fn from_frames_rejects_non_more_interior() {
        let err = Message::from_frames(vec![Frame::Ping, Frame::Last(Bytes::from_static(&[1]))])
            .unwrap_err();
        assert!(matches!(err, MessageError::InteriorNotMore(_, 0)));
    }

    #[test]
    fn from_payloads_empty_list_is_empty_last() {
        let msg = Message::from_payloads(vec![]);
        assert_eq!(msg.frames(), &[Frame::EmptyLast]);
    }

    #[test]
    fn from_payloads_splits_into_more_and_last() {
        let msg = Message::from_payloads(vec![
            Bytes::from_static(&[1]),
            Bytes::from_static(&[2]),
            Bytes::from_static(&[3]),
        ]);
        assert_eq!(msg.frame_count(), 3);
        assert!(matches!(msg.frames()[0], Frame::More(_)));
        assert!(matches!(msg.frames()[1], Frame::More(_)));
        assert!(matches!(msg.frames()[2], Frame::Last(_)));
    }
}
