// ABOUTME: Per-session inbox/outbox: batches outgoing frames into gather writes, assembles incoming bytes into messages.
// ABOUTME: The gather-write loop in process_outbox is grounded on harpc's PacketWriter (session/writer/mod.rs in the pack).

use crate::frame::{Frame, FrameError};
use crate::frame_builder::FrameBuilder;
use crate::message::{Message, MessageAssembler};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

struct ReaderState {
    frame_builder: FrameBuilder,
    assembler: MessageAssembler,
}

/// Per-session inbound/outbound queues and parser state.
///
/// Invariants: the terminal frame of every message handed
/// out of `inbox` is `Last` or `EmptyLast`; at most one reader and one
/// writer touch a given mailbox at any instant (enforced by the postmaster,
/// not by this type); `inbox_byte_count` always equals the bytes currently
/// queued in `inbox_bytes` plus whatever chunk is mid-parse.
pub struct Mailbox {
    max_frame_data: usize,
    inbox_bytes: Mutex<VecDeque<Bytes>>,
    inbox_byte_count: AtomicUsize,
    reader_state: Mutex<ReaderState>,
    inbox: Mutex<VecDeque<Message>>,
    outbox: Mutex<VecDeque<Message>>,
    ping_pending: AtomicUsize,
}

impl Mailbox {
    pub fn new(max_frame_data: usize) -> Self {
        Self {
            max_frame_data,
            inbox_bytes: Mutex::new(VecDeque::new()),
            inbox_byte_count: AtomicUsize::new(0),
            reader_state: Mutex::new(ReaderState {
                frame_builder: FrameBuilder::new(max_frame_data),
                assembler: MessageAssembler::new(),
            }),
            inbox: Mutex::new(VecDeque::new()),
            outbox: Mutex::new(VecDeque::new()),
            ping_pending: AtomicUsize::new(0),
        }
    }

    pub fn max_frame_data(&self) -> usize {
        self.max_frame_data
    }

    /// Current `inbox_byte_count`, used by callers to apply back-pressure.
    pub fn inbox_byte_count(&self) -> usize {
        self.inbox_byte_count.load(Ordering::SeqCst)
    }

    /// Queues a raw chunk received from the socket for parsing by the next
    /// reader pass.
    pub fn enqueue_incoming_buffer(&self, chunk: Bytes) {
        self.inbox_byte_count.fetch_add(chunk.len(), Ordering::SeqCst);
        self.inbox_bytes.lock().unwrap().push_back(chunk);
    }

    /// Queues a message for the next writer pass. FIFO across messages.
    pub fn enqueue_outgoing(&self, message: Message) {
        self.outbox.lock().unwrap().push_back(message);
    }

    pub fn has_pending_outbox(&self) -> bool {
        !self.outbox.lock().unwrap().is_empty() || self.ping_pending.load(Ordering::SeqCst) > 0
    }

    /// Queues a standalone `Ping` frame, sent ahead of any queued messages
    /// on the next writer pass. Pings never join a `Message`, so they
    /// bypass the outbox's message FIFO entirely.
    pub fn enqueue_ping(&self) {
        self.ping_pending.fetch_add(1, Ordering::SeqCst);
    }

    /// Pops the oldest completed incoming message, if any.
    pub fn pop_incoming(&self) -> Option<Message> {
        self.inbox.lock().unwrap().pop_front()
    }

    /// Invoked by a reader worker holding single-flight on this mailbox.
    /// Drains `inbox_bytes`, feeds the bytes through the
    /// frame builder and message assembler, and returns whether at least
    /// one message completed in this pass (for `IncomingMessage` event
    /// coalescing — the caller raises the event at most once per call,
    /// never once per frame).
    ///
    /// `Ping` frames update the caller's liveness tracking (the session
    /// does that, using the mere fact that bytes arrived) but are dropped
    /// here rather than fed to the assembler; they never appear in a
    /// `Message`.
    pub fn process_inbox(&self) -> Result<bool, MailboxError> {
        let mut any_completed = false;
        loop {
            let chunk = {
                let mut inbox_bytes = self.inbox_bytes.lock().unwrap();
                inbox_bytes.pop_front()
            };
            let Some(chunk) = chunk else {
                break;
            };
            self.inbox_byte_count
                .fetch_sub(chunk.len(), Ordering::SeqCst);

            let mut reader_state = self.reader_state.lock().unwrap();
            reader_state.frame_builder.write(&chunk)?;
            let frames: Vec<Frame> = reader_state.frame_builder.frames().collect();
            for frame in frames {
                if matches!(frame, Frame::Ping) {
                    continue;
                }
                if let Some(message) = reader_state.assembler.feed(frame) {
                    self.inbox.lock().unwrap().push_back(message);
                    any_completed = true;
                }
            }
        }
        Ok(any_completed)
    }

    /// Invoked by a writer worker holding single-flight on this mailbox.
    /// Drains the outbox greedily, gathering whole
    /// frames into a buffer bounded by `max_frame_data` payload bytes, and
    /// flushes each buffer with a 3-byte gather header `[0x00, len_lo,
    /// len_hi]`. Returns the number of messages sent.
    pub async fn process_outbox<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
    ) -> Result<usize, MailboxError> {
        let mut sent = 0usize;
        let mut gather = BytesMut::new();

        let ping_count = self.ping_pending.swap(0, Ordering::SeqCst);
        for _ in 0..ping_count {
            let encoded = Frame::Ping.encode(self.max_frame_data)?;
            if !gather.is_empty() && gather.len() + encoded.len() > self.max_frame_data {
                Self::flush_gather(writer, &mut gather).await?;
            }
            gather.extend_from_slice(&encoded);
        }

        loop {
            let message = {
                let mut outbox = self.outbox.lock().unwrap();
                outbox.pop_front()
            };
            let Some(message) = message else {
                break;
            };

            for frame in message.frames() {
                let encoded = frame.encode(self.max_frame_data)?;
                if !gather.is_empty() && gather.len() + encoded.len() > self.max_frame_data {
                    Self::flush_gather(writer, &mut gather).await?;
                }
                gather.extend_from_slice(&encoded);
            }
            sent += 1;
        }

        if !gather.is_empty() {
            Self::flush_gather(writer, &mut gather).await?;
        }

        Ok(sent)
    }

    async fn flush_gather<W: AsyncWrite + Unpin>(
        writer: &mut W,
        gather: &mut BytesMut,
    ) -> Result<(), MailboxError> {
        debug_assert!(gather.len() <= u16::MAX as usize);
        let mut header = [0u8; 3];
        header[0] = 0x00;
        header[1..3].copy_from_slice(&(gather.len() as u16).to_le_bytes());
        writer.write_all(&header).await?;
        writer.write_all(gather).await?;
        writer.flush().await?;
        gather.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameType;

    const MAX: usize = 16 * 1024 - 3;

    #[test]
    fn single_frame_echo_assembles_one_message() {
        let mailbox = Mailbox::new(MAX);
        let wire = Frame::Last(Bytes::from_static(&[0x01, 0x02, 0x03]))
            .encode(MAX)
            .unwrap();
        mailbox.enqueue_incoming_buffer(wire);
        let completed = mailbox.process_inbox().unwrap();
        assert!(completed);
        let msg = mailbox.pop_incoming().unwrap();
        assert_eq!(msg.frame_count(), 1);
        assert_eq!(msg.frames()[0].payload().unwrap().as_ref(), &[1, 2, 3][..]);
        assert!(mailbox.pop_incoming().is_none());
    }

    #[test]
    fn multi_frame_message_assembles_in_order() {
        let mailbox = Mailbox::new(MAX);
        let payload: Vec<u8> = (0..50).collect();
        let mut wire = Vec::new();
        for _ in 0..3 {
            wire.extend_from_slice(
                &Frame::More(Bytes::from(payload.clone()))
                    .encode(MAX)
                    .unwrap(),
            );
        }
        wire.extend_from_slice(
            &Frame::Last(Bytes::from(payload.clone()))
                .encode(MAX)
                .unwrap(),
        );
        mailbox.enqueue_incoming_buffer(Bytes::from(wire));
        assert!(mailbox.process_inbox().unwrap());
        let msg = mailbox.pop_incoming().unwrap();
        assert_eq!(msg.frame_count(), 4);
        for frame in msg.frames() {
            assert_eq!(frame.payload().unwrap().as_ref(), payload.as_slice());
        }
    }

    #[test]
    fn ping_frames_are_dropped_before_assembly() {
        let mailbox = Mailbox::new(MAX);
        let mut wire = Frame::Ping.encode(MAX).unwrap().to_vec();
        wire.extend_from_slice(&Frame::EmptyLast.encode(MAX).unwrap());
        mailbox.enqueue_incoming_buffer(Bytes::from(wire));
        assert!(mailbox.process_inbox().unwrap());
        let msg = mailbox.pop_incoming().unwrap();
        assert_eq!(msg.frame_count(), 1);
        assert_eq!(msg.frames()[0].frame_type(), FrameType::EmptyLast);
    }

    #[test]
    fn inbox_byte_count_tracks_queued_chunks() {
        let mailbox = Mailbox::new(MAX);
        let wire = Frame::EmptyLast.encode(MAX).unwrap();
        mailbox.enqueue_incoming_buffer(wire.clone());
        assert_eq!(mailbox.inbox_byte_count(), wire.len());
        mailbox.process_inbox().unwrap();
        assert_eq!(mailbox.inbox_byte_count(), 0);
    }

    #[tokio::test]
    async fn process_outbox_flushes_gather_headers_and_preserves_frame_bytes() {
        let mailbox = Mailbox::new(MAX);
        let msg = Message::from_payloads(vec![Bytes::from_static(b"hello")]);
        mailbox.enqueue_outgoing(msg);

        let (mut client, mut server) = tokio::io::duplex(1024);
        let sent = mailbox.process_outbox(&mut client).await.unwrap();
        assert_eq!(sent, 1);
        drop(client);

        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        server.read_to_end(&mut buf).await.unwrap();

        assert_eq!(buf[0], 0x00);
        let len = u16::from_le_bytes([buf[1], buf[2]]) as usize;
        assert_eq!(buf.len(), 3 + len);

        let expected_frame = Frame::Last(Bytes::from_static(b"hello")).encode(MAX).unwrap();
        assert_eq!(&buf[3..], &expected_frame[..]);
    }

    #[tokio::test]
    async fn process_outbox_splits_into_multiple_gather_packets_when_over_budget() {
        let max_frame_data = 8usize;
        let mailbox = Mailbox::new(max_frame_data);
        // Each frame's payload is 8 bytes, exactly max_frame_data; the second
        // frame cannot join the first gather buffer.
        mailbox.enqueue_outgoing(Message::from_payloads(vec![Bytes::from(vec![1u8; 8])]));
        mailbox.enqueue_outgoing(Message::from_payloads(vec![Bytes::from(vec![2u8; 8])]));

        let (mut client, mut server) = tokio::io::duplex(4096);
        let sent = mailbox.process_outbox(&mut client).await.unwrap();
        assert_eq!(sent, 2);
        drop(client);

        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        server.read_to_end(&mut buf).await.unwrap();

        // Two gather packets, each [0x00, len_lo, len_hi] + one frame (3 + 8 bytes).
        assert_eq!(buf.len(), 2 * (3 + 3 + 8));
    }
}
