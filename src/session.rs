// ABOUTME: Connection lifecycle state machine, ping/timeout tracking, and the socket read loop feeding a Mailbox.
// ABOUTME: Each session carries a UUID identity and moves through Connecting -> Connected -> Closed.

use crate::buffer_pool::BufferPool;
use crate::config::{Config, ConfigError};
use crate::mailbox::{Mailbox, MailboxError};
use crate::message::Message;
use crate::postmaster::{MailboxId, Postmaster};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

/// Reason a session closed, reported to both sides where applicable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosing,
    ServerClosing,
    SocketError,
    ProtocolError,
    ApplicationError,
    AuthenticationFailure,
    TimeOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Closing,
    Closed(CloseReason),
}

/// Push-based event listeners for a session, delivered on the worker pool,
/// never on the I/O thread.
pub trait SessionListener: Send + Sync {
    fn on_connected(&self, _session: &Arc<Session>) {}
    fn on_incoming_message(&self, _session: &Arc<Session>, _message: Message) {}
    fn on_closed(&self, _session: &Arc<Session>, _reason: CloseReason) {}
}

/// A single connection's lifecycle, mailbox, and postmaster registration.
///
/// Holds the mailbox and only a handle to the shared postmaster (not a
/// back-reference from the postmaster to the session, which would own the
/// session and create a cycle): the postmaster's
/// registry instead holds a [`Weak`] reference into this session's
/// callbacks.
pub struct Session {
    id: Uuid,
    mailbox: Arc<Mailbox>,
    postmaster: Postmaster,
    mailbox_id: Mutex<Option<MailboxId>>,
    state: Mutex<SessionState>,
    last_received: Mutex<Instant>,
    listener: Arc<dyn SessionListener>,
    config: Config,
    sequence: AtomicU64,
}

impl Session {
    /// Creates a session and registers its mailbox with the postmaster. The
    /// caller supplies the socket's `AsyncWrite` half (handed to the
    /// postmaster for writer passes); `spawn_reader` must be called
    /// separately with the socket's read half to start the inbound loop.
    ///
    /// Fails with [`ConfigError::FrameTooLarge`] if `config`'s
    /// `send_and_receive_buffer_size` is too small to carry a frame header;
    /// this is the point at which that invariant is actually enforced.
    pub fn new<W>(
        config: Config,
        postmaster: Postmaster,
        writer: W,
        listener: Arc<dyn SessionListener>,
    ) -> Result<Arc<Self>, ConfigError>
    where
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let max_frame_data = config.max_frame_data()?;
        let mailbox = Arc::new(Mailbox::new(max_frame_data));

        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            mailbox: mailbox.clone(),
            postmaster: postmaster.clone(),
            mailbox_id: Mutex::new(None),
            state: Mutex::new(SessionState::Connecting),
            last_received: Mutex::new(Instant::now()),
            listener,
            config,
            sequence: AtomicU64::new(0),
        });

        let weak_for_incoming: Weak<Session> = Arc::downgrade(&session);
        let weak_for_error: Weak<Session> = Arc::downgrade(&session);
        let send_timeout = session.config.send_timeout;
        let mailbox_id = postmaster.register(
            mailbox,
            writer,
            send_timeout,
            move || {
                if let Some(session) = weak_for_incoming.upgrade() {
                    session.drain_incoming_messages();
                }
            },
            move |err: MailboxError| {
                if let Some(session) = weak_for_error.upgrade() {
                    let reason = match err {
                        MailboxError::Frame(_) => CloseReason::ProtocolError,
                        MailboxError::Io(_) => CloseReason::SocketError,
                    };
                    session.close(reason);
                }
            },
        );
        *session.mailbox_id.lock().unwrap() = Some(mailbox_id);
        *session.state.lock().unwrap() = SessionState::Connected;
        session.listener.on_connected(&session);

        Ok(session)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub fn is_ready_for_traffic(&self) -> bool {
        matches!(self.state(), SessionState::Connected)
    }

    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    /// Queues a message for the next writer pass and signals the
    /// postmaster.
    pub fn send(&self, message: Message) {
        self.mailbox.enqueue_outgoing(message);
        if let Some(id) = *self.mailbox_id.lock().unwrap() {
            self.postmaster.signal_write(id);
        }
    }

    fn send_ping(&self) {
        self.mailbox.enqueue_ping();
        if let Some(id) = *self.mailbox_id.lock().unwrap() {
            self.postmaster.signal_write(id);
        }
    }

    /// Drives the inbound read loop until EOF or error. Intended to be
    /// spawned as its own task by the caller (client or server accept
    /// loop), given the socket's read half. Each pass borrows its read
    /// buffer from `buffer_pool` rather than allocating one per session.
    pub async fn run_reader<R>(self: &Arc<Self>, mut reader: R, buffer_pool: &BufferPool)
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = buffer_pool.acquire();
        buf.resize(buffer_pool.buffer_size(), 0);
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    self.close(CloseReason::ClientClosing);
                    break;
                }
                Ok(n) => {
                    *self.last_received.lock().unwrap() = Instant::now();
                    self.mailbox
                        .enqueue_incoming_buffer(bytes::Bytes::copy_from_slice(&buf[..n]));
                    if let Some(id) = *self.mailbox_id.lock().unwrap() {
                        self.postmaster.signal_read(id);
                    }
                }
                Err(_) => {
                    self.close(CloseReason::SocketError);
                    break;
                }
            }
        }
    }

    /// Drives the outbound ping loop when `ping_frequency` is non-zero.
    /// Intended to be spawned as its own task.
    pub async fn run_ping_loop(self: &Arc<Self>) {
        if self.config.ping_frequency.is_zero() {
            return;
        }
        let mut interval = tokio::time::interval(self.config.ping_frequency);
        loop {
            interval.tick().await;
            if !matches!(self.state(), SessionState::Connected) {
                break;
            }
            self.send_ping();
        }
    }

    /// Server-side idle watchdog: closes the session with `TimeOut` if
    /// `now - last_received > ping_timeout`. Intended to be spawned as its
    /// own task when `ping_timeout` is non-zero.
    pub async fn run_timeout_watchdog(self: &Arc<Self>) {
        if self.config.ping_timeout.is_zero() {
            return;
        }
        let poll_interval = (self.config.ping_timeout / 4).max(Duration::from_millis(50));
        loop {
            tokio::time::sleep(poll_interval).await;
            if !matches!(self.state(), SessionState::Connected) {
                break;
            }
            let idle = self.last_received.lock().unwrap().elapsed();
            if idle > self.config.ping_timeout {
                self.close(CloseReason::TimeOut);
                break;
            }
        }
    }

    fn drain_incoming_messages(self: &Arc<Self>) {
        while let Some(message) = self.mailbox.pop_incoming() {
            self.listener.on_incoming_message(self, message);
        }
    }

    /// Closes the session with the given reason. Idempotent: a session
    /// already `Closing`/`Closed` is left as-is.
    pub fn close(self: &Arc<Self>, reason: CloseReason) {
        {
            let mut state = self.state.lock().unwrap();
            if matches!(*state, SessionState::Closing | SessionState::Closed(_)) {
                return;
            }
            *state = SessionState::Closing;
        }
        if let Some(id) = self.mailbox_id.lock().unwrap().take() {
            self.postmaster.unregister(id);
        }
        *self.state.lock().unwrap() = SessionState::Closed(reason);
        tracing::info!(session_id = %self.id, ?reason, "session closed");
        self.listener.on_closed(self, reason);
    }

    /// Monotonically increasing sequence number local to this session, for
    /// callers that want one (e.g. RPC return ids draw from their own
    /// table, not this counter; this is a general-purpose convenience).
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }
}
