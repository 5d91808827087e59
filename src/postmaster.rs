// ABOUTME: Worker-pool scheduler multiplexing many mailboxes onto bounded reader/writer pools with per-mailbox single-flight.
// ABOUTME: Built on tokio's task/channel primitives: a fixed worker pool plus an optional adaptive supervisor.

use crate::mailbox::{Mailbox, MailboxError};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

pub type MailboxId = u64;

/// Idle-time threshold below which the (optional) supervisor grows a pool.
const SUPERVISOR_IDLE_THRESHOLD: Duration = Duration::from_millis(50);
const SUPERVISOR_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
const READY_QUEUE_POLL_TIMEOUT: Duration = Duration::from_secs(60);

struct Registered {
    mailbox: Arc<Mailbox>,
    writer: Arc<AsyncMutex<Box<dyn AsyncWrite + Unpin + Send>>>,
    send_timeout: Duration,
    on_incoming: Arc<dyn Fn() + Send + Sync>,
    on_error: Arc<dyn Fn(MailboxError) + Send + Sync>,
}

impl Clone for Registered {
    fn clone(&self) -> Self {
        Self {
            mailbox: self.mailbox.clone(),
            writer: self.writer.clone(),
            send_timeout: self.send_timeout,
            on_incoming: self.on_incoming.clone(),
            on_error: self.on_error.clone(),
        }
    }
}

#[derive(Default)]
struct PoolStats {
    idle_nanos: AtomicU64,
    busy_nanos: AtomicU64,
    worker_count: AtomicUsize,
}

struct Inner {
    registry: Mutex<HashMap<MailboxId, Registered>>,
    ongoing_read: Mutex<HashSet<MailboxId>>,
    ongoing_write: Mutex<HashSet<MailboxId>>,
    read_ready_tx: Mutex<Option<mpsc::UnboundedSender<MailboxId>>>,
    write_ready_tx: Mutex<Option<mpsc::UnboundedSender<MailboxId>>>,
    read_ready_rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<MailboxId>>>,
    write_ready_rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<MailboxId>>>,
    next_id: AtomicU64,
    max_workers_per_direction: usize,
    read_stats: PoolStats,
    write_stats: PoolStats,
}

/// Shared scheduler that multiplexes many [`Mailbox`]es onto a bounded pool
/// of reader and writer workers.
///
/// Enforces at most one reader and one writer active
/// per mailbox at any instant (single-flight), and that every
/// `enqueue_outgoing`/incoming-buffer enqueue eventually gets exactly one
/// worker pass that observes it, even if the signal races a worker that is
/// already about to release single-flight (`release_*` re-checks after
/// removing the mailbox from the ongoing set).
#[derive(Clone)]
pub struct Postmaster {
    inner: Arc<Inner>,
}

impl Postmaster {
    /// Spawns a fixed-size pool of `max_read_write_workers` readers and the
    /// same number of writers. This is the default, correctness-complete
    /// configuration; see [`with_supervisor`](Self::with_supervisor) for the
    /// optional adaptive variant.
    pub fn new(max_read_write_workers: usize) -> Self {
        Self::new_with_initial_workers(max_read_write_workers, max_read_write_workers)
    }

    /// Starts with a single reader and single writer and lets a supervisor
    /// task grow each pool toward `max_read_write_workers` when average
    /// worker idle time drops below 50ms. Not
    /// load-bearing for correctness; purely a throughput knob.
    pub fn with_supervisor(max_read_write_workers: usize) -> Self {
        let postmaster = Self::new_with_initial_workers(max_read_write_workers, 1);
        postmaster.spawn_supervisor();
        postmaster
    }

    fn new_with_initial_workers(max_read_write_workers: usize, initial: usize) -> Self {
        let (read_tx, read_rx) = mpsc::unbounded_channel();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            registry: Mutex::new(HashMap::new()),
            ongoing_read: Mutex::new(HashSet::new()),
            ongoing_write: Mutex::new(HashSet::new()),
            read_ready_tx: Mutex::new(Some(read_tx)),
            write_ready_tx: Mutex::new(Some(write_tx)),
            read_ready_rx: Arc::new(AsyncMutex::new(read_rx)),
            write_ready_rx: Arc::new(AsyncMutex::new(write_rx)),
            next_id: AtomicU64::new(1),
            max_workers_per_direction: max_read_write_workers,
            read_stats: PoolStats::default(),
            write_stats: PoolStats::default(),
        });
        let postmaster = Self { inner };
        for _ in 0..initial {
            postmaster.spawn_reader_worker();
            postmaster.spawn_writer_worker();
        }
        postmaster
    }

    /// Registers a mailbox with this postmaster, pairing it with the
    /// `AsyncWrite` half of its socket and the callbacks invoked after a
    /// reader pass completes a message, or after either direction errors.
    ///
    /// `send_timeout` bounds each writer pass (`Duration::ZERO` disables the
    /// bound); a pass that doesn't finish in time is treated as a socket
    /// error and reported through `on_error`.
    pub fn register<W>(
        &self,
        mailbox: Arc<Mailbox>,
        writer: W,
        send_timeout: Duration,
        on_incoming: impl Fn() + Send + Sync + 'static,
        on_error: impl Fn(MailboxError) + Send + Sync + 'static,
    ) -> MailboxId
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let registered = Registered {
            mailbox,
            writer: Arc::new(AsyncMutex::new(Box::new(writer))),
            send_timeout,
            on_incoming: Arc::new(on_incoming),
            on_error: Arc::new(on_error),
        };
        self.inner.registry.lock().unwrap().insert(id, registered);
        id
    }

    pub fn unregister(&self, id: MailboxId) {
        self.inner.registry.lock().unwrap().remove(&id);
        self.inner.ongoing_read.lock().unwrap().remove(&id);
        self.inner.ongoing_write.lock().unwrap().remove(&id);
    }

    /// Coalesced signal: enqueues `id` on the read-ready queue unless a read
    /// is already ongoing or already queued for it.
    pub fn signal_read(&self, id: MailboxId) {
        let mut ongoing = self.inner.ongoing_read.lock().unwrap();
        if ongoing.insert(id) {
            drop(ongoing);
            if let Some(tx) = self.inner.read_ready_tx.lock().unwrap().as_ref() {
                let _ = tx.send(id);
            }
        }
    }

    /// Coalesced signal: enqueues `id` on the write-ready queue unless a
    /// write is already ongoing or already queued for it.
    pub fn signal_write(&self, id: MailboxId) {
        let mut ongoing = self.inner.ongoing_write.lock().unwrap();
        if ongoing.insert(id) {
            drop(ongoing);
            if let Some(tx) = self.inner.write_ready_tx.lock().unwrap().as_ref() {
                let _ = tx.send(id);
            }
        }
    }

    fn release_read(&self, id: MailboxId) {
        self.inner.ongoing_read.lock().unwrap().remove(&id);
        let has_more = self
            .inner
            .registry
            .lock()
            .unwrap()
            .get(&id)
            .map(|r| r.mailbox.inbox_byte_count() > 0)
            .unwrap_or(false);
        if has_more {
            self.signal_read(id);
        }
    }

    fn release_write(&self, id: MailboxId) {
        self.inner.ongoing_write.lock().unwrap().remove(&id);
        let has_more = self
            .inner
            .registry
            .lock()
            .unwrap()
            .get(&id)
            .map(|r| r.mailbox.has_pending_outbox())
            .unwrap_or(false);
        if has_more {
            self.signal_write(id);
        }
    }

    /// Shuts the pool down: drops the ready-queue senders so every blocked
    /// worker wakes with a closed channel and returns promptly.
    pub fn shutdown(&self) {
        self.inner.read_ready_tx.lock().unwrap().take();
        self.inner.write_ready_tx.lock().unwrap().take();
    }

    fn spawn_reader_worker(&self) {
        let inner = self.inner.clone();
        let postmaster = self.clone();
        self.inner.read_stats.worker_count.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            loop {
                let wait_start = Instant::now();
                let id = {
                    let mut rx = inner.read_ready_rx.lock().await;
                    tokio::time::timeout(READY_QUEUE_POLL_TIMEOUT, rx.recv()).await
                };
                inner
                    .read_stats
                    .idle_nanos
                    .fetch_add(wait_start.elapsed().as_nanos() as u64, Ordering::Relaxed);
                let id = match id {
                    Ok(Some(id)) => id,
                    Ok(None) => break,
                    Err(_) => continue,
                };

                let busy_start = Instant::now();
                let registered = inner.registry.lock().unwrap().get(&id).cloned();
                if let Some(registered) = registered {
                    match registered.mailbox.process_inbox() {
                        Ok(true) => (registered.on_incoming)(),
                        Ok(false) => {}
                        Err(err) => {
                            tracing::warn!(mailbox_id = id, error = %err, "reader worker error");
                            (registered.on_error)(err);
                        }
                    }
                }
                inner
                    .read_stats
                    .busy_nanos
                    .fetch_add(busy_start.elapsed().as_nanos() as u64, Ordering::Relaxed);
                postmaster.release_read(id);
            }
        });
    }

    fn spawn_writer_worker(&self) {
        let inner = self.inner.clone();
        let postmaster = self.clone();
        self.inner.write_stats.worker_count.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            loop {
                let wait_start = Instant::now();
                let id = {
                    let mut rx = inner.write_ready_rx.lock().await;
                    tokio::time::timeout(READY_QUEUE_POLL_TIMEOUT, rx.recv()).await
                };
                inner
                    .write_stats
                    .idle_nanos
                    .fetch_add(wait_start.elapsed().as_nanos() as u64, Ordering::Relaxed);
                let id = match id {
                    Ok(Some(id)) => id,
                    Ok(None) => break,
                    Err(_) => continue,
                };

                let busy_start = Instant::now();
                let registered = inner.registry.lock().unwrap().get(&id).cloned();
                if let Some(registered) = registered {
                    let mut writer = registered.writer.lock().await;
                    let pass = registered.mailbox.process_outbox(&mut *writer);
                    let result = if registered.send_timeout.is_zero() {
                        pass.await
                    } else {
                        match tokio::time::timeout(registered.send_timeout, pass).await {
                            Ok(result) => result,
                            Err(_) => Err(MailboxError::Io(std::io::Error::new(
                                std::io::ErrorKind::TimedOut,
                                "send_timeout elapsed",
                            ))),
                        }
                    };
                    if let Err(err) = result {
                        tracing::warn!(mailbox_id = id, error = %err, "writer worker error");
                        drop(writer);
                        (registered.on_error)(err);
                    }
                }
                inner
                    .write_stats
                    .busy_nanos
                    .fetch_add(busy_start.elapsed().as_nanos() as u64, Ordering::Relaxed);
                postmaster.release_write(id);
            }
        });
    }

    fn spawn_supervisor(&self) {
        let postmaster = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SUPERVISOR_SAMPLE_INTERVAL).await;
                if postmaster.inner.read_ready_tx.lock().unwrap().is_none() {
                    break; // shut down
                }
                postmaster.maybe_grow(&postmaster.inner.read_stats, Pool::Reader);
                postmaster.maybe_grow(&postmaster.inner.write_stats, Pool::Writer);
            }
        });
    }

    fn maybe_grow(&self, stats: &PoolStats, pool: Pool) {
        let workers = stats.worker_count.load(Ordering::Relaxed).max(1);
        if workers >= self.inner.max_workers_per_direction {
            return;
        }
        let idle = stats.idle_nanos.swap(0, Ordering::Relaxed);
        let busy = stats.busy_nanos.swap(0, Ordering::Relaxed);
        let total = idle + busy;
        if total == 0 {
            return;
        }
        let avg_idle = Duration::from_nanos(idle / workers as u64);
        if avg_idle < SUPERVISOR_IDLE_THRESHOLD {
            match pool {
                Pool::Reader => self.spawn_reader_worker(),
                Pool::Writer => self.spawn_writer_worker(),
            }
        }
    }
}

enum Pool {
    Reader,
    Writer,
}
