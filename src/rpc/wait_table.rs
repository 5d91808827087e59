// ABOUTME: Correlation tables for in-flight RPC calls: local-originated wait handles and remote-originated cancel tokens.
// ABOUTME: return_id allocation is 16-bit with wrap-around, skipping 0 ("no response expected") and ids already in use.

use crate::rpc::wire::RemoteException;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, Notify};

/// What a `MethodCall`'s wait handle eventually resolves to.
#[derive(Debug)]
pub enum WaitOutcome {
    Returned(Bytes),
    Excepted(RemoteException),
}

struct Entry {
    tx: oneshot::Sender<WaitOutcome>,
}

/// Local-originated correlation table: maps a proxy call's `return_id` to
/// the handle awaiting its `MethodReturn`/`MethodException`.
///
/// One table per session per direction; the table for the direction in
/// which methods are dispatched locally lives in [`crate::rpc::handler`]'s
/// remote-cancel table instead.
pub struct WaitTable {
    next_id: Mutex<u16>,
    entries: Mutex<HashMap<u16, Entry>>,
}

impl Default for WaitTable {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitTable {
    pub fn new() -> Self {
        Self {
            next_id: Mutex::new(0),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Allocates a fresh, currently-unused `return_id` (0 is reserved for
    /// "no response expected" and is never handed out) and its receiver.
    pub fn allocate(&self) -> (u16, oneshot::Receiver<WaitOutcome>) {
        let mut next_id = self.next_id.lock().unwrap();
        let mut entries = self.entries.lock().unwrap();
        let id = loop {
            *next_id = next_id.wrapping_add(1);
            if *next_id == 0 {
                *next_id = 1;
            }
            if !entries.contains_key(&*next_id) {
                break *next_id;
            }
        };
        let (tx, rx) = oneshot::channel();
        entries.insert(id, Entry { tx });
        (id, rx)
    }

    /// Resolves the wait handle for `id`, if it is still present. Unknown
    /// ids (already cancelled, timed out, or never allocated) are silently
    /// discarded.
    pub fn resolve(&self, id: u16, outcome: WaitOutcome) {
        if let Some(entry) = self.entries.lock().unwrap().remove(&id) {
            let _ = entry.tx.send(outcome);
        }
    }

    /// Deallocates `id` without resolving it (the receiver observes a
    /// closed channel). Used when a proxy call is cancelled locally.
    pub fn remove(&self, id: u16) {
        self.entries.lock().unwrap().remove(&id);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

/// A best-effort cooperative cancellation signal, analogous to
/// `tokio_util::sync::CancellationToken` but implemented directly on
/// `Notify` to avoid an extra dependency the rest of the crate doesn't
/// otherwise need.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called (or immediately, if it
    /// already has been).
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.inner.notify.notified().await;
    }
}

/// Remote-originated table: maps an inbound call's `return_id` to the
/// [`CancelToken`] its invocation observes, so a later `MethodCancel` can
/// trigger it.
#[derive(Default)]
pub struct RemoteCancelTable {
    tokens: Mutex<HashMap<u16, CancelToken>>,
}

impl RemoteCancelTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, return_id: u16) -> CancelToken {
        let token = CancelToken::new();
        self.tokens.lock().unwrap().insert(return_id, token.clone());
        token
    }

    pub fn cancel(&self, return_id: u16) {
        if let Some(token) = self.tokens.lock().unwrap().get(&return_id) {
            token.cancel();
        }
    }

    pub fn remove(&self, return_id: u16) {
        self.tokens.lock().unwrap().remove(&return_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_never_hands_out_zero() {
        let table = WaitTable::new();
        for _ in 0..5 {
            let (id, _rx) = table.allocate();
            assert_ne!(id, 0);
        }
    }

    #[test]
    fn allocate_skips_ids_in_use() {
        let table = WaitTable::new();
        let (first, _rx1) = table.allocate();
        let (second, _rx2) = table.allocate();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn resolve_delivers_outcome_to_receiver() {
        let table = WaitTable::new();
        let (id, rx) = table.allocate();
        table.resolve(id, WaitOutcome::Returned(Bytes::from_static(b"ok")));
        match rx.await.unwrap() {
            WaitOutcome::Returned(bytes) => assert_eq!(bytes.as_ref(), b"ok"),
            WaitOutcome::Excepted(_) => panic!("expected Returned"),
        }
    }

    #[test]
    fn resolve_on_unknown_id_is_silently_dropped() {
        let table = WaitTable::new();
        table.resolve(1234, WaitOutcome::Returned(Bytes::new()));
    }

    #[tokio::test]
    async fn cancel_token_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move {
                token.cancelled().await;
            })
        };
        token.cancel();
        waiter.await.unwrap();
        assert!(token.is_cancelled());
    }

    #[test]
    fn remote_cancel_table_triggers_registered_token() {
        let table = RemoteCancelTable::new();
        let token = table.register(7);
        assert!(!token.is_cancelled());
        table.cancel(7);
        assert!(token.is_cancelled());
    }
}
