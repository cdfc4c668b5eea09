//! Concurrent session table
//!
//! Sharded by `DashMap`, so the hot path (one lookup per captured segment)
//! only locks the shard holding that session. Teardown removes the entry,
//! and removal happens at most once however many callers race for it.

use super::{ReplayWindow, SessionError, SessionKey};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Dispatcher-side state of one session
pub struct SessionEntry {
    key: SessionKey,
    inbound: mpsc::Sender<Bytes>,
    closing: watch::Sender<bool>,
    last_seen: Mutex<Instant>,
    replay: Mutex<ReplayWindow>,
    closed: AtomicBool,
}

impl SessionEntry {
    pub fn key(&self) -> SessionKey {
        self.key
    }

    /// Run a nonce through the replay window
    pub fn accept(&self, salt: u32, counter: u64) -> bool {
        self.replay.lock().check(salt, counter)
    }

    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Queue an authenticated packet without blocking; false if dropped
    pub fn deliver(&self, packet: Bytes) -> bool {
        self.inbound.try_send(packet).is_ok()
    }

    /// Signal the owning connection to stop. True only for the first caller.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.closing.send(true);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Connection-side half of a session
pub struct SessionInbox {
    pub key: SessionKey,
    pub packets: mpsc::Receiver<Bytes>,
    pub closing: watch::Receiver<bool>,
}

impl std::fmt::Debug for SessionInbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionInbox").field("key", &self.key).finish()
    }
}

/// Live sessions
pub struct SessionTable {
    sessions: DashMap<SessionKey, Arc<SessionEntry>>,
    max_sessions: usize,
    queue_depth: usize,
    released: AtomicU64,
}

impl SessionTable {
    pub fn new(max_sessions: usize, queue_depth: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_sessions,
            queue_depth,
            released: AtomicU64::new(0),
        }
    }

    /// Create a session, returning both halves
    pub fn register(
        &self,
        key: SessionKey,
    ) -> Result<(Arc<SessionEntry>, SessionInbox), SessionError> {
        // Checked before taking the shard lock; len() locks every shard
        if self.sessions.len() >= self.max_sessions {
            return Err(SessionError::Full(self.max_sessions));
        }

        match self.sessions.entry(key) {
            Entry::Occupied(_) => Err(SessionError::Duplicate(key)),
            Entry::Vacant(vacant) => {
                let (inbound, packets) = mpsc::channel(self.queue_depth);
                let (closing, closing_rx) = watch::channel(false);
                let entry = Arc::new(SessionEntry {
                    key,
                    inbound,
                    closing,
                    last_seen: Mutex::new(Instant::now()),
                    replay: Mutex::new(ReplayWindow::new()),
                    closed: AtomicBool::new(false),
                });
                vacant.insert(entry.clone());
                debug!("Session {} registered", key);

                Ok((
                    entry,
                    SessionInbox {
                        key,
                        packets,
                        closing: closing_rx,
                    },
                ))
            }
        }
    }

    pub fn get(&self, key: &SessionKey) -> Option<Arc<SessionEntry>> {
        self.sessions.get(key).map(|entry| entry.value().clone())
    }

    /// Remove a session and signal its connection. Idempotent: returns true
    /// only for the call that actually released it.
    pub fn teardown(&self, key: &SessionKey) -> bool {
        match self.sessions.remove(key) {
            Some((_, entry)) => {
                entry.close();
                self.released.fetch_add(1, Ordering::Relaxed);
                debug!("Session {} released", key);
                true
            }
            None => false,
        }
    }

    /// Tear down sessions idle longer than `idle`
    pub fn reap_idle(&self, idle: Duration) -> Vec<SessionKey> {
        let stale: Vec<SessionKey> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_for() > idle)
            .map(|entry| *entry.key())
            .collect();

        stale.into_iter().filter(|key| self.teardown(key)).collect()
    }

    /// Tear down every session
    pub fn close_all(&self) -> usize {
        let keys: Vec<SessionKey> = self.sessions.iter().map(|entry| *entry.key()).collect();
        keys.iter().filter(|key| self.teardown(key)).count()
    }

    /// Whether any live session talks to `remote`
    pub fn has_remote(&self, remote: &SocketAddrV4) -> bool {
        self.sessions.iter().any(|entry| entry.key().remote == *remote)
    }

    /// Every peer a live session talks to
    pub fn remotes(&self) -> HashSet<SocketAddrV4> {
        self.sessions.iter().map(|entry| entry.key().remote).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions released over the table's lifetime
    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(conv: u32) -> SessionKey {
        SessionKey {
            local: "10.0.0.1:9999".parse().unwrap(),
            remote: "10.0.0.2:40000".parse().unwrap(),
            conv,
        }
    }

    #[tokio::test]
    async fn test_register_and_deliver() {
        let table = SessionTable::new(8, 4);
        let (entry, mut inbox) = table.register(key(1)).unwrap();

        assert!(entry.deliver(Bytes::from_static(b"packet")));
        assert_eq!(&inbox.packets.recv().await.unwrap()[..], b"packet");
        assert!(table.get(&key(1)).is_some());
        assert!(matches!(
            table.register(key(1)),
            Err(SessionError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        let table = SessionTable::new(8, 2);
        let (entry, _inbox) = table.register(key(1)).unwrap();
        assert!(entry.deliver(Bytes::from_static(b"1")));
        assert!(entry.deliver(Bytes::from_static(b"2")));
        assert!(!entry.deliver(Bytes::from_static(b"3")));
    }

    #[test]
    fn test_capacity() {
        let table = SessionTable::new(2, 4);
        let _a = table.register(key(1)).unwrap();
        let _b = table.register(key(2)).unwrap();
        assert!(matches!(table.register(key(3)), Err(SessionError::Full(2))));

        table.teardown(&key(1));
        assert!(table.register(key(3)).is_ok());
    }

    #[tokio::test]
    async fn test_teardown_idempotent() {
        let table = Arc::new(SessionTable::new(8, 4));
        let (_entry, mut inbox) = table.register(key(1)).unwrap();

        // Concurrent timeout and peer close race for the same session
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let table = table.clone();
            tasks.push(tokio::spawn(async move { table.teardown(&key(1)) }));
        }
        let mut released = 0;
        for task in tasks {
            if task.await.unwrap() {
                released += 1;
            }
        }

        assert_eq!(released, 1);
        assert_eq!(table.released(), 1);
        assert!(table.is_empty());
        assert!(*inbox.closing.borrow_and_update());
        assert!(!table.teardown(&key(1)));
    }

    #[test]
    fn test_entry_close_once() {
        let table = SessionTable::new(8, 4);
        let (entry, _inbox) = table.register(key(1)).unwrap();
        assert!(entry.close());
        assert!(!entry.close());
        assert!(entry.is_closed());
    }

    #[test]
    fn test_remotes_follow_sessions() {
        let table = SessionTable::new(8, 4);
        let remote: SocketAddrV4 = "10.0.0.2:40000".parse().unwrap();
        let _a = table.register(key(1)).unwrap();
        let _b = table.register(key(2)).unwrap();
        assert_eq!(table.remotes().into_iter().collect::<Vec<_>>(), vec![remote]);

        table.teardown(&key(1));
        assert!(table.has_remote(&remote));
        table.teardown(&key(2));
        assert!(!table.has_remote(&remote));
        assert!(table.remotes().is_empty());
    }

    #[tokio::test]
    async fn test_reap_idle() {
        let table = SessionTable::new(8, 4);
        let (old, _a) = table.register(key(1)).unwrap();
        let (fresh, _b) = table.register(key(2)).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        fresh.touch();

        let reaped = table.reap_idle(Duration::from_millis(50));
        assert_eq!(reaped, vec![key(1)]);
        assert_eq!(table.len(), 1);
        assert!(old.is_closed());
    }
}
