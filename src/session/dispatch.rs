//! Routes captured tunnel segments to sessions

use super::{SessionInbox, SessionKey, SessionTable};
use crate::crypto::PacketOpener;
use crate::kcp;
use crate::link::{Carrier, LinkError};
use crate::packet::Segment;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

/// How often idle sessions are reaped
const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Consumes the capture queue
///
/// Every payload is authenticated before it can create or touch a session.
/// On a server, new conversations are registered and handed to `acceptor`;
/// on a client (`acceptor` is `None`) unknown conversations are dropped.
pub struct Dispatcher {
    table: Arc<SessionTable>,
    opener: PacketOpener,
    carrier: Arc<Carrier>,
    acceptor: Option<mpsc::Sender<SessionInbox>>,
    idle_timeout: Duration,
    auth_failures: u64,
    replays: u64,
}

impl Dispatcher {
    pub fn new(
        table: Arc<SessionTable>,
        opener: PacketOpener,
        carrier: Arc<Carrier>,
        acceptor: Option<mpsc::Sender<SessionInbox>>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            table,
            opener,
            carrier,
            acceptor,
            idle_timeout,
            auth_failures: 0,
            replays: 0,
        }
    }

    /// Packets that failed authentication so far
    pub fn auth_failures(&self) -> u64 {
        self.auth_failures
    }

    /// Tear down idle sessions and drop flow state no session uses any more
    pub fn reap(&self) {
        for key in self.table.reap_idle(self.idle_timeout) {
            info!("Session {} idle for {:?}, torn down", key, self.idle_timeout);
        }
        let live = self.table.remotes();
        self.carrier.prune_flows(|remote| live.contains(remote));
    }

    /// Route one captured segment
    pub fn handle(&mut self, segment: Segment) {
        let remote = segment.src;

        let opened = match self.opener.open(&segment.payload) {
            Ok(opened) => opened,
            Err(e) => {
                self.auth_failures += 1;
                if self.auth_failures == 1 {
                    warn!(
                        "Dropping unauthenticated packet from {} on {}: {} (key or protocol mismatch?)",
                        remote,
                        self.carrier.interface(),
                        e
                    );
                } else {
                    debug!("Dropping unauthenticated packet from {}: {}", remote, e);
                }
                return;
            }
        };

        let Some(conv) = kcp::conv_of(&opened.plaintext) else {
            debug!("Dropping short packet from {}", remote);
            return;
        };

        let key = SessionKey {
            local: segment.dst,
            remote,
            conv,
        };

        let entry = match self.table.get(&key) {
            Some(entry) => entry,
            None => match &self.acceptor {
                Some(acceptor) => match self.table.register(key) {
                    Ok((entry, inbox)) => {
                        if acceptor.try_send(inbox).is_err() {
                            warn!("Session {} rejected: acceptor busy", key);
                            self.table.teardown(&key);
                            return;
                        }
                        info!("Session {} opened on {}", key, self.carrier.interface());
                        entry
                    }
                    Err(e) => {
                        warn!("Session {} rejected: {}", key, e);
                        return;
                    }
                },
                None => {
                    trace!("Dropping packet for unknown session {}", key);
                    return;
                }
            },
        };

        if !entry.accept(opened.salt, opened.counter) {
            self.replays += 1;
            trace!("Dropping replayed packet #{} for {}", opened.counter, key);
            return;
        }

        entry.touch();
        self.carrier.observe(&segment);

        if !entry.deliver(opened.plaintext) {
            debug!("Session {} queue full, dropping packet", key);
        }
    }

    /// Dispatch until the capture queue closes or shutdown is signalled
    ///
    /// Also reaps idle sessions, and fails once the carrier has given up
    /// injecting.
    pub async fn run(
        mut self,
        mut queue: mpsc::Receiver<Segment>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), LinkError> {
        let mut reaper = tokio::time::interval(REAP_INTERVAL);
        reaper.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                segment = queue.recv() => match segment {
                    Some(segment) => self.handle(segment),
                    None => break,
                },
                _ = reaper.tick() => {
                    self.reap();
                    if self.carrier.failed() {
                        return Err(LinkError::Closed);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        debug!(
            "Dispatcher stopped ({} auth failures, {} replays)",
            self.auth_failures, self.replays
        );
        Ok(())
    }
}
