//! Client connection pool
//!
//! `transport.conn` KCP sessions to the server. New streams are spread
//! round-robin; a stream never moves, so its bytes stay in order. A slot
//! whose connection died is redialed the next time it is picked.

use super::{KcpConnection, StreamHandle, TunnelContext, TunnelError, TunnelHandle};
use crate::proxy::Address;
use crate::session::SessionKey;
use rand::Rng;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Dials new client sessions
#[derive(Clone)]
pub struct Connector {
    ctx: TunnelContext,
    server: SocketAddrV4,
    shutdown: watch::Receiver<bool>,
}

impl Connector {
    pub fn new(ctx: TunnelContext, server: SocketAddrV4, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            ctx,
            server,
            shutdown,
        }
    }

    pub fn server(&self) -> SocketAddrV4 {
        self.server
    }

    /// Start a session under a fresh conversation id and wait for the handshake
    pub async fn dial(&self) -> Result<TunnelHandle, TunnelError> {
        let conv = rand::thread_rng().gen_range(1..=u32::MAX);
        let key = SessionKey {
            local: self.ctx.carrier.local(),
            remote: self.server,
            conv,
        };

        let (_entry, inbox) = self.ctx.table.register(key)?;
        let (conn, handle) = match KcpConnection::client(self.ctx.clone(), inbox) {
            Ok(pair) => pair,
            Err(e) => {
                self.ctx.table.teardown(&key);
                return Err(e);
            }
        };

        debug!("Dialing session {} on {}", key, self.ctx.carrier.interface());
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            // Outcome is logged by the connection itself
            let _ = conn.run(shutdown).await;
        });

        handle.established().await?;
        Ok(handle)
    }
}

/// Round-robin pool of client connections
pub struct TunnelPool {
    connector: Connector,
    slots: Vec<Mutex<Option<TunnelHandle>>>,
    next: AtomicUsize,
}

impl TunnelPool {
    pub fn new(connector: Connector, size: usize) -> Self {
        let slots = (0..size.max(1)).map(|_| Mutex::new(None)).collect();
        Self {
            connector,
            slots,
            next: AtomicUsize::new(0),
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Dial every slot up front; returns how many came up
    pub async fn warm_up(&self) -> usize {
        let mut ready = 0;
        for index in 0..self.slots.len() {
            match self.connection(index).await {
                Ok(_) => ready += 1,
                Err(e) => warn!(
                    "Connection {}/{} to {} failed: {}",
                    index + 1,
                    self.slots.len(),
                    self.connector.server(),
                    e
                ),
            }
        }
        ready
    }

    /// Live connection for a slot, dialing if needed
    async fn connection(&self, index: usize) -> Result<TunnelHandle, TunnelError> {
        let mut slot = self.slots[index].lock().await;
        if let Some(handle) = slot.as_ref().filter(|handle| handle.is_usable()) {
            return Ok(handle.clone());
        }

        if let Some(dead) = slot.take() {
            info!("Connection {} ({}) is gone, redialing", index + 1, dead.key());
        }

        let handle = self.connector.dial().await?;
        info!(
            "Connection {}/{} up: {}",
            index + 1,
            self.slots.len(),
            handle.key()
        );
        *slot = Some(handle.clone());
        Ok(handle)
    }

    /// Open a stream on the next connection in turn
    pub async fn open_stream(&self, destination: Address) -> Result<StreamHandle, TunnelError> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        let handle = self.connection(index).await?;
        handle.open_stream(destination).await
    }

    /// Connections currently usable, skipping slots being dialed
    pub fn live(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| {
                slot.try_lock()
                    .map(|slot| slot.as_ref().is_some_and(|handle| handle.is_usable()))
                    .unwrap_or(false)
            })
            .count()
    }
}
