//! Role multiplexer
//!
//! Wires one opened link into a running node:
//!
//! ```text
//! capture (blocking) -> queue -> dispatcher -> session inboxes -> connections
//!                                                                     |
//!                        carrier (serialized injection) <-------------+
//! ```
//!
//! and puts the client or server front-end on top. Capture, dispatcher and
//! front-end share fate under a [`Supervisor`].

pub mod client;
pub mod relay;
pub mod server;
pub mod supervisor;

pub use relay::{relay, RelayStats};
pub use supervisor::Supervisor;

use crate::config::{Config, Role};
use crate::crypto::{PacketKey, PacketOpener};
use crate::link::{run_capture, CaptureFilter, CaptureStats, Carrier, Link};
use crate::protocol::{
    CAPTURE_QUEUE_DEPTH, MAX_SESSIONS, PROTOCOL_VERSION, SESSION_QUEUE_DEPTH, SHUTDOWN_GRACE,
};
use crate::session::{Dispatcher, SessionTable};
use crate::tunnel::{Connector, TunnelContext, TunnelPool};
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, info_span, Instrument};

/// New sessions waiting for the server front-end
const ACCEPT_QUEUE: usize = 256;

/// Process-wide stop signal
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Raise the signal; later calls are no-ops
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolve once the signal is raised
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this only returns once raised
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// A configured node bound to one link
pub struct Node {
    config: Config,
    link: Link,
    table: Arc<SessionTable>,
}

impl Node {
    pub fn new(config: Config, link: Link) -> Self {
        Self {
            config,
            link,
            table: Arc::new(SessionTable::new(MAX_SESSIONS, SESSION_QUEUE_DEPTH)),
        }
    }

    /// Session table shared by the dispatcher and the connections
    pub fn sessions(&self) -> Arc<SessionTable> {
        self.table.clone()
    }

    /// Run until `shutdown` is raised or a supervised task stops
    ///
    /// Returns the first fatal error, if any. Sessions still open after the
    /// grace period are torn down before returning.
    pub async fn run(self, shutdown: Shutdown) -> Result<()> {
        let span = info_span!("node", role = %self.config.role, iface = %self.link.interface);
        let table = self.table.clone();
        let result = self.start(shutdown.clone()).instrument(span).await;

        shutdown.trigger();
        wait_for_sessions(&table, SHUTDOWN_GRACE).await;
        let leftover = table.close_all();
        if leftover > 0 {
            debug!("Tore down {} session(s) left after the grace period", leftover);
        }
        result
    }

    async fn start(self, shutdown: Shutdown) -> Result<()> {
        let Node { config, link, table } = self;
        if shutdown.is_triggered() {
            return Ok(());
        }

        let classifier = Arc::new(config.classifier()?);
        let local = config.local_endpoint();
        let transport = &config.transport;
        let key = Arc::new(PacketKey::derive(
            &transport.kcp.key,
            &transport.protocol,
            PROTOCOL_VERSION,
        )?);

        let Link {
            interface,
            mac,
            sender,
            receiver,
        } = link;
        let carrier = Arc::new(Carrier::new(
            interface.clone(),
            mac,
            config.network.ipv4.router_mac,
            local,
            classifier.clone(),
            sender,
        ));

        let peer = match config.role {
            Role::Client => config.server.as_ref().map(|server| server.addr),
            Role::Server => None,
        };
        let filter = CaptureFilter { local, peer };
        info!(
            "paqet {} {} on {} as {} ({} conn, kcp {})",
            crate::VERSION,
            config.role,
            interface,
            local,
            transport.conn,
            transport.kcp.mode
        );

        let ctx = TunnelContext {
            carrier: carrier.clone(),
            key: key.clone(),
            kcp: transport.kcp.engine_config(),
            table: table.clone(),
        };

        let mut supervisor = Supervisor::new(shutdown.clone());
        let (queue_tx, queue_rx) = mpsc::channel(CAPTURE_QUEUE_DEPTH);
        let stats = Arc::new(CaptureStats::default());
        let stop = shutdown.subscribe();
        supervisor.spawn_blocking("capture", move || {
            Ok(run_capture(receiver, filter, classifier, queue_tx, stop, stats)?)
        });

        let (acceptor, sessions) = match config.role {
            Role::Server => {
                let (tx, rx) = mpsc::channel(ACCEPT_QUEUE);
                (Some(tx), Some(rx))
            }
            Role::Client => (None, None),
        };
        let dispatcher = Dispatcher::new(
            table,
            PacketOpener::new(key),
            carrier,
            acceptor,
            config.idle_timeout(),
        );
        let stop = shutdown.subscribe();
        supervisor.spawn("dispatcher", async move {
            Ok(dispatcher.run(queue_rx, stop).await?)
        });

        match (config.role, sessions) {
            (Role::Server, Some(sessions)) => {
                supervisor.spawn("server", server::run(ctx, sessions, shutdown.clone()));
            }
            _ => {
                let server = config
                    .server
                    .as_ref()
                    .map(|server| server.addr)
                    .ok_or(crate::config::ConfigError::Missing("server.addr"))?;
                let connector = Connector::new(ctx, server, shutdown.subscribe());
                let pool = Arc::new(TunnelPool::new(connector, transport.conn as usize));
                supervisor.spawn(
                    "client",
                    client::run(
                        pool,
                        config.socks5.clone(),
                        config.forward.clone(),
                        shutdown.clone(),
                    ),
                );
            }
        }

        supervisor.run().await
    }
}

/// Give live connections a chance to send GOAWAY and release their sessions
async fn wait_for_sessions(table: &SessionTable, grace: Duration) {
    let deadline = tokio::time::Instant::now() + grace;
    while !table.is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
