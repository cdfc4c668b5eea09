//! Server front-end: one connection task per accepted session, one relay
//! task per accepted stream

use super::relay::relay;
use super::Shutdown;
use crate::protocol::{DIAL_TIMEOUT, SHUTDOWN_GRACE};
use crate::proxy::Address;
use crate::session::SessionInbox;
use crate::tunnel::{IncomingStream, KcpConnection, OpenStatus, TunnelContext};
use crate::Error;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Streams buffered between a connection and its acceptor task
const INCOMING_QUEUE: usize = 64;

/// Accept sessions until shutdown, then let their connections drain
pub async fn run(
    ctx: TunnelContext,
    mut sessions: mpsc::Receiver<SessionInbox>,
    shutdown: Shutdown,
) -> Result<(), Error> {
    let mut connections = JoinSet::new();
    info!(
        "Serving tunnel sessions on {} ({})",
        ctx.carrier.local(),
        ctx.carrier.interface()
    );

    loop {
        tokio::select! {
            inbox = sessions.recv() => match inbox {
                Some(inbox) => {
                    let key = inbox.key;
                    let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE);
                    let conn = match KcpConnection::server(ctx.clone(), inbox, incoming_tx) {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("Session {} not started: {}", key, e);
                            ctx.table.teardown(&key);
                            continue;
                        }
                    };
                    tokio::spawn(accept_streams(incoming_rx));
                    let stop = shutdown.subscribe();
                    connections.spawn(async move {
                        // Outcome is logged by the connection itself
                        let _ = conn.run(stop).await;
                    });
                }
                None => break,
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown.wait() => break,
        }
    }

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        debug!("{} connection(s) still draining, aborting", connections.len());
        connections.abort_all();
    }
    Ok(())
}

/// Dial and relay every stream the peer opens on one connection
async fn accept_streams(mut incoming: mpsc::Receiver<IncomingStream>) {
    while let Some(stream) = incoming.recv().await {
        tokio::spawn(serve_stream(stream));
    }
}

async fn serve_stream(incoming: IncomingStream) {
    let id = incoming.id();
    let destination = incoming.destination().clone();

    let socket = match dial(&destination).await {
        Ok(socket) => socket,
        Err(e) => {
            let status = OpenStatus::from(&e);
            debug!("Stream {} -> {}: {} ({})", id, destination, status, e);
            incoming.reject(status);
            return;
        }
    };

    let stream = match incoming.accept() {
        Ok(stream) => stream,
        Err(e) => {
            debug!("Stream {} -> {}: connection gone: {}", id, destination, e);
            return;
        }
    };

    match relay(socket, stream).await {
        Ok(stats) => debug!(
            "Stream {} -> {} closed ({} up, {} down)",
            id, destination, stats.sent, stats.received
        ),
        Err(e) => debug!("Stream {} -> {} aborted: {}", id, destination, e),
    }
}

/// Connect to a relay destination within [`DIAL_TIMEOUT`]
pub async fn dial(destination: &Address) -> io::Result<TcpStream> {
    let connect = async {
        match destination {
            Address::Ipv4(ip, port) => TcpStream::connect((Ipv4Addr::from(*ip), *port)).await,
            Address::Ipv6(ip, port) => TcpStream::connect((Ipv6Addr::from(*ip), *port)).await,
            Address::Domain(host, port) => TcpStream::connect((host.as_str(), *port)).await,
        }
    };

    let socket = tokio::time::timeout(DIAL_TIMEOUT, connect)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timed out"))??;
    socket.set_nodelay(true)?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let socket = dial(&Address::from(addr)).await.unwrap();
        assert_eq!(socket.peer_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn test_dial_refused_maps_to_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = dial(&Address::from(addr)).await.unwrap_err();
        assert_eq!(OpenStatus::from(&err), OpenStatus::ConnectionRefused);
    }
}
