//! Client front-end: SOCKS5 listeners and port forwards over the tunnel pool

use super::relay::relay;
use super::Shutdown;
use crate::config::{ForwardConfig, Socks5Config};
use crate::proxy::{accept_retry_delay, Address, Reply, Socks5Request, Socks5Server};
use crate::tunnel::{OpenStatus, TunnelError, TunnelPool};
use crate::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// SOCKS5 reply for a failed stream open
pub fn reply_for(err: &TunnelError) -> Reply {
    match err {
        TunnelError::OpenRefused(status) => match status {
            OpenStatus::Succeeded | OpenStatus::GeneralFailure => Reply::GeneralFailure,
            OpenStatus::NotAllowed => Reply::ConnectionNotAllowed,
            OpenStatus::NetworkUnreachable => Reply::NetworkUnreachable,
            OpenStatus::HostUnreachable => Reply::HostUnreachable,
            OpenStatus::ConnectionRefused => Reply::ConnectionRefused,
            OpenStatus::TimedOut => Reply::TtlExpired,
        },
        TunnelError::OpenTimeout => Reply::TtlExpired,
        _ => Reply::GeneralFailure,
    }
}

/// Serve every configured listener until shutdown
pub async fn run(
    pool: Arc<TunnelPool>,
    socks5: Vec<Socks5Config>,
    forwards: Vec<ForwardConfig>,
    shutdown: Shutdown,
) -> Result<(), Error> {
    let mut listeners: JoinSet<Result<(), Error>> = JoinSet::new();

    for socks in socks5 {
        let mut server = Socks5Server::bind(socks.listen.0).await?;
        if let Some((username, password)) = socks.credentials() {
            server = server.with_auth(username, password);
        }
        let pool = pool.clone();
        let stop = shutdown.subscribe();
        listeners.spawn(async move {
            let handler = move |request: Socks5Request| {
                let pool = pool.clone();
                async move { serve_socks(pool, request).await }
            };
            server.run(handler, stop).await?;
            Ok(())
        });
    }

    for forward in forwards {
        let target = forward.target()?;
        let listener = TcpListener::bind(forward.listen.0).await?;
        info!(
            "Forwarding {} -> {} through the tunnel",
            listener.local_addr()?,
            target
        );
        listeners.spawn(serve_forward(listener, target, pool.clone(), shutdown.clone()));
    }

    // Dial in the background so listeners come up without waiting on the server
    let warm = pool.clone();
    tokio::spawn(async move {
        let ready = warm.warm_up().await;
        if ready < warm.size() {
            warn!(
                "{}/{} connections up; the rest will be dialed on demand",
                ready,
                warm.size()
            );
        }
    });

    while let Some(joined) = listeners.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(e) => return Err(Error::Task(e.to_string())),
        }
        if !shutdown.is_triggered() {
            return Err(Error::Task("client listener stopped".to_string()));
        }
    }
    Ok(())
}

async fn serve_socks(pool: Arc<TunnelPool>, request: Socks5Request) {
    let peer = request.peer;
    let destination = request.address.clone();

    let stream = match pool.open_stream(destination.clone()).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!("{} -> {}: open failed: {}", peer, destination, e);
            if let Err(e) = request.fail(reply_for(&e)).await {
                debug!("{}: failure reply not delivered: {}", peer, e);
            }
            return;
        }
    };

    let socket = match request.succeed().await {
        Ok(socket) => socket,
        Err(e) => {
            debug!("{}: success reply not delivered: {}", peer, e);
            return;
        }
    };
    finish_relay(socket, peer, &destination, stream).await;
}

async fn serve_forward(
    listener: TcpListener,
    target: Address,
    pool: Arc<TunnelPool>,
    shutdown: Shutdown,
) -> Result<(), Error> {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Forward to {}: accept failed: {}", target, e);
                        if let Some(delay) = accept_retry_delay(&e) {
                            tokio::time::sleep(delay).await;
                        }
                        continue;
                    }
                };
                let pool = pool.clone();
                let target = target.clone();
                tokio::spawn(async move {
                    match pool.open_stream(target.clone()).await {
                        Ok(stream) => finish_relay(socket, peer, &target, stream).await,
                        Err(e) => debug!("{} -> {}: open failed: {}", peer, target, e),
                    }
                });
            }
            _ = shutdown.wait() => return Ok(()),
        }
    }
}

async fn finish_relay(
    socket: TcpStream,
    peer: SocketAddr,
    destination: &Address,
    stream: crate::tunnel::StreamHandle,
) {
    let _ = socket.set_nodelay(true);
    let id = stream.id();
    match relay(socket, stream).await {
        Ok(stats) => debug!(
            "Stream {} {} -> {} closed ({} up, {} down)",
            id, peer, destination, stats.sent, stats.received
        ),
        Err(e) => debug!("Stream {} {} -> {} aborted: {}", id, peer, destination, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_mapping() {
        assert_eq!(
            reply_for(&TunnelError::OpenRefused(OpenStatus::ConnectionRefused)),
            Reply::ConnectionRefused
        );
        assert_eq!(
            reply_for(&TunnelError::OpenRefused(OpenStatus::HostUnreachable)),
            Reply::HostUnreachable
        );
        assert_eq!(reply_for(&TunnelError::OpenTimeout), Reply::TtlExpired);
        assert_eq!(reply_for(&TunnelError::ConnectionClosed), Reply::GeneralFailure);
    }
}
