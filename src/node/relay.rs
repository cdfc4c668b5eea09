//! Bidirectional relay between a TCP connection and a tunnel stream
//!
//! Half-close travels both ways: EOF from the socket becomes a FIN frame,
//! and a FIN from the peer becomes `shutdown(write)` on the socket. The
//! relay ends once both directions have finished, or on the first error,
//! in which case the dropped stream halves reset the peer. A stream closed
//! for writing by a draining connection ends the upstream direction only;
//! a reset still fails the relay through the downstream side.

use crate::tunnel::{StreamHandle, TunnelError};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Read size for the socket side
const RELAY_BUFFER: usize = 32 * 1024;

/// Bytes moved by one relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Socket to tunnel
    pub sent: u64,
    /// Tunnel to socket
    pub received: u64,
}

/// Relay until both directions are closed
pub async fn relay<S>(io: S, stream: StreamHandle) -> Result<RelayStats, TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let stream_id = stream.id();
    let (mut io_read, mut io_write) = tokio::io::split(io);
    let (mut writer, mut reader) = stream.split();

    let upstream = async {
        let mut sent = 0u64;
        let mut buf = BytesMut::with_capacity(RELAY_BUFFER);
        loop {
            buf.reserve(RELAY_BUFFER);
            let n = io_read.read_buf(&mut buf).await?;
            if n == 0 {
                trace!("Stream {}: local EOF, sending FIN", stream_id);
                writer.finish()?;
                return Ok::<_, TunnelError>(sent);
            }
            match writer.send(buf.split().freeze()).await {
                Ok(()) => sent += n as u64,
                // Draining connection already sent our FIN
                Err(TunnelError::StreamClosed) => {
                    trace!("Stream {}: closed for writing", stream_id);
                    return Ok(sent);
                }
                Err(e) => return Err(e),
            }
        }
    };

    let downstream = async {
        let mut received = 0u64;
        while let Some(data) = reader.recv().await? {
            received += data.len() as u64;
            io_write.write_all(&data).await?;
        }
        trace!("Stream {}: peer FIN, closing socket write side", stream_id);
        io_write.shutdown().await?;
        Ok::<_, TunnelError>(received)
    };

    let (sent, received) = tokio::try_join!(upstream, downstream)?;
    Ok(RelayStats { sent, received })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::{MuxEvent, Multiplexer};
    use bytes::Bytes;

    fn pump(from: &mut Multiplexer, to: &mut Multiplexer) -> Vec<MuxEvent> {
        from.apply_queued_commands();
        from.take_send_queue()
            .into_iter()
            .filter_map(|frame| to.handle_frame(frame).unwrap())
            .collect()
    }

    fn open_pair(client: &mut Multiplexer, server: &mut Multiplexer) -> (StreamHandle, StreamHandle) {
        let local = client
            .open_stream("127.0.0.1:80".parse().unwrap())
            .unwrap();
        let Some(MuxEvent::Incoming(incoming)) = pump(client, server).pop() else {
            panic!("expected incoming stream");
        };
        let remote = incoming.accept().unwrap();
        pump(server, client);
        (local, remote)
    }

    #[tokio::test]
    async fn test_peer_drain_ends_relay_cleanly() {
        let mut client = Multiplexer::new_client();
        let mut server = Multiplexer::new_server();
        let (local, remote) = open_pair(&mut client, &mut server);

        let (app, proxied) = tokio::io::duplex(64 * 1024);
        let relay = tokio::spawn(relay(proxied, remote));

        let (mut tx, _rx) = local.split();
        tx.send(Bytes::from_static(b"before drain")).await.unwrap();
        client.apply_queued_commands();
        client.finish_all();
        pump(&mut client, &mut server);

        // The application reads everything, then a clean EOF
        let (mut app_read, mut app_write) = tokio::io::split(app);
        let mut seen = Vec::new();
        app_read.read_to_end(&mut seen).await.unwrap();
        assert_eq!(seen, b"before drain");

        app_write.write_all(b"after").await.unwrap();
        app_write.shutdown().await.unwrap();
        let stats = relay.await.unwrap().unwrap();
        assert_eq!(stats.received, 12);
    }

    #[tokio::test]
    async fn test_local_drain_ends_relay_cleanly() {
        let mut client = Multiplexer::new_client();
        let mut server = Multiplexer::new_server();
        let (local, remote) = open_pair(&mut client, &mut server);

        let (app, proxied) = tokio::io::duplex(64 * 1024);
        let relay = tokio::spawn(relay(proxied, local));

        client.finish_all();
        let (mut app_read, mut app_write) = tokio::io::split(app);
        let mut seen = Vec::new();
        app_read.read_to_end(&mut seen).await.unwrap();
        assert!(seen.is_empty());

        app_write.write_all(b"too late").await.unwrap();
        drop(app_write);
        assert!(relay.await.unwrap().is_ok());

        // The peer got FIN, not a reset
        pump(&mut client, &mut server);
        let (_tx, mut rx) = remote.split();
        assert!(rx.recv().await.unwrap().is_none());
    }
}
