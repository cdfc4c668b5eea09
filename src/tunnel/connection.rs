//! KCP connection task
//!
//! One task per session. It feeds authenticated packets into the KCP engine,
//! runs the HELLO handshake, drives the stream multiplexer and injects the
//! engine's sealed output through the carrier.

use super::{
    Frame, FrameType, IncomingStream, MuxEvent, Multiplexer, OpenStatus, StreamHandle,
    TunnelError,
};
use crate::crypto::{PacketKey, PacketSealer};
use crate::kcp::{KcpConfig, KcpEngine};
use crate::link::Carrier;
use crate::protocol::{
    ProtocolError, HANDSHAKE_TIMEOUT, KEEPALIVE_INTERVAL, OPEN_TIMEOUT, PROTOCOL_NAME,
    PROTOCOL_VERSION, SHUTDOWN_GRACE,
};
use crate::proxy::Address;
use crate::session::{SessionInbox, SessionKey, SessionTable};
use crate::ErrorKind;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for HELLO / HELLO_ACK
    Handshaking,
    /// Fully connected and ready
    Established,
    /// GOAWAY sent, flushing what is queued
    Draining,
    /// Connection closed
    Closed,
}

/// What every connection on one carrier shares
#[derive(Clone)]
pub struct TunnelContext {
    pub carrier: Arc<Carrier>,
    pub key: Arc<PacketKey>,
    pub kcp: KcpConfig,
    pub table: Arc<SessionTable>,
}

struct OpenRequest {
    destination: Address,
    reply: oneshot::Sender<Result<StreamHandle, TunnelError>>,
}

/// Client-side handle to a running connection
#[derive(Clone)]
pub struct TunnelHandle {
    key: SessionKey,
    requests: mpsc::Sender<OpenRequest>,
    state: watch::Receiver<ConnectionState>,
}

impl TunnelHandle {
    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Whether new streams can still be opened here
    pub fn is_usable(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Handshaking | ConnectionState::Established
        ) && !self.requests.is_closed()
    }

    /// Wait for the handshake to finish
    pub async fn established(&self) -> Result<(), TunnelError> {
        let mut state = self.state.clone();
        loop {
            let current = *state.borrow_and_update();
            match current {
                ConnectionState::Established => return Ok(()),
                ConnectionState::Draining | ConnectionState::Closed => {
                    return Err(TunnelError::Handshake(format!(
                        "session {} closed before HELLO_ACK",
                        self.key
                    )))
                }
                ConnectionState::Handshaking => {}
            }
            if state.changed().await.is_err() {
                return Err(TunnelError::ConnectionClosed);
            }
        }
    }

    /// Open a stream to `destination` through the server
    ///
    /// Resolves once the server has dialed the destination, or fails with
    /// its status, or with [`TunnelError::OpenTimeout`].
    pub async fn open_stream(&self, destination: Address) -> Result<StreamHandle, TunnelError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(OpenRequest { destination, reply })
            .await
            .map_err(|_| TunnelError::ConnectionClosed)?;

        match tokio::time::timeout(OPEN_TIMEOUT, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TunnelError::ConnectionClosed),
            Err(_) => Err(TunnelError::OpenTimeout),
        }
    }
}

/// A KCP session and the streams multiplexed over it
pub struct KcpConnection {
    key: SessionKey,
    is_client: bool,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    kcp: KcpEngine,
    mux: Multiplexer,
    sealer: PacketSealer,
    ctx: TunnelContext,
    inbox: SessionInbox,
    requests: Option<mpsc::Receiver<OpenRequest>>,
    pending: HashMap<u32, (StreamHandle, oneshot::Sender<Result<StreamHandle, TunnelError>>)>,
    incoming: Option<mpsc::Sender<IncomingStream>>,
    epoch: Instant,
    drain_deadline: Instant,
}

impl KcpConnection {
    fn new(ctx: TunnelContext, inbox: SessionInbox, is_client: bool) -> Result<Self, TunnelError> {
        let key = inbox.key;
        let mut kcp = KcpEngine::new(key.conv);
        ctx.kcp.apply(&mut kcp)?;
        let sealer = PacketSealer::new(ctx.key.clone())?;
        let (state_tx, _) = watch::channel(ConnectionState::Handshaking);

        Ok(Self {
            key,
            is_client,
            state: ConnectionState::Handshaking,
            state_tx,
            kcp,
            mux: if is_client {
                Multiplexer::new_client()
            } else {
                Multiplexer::new_server()
            },
            sealer,
            ctx,
            inbox,
            requests: None,
            pending: HashMap::new(),
            incoming: None,
            epoch: Instant::now(),
            drain_deadline: Instant::now(),
        })
    }

    /// A connection we initiate; streams are opened through the handle
    pub fn client(
        ctx: TunnelContext,
        inbox: SessionInbox,
    ) -> Result<(Self, TunnelHandle), TunnelError> {
        let mut conn = Self::new(ctx, inbox, true)?;
        let (requests_tx, requests_rx) = mpsc::channel(64);
        conn.requests = Some(requests_rx);

        let handle = TunnelHandle {
            key: conn.key,
            requests: requests_tx,
            state: conn.state_tx.subscribe(),
        };
        Ok((conn, handle))
    }

    /// A connection the peer initiated; its streams arrive on `incoming`
    pub fn server(
        ctx: TunnelContext,
        inbox: SessionInbox,
        incoming: mpsc::Sender<IncomingStream>,
    ) -> Result<Self, TunnelError> {
        let mut conn = Self::new(ctx, inbox, false)?;
        conn.incoming = Some(incoming);
        Ok(conn)
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    /// Run until the session ends
    ///
    /// Whatever the outcome, the session is released from the table and
    /// every stream still on it is reset.
    pub async fn run(mut self, shutdown: watch::Receiver<bool>) -> Result<(), TunnelError> {
        let span = info_span!(
            "session",
            iface = %self.ctx.carrier.interface(),
            id = %self.key
        );
        async move {
            let result = self.drive(shutdown).await;
            self.finish(&result).await;
            result
        }
        .instrument(span)
        .await
    }

    fn now_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.state_tx.send_replace(state);
    }

    async fn drive(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), TunnelError> {
        let interval = Duration::from_millis(self.kcp.interval().max(1) as u64);
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut keepalive =
            tokio::time::interval_at(Instant::now() + KEEPALIVE_INTERVAL, KEEPALIVE_INTERVAL);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let send_limit = 2 * self.ctx.kcp.sndwnd as usize;
        let handshake_deadline = Instant::now() + HANDSHAKE_TIMEOUT;

        self.kcp.update(self.now_ms());
        if self.is_client {
            self.queue_frame(Frame::hello(PROTOCOL_VERSION, PROTOCOL_NAME))?;
            self.kcp.flush();
            self.transmit().await?;
        }

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.kcp.update(self.now_ms());
                    self.transmit().await?;

                    if self.kcp.is_dead() {
                        return Err(TunnelError::DeadLink);
                    }
                    match self.state {
                        ConnectionState::Handshaking if Instant::now() >= handshake_deadline => {
                            return Err(TunnelError::HandshakeTimeout(HANDSHAKE_TIMEOUT));
                        }
                        ConnectionState::Draining
                            if self.kcp.wait_snd() == 0 || Instant::now() >= self.drain_deadline =>
                        {
                            return Ok(());
                        }
                        _ => {}
                    }
                }
                packet = self.inbox.packets.recv() => match packet {
                    Some(packet) => {
                        self.on_packet(packet)?;
                        self.flush_frames().await?;
                    }
                    None => return Ok(()),
                },
                cmd = self.mux.next_command(),
                    if self.state != ConnectionState::Handshaking && self.kcp.wait_snd() < send_limit =>
                {
                    if let Some(cmd) = cmd {
                        self.mux.apply_command(cmd);
                        self.flush_frames().await?;
                    }
                }
                request = next_request(&mut self.requests), if self.state == ConnectionState::Established => {
                    match request {
                        Some(request) => {
                            self.open(request);
                            self.flush_frames().await?;
                        }
                        None => {
                            self.requests = None;
                            self.begin_drain("client closed");
                            self.kcp.flush();
                            self.transmit().await?;
                        }
                    }
                }
                _ = self.inbox.closing.changed() => {
                    debug!("Session released by the table");
                    return Ok(());
                }
                _ = shutdown.changed(), if self.state != ConnectionState::Draining => {
                    self.begin_drain("shutdown");
                    self.kcp.flush();
                    self.transmit().await?;
                }
                _ = keepalive.tick() => {
                    if self.state == ConnectionState::Established {
                        self.mux.send_ping();
                        self.flush_frames().await?;
                    }
                    self.pending.retain(|_, (_, reply)| !reply.is_closed());
                }
            }
        }
    }

    /// Feed one packet to KCP and act on every completed frame
    fn on_packet(&mut self, packet: Bytes) -> Result<(), TunnelError> {
        if let Err(e) = self.kcp.input(&packet) {
            debug!("Discarding KCP packet: {}", e);
            return Ok(());
        }

        while let Some(message) = self.kcp.recv() {
            let frame = Frame::decode(message)?;
            self.on_frame(frame)?;
        }
        Ok(())
    }

    fn on_frame(&mut self, frame: Frame) -> Result<(), TunnelError> {
        if self.state == ConnectionState::Handshaking {
            return self.on_handshake(frame);
        }

        match self.mux.handle_frame(frame)? {
            None | Some(MuxEvent::Pong(_)) => {}
            Some(MuxEvent::Incoming(stream)) if self.state == ConnectionState::Draining => {
                debug!("Refusing stream {} while draining", stream.id());
                stream.reject(OpenStatus::GeneralFailure);
            }
            Some(MuxEvent::Incoming(stream)) => self.on_incoming(stream),
            Some(MuxEvent::Opened { stream_id, status }) => self.on_opened(stream_id, status),
            Some(MuxEvent::GoAway(reason)) => {
                info!("Peer going away: {}", reason);
                if self.state != ConnectionState::Draining {
                    self.begin_drain("peer going away");
                }
            }
        }
        Ok(())
    }

    fn on_handshake(&mut self, frame: Frame) -> Result<(), TunnelError> {
        match (self.is_client, frame.frame_type) {
            (false, FrameType::Hello) => {
                let (version, protocol) = frame.parse_hello()?;
                if version != PROTOCOL_VERSION {
                    self.queue_frame(Frame::go_away(&format!("unsupported version {}", version)))?;
                    return Err(ProtocolError::VersionMismatch {
                        expected: PROTOCOL_VERSION,
                        actual: version,
                    }
                    .into());
                }
                if protocol != PROTOCOL_NAME {
                    self.queue_frame(Frame::go_away(&format!("unsupported protocol {}", protocol)))?;
                    return Err(ProtocolError::ProtocolMismatch {
                        expected: PROTOCOL_NAME.to_string(),
                        actual: protocol,
                    }
                    .into());
                }

                self.queue_frame(Frame::hello_ack(PROTOCOL_VERSION))?;
                self.set_state(ConnectionState::Established);
                info!("Session established with client v{}", version);
                Ok(())
            }
            (true, FrameType::HelloAck) => {
                self.set_state(ConnectionState::Established);
                info!("Session established");
                Ok(())
            }
            (true, FrameType::GoAway) => Err(TunnelError::Handshake(
                String::from_utf8_lossy(&frame.payload).to_string(),
            )),
            (_, other) => Err(ProtocolError::UnexpectedMessage(format!(
                "{:?} during handshake",
                other
            ))
            .into()),
        }
    }

    fn on_incoming(&mut self, stream: IncomingStream) {
        match &self.incoming {
            Some(incoming) => {
                if let Err(e) = incoming.try_send(stream) {
                    warn!("Stream backlog full, refusing stream");
                    e.into_inner().reject(OpenStatus::GeneralFailure);
                }
            }
            None => {
                debug!("Refusing stream {} opened by the server", stream.id());
                stream.reject(OpenStatus::NotAllowed);
            }
        }
    }

    fn on_opened(&mut self, stream_id: u32, status: OpenStatus) {
        let Some((handle, reply)) = self.pending.remove(&stream_id) else {
            return;
        };
        if status == OpenStatus::Succeeded {
            // A requester that already gave up drops the handle, resetting the stream
            let _ = reply.send(Ok(handle));
        } else {
            drop(handle);
            let _ = reply.send(Err(TunnelError::OpenRefused(status)));
        }
    }

    fn open(&mut self, request: OpenRequest) {
        debug!("Opening stream to {}", request.destination);
        match self.mux.open_stream(request.destination) {
            Ok(handle) => {
                self.pending.insert(handle.id(), (handle, request.reply));
            }
            Err(e) => {
                let _ = request.reply.send(Err(e));
            }
        }
    }

    /// FIN every stream, send GOAWAY and stop taking new work
    ///
    /// The connection then lingers until KCP has delivered everything or
    /// `SHUTDOWN_GRACE` passes; whatever is left at that point is reset.
    fn begin_drain(&mut self, reason: &str) {
        debug!("Draining: {}", reason);
        self.mux.apply_queued_commands();
        self.mux.finish_all();
        self.fail_pending();

        // Stream data and FINs go out ahead of the GOAWAY
        for frame in self.mux.take_send_queue() {
            if let Err(e) = self.queue_frame(frame) {
                debug!("Could not queue frame while draining: {}", e);
            }
        }
        if self.state == ConnectionState::Established {
            if let Err(e) = self.queue_frame(Frame::go_away(reason)) {
                debug!("Could not queue GOAWAY: {}", e);
            }
        }
        self.set_state(ConnectionState::Draining);
        self.drain_deadline = Instant::now() + SHUTDOWN_GRACE;
    }

    fn fail_pending(&mut self) {
        for (_, (_handle, reply)) in self.pending.drain() {
            let _ = reply.send(Err(TunnelError::ConnectionClosed));
        }
    }

    fn queue_frame(&mut self, frame: Frame) -> Result<(), TunnelError> {
        let message = frame.encode()?;
        self.kcp.send(&message)?;
        Ok(())
    }

    /// Move multiplexer frames into KCP and push them out immediately
    async fn flush_frames(&mut self) -> Result<(), TunnelError> {
        let frames = self.mux.take_send_queue();
        if frames.is_empty() {
            return Ok(());
        }
        for frame in frames {
            self.queue_frame(frame)?;
        }
        self.kcp.flush();
        self.transmit().await
    }

    /// Seal and inject everything KCP produced
    async fn transmit(&mut self) -> Result<(), TunnelError> {
        for packet in self.kcp.take_output() {
            let sealed = self.sealer.seal(&packet)?;
            self.ctx.carrier.send(self.key.remote, &sealed).await?;
        }
        Ok(())
    }

    async fn finish(&mut self, result: &Result<(), TunnelError>) {
        self.mux.reset_all();
        self.fail_pending();

        // Last chance for a queued GOAWAY
        if !self.ctx.carrier.failed() {
            self.kcp.flush();
            if let Err(e) = self.transmit().await {
                debug!("Final flush failed: {}", e);
            }
        }

        self.set_state(ConnectionState::Closed);
        self.ctx.table.teardown(&self.key);
        if !self.ctx.table.has_remote(&self.key.remote) {
            self.ctx.carrier.forget(&self.key.remote);
        }

        match result {
            Ok(()) => info!("Session closed"),
            Err(e) => match e.kind() {
                ErrorKind::TransportHandshake | ErrorKind::PeerProtocol => {
                    warn!("Session failed: {}", e)
                }
                ErrorKind::CarrierIo | ErrorKind::Configuration => error!("Session failed: {}", e),
                ErrorKind::Other => info!("Session closed: {}", e),
            },
        }
    }
}

async fn next_request(requests: &mut Option<mpsc::Receiver<OpenRequest>>) -> Option<OpenRequest> {
    match requests {
        Some(requests) => requests.recv().await,
        None => std::future::pending().await,
    }
}
