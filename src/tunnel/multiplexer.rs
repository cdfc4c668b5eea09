//! Stream multiplexer for the tunnel
//!
//! Manages multiple logical streams over a single KCP connection. The
//! multiplexer is owned by the connection task; applications talk to it
//! through [`StreamWriter`] and [`StreamReader`] halves over channels.
//!
//! Flow control is per stream. A writer holds one semaphore permit per byte
//! it may still send; the peer's WINDOW_UPDATE frames add permits back.

use super::frame::{OpenStatus, MAX_PAYLOAD_SIZE};
use super::{
    Frame, FrameType, StreamState, TunnelError, TunnelStream, DEFAULT_WINDOW_SIZE, MAX_STREAMS,
};
use crate::proxy::Address;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, trace};

/// Stream event sent from multiplexer to stream handlers
#[derive(Debug)]
pub enum StreamEvent {
    /// Data received for stream
    Data(Bytes),
    /// Peer finished writing
    Fin,
    /// Stream reset by the peer or torn down with its connection
    Reset,
}

/// Command sent from stream handlers to multiplexer
#[derive(Debug)]
pub enum StreamCommand {
    /// Send data on stream
    Send { stream_id: u32, data: Bytes },
    /// Half-close the sending direction
    Fin { stream_id: u32 },
    /// Abort the stream
    Close { stream_id: u32 },
    /// Send window update
    WindowUpdate { stream_id: u32, increment: u32 },
    /// Answer a peer's STREAM_OPEN
    OpenAck { stream_id: u32, status: OpenStatus },
}

/// Sending half of a stream
#[derive(Debug)]
pub struct StreamWriter {
    stream_id: u32,
    cmd_tx: mpsc::UnboundedSender<StreamCommand>,
    credit: Arc<Semaphore>,
    finished: bool,
}

impl StreamWriter {
    pub fn id(&self) -> u32 {
        self.stream_id
    }

    /// Send data on this stream, waiting for window as needed
    pub async fn send(&mut self, mut data: Bytes) -> Result<(), TunnelError> {
        if self.finished {
            return Err(TunnelError::StreamClosed);
        }

        while !data.is_empty() {
            let chunk = data.split_to(data.len().min(MAX_PAYLOAD_SIZE));
            let permits = self
                .credit
                .acquire_many(chunk.len() as u32)
                .await
                .map_err(|_| TunnelError::StreamClosed)?;
            permits.forget();

            self.cmd_tx
                .send(StreamCommand::Send {
                    stream_id: self.stream_id,
                    data: chunk,
                })
                .map_err(|_| TunnelError::ConnectionClosed)?;
        }
        Ok(())
    }

    /// Half-close: the peer reads EOF once all sent data arrived
    pub fn finish(&mut self) -> Result<(), TunnelError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.cmd_tx
            .send(StreamCommand::Fin {
                stream_id: self.stream_id,
            })
            .map_err(|_| TunnelError::ConnectionClosed)
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.cmd_tx.send(StreamCommand::Close {
                stream_id: self.stream_id,
            });
        }
    }
}

/// Receiving half of a stream
#[derive(Debug)]
pub struct StreamReader {
    stream_id: u32,
    cmd_tx: mpsc::UnboundedSender<StreamCommand>,
    event_rx: mpsc::UnboundedReceiver<StreamEvent>,
    consumed: u32,
    done: bool,
}

impl StreamReader {
    pub fn id(&self) -> u32 {
        self.stream_id
    }

    /// Next chunk of data; `Ok(None)` is a clean end of stream
    pub async fn recv(&mut self) -> Result<Option<Bytes>, TunnelError> {
        if self.done {
            return Ok(None);
        }

        match self.event_rx.recv().await {
            Some(StreamEvent::Data(data)) => {
                self.consumed += data.len() as u32;
                if self.consumed >= DEFAULT_WINDOW_SIZE / 2 {
                    let _ = self.cmd_tx.send(StreamCommand::WindowUpdate {
                        stream_id: self.stream_id,
                        increment: self.consumed,
                    });
                    self.consumed = 0;
                }
                Ok(Some(data))
            }
            Some(StreamEvent::Fin) => {
                self.done = true;
                Ok(None)
            }
            Some(StreamEvent::Reset) => {
                self.done = true;
                Err(TunnelError::StreamClosed)
            }
            None => {
                self.done = true;
                Err(TunnelError::ConnectionClosed)
            }
        }
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.cmd_tx.send(StreamCommand::Close {
                stream_id: self.stream_id,
            });
        }
    }
}

/// Both halves of an open stream
#[derive(Debug)]
pub struct StreamHandle {
    pub writer: StreamWriter,
    pub reader: StreamReader,
}

impl StreamHandle {
    pub fn id(&self) -> u32 {
        self.writer.stream_id
    }

    pub fn split(self) -> (StreamWriter, StreamReader) {
        (self.writer, self.reader)
    }
}

/// A stream the peer asked to open, not yet answered
#[derive(Debug)]
pub struct IncomingStream {
    destination: Address,
    handle: StreamHandle,
}

impl IncomingStream {
    pub fn id(&self) -> u32 {
        self.handle.id()
    }

    pub fn destination(&self) -> &Address {
        &self.destination
    }

    /// Acknowledge the open and start relaying
    pub fn accept(self) -> Result<StreamHandle, TunnelError> {
        self.handle
            .writer
            .cmd_tx
            .send(StreamCommand::OpenAck {
                stream_id: self.handle.id(),
                status: OpenStatus::Succeeded,
            })
            .map_err(|_| TunnelError::ConnectionClosed)?;
        Ok(self.handle)
    }

    /// Refuse the open
    pub fn reject(self, status: OpenStatus) {
        let _ = self.handle.writer.cmd_tx.send(StreamCommand::OpenAck {
            stream_id: self.handle.id(),
            status,
        });
    }
}

/// What a frame meant to the connection, beyond stream bookkeeping
#[derive(Debug)]
pub enum MuxEvent {
    /// Peer opened a stream
    Incoming(IncomingStream),
    /// Peer answered one of our opens
    Opened { stream_id: u32, status: OpenStatus },
    /// Peer is closing the connection
    GoAway(String),
    Pong(u64),
}

/// Multiplexer state for a single stream
struct StreamSlot {
    stream: TunnelStream,
    event_tx: mpsc::UnboundedSender<StreamEvent>,
    credit: Arc<Semaphore>,
}

/// Stream multiplexer
pub struct Multiplexer {
    /// Active streams
    streams: HashMap<u32, StreamSlot>,
    /// Next stream ID (odd for client, even for server)
    next_stream_id: u32,
    /// Command receiver from stream handles
    cmd_rx: mpsc::UnboundedReceiver<StreamCommand>,
    /// Command sender (cloned for new stream handles)
    cmd_tx: mpsc::UnboundedSender<StreamCommand>,
    /// Pending frames to send
    send_queue: Vec<Frame>,
}

impl Multiplexer {
    fn new(first_stream_id: u32) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Self {
            streams: HashMap::new(),
            next_stream_id: first_stream_id,
            cmd_rx,
            cmd_tx,
            send_queue: Vec::new(),
        }
    }

    /// Create a new client-side multiplexer
    pub fn new_client() -> Self {
        Self::new(1)
    }

    /// Create a new server-side multiplexer
    pub fn new_server() -> Self {
        Self::new(2)
    }

    fn insert(&mut self, stream: TunnelStream) -> StreamHandle {
        let stream_id = stream.id();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let credit = Arc::new(Semaphore::new(DEFAULT_WINDOW_SIZE as usize));

        self.streams.insert(
            stream_id,
            StreamSlot {
                stream,
                event_tx,
                credit: credit.clone(),
            },
        );

        StreamHandle {
            writer: StreamWriter {
                stream_id,
                cmd_tx: self.cmd_tx.clone(),
                credit,
                finished: false,
            },
            reader: StreamReader {
                stream_id,
                cmd_tx: self.cmd_tx.clone(),
                event_rx,
                consumed: 0,
                done: false,
            },
        }
    }

    fn remove(&mut self, stream_id: u32, event: Option<StreamEvent>) {
        if let Some(slot) = self.streams.remove(&stream_id) {
            slot.credit.close();
            if let Some(event) = event {
                let _ = slot.event_tx.send(event);
            }
            trace!("Stream {} removed", stream_id);
        }
    }

    /// Open a new stream to a destination
    ///
    /// The handle is usable once the peer answers with STREAM_OPEN_ACK.
    pub fn open_stream(&mut self, destination: Address) -> Result<StreamHandle, TunnelError> {
        if self.streams.len() >= MAX_STREAMS as usize {
            return Err(TunnelError::TooManyStreams(MAX_STREAMS));
        }

        let stream_id = self.next_stream_id;
        self.next_stream_id = self.next_stream_id.wrapping_add(2); // Keep odd/even pattern

        self.send_queue.push(Frame::stream_open(stream_id, &destination));
        Ok(self.insert(TunnelStream::opening(stream_id, destination)))
    }

    /// Handle an incoming stream or keepalive frame
    pub fn handle_frame(&mut self, frame: Frame) -> Result<Option<MuxEvent>, TunnelError> {
        let stream_id = frame.stream_id;
        match frame.frame_type {
            FrameType::Data => {
                self.handle_data(stream_id, frame.payload)?;
                Ok(None)
            }
            FrameType::StreamOpen => self.handle_stream_open(stream_id, &frame.payload),
            FrameType::StreamOpenAck => {
                let status = frame.parse_status()?;
                match self.streams.get_mut(&stream_id) {
                    Some(slot) if status == OpenStatus::Succeeded => slot.stream.established(),
                    Some(_) => self.remove(stream_id, Some(StreamEvent::Reset)),
                    None => return Ok(None),
                }
                Ok(Some(MuxEvent::Opened { stream_id, status }))
            }
            FrameType::Fin => {
                if let Some(slot) = self.streams.get_mut(&stream_id) {
                    slot.stream.close_remote();
                    let _ = slot.event_tx.send(StreamEvent::Fin);
                    if slot.stream.is_closed() {
                        self.remove(stream_id, None);
                    }
                }
                Ok(None)
            }
            FrameType::StreamClose => {
                self.remove(stream_id, Some(StreamEvent::Reset));
                Ok(None)
            }
            FrameType::WindowUpdate => {
                let increment = frame.parse_u32()?;
                if let Some(slot) = self.streams.get(&stream_id) {
                    slot.credit.add_permits(increment as usize);
                }
                Ok(None)
            }
            FrameType::Ping => {
                self.send_queue.push(Frame::pong(frame.parse_u64()?));
                Ok(None)
            }
            FrameType::Pong => Ok(Some(MuxEvent::Pong(frame.parse_u64()?))),
            FrameType::GoAway => Ok(Some(MuxEvent::GoAway(
                String::from_utf8_lossy(&frame.payload).to_string(),
            ))),
            FrameType::Hello | FrameType::HelloAck => Err(TunnelError::InvalidFrame(format!(
                "{:?} after handshake",
                frame.frame_type
            ))),
        }
    }

    /// Handle incoming data frame
    fn handle_data(&mut self, stream_id: u32, data: Bytes) -> Result<(), TunnelError> {
        let Some(slot) = self.streams.get_mut(&stream_id) else {
            // Late data after a local reset
            trace!("Data for unknown stream {}", stream_id);
            return Ok(());
        };

        match slot.stream.consume_recv_window(data.len() as u32) {
            Ok(()) => {
                let _ = slot.event_tx.send(StreamEvent::Data(data));
                Ok(())
            }
            Err(TunnelError::FlowControl) => {
                // Peer ignored our window; the whole connection is suspect
                Err(TunnelError::FlowControl)
            }
            Err(e) => {
                debug!("Stream {} dropped data: {}", stream_id, e);
                Ok(())
            }
        }
    }

    /// Handle stream open request (server side)
    fn handle_stream_open(
        &mut self,
        stream_id: u32,
        payload: &[u8],
    ) -> Result<Option<MuxEvent>, TunnelError> {
        if self.streams.contains_key(&stream_id) {
            return Err(TunnelError::InvalidFrame(format!(
                "Stream {} opened twice",
                stream_id
            )));
        }

        let destination = match Address::decode(payload) {
            Ok(destination) => destination,
            Err(e) => {
                debug!("Stream {} has a bad destination: {}", stream_id, e);
                self.send_queue
                    .push(Frame::stream_open_ack(stream_id, OpenStatus::GeneralFailure));
                return Ok(None);
            }
        };

        if self.streams.len() >= MAX_STREAMS as usize {
            self.send_queue
                .push(Frame::stream_open_ack(stream_id, OpenStatus::GeneralFailure));
            return Ok(None);
        }

        let handle = self.insert(TunnelStream::accepted(stream_id, destination.clone()));
        Ok(Some(MuxEvent::Incoming(IncomingStream {
            destination,
            handle,
        })))
    }

    /// Wait for the next command from a stream handle
    pub async fn next_command(&mut self) -> Option<StreamCommand> {
        self.cmd_rx.recv().await
    }

    /// Turn a stream command into frames
    pub fn apply_command(&mut self, cmd: StreamCommand) {
        match cmd {
            StreamCommand::Send { stream_id, data } => {
                if let Some(slot) = self.streams.get(&stream_id) {
                    if slot.stream.can_send() {
                        self.send_queue.push(Frame::data(stream_id, data));
                    }
                }
            }
            StreamCommand::Fin { stream_id } => {
                if let Some(slot) = self.streams.get_mut(&stream_id) {
                    slot.stream.close_local();
                    self.send_queue.push(Frame::fin(stream_id));
                    if slot.stream.is_closed() {
                        self.remove(stream_id, None);
                    }
                }
            }
            StreamCommand::Close { stream_id } => {
                if self.streams.contains_key(&stream_id) {
                    self.send_queue.push(Frame::stream_close(stream_id));
                    self.remove(stream_id, Some(StreamEvent::Reset));
                }
            }
            StreamCommand::WindowUpdate {
                stream_id,
                increment,
            } => {
                if let Some(slot) = self.streams.get_mut(&stream_id) {
                    slot.stream.apply_window_update(increment);
                    self.send_queue
                        .push(Frame::window_update(stream_id, increment));
                }
            }
            StreamCommand::OpenAck { stream_id, status } => {
                if self.streams.contains_key(&stream_id) {
                    self.send_queue
                        .push(Frame::stream_open_ack(stream_id, status));
                    if status != OpenStatus::Succeeded {
                        self.remove(stream_id, None);
                    }
                }
            }
        }
    }

    /// Apply whatever stream handles have already queued
    pub fn apply_queued_commands(&mut self) {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            self.apply_command(cmd);
        }
    }

    /// Close every stream gracefully, for a draining connection
    ///
    /// Established streams send FIN and their readers see end of stream;
    /// writers are refused from then on. Opens still waiting for an answer
    /// are reset.
    pub fn finish_all(&mut self) {
        let ids: Vec<u32> = self.streams.keys().copied().collect();
        for stream_id in ids {
            let Some(slot) = self.streams.get(&stream_id) else {
                continue;
            };
            if slot.stream.state() == StreamState::Opening {
                self.send_queue.push(Frame::stream_close(stream_id));
                self.remove(stream_id, Some(StreamEvent::Reset));
                continue;
            }

            if slot.stream.can_send() {
                self.send_queue.push(Frame::fin(stream_id));
            }
            let event = slot.stream.can_recv().then_some(StreamEvent::Fin);
            self.remove(stream_id, event);
        }
    }

    /// Abort every stream, e.g. when the connection goes away
    pub fn reset_all(&mut self) {
        let ids: Vec<u32> = self.streams.keys().copied().collect();
        for stream_id in ids {
            self.remove(stream_id, Some(StreamEvent::Reset));
        }
    }

    /// Get frames ready to send
    pub fn take_send_queue(&mut self) -> Vec<Frame> {
        std::mem::take(&mut self.send_queue)
    }

    /// Check if there are frames to send
    pub fn has_pending_frames(&self) -> bool {
        !self.send_queue.is_empty()
    }

    /// Get number of active streams
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Queue a keepalive ping
    pub fn send_ping(&mut self) {
        self.send_queue.push(Frame::ping(rand::random()));
    }
}
