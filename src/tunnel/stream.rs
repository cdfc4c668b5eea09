//! Per-stream state tracked by the multiplexer

use super::{TunnelError, DEFAULT_WINDOW_SIZE};
use crate::proxy::Address;

/// Stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// STREAM_OPEN sent, waiting for the ack
    Opening,
    /// Stream is open and active
    Open,
    /// Local side has sent FIN
    HalfClosedLocal,
    /// Remote side has sent FIN
    HalfClosedRemote,
    /// Stream is fully closed
    Closed,
}

/// A multiplexed stream within the tunnel
#[derive(Debug)]
pub struct TunnelStream {
    id: u32,
    state: StreamState,
    /// Bytes the peer may still send before the next window update
    recv_window: u32,
    destination: Address,
}

impl TunnelStream {
    /// A stream we are opening
    pub fn opening(id: u32, destination: Address) -> Self {
        Self {
            id,
            state: StreamState::Opening,
            recv_window: DEFAULT_WINDOW_SIZE,
            destination,
        }
    }

    /// A stream the peer opened
    pub fn accepted(id: u32, destination: Address) -> Self {
        Self {
            state: StreamState::Open,
            ..Self::opening(id, destination)
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn destination(&self) -> &Address {
        &self.destination
    }

    /// Open acknowledged by the peer
    pub fn established(&mut self) {
        if self.state == StreamState::Opening {
            self.state = StreamState::Open;
        }
    }

    /// Local writes allowed
    pub fn can_send(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedRemote)
    }

    /// Peer data allowed
    pub fn can_recv(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedLocal)
    }

    /// Account for received bytes; the peer must stay inside the window
    pub fn consume_recv_window(&mut self, amount: u32) -> Result<(), TunnelError> {
        if !self.can_recv() {
            return Err(TunnelError::StreamClosed);
        }
        if amount > self.recv_window {
            return Err(TunnelError::FlowControl);
        }
        self.recv_window -= amount;
        Ok(())
    }

    /// Re-open window after the reader consumed data
    pub fn apply_window_update(&mut self, increment: u32) {
        self.recv_window = self
            .recv_window
            .saturating_add(increment)
            .min(DEFAULT_WINDOW_SIZE);
    }

    /// FIN sent
    pub fn close_local(&mut self) {
        self.state = match self.state {
            StreamState::Opening | StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            _ => self.state,
        };
    }

    /// FIN received
    pub fn close_remote(&mut self) {
        self.state = match self.state {
            StreamState::Opening | StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            _ => self.state,
        };
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }
}
