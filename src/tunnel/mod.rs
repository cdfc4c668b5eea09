//! Tunnel layer - streams over authenticated KCP sessions
//!
//! Provides:
//! - Frame encoding/decoding
//! - Stream multiplexing with half-close
//! - Flow control
//! - The per-session connection task and its handshake
//! - A client pool of `transport.conn` connections

mod connection;
mod frame;
mod multiplexer;
mod pool;
mod stream;

pub use connection::{ConnectionState, KcpConnection, TunnelContext, TunnelHandle};
pub use frame::{Frame, FrameType, OpenStatus, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use multiplexer::{
    IncomingStream, MuxEvent, Multiplexer, StreamCommand, StreamEvent, StreamHandle,
    StreamReader, StreamWriter,
};
pub use pool::{Connector, TunnelPool};
pub use stream::{StreamState, TunnelStream};

use crate::ErrorKind;
use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Too many streams (limit {0})")]
    TooManyStreams(u32),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Flow control violation")]
    FlowControl,

    #[error("No HELLO_ACK within {0:?}")]
    HandshakeTimeout(std::time::Duration),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Stream open refused: {0}")]
    OpenRefused(OpenStatus),

    #[error("Stream open timed out")]
    OpenTimeout,

    #[error("KCP link dead after repeated retransmissions")]
    DeadLink,

    #[error("Protocol error: {0}")]
    Protocol(#[from] crate::protocol::ProtocolError),

    #[error("KCP error: {0}")]
    Kcp(#[from] crate::kcp::KcpError),

    #[error("Session error: {0}")]
    Session(#[from] crate::session::SessionError),

    #[error("Link error: {0}")]
    Link(#[from] crate::link::LinkError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),
}

impl TunnelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TunnelError::HandshakeTimeout(_) | TunnelError::Handshake(_) => {
                ErrorKind::TransportHandshake
            }
            TunnelError::Protocol(_)
            | TunnelError::InvalidFrame(_)
            | TunnelError::FlowControl
            | TunnelError::Kcp(_) => ErrorKind::PeerProtocol,
            TunnelError::Link(e) => e.kind(),
            _ => ErrorKind::Other,
        }
    }
}

/// Maximum number of concurrent streams per connection
pub const MAX_STREAMS: u32 = 1024;

/// Default window size for flow control (256 KB)
pub const DEFAULT_WINDOW_SIZE: u32 = 262144;
