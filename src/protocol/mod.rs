//! Protocol definitions and constants

use std::time::Duration;
use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u8, actual: u8 },

    #[error("Transport protocol mismatch: expected {expected}, got {actual}")]
    ProtocolMismatch { expected: String, actual: String },

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),
}

/// Tunnel protocol version carried in HELLO
pub const PROTOCOL_VERSION: u8 = 1;

/// The only transport protocol currently spoken
pub const PROTOCOL_NAME: &str = "kcp";

/// How long a client waits for HELLO_ACK
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a client waits for STREAM_OPEN_ACK
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(12);

/// How long a server waits to reach a relay destination
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(8);

/// Ping interval on an established connection
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Default session idle timeout in seconds
pub const DEFAULT_IDLE_TIMEOUT: u64 = 120;

/// Time allowed for connections to flush on shutdown
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Upper bound on concurrently tracked sessions
pub const MAX_SESSIONS: usize = 4096;

/// Authenticated packets buffered per session
pub const SESSION_QUEUE_DEPTH: usize = 1024;

/// Captured segments buffered between the capture loop and the dispatcher
pub const CAPTURE_QUEUE_DEPTH: usize = 8192;
