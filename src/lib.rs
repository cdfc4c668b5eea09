//! # paqet
//!
//! A bidirectional packet proxy that carries KCP sessions inside forged TCP
//! segments injected and captured directly on a network interface.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   Role Multiplexer                   │
//! │     (SOCKS5 / forwards on the client, dial-out on   │
//! │      the server, half-close relay, supervisor)      │
//! ├─────────────────────────────────────────────────────┤
//! │                 KCP Transport Adapter                │
//! │  (KCP engine, packet sealing, stream multiplexing,  │
//! │         handshake, pool of `conn` sessions)         │
//! ├─────────────────────────────────────────────────────┤
//! │               Session/Connection Tracker             │
//! │   (session table, replay window, idle reaping)      │
//! ├─────────────────────────────────────────────────────┤
//! │                  TCP Flag Classifier                 │
//! │        (exact-match local/remote flag sets)         │
//! ├─────────────────────────────────────────────────────┤
//! │                  Raw Socket I/O Layer                │
//! │   (datalink capture loop, serialized injection)     │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod crypto;
pub mod kcp;
pub mod link;
pub mod network;
pub mod node;
pub mod packet;
pub mod protocol;
pub mod proxy;
pub mod session;
pub mod tunnel;

pub use config::Config;
pub use node::{Node, Shutdown};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Network error: {0}")]
    Network(#[from] network::NetworkError),

    #[error("Link error: {0}")]
    Link(#[from] link::LinkError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("KCP error: {0}")]
    Kcp(#[from] kcp::KcpError),

    #[error("Session error: {0}")]
    Session(#[from] session::SessionError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Task failed: {0}")]
    Task(String),
}

/// Failure classes, used to decide how far an error may propagate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad configuration or unusable interface. Fatal at startup.
    Configuration,
    /// A tunnel handshake did not complete. Scoped to one session.
    TransportHandshake,
    /// Raw socket read/write failure that outlived its retries.
    CarrierIo,
    /// Peer speaks another protocol or version. Scoped to one session.
    PeerProtocol,
    /// Anything else.
    Other,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) | Error::Network(_) => ErrorKind::Configuration,
            Error::Link(e) => e.kind(),
            Error::Protocol(_) => ErrorKind::PeerProtocol,
            Error::Tunnel(e) => e.kind(),
            _ => ErrorKind::Other,
        }
    }

    /// Whether this error must terminate the process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Configuration | ErrorKind::CarrierIo
        )
    }
}
