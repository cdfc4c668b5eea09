//! Raw socket I/O layer
//!
//! Provides:
//! - Blocking frame sender/receiver traits
//! - A `pnet` datalink implementation bound to a network interface
//! - An in-memory lossy implementation for tests
//! - The capture loop (one per interface)
//! - The carrier, which forges and injects TCP segments

pub mod capture;
pub mod carrier;
pub mod datalink;
pub mod memory;

pub use capture::{run_capture, CaptureFilter, CaptureStats};
pub use carrier::Carrier;

use crate::packet::{MacAddr, PacketError};
use crate::ErrorKind;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Attempts made on a failing raw socket before giving up
pub const RETRY_LIMIT: u32 = 5;

/// Read timeout of the capture socket, bounds shutdown latency
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Link layer errors
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Interface '{0}' not found")]
    InterfaceNotFound(String),

    #[error("Interface '{0}' has no MAC address")]
    NoMacAddress(String),

    #[error("Cannot open interface '{interface}': {source}")]
    Open {
        interface: String,
        #[source]
        source: io::Error,
    },

    #[error("Interface '{0}' does not provide an Ethernet channel")]
    UnsupportedChannel(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Link closed")]
    Closed,

    #[error("Raw socket failed after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),
}

impl LinkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LinkError::InterfaceNotFound(_)
            | LinkError::NoMacAddress(_)
            | LinkError::Open { .. }
            | LinkError::UnsupportedChannel(_) => ErrorKind::Configuration,
            LinkError::Io(_) | LinkError::Closed | LinkError::Exhausted { .. } => {
                ErrorKind::CarrierIo
            }
            LinkError::Packet(_) => ErrorKind::Other,
        }
    }
}

/// Injects whole Ethernet frames
pub trait FrameSender: Send {
    fn send_frame(&mut self, frame: &[u8]) -> io::Result<()>;
}

/// Captures whole Ethernet frames
pub trait FrameReceiver: Send {
    /// Block for the next frame. `Ok(None)` means the read timed out.
    fn recv_frame(&mut self) -> io::Result<Option<Vec<u8>>>;
}

/// An opened interface
pub struct Link {
    pub interface: String,
    pub mac: MacAddr,
    pub sender: Box<dyn FrameSender>,
    pub receiver: Box<dyn FrameReceiver>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("interface", &self.interface)
            .field("mac", &self.mac)
            .finish_non_exhaustive()
    }
}

/// Exponential backoff for the n-th consecutive failure (1-based)
pub fn backoff(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(6);
    Duration::from_millis(20u64 << exp)
}
