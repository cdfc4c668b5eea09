//! Packet layer
//!
//! Provides:
//! - TCP flag sets parsed from configuration strings
//! - MAC addresses
//! - Ethernet/IPv4/TCP segment building and parsing
//! - The exact-match flag classifier

mod classifier;
mod flags;
mod mac;
mod segment;

pub use classifier::{FlagClassifier, Verdict};
pub use flags::TcpFlags;
pub use mac::MacAddr;
pub use segment::{Segment, ETHERNET_HEADER_LEN, MAX_SEGMENT_PAYLOAD};

use thiserror::Error;

/// Packet layer errors
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("Invalid TCP flag '{0}'")]
    InvalidFlag(char),

    #[error("TCP flag '{0}' listed twice")]
    DuplicateFlag(char),

    #[error("Empty TCP flag combination")]
    EmptyFlags,

    #[error("Invalid MAC address: {0}")]
    InvalidMac(String),

    #[error("Malformed packet: {0}")]
    Malformed(String),

    #[error("Payload too large: {0} bytes")]
    TooLarge(usize),
}
