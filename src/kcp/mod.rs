//! KCP ARQ engine
//!
//! A synchronous, allocation-light port of the classic KCP protocol. The
//! engine never touches a socket: callers feed it received packets with
//! [`KcpEngine::input`], drive its clock with [`KcpEngine::update`] and drain
//! the packets it wants sent with [`KcpEngine::take_output`].
//!
//! Wire format (24-byte header, little-endian):
//!
//! ```text
//! +------+-----+-----+-----+----+----+-----+-----+------...
//! | conv | cmd | frg | wnd | ts | sn | una | len | data
//! |  4B  | 1B  | 1B  | 2B  | 4B | 4B | 4B  | 4B  |
//! +------+-----+-----+-----+----+----+-----+-----+------...
//! ```

mod config;
mod engine;
mod segment;

pub use config::{KcpConfig, KcpMode};
pub use engine::KcpEngine;
pub use segment::{conv_of, Command, SegmentHeader, OVERHEAD};

use thiserror::Error;

/// KCP errors
#[derive(Debug, Error)]
pub enum KcpError {
    #[error("Message of {0} bytes needs too many fragments")]
    MessageTooLarge(usize),

    #[error("Empty message")]
    EmptyMessage,

    #[error("Truncated KCP packet")]
    Truncated,

    #[error("Conversation mismatch: expected {expected}, got {actual}")]
    ConvMismatch { expected: u32, actual: u32 },

    #[error("Unknown KCP command: {0}")]
    UnknownCommand(u8),

    #[error("Invalid MTU: {0}")]
    InvalidMtu(usize),
}

pub(crate) const RTO_NDL: u32 = 30;
pub(crate) const RTO_MIN: u32 = 100;
pub(crate) const RTO_DEF: u32 = 200;
pub(crate) const RTO_MAX: u32 = 60_000;
pub(crate) const ASK_SEND: u32 = 1;
pub(crate) const ASK_TELL: u32 = 2;
pub(crate) const WND_SND: u16 = 32;
pub(crate) const WND_RCV: u16 = 128;
pub(crate) const DEFAULT_MTU: usize = 1400;
pub(crate) const DEFAULT_INTERVAL: u32 = 100;
pub(crate) const DEADLINK: u32 = 20;
pub(crate) const THRESH_INIT: u32 = 2;
pub(crate) const THRESH_MIN: u32 = 2;
pub(crate) const PROBE_INIT: u32 = 7_000;
pub(crate) const PROBE_LIMIT: u32 = 120_000;
pub(crate) const FASTACK_LIMIT: u32 = 5;

/// Signed distance between two wrapping 32-bit counters
#[inline]
pub(crate) fn timediff(later: u32, earlier: u32) -> i32 {
    later.wrapping_sub(earlier) as i32
}
