use super::{PacketError, TcpFlags};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Classification of a captured segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Flags exactly match a `remote_flag` entry; the payload belongs to us
    Tunnel,
    /// Anything else; left to the kernel untouched
    Pass,
}

/// Exact-match TCP flag classifier
///
/// `remote` lists the combinations accepted from the peer, `local` the
/// combinations stamped on injected segments. Matching compares the whole
/// flags byte, so `PA` never matches a `PAU` or a bare `A` segment.
#[derive(Debug)]
pub struct FlagClassifier {
    local: Vec<TcpFlags>,
    remote: Vec<TcpFlags>,
    cursor: AtomicUsize,
}

impl FlagClassifier {
    pub fn new(local: Vec<TcpFlags>, remote: Vec<TcpFlags>) -> Result<Self, PacketError> {
        if local.is_empty() || remote.is_empty() {
            return Err(PacketError::EmptyFlags);
        }
        Ok(Self {
            local,
            remote,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Classify a captured segment by its flags
    pub fn classify(&self, flags: TcpFlags) -> Verdict {
        if self.is_tunnel(flags) {
            Verdict::Tunnel
        } else {
            Verdict::Pass
        }
    }

    pub fn is_tunnel(&self, flags: TcpFlags) -> bool {
        self.remote.iter().any(|allowed| *allowed == flags)
    }

    /// Flags for the next injected segment, rotating through `local`
    pub fn next_local(&self) -> TcpFlags {
        let i = self.cursor.fetch_add(1, Ordering::Relaxed);
        self.local[i % self.local.len()]
    }

    pub fn local(&self) -> &[TcpFlags] {
        &self.local
    }

    pub fn remote(&self) -> &[TcpFlags] {
        &self.remote
    }
}

impl Default for FlagClassifier {
    fn default() -> Self {
        Self {
            local: vec![TcpFlags::PSH_ACK],
            remote: vec![TcpFlags::PSH_ACK],
            cursor: AtomicUsize::new(0),
        }
    }
}
