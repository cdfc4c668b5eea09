//! Session tracking
//!
//! Maps authenticated carrier traffic to KCP sessions without any help from
//! kernel connection tracking:
//! - [`SessionTable`]: concurrent map of live sessions
//! - [`ReplayWindow`]: per-session duplicate suppression
//! - [`Dispatcher`]: routes captured segments into session queues

mod dispatch;
mod replay;
mod table;

pub use dispatch::Dispatcher;
pub use replay::ReplayWindow;
pub use table::{SessionEntry, SessionInbox, SessionTable};

use std::fmt;
use std::net::SocketAddrV4;
use thiserror::Error;

/// Identity of a session: the carrier 4-tuple plus the KCP conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub local: SocketAddrV4,
    pub remote: SocketAddrV4,
    pub conv: u32,
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}#{:08x}", self.local, self.remote, self.conv)
    }
}

/// Session errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session {0} already exists")]
    Duplicate(SessionKey),

    #[error("Session table full ({0} sessions)")]
    Full(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display() {
        let key = SessionKey {
            local: "10.0.0.2:40000".parse().unwrap(),
            remote: "10.0.0.1:9999".parse().unwrap(),
            conv: 0xbeef,
        };
        assert_eq!(key.to_string(), "10.0.0.2:40000<->10.0.0.1:9999#0000beef");
    }
}
