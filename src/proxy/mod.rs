//! Proxy front-ends
//!
//! Provides:
//! - SOCKS5 proxy server (CONNECT, optional username/password)
//! - The destination address type carried in STREAM_OPEN

mod socks5;

pub use socks5::{Reply, Socks5Request, Socks5Server};

use bytes::{BufMut, BytesMut};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Pause after an accept failed for lack of descriptors or memory
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

const ENOMEM: i32 = 12;
const ENFILE: i32 = 23;
const EMFILE: i32 = 24;

/// How long a listener waits before accepting again after `e`
///
/// Accept errors never end a listener. Exhausted descriptors or memory
/// take a while to free up; anything else concerns one connection only.
pub fn accept_retry_delay(e: &io::Error) -> Option<Duration> {
    match e.raw_os_error() {
        Some(ENFILE | EMFILE | ENOMEM) => Some(ACCEPT_BACKOFF),
        _ => None,
    }
}

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid SOCKS version: {0}")]
    InvalidSocksVersion(u8),

    #[error("Unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("Address type not supported: {0}")]
    UnsupportedAddressType(u8),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

/// SOCKS address type tags, shared with the STREAM_OPEN encoding
pub(crate) const ATYP_IPV4: u8 = 0x01;
pub(crate) const ATYP_DOMAIN: u8 = 0x03;
pub(crate) const ATYP_IPV6: u8 = 0x04;

/// Proxy target address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address and port
    Ipv4([u8; 4], u16),
    /// IPv6 address and port
    Ipv6([u8; 16], u16),
    /// Domain name and port
    Domain(String, u16),
}

impl Address {
    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Ipv4(_, port) => *port,
            Address::Ipv6(_, port) => *port,
            Address::Domain(_, port) => *port,
        }
    }

    /// Append the SOCKS wire form: `atyp | addr | port(be16)`
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Address::Ipv4(ip, port) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(ip);
                buf.put_u16(*port);
            }
            Address::Ipv6(ip, port) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(ip);
                buf.put_u16(*port);
            }
            Address::Domain(domain, port) => {
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
                buf.put_u16(*port);
            }
        }
    }

    /// Parse the SOCKS wire form; the whole slice must be consumed
    pub fn decode(payload: &[u8]) -> Result<Self, ProxyError> {
        let invalid = || ProxyError::InvalidAddress(format!("{} byte destination", payload.len()));
        let (&atyp, rest) = payload.split_first().ok_or_else(invalid)?;

        let port_at = |rest: &[u8], at: usize| -> Result<u16, ProxyError> {
            if rest.len() != at + 2 {
                return Err(invalid());
            }
            Ok(u16::from_be_bytes([rest[at], rest[at + 1]]))
        };

        match atyp {
            ATYP_IPV4 => {
                let port = port_at(rest, 4)?;
                let mut ip = [0u8; 4];
                ip.copy_from_slice(&rest[..4]);
                Ok(Address::Ipv4(ip, port))
            }
            ATYP_IPV6 => {
                let port = port_at(rest, 16)?;
                let mut ip = [0u8; 16];
                ip.copy_from_slice(&rest[..16]);
                Ok(Address::Ipv6(ip, port))
            }
            ATYP_DOMAIN => {
                let (&len, rest) = rest.split_first().ok_or_else(invalid)?;
                let len = len as usize;
                let port = port_at(rest, len)?;
                let domain = std::str::from_utf8(&rest[..len])
                    .map_err(|_| ProxyError::InvalidAddress("non UTF-8 domain".to_string()))?;
                if domain.is_empty() {
                    return Err(invalid());
                }
                Ok(Address::Domain(domain.to_string(), port))
            }
            other => Err(ProxyError::UnsupportedAddressType(other)),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Address::Ipv4(v4.ip().octets(), v4.port()),
            SocketAddr::V6(v6) => Address::Ipv6(v6.ip().octets(), v6.port()),
        }
    }
}

impl FromStr for Address {
    type Err = ProxyError;

    /// Accepts `1.2.3.4:80`, `[::1]:80` and `example.com:443`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(addr.into());
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ProxyError::InvalidAddress(format!("missing port in '{}'", s)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| ProxyError::InvalidAddress(format!("bad port in '{}'", s)))?;
        if host.is_empty() || host.len() > 255 || host.contains(':') {
            return Err(ProxyError::InvalidAddress(s.to_string()));
        }
        Ok(Address::Domain(host.to_string(), port))
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Ipv4(ip, port) => write!(f, "{}:{}", Ipv4Addr::from(*ip), port),
            Address::Ipv6(ip, port) => write!(f, "[{}]:{}", Ipv6Addr::from(*ip), port),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_retry_delay() {
        assert_eq!(
            accept_retry_delay(&io::Error::from_raw_os_error(EMFILE)),
            Some(ACCEPT_BACKOFF)
        );
        assert_eq!(
            accept_retry_delay(&io::Error::from_raw_os_error(ENFILE)),
            Some(ACCEPT_BACKOFF)
        );
        assert_eq!(
            accept_retry_delay(&io::Error::from(io::ErrorKind::ConnectionAborted)),
            None
        );
    }

    #[test]
    fn test_parse_domain_destination() {
        // Domain format: [0x03][len][domain][port_be]
        let mut payload = vec![0x03, 11];
        payload.extend_from_slice(b"example.com");
        payload.extend_from_slice(&443u16.to_be_bytes());

        let dest = Address::decode(&payload).unwrap();
        assert_eq!(dest.to_string(), "example.com:443");
    }

    #[test]
    fn test_parse_ipv4_destination() {
        // IPv4 format: [0x01][4 bytes IP][port_be]
        let payload = vec![0x01, 192, 168, 1, 1, 0x01, 0xBB]; // 192.168.1.1:443

        let dest = Address::decode(&payload).unwrap();
        assert_eq!(dest.to_string(), "192.168.1.1:443");
    }

    #[test]
    fn test_encode_matches_decode() {
        for text in ["10.1.2.3:8080", "[2001:db8::1]:443", "httpbin.org:443"] {
            let addr: Address = text.parse().unwrap();
            let mut buf = BytesMut::new();
            addr.encode(&mut buf);
            assert_eq!(Address::decode(&buf).unwrap(), addr);
            assert_eq!(addr.to_string(), text);
        }
    }

    #[test]
    fn test_malformed_destinations() {
        assert!(Address::decode(&[]).is_err());
        assert!(Address::decode(&[0x01, 1, 2, 3]).is_err());
        assert!(Address::decode(&[0x03, 5, b'a', 0, 80]).is_err());
        assert!(matches!(
            Address::decode(&[0x09, 0, 0]),
            Err(ProxyError::UnsupportedAddressType(9))
        ));
        assert!("no-port".parse::<Address>().is_err());
        assert!("host:99999".parse::<Address>().is_err());
    }
}
