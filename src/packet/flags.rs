//! TCP flag combinations
//!
//! Combinations are written as letters, one per flag, e.g. `"PA"` for
//! PSH+ACK. Letters: `F` FIN, `S` SYN, `R` RST, `P` PSH, `A` ACK, `U` URG,
//! `E` ECE, `C` CWR.

use super::PacketError;
use etherparse::TcpHeader;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A set of TCP flags, stored as the on-wire flags byte
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TcpFlags(u8);

/// Letter order used for display, matching tcpdump
const LETTERS: [(char, u8); 8] = [
    ('F', TcpFlags::FIN),
    ('S', TcpFlags::SYN),
    ('R', TcpFlags::RST),
    ('P', TcpFlags::PSH),
    ('A', TcpFlags::ACK),
    ('U', TcpFlags::URG),
    ('E', TcpFlags::ECE),
    ('C', TcpFlags::CWR),
];

impl TcpFlags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
    pub const ECE: u8 = 0x40;
    pub const CWR: u8 = 0x80;

    /// PSH+ACK, the default for both directions
    pub const PSH_ACK: TcpFlags = TcpFlags(Self::PSH | Self::ACK);

    /// Create from the raw flags byte
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Raw flags byte
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Check whether a flag bit is set
    pub fn contains(self, bit: u8) -> bool {
        self.0 & bit == bit
    }

    /// Read the flags of a parsed TCP header
    pub fn from_header(header: &TcpHeader) -> Self {
        let mut bits = 0;
        for (set, bit) in [
            (header.fin, Self::FIN),
            (header.syn, Self::SYN),
            (header.rst, Self::RST),
            (header.psh, Self::PSH),
            (header.ack, Self::ACK),
            (header.urg, Self::URG),
            (header.ece, Self::ECE),
            (header.cwr, Self::CWR),
        ] {
            if set {
                bits |= bit;
            }
        }
        Self(bits)
    }

    /// Write these flags into a TCP header
    pub fn apply(self, header: &mut TcpHeader) {
        header.fin = self.contains(Self::FIN);
        header.syn = self.contains(Self::SYN);
        header.rst = self.contains(Self::RST);
        header.psh = self.contains(Self::PSH);
        header.ack = self.contains(Self::ACK);
        header.urg = self.contains(Self::URG);
        header.ece = self.contains(Self::ECE);
        header.cwr = self.contains(Self::CWR);
    }
}

impl FromStr for TcpFlags {
    type Err = PacketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(PacketError::EmptyFlags);
        }

        let mut bits = 0u8;
        for c in s.chars() {
            let upper = c.to_ascii_uppercase();
            let bit = LETTERS
                .iter()
                .find(|(letter, _)| *letter == upper)
                .map(|(_, bit)| *bit)
                .ok_or(PacketError::InvalidFlag(c))?;
            if bits & bit != 0 {
                return Err(PacketError::DuplicateFlag(upper));
            }
            bits |= bit;
        }

        Ok(Self(bits))
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (letter, bit) in LETTERS {
            if self.contains(bit) {
                write!(f, "{}", letter)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TcpFlags({})", self)
    }
}

impl Serialize for TcpFlags {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TcpFlags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_psh_ack() {
        let flags: TcpFlags = "PA".parse().unwrap();
        assert_eq!(flags, TcpFlags::PSH_ACK);
        assert_eq!(flags.bits(), 0x18);
        assert_eq!(flags.to_string(), "PA");

        // Order and case do not matter
        assert_eq!("ap".parse::<TcpFlags>().unwrap(), TcpFlags::PSH_ACK);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            "PX".parse::<TcpFlags>(),
            Err(PacketError::InvalidFlag('X'))
        ));
        assert!(matches!(
            "PAP".parse::<TcpFlags>(),
            Err(PacketError::DuplicateFlag('P'))
        ));
        assert!(matches!("".parse::<TcpFlags>(), Err(PacketError::EmptyFlags)));
    }

    #[test]
    fn test_header_roundtrip() {
        let flags: TcpFlags = "SA".parse().unwrap();
        let mut header = TcpHeader::new(1000, 2000, 1, 1024);
        flags.apply(&mut header);
        assert!(header.syn && header.ack && !header.psh);
        assert_eq!(TcpFlags::from_header(&header), flags);
    }
}
