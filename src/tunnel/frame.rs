//! Frame encoding/decoding for the tunnel protocol
//!
//! Every KCP message carries exactly one frame, so frames need no
//! resynchronisation and the length field must match the message.
//!
//! Frame format:
//! ```text
//! +--------+--------+--------+--------+
//! |  Type  |      Stream ID (4B)      :
//! +--------+--------+--------+--------+
//! :        |   Length (2B)   |        :
//! +--------+--------+--------+--------+
//! :              Payload              |
//! +--------+--------+--------+--------+
//! ```

use super::TunnelError;
use crate::proxy::Address;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 7;

/// Maximum payload of a single frame
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Data frame
    Data = 0x00,
    /// Stream open request, payload is the destination
    StreamOpen = 0x01,
    /// Stream reset (abortive close)
    StreamClose = 0x02,
    /// Window update (flow control)
    WindowUpdate = 0x03,
    /// Ping (keepalive)
    Ping = 0x04,
    /// Pong (keepalive response)
    Pong = 0x05,
    /// Go away (connection closing), payload is the reason
    GoAway = 0x06,
    /// Sender will write no more on this stream
    Fin = 0x07,
    /// Result of a stream open, payload is one status byte
    StreamOpenAck = 0x08,
    /// Client greeting: version and transport protocol
    Hello = 0x10,
    /// Server accepted the greeting
    HelloAck = 0x11,
}

impl TryFrom<u8> for FrameType {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(FrameType::Data),
            0x01 => Ok(FrameType::StreamOpen),
            0x02 => Ok(FrameType::StreamClose),
            0x03 => Ok(FrameType::WindowUpdate),
            0x04 => Ok(FrameType::Ping),
            0x05 => Ok(FrameType::Pong),
            0x06 => Ok(FrameType::GoAway),
            0x07 => Ok(FrameType::Fin),
            0x08 => Ok(FrameType::StreamOpenAck),
            0x10 => Ok(FrameType::Hello),
            0x11 => Ok(FrameType::HelloAck),
            _ => Err(TunnelError::InvalidFrame(format!(
                "Unknown frame type: {}",
                value
            ))),
        }
    }
}

/// Outcome of a stream open, numbered like SOCKS5 reply codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpenStatus {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TimedOut = 0x06,
}

impl From<u8> for OpenStatus {
    fn from(value: u8) -> Self {
        match value {
            0x00 => OpenStatus::Succeeded,
            0x02 => OpenStatus::NotAllowed,
            0x03 => OpenStatus::NetworkUnreachable,
            0x04 => OpenStatus::HostUnreachable,
            0x05 => OpenStatus::ConnectionRefused,
            0x06 => OpenStatus::TimedOut,
            _ => OpenStatus::GeneralFailure,
        }
    }
}

impl From<&std::io::Error> for OpenStatus {
    fn from(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused => OpenStatus::ConnectionRefused,
            ErrorKind::TimedOut => OpenStatus::TimedOut,
            ErrorKind::PermissionDenied => OpenStatus::NotAllowed,
            ErrorKind::NotFound | ErrorKind::AddrNotAvailable => OpenStatus::HostUnreachable,
            _ => OpenStatus::GeneralFailure,
        }
    }
}

impl std::fmt::Display for OpenStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            OpenStatus::Succeeded => "succeeded",
            OpenStatus::GeneralFailure => "general failure",
            OpenStatus::NotAllowed => "not allowed",
            OpenStatus::NetworkUnreachable => "network unreachable",
            OpenStatus::HostUnreachable => "host unreachable",
            OpenStatus::ConnectionRefused => "connection refused",
            OpenStatus::TimedOut => "timed out",
        };
        f.write_str(text)
    }
}

/// A protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Stream ID (0 for connection-level frames)
    pub stream_id: u32,
    /// Payload data
    pub payload: Bytes,
}

impl Frame {
    fn new(frame_type: FrameType, stream_id: u32, payload: Bytes) -> Self {
        Self {
            frame_type,
            stream_id,
            payload,
        }
    }

    /// Create a new data frame
    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self::new(FrameType::Data, stream_id, payload)
    }

    /// Create a stream open frame
    pub fn stream_open(stream_id: u32, destination: &Address) -> Self {
        let mut payload = BytesMut::with_capacity(32);
        destination.encode(&mut payload);
        Self::new(FrameType::StreamOpen, stream_id, payload.freeze())
    }

    pub fn stream_open_ack(stream_id: u32, status: OpenStatus) -> Self {
        Self::new(
            FrameType::StreamOpenAck,
            stream_id,
            Bytes::copy_from_slice(&[status as u8]),
        )
    }

    /// Create a stream close (reset) frame
    pub fn stream_close(stream_id: u32) -> Self {
        Self::new(FrameType::StreamClose, stream_id, Bytes::new())
    }

    pub fn fin(stream_id: u32) -> Self {
        Self::new(FrameType::Fin, stream_id, Bytes::new())
    }

    /// Create a window update frame
    pub fn window_update(stream_id: u32, increment: u32) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(increment);
        Self::new(FrameType::WindowUpdate, stream_id, payload.freeze())
    }

    /// Create a ping frame
    pub fn ping(data: u64) -> Self {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u64(data);
        Self::new(FrameType::Ping, 0, payload.freeze())
    }

    /// Create a pong frame
    pub fn pong(data: u64) -> Self {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u64(data);
        Self::new(FrameType::Pong, 0, payload.freeze())
    }

    pub fn go_away(reason: &str) -> Self {
        let reason = &reason.as_bytes()[..reason.len().min(MAX_PAYLOAD_SIZE)];
        Self::new(FrameType::GoAway, 0, Bytes::copy_from_slice(reason))
    }

    /// Create a hello frame: `version | len | protocol`
    pub fn hello(version: u8, protocol: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + protocol.len());
        payload.put_u8(version);
        payload.put_u8(protocol.len() as u8);
        payload.put_slice(protocol.as_bytes());
        Self::new(FrameType::Hello, 0, payload.freeze())
    }

    pub fn hello_ack(version: u8) -> Self {
        Self::new(FrameType::HelloAck, 0, Bytes::copy_from_slice(&[version]))
    }

    /// Version and protocol from a hello frame
    pub fn parse_hello(&self) -> Result<(u8, String), TunnelError> {
        let invalid = || TunnelError::InvalidFrame("Invalid hello".to_string());
        let (&version, rest) = self.payload.split_first().ok_or_else(invalid)?;
        let (&len, rest) = rest.split_first().ok_or_else(invalid)?;
        if rest.len() != len as usize {
            return Err(invalid());
        }
        let protocol = String::from_utf8_lossy(rest).to_string();
        Ok((version, protocol))
    }

    pub fn parse_u32(&self) -> Result<u32, TunnelError> {
        let bytes = <[u8; 4]>::try_from(&self.payload[..])
            .map_err(|_| TunnelError::InvalidFrame(format!("Invalid {:?}", self.frame_type)))?;
        Ok(u32::from_be_bytes(bytes))
    }

    pub fn parse_u64(&self) -> Result<u64, TunnelError> {
        let bytes = <[u8; 8]>::try_from(&self.payload[..])
            .map_err(|_| TunnelError::InvalidFrame(format!("Invalid {:?}", self.frame_type)))?;
        Ok(u64::from_be_bytes(bytes))
    }

    pub fn parse_status(&self) -> Result<OpenStatus, TunnelError> {
        match self.payload[..] {
            [status] => Ok(OpenStatus::from(status)),
            _ => Err(TunnelError::InvalidFrame("Invalid open ack".to_string())),
        }
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<Bytes, TunnelError> {
        let payload_len = self.payload.len();
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(TunnelError::FrameTooLarge(payload_len, MAX_PAYLOAD_SIZE));
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);
        buf.put_u8(self.frame_type as u8);
        buf.put_u32(self.stream_id);
        buf.put_u16(payload_len as u16);
        buf.extend_from_slice(&self.payload);

        Ok(buf.freeze())
    }

    /// Decode one frame occupying a whole message
    pub fn decode(mut message: Bytes) -> Result<Self, TunnelError> {
        if message.len() < FRAME_HEADER_SIZE {
            return Err(TunnelError::InvalidFrame(format!(
                "Short frame: {} bytes",
                message.len()
            )));
        }

        let frame_type = FrameType::try_from(message.get_u8())?;
        let stream_id = message.get_u32();
        let payload_len = message.get_u16() as usize;

        if payload_len != message.len() {
            return Err(TunnelError::InvalidFrame(format!(
                "Length {} does not match {} payload bytes",
                payload_len,
                message.len()
            )));
        }

        Ok(Self::new(frame_type, stream_id, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encode_decode() {
        let original = Frame::data(42, Bytes::from_static(b"Hello, World!"));
        let encoded = original.encode().unwrap();
        assert_eq!(encoded.len(), FRAME_HEADER_SIZE + 13);

        let decoded = Frame::decode(encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_stream_open_frame() {
        let dest: Address = "example.com:443".parse().unwrap();
        let frame = Frame::stream_open(1, &dest);

        let decoded = Frame::decode(frame.encode().unwrap()).unwrap();

        assert_eq!(decoded.frame_type, FrameType::StreamOpen);
        assert_eq!(decoded.stream_id, 1);
        assert_eq!(Address::decode(&decoded.payload).unwrap(), dest);
    }

    #[test]
    fn test_hello_frame() {
        let frame = Frame::decode(Frame::hello(1, "kcp").encode().unwrap()).unwrap();
        assert_eq!(frame.parse_hello().unwrap(), (1, "kcp".to_string()));

        let truncated = Frame::new(FrameType::Hello, 0, Bytes::from_static(&[1, 5, b'k']));
        assert!(truncated.parse_hello().is_err());
    }

    #[test]
    fn test_control_payloads() {
        assert_eq!(Frame::window_update(3, 65536).parse_u32().unwrap(), 65536);
        assert_eq!(Frame::ping(7).parse_u64().unwrap(), 7);
        assert_eq!(
            Frame::stream_open_ack(3, OpenStatus::ConnectionRefused)
                .parse_status()
                .unwrap(),
            OpenStatus::ConnectionRefused
        );
        assert!(Frame::data(1, Bytes::from_static(b"abc")).parse_u32().is_err());
    }

    #[test]
    fn test_malformed_frames() {
        assert!(Frame::decode(Bytes::from_static(&[0, 0, 0])).is_err());
        // Unknown type
        assert!(Frame::decode(Bytes::from_static(&[0x7f, 0, 0, 0, 1, 0, 0])).is_err());
        // Length disagrees with the message
        assert!(Frame::decode(Bytes::from_static(&[0, 0, 0, 0, 1, 0, 5, b'a'])).is_err());
        // Oversized payload cannot be encoded
        let big = Frame::data(1, Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE + 1]));
        assert!(matches!(big.encode(), Err(TunnelError::FrameTooLarge(..))));
    }

    #[test]
    fn test_status_from_io_error() {
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert_eq!(OpenStatus::from(&refused), OpenStatus::ConnectionRefused);
        assert_eq!(OpenStatus::from(0x42), OpenStatus::GeneralFailure);
    }
}
