use super::KcpError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// KCP header length
pub const OVERHEAD: usize = 24;

/// KCP commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Push = 81,
    Ack = 82,
    WindowAsk = 83,
    WindowTell = 84,
}

impl TryFrom<u8> for Command {
    type Error = KcpError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            81 => Ok(Command::Push),
            82 => Ok(Command::Ack),
            83 => Ok(Command::WindowAsk),
            84 => Ok(Command::WindowTell),
            _ => Err(KcpError::UnknownCommand(value)),
        }
    }
}

/// Decoded segment header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub conv: u32,
    pub cmd: Command,
    pub frg: u8,
    pub wnd: u16,
    pub ts: u32,
    pub sn: u32,
    pub una: u32,
    pub len: u32,
}

impl SegmentHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.conv);
        buf.put_u8(self.cmd as u8);
        buf.put_u8(self.frg);
        buf.put_u16_le(self.wnd);
        buf.put_u32_le(self.ts);
        buf.put_u32_le(self.sn);
        buf.put_u32_le(self.una);
        buf.put_u32_le(self.len);
    }

    pub fn decode(mut data: &[u8]) -> Result<Self, KcpError> {
        if data.len() < OVERHEAD {
            return Err(KcpError::Truncated);
        }

        let conv = data.get_u32_le();
        let cmd = Command::try_from(data.get_u8())?;
        Ok(Self {
            conv,
            cmd,
            frg: data.get_u8(),
            wnd: data.get_u16_le(),
            ts: data.get_u32_le(),
            sn: data.get_u32_le(),
            una: data.get_u32_le(),
            len: data.get_u32_le(),
        })
    }
}

/// Read the conversation id of a raw KCP packet
pub fn conv_of(packet: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = packet.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

/// A segment held in one of the engine's queues
#[derive(Debug, Clone)]
pub(crate) struct KcpSegment {
    pub frg: u8,
    pub wnd: u16,
    pub ts: u32,
    pub sn: u32,
    pub una: u32,
    pub resendts: u32,
    pub rto: u32,
    pub fastack: u32,
    pub xmit: u32,
    pub data: Bytes,
}

impl KcpSegment {
    pub fn new(frg: u8, data: Bytes) -> Self {
        Self {
            frg,
            wnd: 0,
            ts: 0,
            sn: 0,
            una: 0,
            resendts: 0,
            rto: 0,
            fastack: 0,
            xmit: 0,
            data,
        }
    }

    pub fn header(&self, conv: u32, cmd: Command) -> SegmentHeader {
        SegmentHeader {
            conv,
            cmd,
            frg: self.frg,
            wnd: self.wnd,
            ts: self.ts,
            sn: self.sn,
            una: self.una,
            len: self.data.len() as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = SegmentHeader {
            conv: 0x0403_0201,
            cmd: Command::Push,
            frg: 2,
            wnd: 0x0201,
            ts: 5,
            sn: 6,
            una: 7,
            len: 8,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        assert_eq!(buf.len(), OVERHEAD);
        assert_eq!(&buf[..8], &[1, 2, 3, 4, 81, 2, 1, 2]);
        assert_eq!(conv_of(&buf), Some(0x0403_0201));
        assert_eq!(SegmentHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            SegmentHeader::decode(&[0u8; OVERHEAD - 1]),
            Err(KcpError::Truncated)
        ));

        let mut raw = [0u8; OVERHEAD];
        raw[4] = 99;
        assert!(matches!(
            SegmentHeader::decode(&raw),
            Err(KcpError::UnknownCommand(99))
        ));
        assert_eq!(conv_of(&raw[..3]), None);
    }
}
