//! `pnet` datalink backend
//!
//! Requires CAP_NET_RAW (or root). The channel is opened non-promiscuous;
//! frames addressed to the interface are enough.

use super::{FrameReceiver, FrameSender, Link, LinkError, READ_TIMEOUT};
use crate::packet::MacAddr;
use pnet::datalink::{self, Channel, DataLinkReceiver, DataLinkSender, NetworkInterface};
use std::io;
use tracing::info;

/// Look up an interface by name
pub fn find_interface(name: &str) -> Result<NetworkInterface, LinkError> {
    datalink::interfaces()
        .into_iter()
        .find(|iface| iface.name == name)
        .ok_or_else(|| LinkError::InterfaceNotFound(name.to_string()))
}

/// Open capture and injection on `name`
pub fn open(name: &str) -> Result<Link, LinkError> {
    let iface = find_interface(name)?;

    let mac = iface
        .mac
        .map(|m| MacAddr::new(m.octets()))
        .filter(|m| !m.is_zero())
        .ok_or_else(|| LinkError::NoMacAddress(name.to_string()))?;

    let config = datalink::Config {
        read_timeout: Some(READ_TIMEOUT),
        promiscuous: false,
        ..Default::default()
    };

    let (tx, rx) = match datalink::channel(&iface, config) {
        Ok(Channel::Ethernet(tx, rx)) => (tx, rx),
        Ok(_) => return Err(LinkError::UnsupportedChannel(name.to_string())),
        Err(source) => {
            return Err(LinkError::Open {
                interface: name.to_string(),
                source,
            })
        }
    };

    info!("Opened raw channel on {} ({})", name, mac);

    Ok(Link {
        interface: name.to_string(),
        mac,
        sender: Box::new(DatalinkSender { tx }),
        receiver: Box::new(DatalinkReceiver { rx }),
    })
}

struct DatalinkSender {
    tx: Box<dyn DataLinkSender>,
}

impl FrameSender for DatalinkSender {
    fn send_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        match self.tx.send_to(frame, None) {
            Some(result) => result,
            None => Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "datalink send buffer unavailable",
            )),
        }
    }
}

struct DatalinkReceiver {
    rx: Box<dyn DataLinkReceiver>,
}

impl FrameReceiver for DatalinkReceiver {
    fn recv_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        match self.rx.next() {
            Ok(frame) => Ok(Some(frame.to_vec())),
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
