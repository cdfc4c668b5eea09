//! In-memory links with simulated loss
//!
//! Endpoints exchange frames over channels, either as a pair or as a hub
//! where every frame reaches every other endpoint, like a shared Ethernet
//! segment. Each sender drops, duplicates and reorders frames according to
//! a seeded [`LossModel`], so a failing run can be replayed.

use super::{FrameReceiver, FrameSender, Link, READ_TIMEOUT};
use crate::packet::MacAddr;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};

/// Per-direction impairment probabilities
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossModel {
    pub drop: f64,
    pub duplicate: f64,
    pub reorder: f64,
    pub seed: u64,
}

impl LossModel {
    /// A perfect link
    pub fn lossless() -> Self {
        Self {
            drop: 0.0,
            duplicate: 0.0,
            reorder: 0.0,
            seed: 0,
        }
    }
}

impl Default for LossModel {
    fn default() -> Self {
        Self::lossless()
    }
}

/// Build two connected links, named `mem0` and `mem1`
pub fn pair(a_mac: MacAddr, b_mac: MacAddr, loss: LossModel) -> (Link, Link) {
    let (a_tx, b_rx) = mpsc::channel();
    let (b_tx, a_rx) = mpsc::channel();
    (
        endpoint(0, a_mac, vec![a_tx], a_rx, loss),
        endpoint(1, b_mac, vec![b_tx], b_rx, loss),
    )
}

/// Build one link per MAC on a shared segment, named `mem0`, `mem1`, ...
///
/// A frame sent on any link is received on all the others.
pub fn hub(macs: &[MacAddr], loss: LossModel) -> Vec<Link> {
    let (senders, receivers): (Vec<Sender<Vec<u8>>>, Vec<Receiver<Vec<u8>>>) =
        macs.iter().map(|_| mpsc::channel()).unzip();

    receivers
        .into_iter()
        .enumerate()
        .map(|(index, rx)| {
            let peers = senders
                .iter()
                .enumerate()
                .filter(|(other, _)| *other != index)
                .map(|(_, tx)| tx.clone())
                .collect();
            endpoint(index, macs[index], peers, rx, loss)
        })
        .collect()
}

fn endpoint(
    index: usize,
    mac: MacAddr,
    peers: Vec<Sender<Vec<u8>>>,
    rx: Receiver<Vec<u8>>,
    loss: LossModel,
) -> Link {
    Link {
        interface: format!("mem{}", index),
        mac,
        sender: Box::new(MemorySender::new(
            peers,
            loss,
            loss.seed.wrapping_add(index as u64),
        )),
        receiver: Box::new(MemoryReceiver { rx }),
    }
}

struct MemorySender {
    peers: Vec<Sender<Vec<u8>>>,
    loss: LossModel,
    rng: StdRng,
    held: Option<Vec<u8>>,
}

impl MemorySender {
    fn new(peers: Vec<Sender<Vec<u8>>>, loss: LossModel, seed: u64) -> Self {
        Self {
            peers,
            loss,
            rng: StdRng::seed_from_u64(seed),
            held: None,
        }
    }

    /// Deliver to every peer still listening; fails once none are
    fn push(&self, frame: Vec<u8>) -> io::Result<()> {
        let delivered = self
            .peers
            .iter()
            .filter(|tx| tx.send(frame.clone()).is_ok())
            .count();
        if delivered == 0 {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer link closed"));
        }
        Ok(())
    }

    fn roll(&mut self, p: f64) -> bool {
        p > 0.0 && self.rng.gen_bool(p.min(1.0))
    }
}

impl FrameSender for MemorySender {
    fn send_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        if self.roll(self.loss.drop) {
            return Ok(());
        }

        // Hold one frame back so the next one overtakes it
        if self.held.is_none() && self.roll(self.loss.reorder) {
            self.held = Some(frame.to_vec());
            return Ok(());
        }

        if self.roll(self.loss.duplicate) {
            self.push(frame.to_vec())?;
        }
        self.push(frame.to_vec())?;

        if let Some(held) = self.held.take() {
            self.push(held)?;
        }
        Ok(())
    }
}

struct MemoryReceiver {
    rx: Receiver<Vec<u8>>,
}

impl FrameReceiver for MemoryReceiver {
    fn recv_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        match self.rx.recv_timeout(READ_TIMEOUT) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "peer link closed",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn macs() -> (MacAddr, MacAddr) {
        (
            MacAddr::new([2, 0, 0, 0, 0, 1]),
            MacAddr::new([2, 0, 0, 0, 0, 2]),
        )
    }

    #[test]
    fn test_lossless_delivery() {
        let (a_mac, b_mac) = macs();
        let (mut a, mut b) = pair(a_mac, b_mac, LossModel::lossless());

        a.sender.send_frame(b"one").unwrap();
        a.sender.send_frame(b"two").unwrap();
        assert_eq!(b.receiver.recv_frame().unwrap().unwrap(), b"one");
        assert_eq!(b.receiver.recv_frame().unwrap().unwrap(), b"two");

        b.sender.send_frame(b"back").unwrap();
        assert_eq!(a.receiver.recv_frame().unwrap().unwrap(), b"back");
    }

    #[test]
    fn test_timeout_returns_none() {
        let (a_mac, b_mac) = macs();
        let (_a, mut b) = pair(a_mac, b_mac, LossModel::lossless());
        assert!(b.receiver.recv_frame().unwrap().is_none());
    }

    #[test]
    fn test_total_drop() {
        let (a_mac, b_mac) = macs();
        let loss = LossModel {
            drop: 1.0,
            ..LossModel::lossless()
        };
        let (mut a, mut b) = pair(a_mac, b_mac, loss);
        a.sender.send_frame(b"lost").unwrap();
        assert!(b.receiver.recv_frame().unwrap().is_none());
    }

    #[test]
    fn test_reorder_swaps_frames() {
        let (a_mac, b_mac) = macs();
        let loss = LossModel {
            reorder: 1.0,
            ..LossModel::lossless()
        };
        let (mut a, mut b) = pair(a_mac, b_mac, loss);
        a.sender.send_frame(b"first").unwrap();
        a.sender.send_frame(b"second").unwrap();
        assert_eq!(b.receiver.recv_frame().unwrap().unwrap(), b"second");
        assert_eq!(b.receiver.recv_frame().unwrap().unwrap(), b"first");
    }

    #[test]
    fn test_hub_reaches_every_other_endpoint() {
        let macs = [
            MacAddr::new([2, 0, 0, 0, 0, 1]),
            MacAddr::new([2, 0, 0, 0, 0, 2]),
            MacAddr::new([2, 0, 0, 0, 0, 3]),
        ];
        let mut links = hub(&macs, LossModel::lossless());
        assert_eq!(links[2].interface, "mem2");

        links[1].sender.send_frame(b"shared").unwrap();
        assert_eq!(links[0].receiver.recv_frame().unwrap().unwrap(), b"shared");
        assert_eq!(links[2].receiver.recv_frame().unwrap().unwrap(), b"shared");
        assert!(links[1].receiver.recv_frame().unwrap().is_none());

        // One endpoint leaving does not cut off the rest
        let gone = links.remove(2);
        drop(gone);
        links[1].sender.send_frame(b"still").unwrap();
        assert_eq!(links[0].receiver.recv_frame().unwrap().unwrap(), b"still");
    }

    #[test]
    fn test_closed_peer() {
        let (a_mac, b_mac) = macs();
        let (a, mut b) = pair(a_mac, b_mac, LossModel::lossless());
        drop(a);
        assert!(b.receiver.recv_frame().is_err());
    }
}
