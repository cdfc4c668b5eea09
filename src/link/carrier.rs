//! Carrier: forges TCP segments around sealed tunnel packets and injects them
//!
//! Injection is serialized per interface; concurrent writers never
//! interleave frames. Sequence and acknowledgement numbers are tracked per
//! peer so the carrier looks like one long-lived TCP flow to middleboxes.
//! Flow state lives only as long as some session still talks to the peer.

use super::{backoff, FrameSender, LinkError, RETRY_LIMIT};
use crate::packet::{FlagClassifier, MacAddr, Segment};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use std::io;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, error, warn};

const CARRIER_WINDOW: u16 = 65535;

#[derive(Debug, Clone, Copy)]
struct FlowState {
    seq: u32,
    ack: u32,
}

/// Serialized injector for one interface
pub struct Carrier {
    interface: String,
    local_mac: MacAddr,
    router_mac: MacAddr,
    local: SocketAddrV4,
    classifier: Arc<FlagClassifier>,
    sender: Mutex<Box<dyn FrameSender>>,
    flows: DashMap<SocketAddrV4, FlowState>,
    failed: AtomicBool,
    sent: AtomicU64,
}

impl Carrier {
    pub fn new(
        interface: String,
        local_mac: MacAddr,
        router_mac: MacAddr,
        local: SocketAddrV4,
        classifier: Arc<FlagClassifier>,
        sender: Box<dyn FrameSender>,
    ) -> Self {
        Self {
            interface,
            local_mac,
            router_mac,
            local,
            classifier,
            sender: Mutex::new(sender),
            flows: DashMap::new(),
            failed: AtomicBool::new(false),
            sent: AtomicU64::new(0),
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn local(&self) -> SocketAddrV4 {
        self.local
    }

    /// Whether injection failed past its retry budget
    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Segments injected so far
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Record a tunnel segment received from a peer
    pub fn observe(&self, segment: &Segment) {
        let next_ack = segment.seq.wrapping_add(segment.payload.len() as u32);
        self.flows
            .entry(segment.src)
            .and_modify(|flow| flow.ack = next_ack)
            .or_insert_with(|| FlowState {
                seq: rand::thread_rng().gen(),
                ack: next_ack,
            });
    }

    /// Peers with flow state
    pub fn flows(&self) -> usize {
        self.flows.len()
    }

    /// Drop the flow state for `remote`
    pub fn forget(&self, remote: &SocketAddrV4) -> bool {
        self.flows.remove(remote).is_some()
    }

    /// Drop flow state for every peer `live` no longer claims; returns how
    /// many were dropped
    pub fn prune_flows<F>(&self, live: F) -> usize
    where
        F: Fn(&SocketAddrV4) -> bool,
    {
        let before = self.flows.len();
        self.flows.retain(|remote, _| live(remote));
        let pruned = before.saturating_sub(self.flows.len());
        if pruned > 0 {
            debug!("Pruned {} idle flows on {}", pruned, self.interface);
        }
        pruned
    }

    /// Build the frame carrying `payload` to `remote`
    fn forge(&self, remote: SocketAddrV4, payload: &[u8]) -> Result<Vec<u8>, LinkError> {
        let (seq, ack) = {
            let mut flow = self.flows.entry(remote).or_insert_with(|| FlowState {
                seq: rand::thread_rng().gen(),
                ack: 0,
            });
            let seq = flow.seq;
            flow.seq = flow.seq.wrapping_add(payload.len() as u32);
            (seq, flow.ack)
        };

        let segment = Segment {
            src: self.local,
            dst: remote,
            flags: self.classifier.next_local(),
            seq,
            ack,
            window: CARRIER_WINDOW,
            payload: Bytes::copy_from_slice(payload),
        };

        Ok(segment.encode(self.local_mac, self.router_mac)?)
    }

    /// Inject `payload` as one forged segment to `remote`
    ///
    /// Transient socket errors are retried with backoff; once the budget is
    /// spent the carrier is marked failed and the error escalates.
    pub async fn send(&self, remote: SocketAddrV4, payload: &[u8]) -> Result<(), LinkError> {
        if self.failed() {
            return Err(LinkError::Closed);
        }

        let frame = self.forge(remote, payload)?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self.inject(&frame);

            match result {
                Ok(()) => {
                    self.sent.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(e) if attempt < RETRY_LIMIT => {
                    warn!(
                        "Injection on {} to {} failed ({}/{}): {}",
                        self.interface, remote, attempt, RETRY_LIMIT, e
                    );
                    tokio::time::sleep(backoff(attempt)).await;
                }
                Err(e) => {
                    error!(
                        "Injection on {} to {} failed permanently: {}",
                        self.interface, remote, e
                    );
                    self.failed.store(true, Ordering::Release);
                    return Err(LinkError::Exhausted {
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }
}

impl Carrier {
    /// One blocking write to the interface
    ///
    /// On a multi-threaded runtime the worker is handed off first, so a slow
    /// NIC stalls only this task.
    fn inject(&self, frame: &[u8]) -> io::Result<()> {
        let send = || self.sender.lock().send_frame(frame);
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(send)
            }
            _ => send(),
        }
    }
}

impl std::fmt::Debug for Carrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Carrier")
            .field("interface", &self.interface)
            .field("local", &self.local)
            .field("router_mac", &self.router_mac)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Records frames, failing the first `failures` sends
    struct Recorder {
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
        failures: u32,
    }

    impl FrameSender for Recorder {
        fn send_frame(&mut self, frame: &[u8]) -> io::Result<()> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(io::Error::new(io::ErrorKind::Other, "busy"));
            }
            self.frames.lock().push(frame.to_vec());
            Ok(())
        }
    }

    fn carrier(failures: u32) -> (Carrier, Arc<Mutex<Vec<Vec<u8>>>>) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let recorder = Recorder {
            frames: frames.clone(),
            failures,
        };
        let carrier = Carrier::new(
            "test0".to_string(),
            MacAddr::new([2, 0, 0, 0, 0, 1]),
            MacAddr::new([2, 0, 0, 0, 0, 2]),
            "10.0.0.2:40000".parse().unwrap(),
            Arc::new(FlagClassifier::default()),
            Box::new(recorder),
        );
        (carrier, frames)
    }

    #[tokio::test]
    async fn test_sequence_numbers_advance() {
        let (carrier, frames) = carrier(0);
        let remote: SocketAddrV4 = "10.0.0.1:9999".parse().unwrap();

        carrier.send(remote, b"hello").await.unwrap();
        carrier.send(remote, b"world!").await.unwrap();

        let frames = frames.lock();
        let first = Segment::parse(&frames[0]).unwrap().unwrap();
        let second = Segment::parse(&frames[1]).unwrap().unwrap();
        assert_eq!(second.seq, first.seq.wrapping_add(5));
        assert_eq!(first.flags.to_string(), "PA");
        assert_eq!(&frames[0][0..6], &[2, 0, 0, 0, 0, 2]);
    }

    #[tokio::test]
    async fn test_ack_follows_peer() {
        let (carrier, frames) = carrier(0);
        let remote: SocketAddrV4 = "10.0.0.1:9999".parse().unwrap();

        carrier.observe(&Segment {
            src: remote,
            dst: carrier.local(),
            flags: Default::default(),
            seq: 1000,
            ack: 0,
            window: 0,
            payload: Bytes::from_static(b"0123456789"),
        });
        carrier.send(remote, b"x").await.unwrap();

        let seg = Segment::parse(&frames.lock()[0]).unwrap().unwrap();
        assert_eq!(seg.ack, 1010);
    }

    #[tokio::test]
    async fn test_transient_failures_retried() {
        let (carrier, frames) = carrier(2);
        let remote: SocketAddrV4 = "10.0.0.1:9999".parse().unwrap();

        carrier.send(remote, b"retry").await.unwrap();
        assert_eq!(frames.lock().len(), 1);
        assert!(!carrier.failed());
    }

    #[tokio::test]
    async fn test_exhausted_marks_failed() {
        let (carrier, _frames) = carrier(u32::MAX);
        let remote: SocketAddrV4 = "10.0.0.1:9999".parse().unwrap();

        let result = carrier.send(remote, b"doomed").await;
        assert!(matches!(result, Err(LinkError::Exhausted { .. })));
        assert!(carrier.failed());
        assert!(matches!(
            carrier.send(remote, b"again").await,
            Err(LinkError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_forget_and_prune_flows() {
        let (carrier, _frames) = carrier(0);
        let kept: SocketAddrV4 = "10.0.0.1:9999".parse().unwrap();

        for port in 40000..40100u16 {
            let remote = SocketAddrV4::new([10, 0, 0, 3].into(), port);
            carrier.send(remote, b"x").await.unwrap();
        }
        carrier.send(kept, b"x").await.unwrap();
        assert_eq!(carrier.flows(), 101);

        assert!(carrier.forget(&kept));
        assert!(!carrier.forget(&kept));
        carrier.send(kept, b"x").await.unwrap();

        assert_eq!(carrier.prune_flows(|remote| *remote == kept), 100);
        assert_eq!(carrier.flows(), 1);
    }

    /// Blocks inside `send_frame` until another task releases it
    struct Gate {
        release: Arc<AtomicBool>,
    }

    impl FrameSender for Gate {
        fn send_frame(&mut self, _frame: &[u8]) -> io::Result<()> {
            for _ in 0..200 {
                if self.release.load(Ordering::Acquire) {
                    return Ok(());
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(io::Error::new(io::ErrorKind::TimedOut, "never released"))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_blocking_injection_does_not_stall_worker() {
        let release = Arc::new(AtomicBool::new(false));
        let carrier = Arc::new(Carrier::new(
            "test0".to_string(),
            MacAddr::new([2, 0, 0, 0, 0, 1]),
            MacAddr::new([2, 0, 0, 0, 0, 2]),
            "10.0.0.2:40000".parse().unwrap(),
            Arc::new(FlagClassifier::default()),
            Box::new(Gate {
                release: release.clone(),
            }),
        ));

        let sending = {
            let carrier = carrier.clone();
            tokio::spawn(async move {
                let remote: SocketAddrV4 = "10.0.0.1:9999".parse().unwrap();
                carrier.send(remote, b"slow").await
            })
        };
        // Needs the only worker while the send above is still blocked
        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            release.store(true, Ordering::Release);
        });

        sending.await.unwrap().unwrap();
        releaser.await.unwrap();
        assert_eq!(carrier.sent(), 1);
    }
}
