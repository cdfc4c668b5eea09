//! Capture loop
//!
//! One blocking loop per interface reads frames, keeps the TCP segments
//! addressed to this node whose flags classify as tunnel traffic, and feeds
//! them to the dispatcher through a bounded queue. Everything else is left
//! alone: capture is passive, so the kernel still sees every frame.

use super::{backoff, FrameReceiver, LinkError, RETRY_LIMIT};
use crate::packet::{FlagClassifier, Segment, Verdict};
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

/// Which segments belong to this node
#[derive(Debug, Clone, Copy)]
pub struct CaptureFilter {
    /// Local carrier endpoint; segments must be addressed to it
    pub local: SocketAddrV4,
    /// Expected peer, if known (clients only)
    pub peer: Option<SocketAddrV4>,
}

impl CaptureFilter {
    pub fn matches(&self, segment: &Segment) -> bool {
        if segment.dst != self.local {
            return false;
        }
        match self.peer {
            Some(peer) => segment.src == peer,
            None => true,
        }
    }
}

/// Capture counters
#[derive(Debug, Default)]
pub struct CaptureStats {
    pub frames: AtomicU64,
    pub tunnel: AtomicU64,
    pub passed: AtomicU64,
    pub malformed: AtomicU64,
    pub dropped: AtomicU64,
}

impl CaptureStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Run the capture loop until `stop` flips, the queue closes, or the raw
/// socket keeps failing past [`RETRY_LIMIT`].
///
/// Blocking; run it on a dedicated thread (`spawn_blocking`).
pub fn run_capture(
    mut receiver: Box<dyn FrameReceiver>,
    filter: CaptureFilter,
    classifier: Arc<FlagClassifier>,
    queue: mpsc::Sender<Segment>,
    stop: watch::Receiver<bool>,
    stats: Arc<CaptureStats>,
) -> Result<(), LinkError> {
    info!("Capture started for {}", filter.local);
    let mut failures = 0u32;

    loop {
        if *stop.borrow() {
            debug!("Capture for {} stopping", filter.local);
            return Ok(());
        }

        let frame = match receiver.recv_frame() {
            Ok(Some(frame)) => {
                failures = 0;
                frame
            }
            Ok(None) => {
                failures = 0;
                continue;
            }
            Err(e) => {
                failures += 1;
                if failures > RETRY_LIMIT {
                    return Err(LinkError::Exhausted {
                        attempts: failures,
                        source: e,
                    });
                }
                warn!(
                    "Capture read on {} failed ({}/{}): {}",
                    filter.local, failures, RETRY_LIMIT, e
                );
                std::thread::sleep(backoff(failures));
                continue;
            }
        };

        CaptureStats::bump(&stats.frames);

        let segment = match Segment::parse(&frame) {
            Ok(Some(segment)) => segment,
            Ok(None) => continue,
            Err(e) => {
                CaptureStats::bump(&stats.malformed);
                trace!("Skipping malformed frame: {}", e);
                continue;
            }
        };

        if !filter.matches(&segment) {
            continue;
        }

        match classifier.classify(segment.flags) {
            Verdict::Pass => {
                CaptureStats::bump(&stats.passed);
                trace!(
                    "Passing {} -> {} [{}]",
                    segment.src,
                    segment.dst,
                    segment.flags
                );
                continue;
            }
            Verdict::Tunnel if segment.payload.is_empty() => continue,
            Verdict::Tunnel => {}
        }

        CaptureStats::bump(&stats.tunnel);
        match queue.try_send(segment) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(segment)) => {
                CaptureStats::bump(&stats.dropped);
                debug!("Capture queue full, dropping segment from {}", segment.src);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Dispatcher gone, capture for {} exiting", filter.local);
                return Ok(());
            }
        }
    }
}
