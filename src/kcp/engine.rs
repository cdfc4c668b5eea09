use super::segment::{Command, KcpSegment, SegmentHeader, OVERHEAD};
use super::*;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

/// One KCP conversation
///
/// Message mode only: every [`send`](Self::send) is delivered as one
/// [`recv`](Self::recv), fragmented into at most 127 segments.
pub struct KcpEngine {
    conv: u32,
    mtu: usize,
    mss: usize,
    dead: bool,

    snd_una: u32,
    snd_nxt: u32,
    rcv_nxt: u32,

    ssthresh: u32,
    rx_rttval: i32,
    rx_srtt: i32,
    rx_rto: u32,
    rx_minrto: u32,

    snd_wnd: u16,
    rcv_wnd: u16,
    rmt_wnd: u16,
    cwnd: u32,
    incr: u32,
    probe: u32,

    current: u32,
    interval: u32,
    ts_flush: u32,
    updated: bool,
    ts_probe: u32,
    probe_wait: u32,

    xmit: u32,
    dead_link: u32,
    nodelay: u32,
    fastresend: u32,
    fastlimit: u32,
    nocwnd: bool,

    snd_queue: VecDeque<KcpSegment>,
    rcv_queue: VecDeque<KcpSegment>,
    snd_buf: VecDeque<KcpSegment>,
    rcv_buf: VecDeque<KcpSegment>,
    acklist: Vec<(u32, u32)>,

    buffer: BytesMut,
    output: VecDeque<Bytes>,
}

impl KcpEngine {
    pub fn new(conv: u32) -> Self {
        Self {
            conv,
            mtu: DEFAULT_MTU,
            mss: DEFAULT_MTU - OVERHEAD,
            dead: false,
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            ssthresh: THRESH_INIT,
            rx_rttval: 0,
            rx_srtt: 0,
            rx_rto: RTO_DEF,
            rx_minrto: RTO_MIN,
            snd_wnd: WND_SND,
            rcv_wnd: WND_RCV,
            rmt_wnd: WND_RCV,
            cwnd: 0,
            incr: 0,
            probe: 0,
            current: 0,
            interval: DEFAULT_INTERVAL,
            ts_flush: DEFAULT_INTERVAL,
            updated: false,
            ts_probe: 0,
            probe_wait: 0,
            xmit: 0,
            dead_link: DEADLINK,
            nodelay: 0,
            fastresend: 0,
            fastlimit: FASTACK_LIMIT,
            nocwnd: false,
            snd_queue: VecDeque::new(),
            rcv_queue: VecDeque::new(),
            snd_buf: VecDeque::new(),
            rcv_buf: VecDeque::new(),
            acklist: Vec::new(),
            buffer: BytesMut::with_capacity(DEFAULT_MTU * 3),
            output: VecDeque::new(),
        }
    }

    pub fn conv(&self) -> u32 {
        self.conv
    }

    pub fn mss(&self) -> usize {
        self.mss
    }

    pub fn interval(&self) -> u32 {
        self.interval
    }

    /// Whether a segment exceeded the retransmission limit
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Segments not yet acknowledged by the peer
    pub fn wait_snd(&self) -> usize {
        self.snd_buf.len() + self.snd_queue.len()
    }

    /// Total retransmissions so far
    pub fn retransmissions(&self) -> u32 {
        self.xmit
    }

    pub fn set_mtu(&mut self, mtu: usize) -> Result<(), KcpError> {
        if mtu < 50 || mtu < OVERHEAD {
            return Err(KcpError::InvalidMtu(mtu));
        }
        self.mtu = mtu;
        self.mss = mtu - OVERHEAD;
        self.buffer = BytesMut::with_capacity(mtu * 3);
        Ok(())
    }

    pub fn set_nodelay(&mut self, nodelay: u32, interval: u32, resend: u32, nocongestion: bool) {
        self.nodelay = nodelay;
        self.rx_minrto = if nodelay != 0 { RTO_NDL } else { RTO_MIN };
        self.interval = interval.clamp(10, 5000);
        self.fastresend = resend;
        self.nocwnd = nocongestion;
    }

    pub fn set_wndsize(&mut self, sndwnd: u16, rcvwnd: u16) {
        if sndwnd > 0 {
            self.snd_wnd = sndwnd;
        }
        if rcvwnd > 0 {
            // Must hold the largest fragmented message
            self.rcv_wnd = rcvwnd.max(WND_RCV);
        }
    }

    /// Queue a message for sending
    pub fn send(&mut self, data: &[u8]) -> Result<(), KcpError> {
        if data.is_empty() {
            return Err(KcpError::EmptyMessage);
        }

        let count = data.len().div_ceil(self.mss);
        if count >= WND_RCV as usize {
            return Err(KcpError::MessageTooLarge(data.len()));
        }

        for (i, chunk) in data.chunks(self.mss).enumerate() {
            let frg = (count - i - 1) as u8;
            self.snd_queue
                .push_back(KcpSegment::new(frg, Bytes::copy_from_slice(chunk)));
        }
        Ok(())
    }

    /// Size of the next complete message, if one is ready
    pub fn peek_size(&self) -> Option<usize> {
        let front = self.rcv_queue.front()?;
        if front.frg == 0 {
            return Some(front.data.len());
        }
        if self.rcv_queue.len() < front.frg as usize + 1 {
            return None;
        }

        let mut size = 0;
        for seg in &self.rcv_queue {
            size += seg.data.len();
            if seg.frg == 0 {
                break;
            }
        }
        Some(size)
    }

    /// Take the next complete message
    pub fn recv(&mut self) -> Option<Bytes> {
        let size = self.peek_size()?;
        let recover = self.rcv_queue.len() >= self.rcv_wnd as usize;

        let single = self.rcv_queue.front().is_some_and(|seg| seg.frg == 0);
        let message = if single {
            self.rcv_queue.pop_front()?.data
        } else {
            let mut merged = BytesMut::with_capacity(size);
            while let Some(seg) = self.rcv_queue.pop_front() {
                merged.extend_from_slice(&seg.data);
                if seg.frg == 0 {
                    break;
                }
            }
            merged.freeze()
        };

        self.move_to_rcv_queue();

        // Tell the peer our window reopened
        if recover && self.rcv_queue.len() < self.rcv_wnd as usize {
            self.probe |= ASK_TELL;
        }

        Some(message)
    }

    /// Feed a packet received from the peer
    pub fn input(&mut self, mut data: &[u8]) -> Result<(), KcpError> {
        if data.len() < OVERHEAD {
            return Err(KcpError::Truncated);
        }

        let prev_una = self.snd_una;
        let mut max_ack: Option<(u32, u32)> = None;

        while data.len() >= OVERHEAD {
            let header = SegmentHeader::decode(data)?;
            if header.conv != self.conv {
                return Err(KcpError::ConvMismatch {
                    expected: self.conv,
                    actual: header.conv,
                });
            }

            let len = header.len as usize;
            if data.len() - OVERHEAD < len {
                return Err(KcpError::Truncated);
            }
            let payload = &data[OVERHEAD..OVERHEAD + len];
            data = &data[OVERHEAD + len..];

            self.rmt_wnd = header.wnd;
            self.parse_una(header.una);
            self.shrink_buf();

            match header.cmd {
                Command::Ack => {
                    let rtt = timediff(self.current, header.ts);
                    if rtt >= 0 {
                        self.update_ack(rtt);
                    }
                    self.parse_ack(header.sn);
                    self.shrink_buf();
                    max_ack = match max_ack {
                        None => Some((header.sn, header.ts)),
                        Some((sn, _)) if timediff(header.sn, sn) > 0 => {
                            Some((header.sn, header.ts))
                        }
                        keep => keep,
                    };
                }
                Command::Push => {
                    if timediff(header.sn, self.rcv_nxt.wrapping_add(self.rcv_wnd as u32)) < 0 {
                        self.acklist.push((header.sn, header.ts));
                        if timediff(header.sn, self.rcv_nxt) >= 0 {
                            let mut seg =
                                KcpSegment::new(header.frg, Bytes::copy_from_slice(payload));
                            seg.wnd = header.wnd;
                            seg.ts = header.ts;
                            seg.sn = header.sn;
                            seg.una = header.una;
                            self.parse_data(seg);
                        }
                    }
                }
                Command::WindowAsk => {
                    self.probe |= ASK_TELL;
                }
                Command::WindowTell => {}
            }
        }

        if let Some((sn, _)) = max_ack {
            self.parse_fastack(sn);
        }

        if timediff(self.snd_una, prev_una) > 0 && self.cwnd < self.rmt_wnd as u32 {
            let mss = self.mss as u32;
            if self.cwnd < self.ssthresh {
                self.cwnd += 1;
                self.incr += mss;
            } else {
                if self.incr < mss {
                    self.incr = mss;
                }
                self.incr += (mss * mss) / self.incr + mss / 16;
                if (self.cwnd + 1) * mss <= self.incr {
                    self.cwnd = (self.incr + mss - 1) / mss.max(1);
                }
            }
            if self.cwnd > self.rmt_wnd as u32 {
                self.cwnd = self.rmt_wnd as u32;
                self.incr = self.rmt_wnd as u32 * mss;
            }
        }

        Ok(())
    }

    /// Advance the clock to `current` milliseconds and flush when due
    pub fn update(&mut self, current: u32) {
        self.current = current;

        if !self.updated {
            self.updated = true;
            self.ts_flush = current;
        }

        let mut slap = timediff(current, self.ts_flush);
        if !(-10_000..10_000).contains(&slap) {
            self.ts_flush = current;
            slap = 0;
        }

        if slap >= 0 {
            self.ts_flush = self.ts_flush.wrapping_add(self.interval);
            if timediff(current, self.ts_flush) >= 0 {
                self.ts_flush = current.wrapping_add(self.interval);
            }
            self.flush();
        }
    }

    /// Packets ready for the wire
    pub fn take_output(&mut self) -> Vec<Bytes> {
        self.output.drain(..).collect()
    }

    /// Emit pending ACKs, probes and data segments
    pub fn flush(&mut self) {
        if !self.updated {
            return;
        }

        let current = self.current;
        let wnd = self.wnd_unused();
        let mut change = false;
        let mut lost = false;

        // Acknowledgements
        for (sn, ts) in std::mem::take(&mut self.acklist) {
            let header = SegmentHeader {
                conv: self.conv,
                cmd: Command::Ack,
                frg: 0,
                wnd,
                ts,
                sn,
                una: self.rcv_nxt,
                len: 0,
            };
            self.write_control(header);
        }

        // Window probing while the peer advertises a zero window
        if self.rmt_wnd == 0 {
            if self.probe_wait == 0 {
                self.probe_wait = PROBE_INIT;
                self.ts_probe = current.wrapping_add(self.probe_wait);
            } else if timediff(current, self.ts_probe) >= 0 {
                if self.probe_wait < PROBE_INIT {
                    self.probe_wait = PROBE_INIT;
                }
                self.probe_wait += self.probe_wait / 2;
                if self.probe_wait > PROBE_LIMIT {
                    self.probe_wait = PROBE_LIMIT;
                }
                self.ts_probe = current.wrapping_add(self.probe_wait);
                self.probe |= ASK_SEND;
            }
        } else {
            self.ts_probe = 0;
            self.probe_wait = 0;
        }

        for (flag, cmd) in [(ASK_SEND, Command::WindowAsk), (ASK_TELL, Command::WindowTell)] {
            if self.probe & flag != 0 {
                let header = SegmentHeader {
                    conv: self.conv,
                    cmd,
                    frg: 0,
                    wnd,
                    ts: 0,
                    sn: 0,
                    una: self.rcv_nxt,
                    len: 0,
                };
                self.write_control(header);
            }
        }
        self.probe = 0;

        // Move queued messages into the send window
        let mut cwnd = self.snd_wnd.min(self.rmt_wnd) as u32;
        if !self.nocwnd {
            cwnd = cwnd.min(self.cwnd);
        }
        while timediff(self.snd_nxt, self.snd_una.wrapping_add(cwnd)) < 0 {
            let Some(mut seg) = self.snd_queue.pop_front() else {
                break;
            };
            seg.wnd = wnd;
            seg.ts = current;
            seg.sn = self.snd_nxt;
            seg.una = self.rcv_nxt;
            seg.resendts = current;
            seg.rto = self.rx_rto;
            seg.fastack = 0;
            seg.xmit = 0;
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            self.snd_buf.push_back(seg);
        }

        let resent = if self.fastresend > 0 {
            self.fastresend
        } else {
            u32::MAX
        };
        let rtomin = if self.nodelay == 0 { self.rx_rto >> 3 } else { 0 };

        for seg in self.snd_buf.iter_mut() {
            let mut needsend = false;

            if seg.xmit == 0 {
                needsend = true;
                seg.xmit += 1;
                seg.rto = self.rx_rto;
                seg.resendts = current.wrapping_add(seg.rto + rtomin);
            } else if timediff(current, seg.resendts) >= 0 {
                needsend = true;
                seg.xmit += 1;
                self.xmit += 1;
                if self.nodelay == 0 {
                    seg.rto += seg.rto.max(self.rx_rto);
                } else {
                    let step = if self.nodelay < 2 { seg.rto } else { self.rx_rto };
                    seg.rto += step / 2;
                }
                seg.resendts = current.wrapping_add(seg.rto);
                lost = true;
            } else if seg.fastack >= resent
                && (seg.xmit <= self.fastlimit || self.fastlimit == 0)
            {
                needsend = true;
                seg.xmit += 1;
                seg.fastack = 0;
                seg.resendts = current.wrapping_add(seg.rto);
                change = true;
            }

            if needsend {
                seg.ts = current;
                seg.wnd = wnd;
                seg.una = self.rcv_nxt;

                if self.buffer.len() + OVERHEAD + seg.data.len() > self.mtu {
                    self.output.push_back(self.buffer.split().freeze());
                }
                seg.header(self.conv, Command::Push).encode(&mut self.buffer);
                self.buffer.extend_from_slice(&seg.data);

                if seg.xmit >= self.dead_link {
                    self.dead = true;
                }
            }
        }

        if !self.buffer.is_empty() {
            self.output.push_back(self.buffer.split().freeze());
        }

        let mss = self.mss as u32;
        if change {
            let inflight = self.snd_nxt.wrapping_sub(self.snd_una);
            self.ssthresh = (inflight / 2).max(THRESH_MIN);
            self.cwnd = self.ssthresh.saturating_add(resent);
            self.incr = self.cwnd.saturating_mul(mss);
        }
        if lost {
            self.ssthresh = (self.cwnd / 2).max(THRESH_MIN);
            self.cwnd = 1;
            self.incr = mss;
        }
        if self.cwnd < 1 {
            self.cwnd = 1;
            self.incr = mss;
        }
    }

    fn write_control(&mut self, header: SegmentHeader) {
        if self.buffer.len() + OVERHEAD > self.mtu {
            self.output.push_back(self.buffer.split().freeze());
        }
        header.encode(&mut self.buffer);
    }

    fn wnd_unused(&self) -> u16 {
        let used = self.rcv_queue.len();
        if used < self.rcv_wnd as usize {
            (self.rcv_wnd as usize - used) as u16
        } else {
            0
        }
    }

    fn update_ack(&mut self, rtt: i32) {
        // The echoed timestamp comes from the peer; keep the estimator in range
        let rtt = rtt.clamp(0, RTO_MAX as i32);
        if self.rx_srtt == 0 {
            self.rx_srtt = rtt;
            self.rx_rttval = rtt / 2;
        } else {
            let delta = (rtt - self.rx_srtt).abs();
            self.rx_rttval = (3 * self.rx_rttval + delta) / 4;
            self.rx_srtt = ((7 * self.rx_srtt + rtt) / 8).max(1);
        }
        let rto = self.rx_srtt as u32 + self.interval.max(4 * self.rx_rttval as u32);
        self.rx_rto = rto.clamp(self.rx_minrto, RTO_MAX);
    }

    fn shrink_buf(&mut self) {
        self.snd_una = match self.snd_buf.front() {
            Some(seg) => seg.sn,
            None => self.snd_nxt,
        };
    }

    fn parse_ack(&mut self, sn: u32) {
        if timediff(sn, self.snd_una) < 0 || timediff(sn, self.snd_nxt) >= 0 {
            return;
        }
        for i in 0..self.snd_buf.len() {
            let seg_sn = self.snd_buf[i].sn;
            if sn == seg_sn {
                self.snd_buf.remove(i);
                break;
            }
            if timediff(sn, seg_sn) < 0 {
                break;
            }
        }
    }

    fn parse_una(&mut self, una: u32) {
        while let Some(seg) = self.snd_buf.front() {
            if timediff(una, seg.sn) > 0 {
                self.snd_buf.pop_front();
            } else {
                break;
            }
        }
    }

    fn parse_fastack(&mut self, sn: u32) {
        if timediff(sn, self.snd_una) < 0 || timediff(sn, self.snd_nxt) >= 0 {
            return;
        }
        for seg in self.snd_buf.iter_mut() {
            if timediff(sn, seg.sn) < 0 {
                break;
            } else if sn != seg.sn {
                seg.fastack += 1;
            }
        }
    }

    fn parse_data(&mut self, seg: KcpSegment) {
        let sn = seg.sn;
        if timediff(sn, self.rcv_nxt.wrapping_add(self.rcv_wnd as u32)) >= 0
            || timediff(sn, self.rcv_nxt) < 0
        {
            return;
        }

        // Find the insertion point scanning from the newest segment
        let mut insert_at = 0;
        let mut repeat = false;
        for i in (0..self.rcv_buf.len()).rev() {
            let existing = self.rcv_buf[i].sn;
            if existing == sn {
                repeat = true;
                break;
            }
            if timediff(sn, existing) > 0 {
                insert_at = i + 1;
                break;
            }
        }

        if !repeat {
            self.rcv_buf.insert(insert_at, seg);
        }

        self.move_to_rcv_queue();
    }

    fn move_to_rcv_queue(&mut self) {
        while let Some(seg) = self.rcv_buf.front() {
            if seg.sn == self.rcv_nxt && self.rcv_queue.len() < self.rcv_wnd as usize {
                if let Some(seg) = self.rcv_buf.pop_front() {
                    self.rcv_queue.push_back(seg);
                }
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            } else {
                break;
            }
        }
    }
}

impl std::fmt::Debug for KcpEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KcpEngine")
            .field("conv", &self.conv)
            .field("snd_una", &self.snd_una)
            .field("snd_nxt", &self.snd_nxt)
            .field("rcv_nxt", &self.rcv_nxt)
            .field("cwnd", &self.cwnd)
            .field("rx_rto", &self.rx_rto)
            .field("dead", &self.dead)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn engine(conv: u32) -> KcpEngine {
        let mut kcp = KcpEngine::new(conv);
        KcpConfig::from_mode(KcpMode::Fast).apply(&mut kcp).unwrap();
        kcp
    }

    /// Drive two engines over a lossy, reordering link with a manual clock
    fn exchange(
        a: &mut KcpEngine,
        b: &mut KcpEngine,
        messages: &[Vec<u8>],
        loss: f64,
        seed: u64,
    ) -> Vec<Bytes> {
        let mut rng = StdRng::seed_from_u64(seed);
        for msg in messages {
            a.send(msg).unwrap();
        }

        let mut received = Vec::new();
        let mut in_flight: Vec<(u32, bool, Bytes)> = Vec::new();
        let mut now = 0u32;

        while received.len() < messages.len() {
            now += 10;
            assert!(now < 600_000, "transfer did not complete");

            a.update(now);
            b.update(now);

            for packet in a.take_output() {
                if !rng.gen_bool(loss) {
                    let delay = rng.gen_range(5..60);
                    in_flight.push((now + delay, true, packet));
                }
            }
            for packet in b.take_output() {
                if !rng.gen_bool(loss) {
                    let delay = rng.gen_range(5..60);
                    in_flight.push((now + delay, false, packet));
                }
            }

            let (due, pending): (Vec<_>, Vec<_>) =
                in_flight.drain(..).partition(|(at, _, _)| *at <= now);
            in_flight = pending;
            for (_, to_b, packet) in due {
                if to_b {
                    b.input(&packet).unwrap();
                } else {
                    a.input(&packet).unwrap();
                }
            }

            while let Some(msg) = b.recv() {
                received.push(msg);
            }
        }

        received
    }

    #[test]
    fn test_reliable_in_order_over_lossy_link() {
        let messages: Vec<Vec<u8>> = (0..200u32)
            .map(|i| {
                let len = 1 + (i as usize * 37) % 3000;
                vec![(i % 251) as u8; len]
            })
            .collect();

        for seed in [1, 7, 42] {
            let mut a = engine(0x1234);
            let mut b = engine(0x1234);
            let received = exchange(&mut a, &mut b, &messages, 0.1, seed);

            assert_eq!(received.len(), messages.len());
            for (got, want) in received.iter().zip(&messages) {
                assert_eq!(&got[..], &want[..]);
            }
            assert!(!a.is_dead());
        }
    }

    #[test]
    fn test_bogus_echoed_timestamp_bounded() {
        let mut kcp = engine(1);
        for _ in 0..8 {
            kcp.update_ack(i32::MAX);
        }
        assert_eq!(kcp.rx_rto, RTO_MAX);

        kcp.update_ack(20);
        assert!(kcp.rx_srtt <= RTO_MAX as i32);
        assert!(kcp.rx_rto <= RTO_MAX);
    }

    #[test]
    fn test_fragmentation() {
        let mut a = engine(1);
        let mut b = engine(1);
        let big = (0..a.mss() * 5 + 17).map(|i| i as u8).collect::<Vec<_>>();

        let received = exchange(&mut a, &mut b, &[big.clone()], 0.0, 0);
        assert_eq!(&received[0][..], &big[..]);
    }

    #[test]
    fn test_message_limits() {
        let mut kcp = engine(1);
        assert!(matches!(kcp.send(&[]), Err(KcpError::EmptyMessage)));

        let too_big = vec![0u8; kcp.mss() * WND_RCV as usize];
        assert!(matches!(
            kcp.send(&too_big),
            Err(KcpError::MessageTooLarge(_))
        ));

        let largest = vec![0u8; kcp.mss() * (WND_RCV as usize - 1)];
        assert!(kcp.send(&largest).is_ok());
    }

    #[test]
    fn test_conv_mismatch() {
        let mut a = engine(1);
        let mut b = engine(2);
        a.send(b"hello").unwrap();
        a.update(0);

        let packet = a.take_output().remove(0);
        assert!(matches!(
            b.input(&packet),
            Err(KcpError::ConvMismatch {
                expected: 2,
                actual: 1
            })
        ));
    }

    #[test]
    fn test_duplicate_packets_ignored() {
        let mut a = engine(9);
        let mut b = engine(9);
        a.send(b"once").unwrap();
        a.update(0);
        b.update(0);

        let packet = a.take_output().remove(0);
        b.input(&packet).unwrap();
        b.input(&packet).unwrap();

        assert_eq!(&b.recv().unwrap()[..], b"once");
        assert!(b.recv().is_none());
    }

    #[test]
    fn test_dead_link() {
        let mut kcp = KcpEngine::new(5);
        KcpConfig::from_mode(KcpMode::Fast3).apply(&mut kcp).unwrap();
        kcp.send(b"nobody listens").unwrap();

        let mut now = 0;
        while !kcp.is_dead() {
            now += 10;
            assert!(now < 10_000_000, "link never declared dead");
            kcp.update(now);
            kcp.take_output();
        }
        assert_eq!(kcp.wait_snd(), 1);
        assert!(kcp.retransmissions() >= DEADLINK - 1);
    }
}
