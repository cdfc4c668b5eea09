/// Width of the sliding window in packets
const WINDOW: u64 = 64;

/// Sliding-window replay filter over packet nonces
///
/// Each sender seals with a fixed random salt and an increasing counter. The
/// first accepted packet pins the salt; later packets must carry the same
/// salt and a counter that is new and no more than 63 behind the highest
/// seen. Reordering inside the window is tolerated.
///
/// The pin holds for the life of the session. A sender never changes salt;
/// it stops sealing when its counter runs out. Following a new salt instead
/// would let a captured packet from an older salt reopen that window.
#[derive(Debug, Default, Clone)]
pub struct ReplayWindow {
    salt: Option<u32>,
    highest: u64,
    bitmap: u64,
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a nonce, returning false for replays and stale packets
    pub fn check(&mut self, salt: u32, counter: u64) -> bool {
        match self.salt {
            None => {
                self.salt = Some(salt);
                self.highest = counter;
                self.bitmap = 1;
                true
            }
            Some(pinned) if pinned != salt => false,
            Some(_) => {
                if counter > self.highest {
                    let shift = counter - self.highest;
                    self.bitmap = if shift >= WINDOW {
                        1
                    } else {
                        (self.bitmap << shift) | 1
                    };
                    self.highest = counter;
                    true
                } else {
                    let offset = self.highest - counter;
                    if offset >= WINDOW {
                        return false;
                    }
                    let bit = 1u64 << offset;
                    if self.bitmap & bit != 0 {
                        false
                    } else {
                        self.bitmap |= bit;
                        true
                    }
                }
            }
        }
    }
}
