//! Anti-replay window over a peer's frame counter.
//!
//! A 64-entry sliding bitmap anchored at the highest counter seen.
//! Counters ahead of the anchor slide the window forward; counters behind
//! it are accepted once if still inside the window and rejected otherwise.

const WINDOW_BITS: u32 = 64;

/// Per-neighbor anti-replay state
#[derive(Debug, Clone, Default)]
pub struct AntiReplay {
    last: u32,
    window: u64,
    primed: bool,
}

impl AntiReplay {
    /// Fresh state that accepts any first counter
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-anchor at `counter`, marking it as seen and forgetting history.
    ///
    /// Used when a handshake or accepted REFRESH establishes a new key,
    /// so the peer's counter stream starts over.
    pub fn init(&mut self, counter: u32) {
        self.last = counter;
        self.window = 1;
        self.primed = true;
    }

    /// Check-and-update: returns `true` if `counter` was already seen or
    /// fell off the back of the window.
    pub fn was_replayed(&mut self, counter: u32) -> bool {
        if !self.primed {
            self.init(counter);
            return false;
        }
        if counter > self.last {
            let shift = counter - self.last;
            self.window = if shift >= WINDOW_BITS {
                1
            } else {
                (self.window << shift) | 1
            };
            self.last = counter;
            return false;
        }
        let offset = self.last - counter;
        if offset >= WINDOW_BITS {
            return true;
        }
        let bit = 1u64 << offset;
        if self.window & bit != 0 {
            return true;
        }
        self.window |= bit;
        false
    }

    /// Highest counter accepted so far (0 when nothing was seen)
    #[must_use]
    pub fn last_counter(&self) -> u32 {
        self.last
    }
}
