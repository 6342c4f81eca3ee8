//! Keepalive pass bookkeeping.
//!
//! Every `T_UP_CHECK` the event loop walks the table once. While
//! occupancy stays at or below the lazy threshold the walk only prolongs
//! entries; above it, entries approaching expiry are probed with up to
//! `U_MAX` UPDATEs, each followed by a `T_UPACK` wait that an authentic
//! UPDATEACK cuts short by prolonging the entry.

use crate::config::Config;
use crate::neighbor::NeighborHandle;
use std::time::Duration;

/// State of one keepalive pass over the table
#[derive(Debug)]
pub struct UpdatePass {
    queue: Vec<NeighborHandle>,
    position: usize,
    retries_left: u8,
}

impl UpdatePass {
    /// Start a pass over a snapshot of table handles
    #[must_use]
    pub fn new(queue: Vec<NeighborHandle>, max_updates: u8) -> Self {
        Self {
            queue,
            position: 0,
            retries_left: max_updates,
        }
    }

    /// Handle currently being probed
    #[must_use]
    pub fn current(&self) -> Option<NeighborHandle> {
        self.queue.get(self.position).copied()
    }

    /// Whether another UPDATE may still be sent to the current neighbor
    #[must_use]
    pub fn may_retry(&self) -> bool {
        self.retries_left > 0
    }

    /// Consume one retransmission credit
    pub fn consume_retry(&mut self) {
        self.retries_left = self.retries_left.saturating_sub(1);
    }

    /// Move to the next neighbor, refilling the retransmission budget
    pub fn advance(&mut self, max_updates: u8) {
        self.position += 1;
        self.retries_left = max_updates;
    }
}

/// Whether a neighbor close to expiry warrants an UPDATE this pass.
///
/// `count` is the current table occupancy. Returns `Prolong` when spare
/// slots make probing pointless, `Skip` when the entry either already
/// expired or is not yet close enough to expiry, and `Probe` otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateDecision {
    /// Renew the lease without radio traffic
    Prolong,
    /// Leave the entry alone this pass
    Skip,
    /// Send an UPDATE and wait for the UPDATEACK
    Probe,
}

/// Decide what the pass does with one neighbor
#[must_use]
pub fn update_decision(
    config: &Config,
    count: usize,
    now: Duration,
    expiration_time: Duration,
) -> UpdateDecision {
    if count <= config.lazy_threshold() {
        return UpdateDecision::Prolong;
    }
    if now > expiration_time {
        // Probing already failed; the expiry sweep reclaims the slot.
        return UpdateDecision::Skip;
    }
    let headroom = config.update_check_interval
        + config.updateack_wait * (config.max_neighbors as u32) * u32::from(config.max_updates);
    if expiration_time - now > headroom {
        return UpdateDecision::Skip;
    }
    UpdateDecision::Probe
}
