//! Neighbor table: a bounded slot pool with dense one-byte local indices.
//!
//! Entries are addressed through generation-checked handles so a timer
//! callback that outlives its neighbor degrades to a no-op instead of
//! touching a recycled slot. The table keeps an insertion list ordered by
//! `local_index`; the allocator fills the first gap in that sequence, so
//! indices stay dense and small enough to travel in one byte.

use crate::addr::{ExtendedAddr, NeighborIds};
use apkes_crypto::{AntiReplay, KEY_LEN, Key128};
use std::time::Duration;
use zeroize::Zeroize;

/// Life stage of a table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NeighborStatus {
    /// Handshake completed; the steady state
    Permanent = 0,
    /// HELLO heard, waiting out the random answer delay
    Tentative = 1,
    /// HELLOACK sent, waiting for the initiator's ACK
    TentativeAwaitingAck = 2,
}

impl NeighborStatus {
    /// Decode the persisted discriminant
    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Permanent),
            1 => Some(Self::Tentative),
            2 => Some(Self::TentativeAwaitingAck),
            _ => None,
        }
    }
}

/// One known peer
#[derive(Debug, Clone)]
pub struct Neighbor {
    /// Extended and short addresses
    pub ids: NeighborIds,
    /// Index we assigned to the peer; stable for the entry's lifetime
    pub local_index: u8,
    /// Index the peer assigned to us
    pub foreign_index: u8,
    /// Symmetric key shared with the peer
    pub pairwise_key: Key128,
    /// Key the peer authenticates its broadcasts with
    pub broadcast_key: Option<Key128>,
    /// Handshake scratch: initiator challenge then our challenge
    pub metadata: [u8; KEY_LEN],
    /// Window over the peer's sending frame counter
    pub anti_replay: AntiReplay,
    /// Life stage
    pub status: NeighborStatus,
    /// Absolute time at which the entry is purged unless prolonged
    pub expiration_time: Duration,
}

impl Drop for Neighbor {
    fn drop(&mut self) {
        // The keys zero themselves; the scratch challenges do not.
        self.metadata.zeroize();
    }
}

impl Neighbor {
    fn blank(local_index: u8) -> Self {
        Self {
            ids: NeighborIds::default(),
            local_index,
            foreign_index: 0,
            pairwise_key: Key128::new([0u8; KEY_LEN]),
            broadcast_key: None,
            metadata: [0u8; KEY_LEN],
            anti_replay: AntiReplay::new(),
            status: NeighborStatus::Tentative,
            expiration_time: Duration::MAX,
        }
    }
}

/// Stable reference to a table slot.
///
/// The generation counter detects reuse: a handle taken before a delete
/// no longer resolves once the slot holds a different peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborHandle {
    slot: usize,
    generation: u32,
}

/// Bounded neighbor pool
pub struct NeighborTable {
    slots: Vec<Option<Neighbor>>,
    generations: Vec<u32>,
    /// Slot ids ordered by ascending `local_index`
    order: Vec<usize>,
}

impl NeighborTable {
    /// Empty table with `capacity` slots
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            generations: vec![0; capacity],
            order: Vec::with_capacity(capacity),
        }
    }

    /// Number of live entries
    #[must_use]
    pub fn count(&self) -> usize {
        self.order.len()
    }

    /// Resolve a handle, if its entry is still the same one
    #[must_use]
    pub fn get(&self, handle: NeighborHandle) -> Option<&Neighbor> {
        if self.generations.get(handle.slot) != Some(&handle.generation) {
            return None;
        }
        self.slots[handle.slot].as_ref()
    }

    /// Mutable handle resolution
    pub fn get_mut(&mut self, handle: NeighborHandle) -> Option<&mut Neighbor> {
        if self.generations.get(handle.slot) != Some(&handle.generation) {
            return None;
        }
        self.slots[handle.slot].as_mut()
    }

    /// Linear lookup by extended address
    #[must_use]
    pub fn lookup(&self, addr: &ExtendedAddr) -> Option<NeighborHandle> {
        self.order
            .iter()
            .find(|&&slot| {
                self.slots[slot]
                    .as_ref()
                    .is_some_and(|n| n.ids.extended_addr == *addr)
            })
            .map(|&slot| NeighborHandle {
                slot,
                generation: self.generations[slot],
            })
    }

    /// Purge expired entries, then allocate a blank entry with the
    /// smallest unused local index. Returns `None` when the pool is full.
    pub fn allocate(&mut self, now: Duration) -> Option<NeighborHandle> {
        self.purge_expired(now);

        let slot = self.slots.iter().position(Option::is_none)?;

        // First gap in the ordered local-index sequence.
        let mut local_index: u8 = 0;
        let mut insert_at = self.order.len();
        for (position, &s) in self.order.iter().enumerate() {
            let existing = self.slots[s].as_ref().map_or(0, |n| n.local_index);
            if existing > local_index {
                insert_at = position;
                break;
            }
            local_index = existing + 1;
        }

        self.slots[slot] = Some(Neighbor::blank(local_index));
        self.order.insert(insert_at, slot);
        Some(NeighborHandle {
            slot,
            generation: self.generations[slot],
        })
    }

    /// Re-insert a restored entry under its persisted local index.
    ///
    /// Returns `None` when the pool is full or the index is already
    /// taken (a corrupt image).
    pub fn restore(&mut self, neighbor: Neighbor) -> Option<NeighborHandle> {
        let slot = self.slots.iter().position(Option::is_none)?;
        let local_index = neighbor.local_index;

        let mut insert_at = self.order.len();
        for (position, &s) in self.order.iter().enumerate() {
            let existing = self.slots[s].as_ref().map_or(0, |n| n.local_index);
            if existing == local_index {
                return None;
            }
            if existing > local_index {
                insert_at = position;
                break;
            }
        }

        self.slots[slot] = Some(neighbor);
        self.order.insert(insert_at, slot);
        Some(NeighborHandle {
            slot,
            generation: self.generations[slot],
        })
    }

    /// Remove an entry; stale handles are ignored
    pub fn remove(&mut self, handle: NeighborHandle) -> bool {
        if self.get(handle).is_none() {
            return false;
        }
        self.slots[handle.slot] = None;
        self.generations[handle.slot] = self.generations[handle.slot].wrapping_add(1);
        self.order.retain(|&s| s != handle.slot);
        true
    }

    /// Drop every entry whose expiration time has passed
    pub fn purge_expired(&mut self, now: Duration) -> usize {
        let expired: Vec<NeighborHandle> = self
            .handles()
            .into_iter()
            .filter(|&h| {
                self.get(h)
                    .is_some_and(|n| n.expiration_time <= now)
            })
            .collect();
        for handle in &expired {
            self.remove(*handle);
        }
        expired.len()
    }

    /// Handles of all live entries, in local-index order
    #[must_use]
    pub fn handles(&self) -> Vec<NeighborHandle> {
        self.order
            .iter()
            .map(|&slot| NeighborHandle {
                slot,
                generation: self.generations[slot],
            })
            .collect()
    }

    /// Iterate live entries in local-index order
    pub fn iter(&self) -> impl Iterator<Item = &Neighbor> {
        self.order
            .iter()
            .filter_map(|&slot| self.slots[slot].as_ref())
    }
}
