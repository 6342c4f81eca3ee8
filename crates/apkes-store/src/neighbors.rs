//! Neighbor-table image codec.
//!
//! The neighbor region holds a 4-byte little-endian record count followed
//! by a packed array of fixed-size records. Every backup overwrites the
//! region wholesale, so the image is always internally consistent.

use crate::flash::{NonVolatile, Region};
use crate::StoreError;

/// Encoded size of one neighbor record
pub const RECORD_LEN: usize = 8 + 2 + 1 + 1 + 1 + 16 + 1 + 16 + 8;

const COUNT_LEN: usize = 4;
const ERASED_COUNT: u32 = u32::MAX;

/// One neighbor as persisted to flash.
///
/// `status` carries the raw life-stage discriminant (0 = permanent); the
/// core maps it back to its own type on restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborRecord {
    /// Peer EUI-64 extended address
    pub extended_addr: [u8; 8],
    /// Peer short address
    pub short_addr: u16,
    /// Index we assigned to the peer
    pub local_index: u8,
    /// Index the peer assigned to us
    pub foreign_index: u8,
    /// Raw life-stage discriminant
    pub status: u8,
    /// Pairwise key bytes
    pub pairwise_key: [u8; 16],
    /// Peer broadcast key, when piggybacking is on
    pub broadcast_key: Option<[u8; 16]>,
    /// Absolute expiration time in seconds
    pub expiration_secs: u64,
}

impl NeighborRecord {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.extended_addr);
        out.extend_from_slice(&self.short_addr.to_le_bytes());
        out.push(self.local_index);
        out.push(self.foreign_index);
        out.push(self.status);
        out.extend_from_slice(&self.pairwise_key);
        match &self.broadcast_key {
            Some(key) => {
                out.push(1);
                out.extend_from_slice(key);
            }
            None => {
                out.push(0);
                out.extend_from_slice(&[0u8; 16]);
            }
        }
        out.extend_from_slice(&self.expiration_secs.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        if bytes.len() < RECORD_LEN {
            return Err(StoreError::Corrupt("truncated neighbor record"));
        }
        let mut extended_addr = [0u8; 8];
        extended_addr.copy_from_slice(&bytes[0..8]);
        let short_addr = u16::from_le_bytes([bytes[8], bytes[9]]);
        let local_index = bytes[10];
        let foreign_index = bytes[11];
        let status = bytes[12];
        let mut pairwise_key = [0u8; 16];
        pairwise_key.copy_from_slice(&bytes[13..29]);
        let broadcast_key = match bytes[29] {
            0 => None,
            1 => {
                let mut key = [0u8; 16];
                key.copy_from_slice(&bytes[30..46]);
                Some(key)
            }
            _ => return Err(StoreError::Corrupt("bad broadcast-key flag")),
        };
        let expiration_secs = u64::from_le_bytes(bytes[46..54].try_into().expect("fixed slice"));
        Ok(Self {
            extended_addr,
            short_addr,
            local_index,
            foreign_index,
            status,
            pairwise_key,
            broadcast_key,
            expiration_secs,
        })
    }
}

/// Overwrite the neighbor region with the given records.
///
/// # Errors
///
/// Propagates flash access errors; an oversized table fails with
/// `StoreError::OutOfBounds` before anything is written.
pub fn backup_neighbors(
    flash: &mut dyn NonVolatile,
    records: &[NeighborRecord],
) -> Result<(), StoreError> {
    flash.erase(Region::Neighbors)?;

    let count = records.len() as u32;
    flash.write_at(Region::Neighbors, 0, &count.to_le_bytes())?;

    let mut image = Vec::with_capacity(records.len() * RECORD_LEN);
    for record in records {
        record.encode(&mut image);
    }
    flash.write_at(Region::Neighbors, COUNT_LEN, &image)?;
    tracing::debug!(count, "neighbor table backed up");
    Ok(())
}

/// Read back the persisted neighbor records.
///
/// An erased region restores as an empty table.
///
/// # Errors
///
/// Returns `StoreError::Corrupt` when the count is implausible for the
/// region size, and propagates flash access errors.
pub fn restore_neighbors(flash: &dyn NonVolatile) -> Result<Vec<NeighborRecord>, StoreError> {
    let mut count_bytes = [0u8; COUNT_LEN];
    flash.read_at(Region::Neighbors, 0, &mut count_bytes)?;
    let count = u32::from_le_bytes(count_bytes);
    if count == ERASED_COUNT {
        return Ok(Vec::new());
    }
    let count = count as usize;
    if COUNT_LEN + count * RECORD_LEN > crate::flash::REGION_CAPACITY {
        return Err(StoreError::Corrupt("neighbor count exceeds region"));
    }

    let mut image = vec![0u8; count * RECORD_LEN];
    flash.read_at(Region::Neighbors, COUNT_LEN, &mut image)?;

    let mut records = Vec::with_capacity(count);
    for chunk in image.chunks_exact(RECORD_LEN) {
        records.push(NeighborRecord::decode(chunk)?);
    }
    tracing::debug!(count, "neighbor table restored");
    Ok(records)
}
