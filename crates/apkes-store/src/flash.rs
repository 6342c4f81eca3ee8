//! The flash contract and its in-memory and file-backed implementations.
//!
//! Storage is split into two disjoint byte-addressable regions that erase
//! as a unit to `0xFF`. `append` maintains a per-region cursor that an
//! erase resets to the region's reserved base (the keying-material region
//! reserves its head for the PRNG seed image, see [`crate::keying`]).

use crate::StoreError;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Capacity of each region in bytes
pub const REGION_CAPACITY: usize = 4096;

/// Byte value of erased flash
pub const ERASED: u8 = 0xFF;

/// The two storage regions the core uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    /// PRNG seed, boot counter, and appended scheme keying material
    KeyingMaterial,
    /// Neighbor-table image
    Neighbors,
}

impl Region {
    fn index(self) -> usize {
        match self {
            Self::KeyingMaterial => 0,
            Self::Neighbors => 1,
        }
    }

    /// Offset where `append` starts writing after an erase
    #[must_use]
    pub fn append_base(self) -> usize {
        match self {
            Self::KeyingMaterial => crate::keying::MATERIAL_BASE,
            Self::Neighbors => 0,
        }
    }
}

/// Byte-addressable non-volatile storage with two erase regions
pub trait NonVolatile {
    /// Erase a whole region to `0xFF` and reset its append cursor
    fn erase(&mut self, region: Region) -> Result<(), StoreError>;

    /// Append bytes at the region's cursor, advancing it
    fn append(&mut self, region: Region, bytes: &[u8]) -> Result<(), StoreError>;

    /// Write bytes at an absolute offset within the region
    fn write_at(&mut self, region: Region, offset: usize, bytes: &[u8]) -> Result<(), StoreError>;

    /// Read bytes from an absolute offset within the region
    fn read_at(&self, region: Region, offset: usize, buf: &mut [u8]) -> Result<(), StoreError>;
}

fn check_bounds(offset: usize, len: usize) -> Result<(), StoreError> {
    if offset + len > REGION_CAPACITY {
        return Err(StoreError::OutOfBounds {
            offset,
            len,
            capacity: REGION_CAPACITY,
        });
    }
    Ok(())
}

/// RAM-backed flash for tests and simulation
pub struct MemFlash {
    regions: [Vec<u8>; 2],
    cursors: [usize; 2],
}

impl MemFlash {
    /// Fresh, fully erased flash
    #[must_use]
    pub fn new() -> Self {
        Self {
            regions: [
                vec![ERASED; REGION_CAPACITY],
                vec![ERASED; REGION_CAPACITY],
            ],
            cursors: [
                Region::KeyingMaterial.append_base(),
                Region::Neighbors.append_base(),
            ],
        }
    }
}

impl Default for MemFlash {
    fn default() -> Self {
        Self::new()
    }
}

impl NonVolatile for MemFlash {
    fn erase(&mut self, region: Region) -> Result<(), StoreError> {
        self.regions[region.index()].fill(ERASED);
        self.cursors[region.index()] = region.append_base();
        Ok(())
    }

    fn append(&mut self, region: Region, bytes: &[u8]) -> Result<(), StoreError> {
        let cursor = self.cursors[region.index()];
        self.write_at(region, cursor, bytes)?;
        self.cursors[region.index()] = cursor + bytes.len();
        Ok(())
    }

    fn write_at(&mut self, region: Region, offset: usize, bytes: &[u8]) -> Result<(), StoreError> {
        check_bounds(offset, bytes.len())?;
        self.regions[region.index()][offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn read_at(&self, region: Region, offset: usize, buf: &mut [u8]) -> Result<(), StoreError> {
        check_bounds(offset, buf.len())?;
        buf.copy_from_slice(&self.regions[region.index()][offset..offset + buf.len()]);
        Ok(())
    }
}

/// File-backed flash image.
///
/// The image holds both regions back to back. Every mutation rewrites the
/// whole file; unlike real flash the backing store is not erase-unit
/// constrained, so in-place rewrites of the seed area are permitted.
pub struct FileFlash {
    path: PathBuf,
    mem: MemFlash,
}

impl FileFlash {
    /// Open an existing image or create a fully erased one
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the file cannot be read or created, or
    /// `StoreError::Corrupt` if an existing image has the wrong size.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut mem = MemFlash::new();
        if path.exists() {
            let image = fs::read(&path)?;
            if image.len() != 2 * REGION_CAPACITY {
                return Err(StoreError::Corrupt("flash image has wrong size"));
            }
            mem.regions[0].copy_from_slice(&image[..REGION_CAPACITY]);
            mem.regions[1].copy_from_slice(&image[REGION_CAPACITY..]);
        }
        Ok(Self { path, mem })
    }

    fn flush(&self) -> Result<(), StoreError> {
        let mut file = fs::File::create(&self.path)?;
        file.write_all(&self.mem.regions[0])?;
        file.write_all(&self.mem.regions[1])?;
        file.sync_all()?;
        Ok(())
    }
}

impl NonVolatile for FileFlash {
    fn erase(&mut self, region: Region) -> Result<(), StoreError> {
        self.mem.erase(region)?;
        self.flush()
    }

    fn append(&mut self, region: Region, bytes: &[u8]) -> Result<(), StoreError> {
        self.mem.append(region, bytes)?;
        self.flush()
    }

    fn write_at(&mut self, region: Region, offset: usize, bytes: &[u8]) -> Result<(), StoreError> {
        self.mem.write_at(region, offset, bytes)?;
        self.flush()
    }

    fn read_at(&self, region: Region, offset: usize, buf: &mut [u8]) -> Result<(), StoreError> {
        self.mem.read_at(region, offset, buf)
    }
}
