//! Keying-material region layout.
//!
//! The head of the region holds the PRNG seed image: a 16-byte seed and a
//! 4-byte little-endian boot counter. Scheme keying material (master or
//! pre-keys) is appended after the reserved head. Restoring the seed
//! writes the boot counter back incremented, so the PRNG stream differs
//! on every boot.

use crate::flash::{ERASED, NonVolatile, Region};
use crate::StoreError;
use apkes_crypto::SEED_LEN;

/// Offset of the seed image within the region
pub const SEED_OFFSET: usize = 0;

/// Offset where appended keying material starts
pub const MATERIAL_BASE: usize = SEED_LEN + 4 + 4; // seed, boot counter, pad

/// Restored PRNG seed image
#[derive(Debug, Clone, Copy)]
pub struct SeedImage {
    /// The persisted seed bytes
    pub seed: [u8; SEED_LEN],
    /// Boot counter to mix into this boot's PRNG stream
    pub boot_count: u32,
}

/// Erase the region and provision it with a seed and scheme material.
///
/// # Errors
///
/// Propagates flash access errors.
pub fn preload_keying(
    flash: &mut dyn NonVolatile,
    seed: &[u8; SEED_LEN],
    material: &[u8],
) -> Result<(), StoreError> {
    flash.erase(Region::KeyingMaterial)?;
    write_seed(flash, seed, 0)?;
    flash.append(Region::KeyingMaterial, material)
}

fn write_seed(
    flash: &mut dyn NonVolatile,
    seed: &[u8; SEED_LEN],
    boot_count: u32,
) -> Result<(), StoreError> {
    let mut image = [0u8; SEED_LEN + 4];
    image[..SEED_LEN].copy_from_slice(seed);
    image[SEED_LEN..].copy_from_slice(&boot_count.to_le_bytes());
    flash.write_at(Region::KeyingMaterial, SEED_OFFSET, &image)
}

/// Read the seed image and persist the boot counter incremented.
///
/// # Errors
///
/// Returns `StoreError::NotProvisioned` when the region was never
/// preloaded, and propagates flash access errors.
pub fn restore_seed(flash: &mut dyn NonVolatile) -> Result<SeedImage, StoreError> {
    let mut image = [0u8; SEED_LEN + 4];
    flash.read_at(Region::KeyingMaterial, SEED_OFFSET, &mut image)?;
    if image.iter().all(|&b| b == ERASED) {
        return Err(StoreError::NotProvisioned);
    }

    let mut seed = [0u8; SEED_LEN];
    seed.copy_from_slice(&image[..SEED_LEN]);
    let boot_count = u32::from_le_bytes(image[SEED_LEN..].try_into().expect("fixed slice"));

    write_seed(flash, &seed, boot_count.wrapping_add(1))?;
    Ok(SeedImage { seed, boot_count })
}

/// Read scheme keying material at an offset relative to the material base.
///
/// # Errors
///
/// Propagates flash access errors.
pub fn restore_keying_material(
    flash: &dyn NonVolatile,
    offset: usize,
    buf: &mut [u8],
) -> Result<(), StoreError> {
    flash.read_at(Region::KeyingMaterial, MATERIAL_BASE + offset, buf)
}
