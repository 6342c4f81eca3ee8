//! Error types for non-volatile storage.

use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Access past the end of a region
    #[error("region access out of bounds: offset {offset} + len {len} > {capacity}")]
    OutOfBounds {
        /// Requested offset
        offset: usize,
        /// Requested length
        len: usize,
        /// Region capacity
        capacity: usize,
    },

    /// The region holds no usable image (erased or never written)
    #[error("region not provisioned")]
    NotProvisioned,

    /// The stored image does not decode
    #[error("stored image corrupt: {0}")]
    Corrupt(&'static str),

    /// Backing file I/O failed
    #[error("flash I/O error: {0}")]
    Io(#[from] std::io::Error),
}
