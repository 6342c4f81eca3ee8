//! # APKES Crypto
//!
//! Cryptographic primitives for the APKES link-layer security subsystem.
//!
//! This crate provides:
//! - Pairwise key derivation from exchanged challenges and a pre-secret
//! - `CCM*` sealing and opening of command frames with a cleartext prefix
//! - Sliding-window anti-replay tracking of peer frame counters
//! - A seeded cryptographic PRNG with a per-boot stream
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm |
//! |----------|-----------|
//! | Key derivation | AES-128 single-block encryption |
//! | Frame authentication | CCM* (AES-128, 8-byte MIC, 13-byte nonce) |
//! | PRNG | `StdRng` seeded from persisted seed + boot counter |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod ccmstar;
pub mod error;
pub mod pairwise;
pub mod random;
pub mod replay;

pub use ccmstar::{FrameNonce, Mic, SecurityLevel, open, seal};
pub use error::CryptoError;
pub use pairwise::{aes128_encrypt_block, derive_pairwise_key, rekey_after_reboot};
pub use random::Prng;
pub use replay::AntiReplay;

use zeroize::{Zeroize, ZeroizeOnDrop};

/// Challenge length carried in HELLO and HELLOACK frames
pub const CHALLENGE_LEN: usize = 8;

/// Pairwise and broadcast key length
pub const KEY_LEN: usize = 16;

/// MIC length produced by the CCM* construction
pub const MIC_LEN: usize = 8;

/// CCM* nonce length
pub const NONCE_LEN: usize = 13;

/// PRNG seed length held in the keying-material region
pub const SEED_LEN: usize = 16;

/// An 8-byte handshake challenge
pub type Challenge = [u8; CHALLENGE_LEN];

/// A 128-bit symmetric key (pairwise, broadcast, or pre-secret).
///
/// Zeroed on drop. The debug representation never prints key material.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Key128([u8; KEY_LEN]);

impl Key128 {
    /// Wrap raw key bytes
    #[must_use]
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw key bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl From<[u8; KEY_LEN]> for Key128 {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for Key128 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Key128(<redacted>)")
    }
}
