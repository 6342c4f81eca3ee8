//! CCM* sealing and opening of command frames.
//!
//! Authenticated frames carry an 8-byte MIC over the whole payload. When
//! the security level has the encryption bit set, a trailing portion of
//! the payload is additionally encrypted while the prefix stays in
//! cleartext; the prefix is fed to CCM* as associated data, the tail as
//! the message. The 13-byte nonce binds the sender's extended address,
//! its frame counter, and the security level, so a frame replayed under a
//! different identity or counter never authenticates.

use crate::{CryptoError, KEY_LEN, Key128, MIC_LEN, NONCE_LEN};
use aes::Aes128;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{AeadInPlace, KeyInit};
use ccm::consts::{U8, U13};
use ccm::Ccm;

type CcmStar = Ccm<Aes128, U8, U13>;

/// An 8-byte message integrity code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mic(pub [u8; MIC_LEN]);

/// An 802.15.4-style security level byte.
///
/// The low two bits select the MIC length class, bit 2 adds payload
/// encryption. This build produces 8-byte MICs throughout (level 2 and
/// its encrypted variant 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityLevel(u8);

impl SecurityLevel {
    /// No security: unauthenticated broadcast (HELLO)
    pub const NONE: Self = Self(0);

    /// MIC-64 without payload encryption
    pub const MIC: Self = Self(2);

    /// MIC-64 with trailing payload encryption
    pub const MIC_ENCRYPTED: Self = Self(2 | (1 << 2));

    /// Construct from a raw level byte
    #[must_use]
    pub fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    /// Raw level byte as carried in the auxiliary security header
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self.0
    }

    /// Whether the frame carries a MIC at all
    #[must_use]
    pub fn is_secured(self) -> bool {
        self.0 & 3 != 0
    }

    /// Whether the trailing payload portion is encrypted
    #[must_use]
    pub fn has_encryption(self) -> bool {
        self.0 & (1 << 2) != 0
    }
}

/// CCM* nonce: extended address, frame counter, security level.
#[derive(Debug, Clone, Copy)]
pub struct FrameNonce([u8; NONCE_LEN]);

impl FrameNonce {
    /// Build the nonce for a frame from its sender and security fields
    #[must_use]
    pub fn new(src_extended: &[u8; 8], frame_counter: u32, level: SecurityLevel) -> Self {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..8].copy_from_slice(src_extended);
        nonce[8..12].copy_from_slice(&frame_counter.to_le_bytes());
        nonce[12] = level.as_u8();
        Self(nonce)
    }

    fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }
}

fn cipher(key: &Key128) -> CcmStar {
    CcmStar::new(GenericArray::from_slice(&key.as_bytes()[..KEY_LEN]))
}

/// Seal a frame payload in place.
///
/// Bytes before `clear_prefix_len` stay in cleartext and are authenticated
/// as associated data; the remainder is encrypted in place. Pass
/// `clear_prefix_len == payload.len()` for MIC-only frames.
///
/// # Errors
///
/// Returns `CryptoError::AuthFailed` if the CCM* computation is rejected
/// by the underlying implementation.
pub fn seal(
    key: &Key128,
    nonce: &FrameNonce,
    clear_prefix_len: usize,
    payload: &mut [u8],
) -> Result<Mic, CryptoError> {
    let (aad, msg) = payload.split_at_mut(clear_prefix_len);
    let tag = cipher(key)
        .encrypt_in_place_detached(GenericArray::from_slice(nonce.as_bytes()), aad, msg)
        .map_err(|_| CryptoError::AuthFailed)?;
    let mut mic = [0u8; MIC_LEN];
    mic.copy_from_slice(tag.as_slice());
    Ok(Mic(mic))
}

/// Verify and open a sealed frame payload in place.
///
/// Verifies the MIC over the whole payload under `key` and, on success,
/// decrypts the portion after `clear_prefix_len` in place. On failure the
/// payload is left unusable and must be discarded.
///
/// # Errors
///
/// Returns `CryptoError::AuthFailed` if the MIC does not verify.
pub fn open(
    key: &Key128,
    nonce: &FrameNonce,
    clear_prefix_len: usize,
    payload: &mut [u8],
    mic: &Mic,
) -> Result<(), CryptoError> {
    let (aad, msg) = payload.split_at_mut(clear_prefix_len);
    cipher(key)
        .decrypt_in_place_detached(
            GenericArray::from_slice(nonce.as_bytes()),
            aad,
            msg,
            GenericArray::from_slice(&mic.0),
        )
        .map_err(|_| CryptoError::AuthFailed)
}
