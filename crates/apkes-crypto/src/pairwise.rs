//! Pairwise key derivation.
//!
//! A pairwise key is the AES-128 encryption of the two exchanged 8-byte
//! challenges under the scheme-provided pre-secret. Both peers reconstruct
//! the ordered pair (initiator challenge, responder challenge), so they
//! arrive at the same key. The reboot variant re-encrypts an all-zero
//! block under the previous key.

use crate::{CHALLENGE_LEN, Challenge, KEY_LEN, Key128};
use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};

/// AES-128 single-block encryption, the primitive both derivations and
/// the master-key scheme build on.
#[must_use]
pub fn aes128_encrypt_block(key: &Key128, plaintext: &[u8; KEY_LEN]) -> Key128 {
    let cipher = Aes128::new(GenericArray::from_slice(key.as_bytes()));
    let mut block = GenericArray::clone_from_slice(plaintext);
    cipher.encrypt_block(&mut block);
    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(block.as_slice());
    Key128::new(out)
}

/// Derive the pairwise key from the ordered challenge pair and a pre-secret.
///
/// `initiator` is the challenge carried in the HELLO, `responder` the one
/// carried in the HELLOACK `extra` field.
#[must_use]
pub fn derive_pairwise_key(
    secret: &Key128,
    initiator: &Challenge,
    responder: &Challenge,
) -> Key128 {
    let mut block = [0u8; KEY_LEN];
    block[..CHALLENGE_LEN].copy_from_slice(initiator);
    block[CHALLENGE_LEN..].copy_from_slice(responder);
    aes128_encrypt_block(secret, &block)
}

/// Derive the refreshed pairwise key used after a reboot.
///
/// Idempotent per reboot: applied once to every restored permanent
/// neighbor, and recomputed identically by every peer that accepts the
/// REFRESH broadcast.
#[must_use]
pub fn rekey_after_reboot(key: &Key128) -> Key128 {
    aes128_encrypt_block(key, &[0u8; KEY_LEN])
}
