//! Keying-scheme adapter.
//!
//! The scheme that turns a pair of node identities into a shared
//! pre-secret is pluggable. The two accessors may differ: a scheme can
//! restrict who may initiate versus accept. `None` means no secret exists
//! for the peer and the caller aborts the handshake step silently.

use crate::addr::{ExtendedAddr, NeighborIds};
use apkes_crypto::{KEY_LEN, Key128, aes128_encrypt_block};
use apkes_store::{NonVolatile, StoreError, restore_keying_material};

/// Capability set consumed by the handshake engine
pub trait KeyingScheme {
    /// Restore scheme material from the keying-material region
    ///
    /// # Errors
    ///
    /// Propagates storage errors; the caller treats failure as
    /// best-effort and continues without secrets.
    fn init(&mut self, flash: &mut dyn NonVolatile) -> Result<(), StoreError>;

    /// Pre-secret shared with a peer we heard a HELLO from
    fn secret_with_hello_sender(&self, ids: &NeighborIds) -> Option<Key128>;

    /// Pre-secret shared with a peer that answered our HELLO
    fn secret_with_helloack_sender(&self, ids: &NeighborIds) -> Option<Key128>;
}

/// Master-key scheme: the pre-secret for a pair is the AES-128
/// encryption of the byte-wise ordered pair of extended addresses under
/// a network-wide master key, so both ends derive the same value no
/// matter who initiated.
pub struct MasterKeyScheme {
    own_addr: ExtendedAddr,
    master: Option<Key128>,
}

impl MasterKeyScheme {
    /// Scheme that loads its master key from flash on `init`
    #[must_use]
    pub fn new(own_addr: ExtendedAddr) -> Self {
        Self {
            own_addr,
            master: None,
        }
    }

    /// Scheme with the master key already in hand
    #[must_use]
    pub fn with_master(own_addr: ExtendedAddr, master: Key128) -> Self {
        Self {
            own_addr,
            master: Some(master),
        }
    }

    fn pair_secret(&self, peer: &ExtendedAddr) -> Option<Key128> {
        let master = self.master.as_ref()?;
        let own = self.own_addr.as_bytes();
        let peer = peer.as_bytes();
        let mut block = [0u8; KEY_LEN];
        let (lo, hi) = if own <= peer { (own, peer) } else { (peer, own) };
        block[..8].copy_from_slice(lo);
        block[8..].copy_from_slice(hi);
        Some(aes128_encrypt_block(master, &block))
    }
}

impl KeyingScheme for MasterKeyScheme {
    fn init(&mut self, flash: &mut dyn NonVolatile) -> Result<(), StoreError> {
        let mut key = [0u8; KEY_LEN];
        restore_keying_material(flash, 0, &mut key)?;
        if key.iter().all(|&b| b == 0xFF) {
            tracing::warn!("keying material region holds no master key");
            return Ok(());
        }
        self.master = Some(Key128::new(key));
        Ok(())
    }

    fn secret_with_hello_sender(&self, ids: &NeighborIds) -> Option<Key128> {
        self.pair_secret(&ids.extended_addr)
    }

    fn secret_with_helloack_sender(&self, ids: &NeighborIds) -> Option<Key128> {
        self.pair_secret(&ids.extended_addr)
    }
}

/// Test and simulation scheme: one preloaded secret shared by all pairs
pub struct FixedSecretScheme {
    secret: Key128,
}

impl FixedSecretScheme {
    /// Scheme handing out `secret` for every peer
    #[must_use]
    pub fn new(secret: Key128) -> Self {
        Self { secret }
    }
}

impl KeyingScheme for FixedSecretScheme {
    fn init(&mut self, _flash: &mut dyn NonVolatile) -> Result<(), StoreError> {
        Ok(())
    }

    fn secret_with_hello_sender(&self, _ids: &NeighborIds) -> Option<Key128> {
        Some(self.secret.clone())
    }

    fn secret_with_helloack_sender(&self, _ids: &NeighborIds) -> Option<Key128> {
        Some(self.secret.clone())
    }
}
