//! Seeded cryptographic PRNG.
//!
//! Nodes without a hardware entropy source boot from a seed preloaded in
//! non-volatile storage. The boot counter stored next to the seed is mixed
//! into the PRNG state so every reboot produces a distinct stream even
//! though the seed bytes never change.

use crate::{CHALLENGE_LEN, Challenge, KEY_LEN, Key128, SEED_LEN};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::time::Duration;

/// Process-wide cryptographic PRNG
pub struct Prng {
    rng: StdRng,
}

impl Prng {
    /// Seed from persisted seed material and the boot counter
    #[must_use]
    pub fn from_seed(seed: [u8; SEED_LEN], boot_count: u32) -> Self {
        let mut expanded = [0u8; 32];
        expanded[..SEED_LEN].copy_from_slice(&seed);
        expanded[SEED_LEN..SEED_LEN + 4].copy_from_slice(&boot_count.to_le_bytes());
        Self {
            rng: StdRng::from_seed(expanded),
        }
    }

    /// Seed from the OS entropy source
    #[must_use]
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Fill a buffer with random bytes
    pub fn fill(&mut self, buf: &mut [u8]) {
        self.rng.fill_bytes(buf);
    }

    /// Draw a fresh 8-byte handshake challenge
    pub fn challenge(&mut self) -> Challenge {
        let mut c = [0u8; CHALLENGE_LEN];
        self.rng.fill_bytes(&mut c);
        c
    }

    /// Draw a fresh 128-bit key
    pub fn key(&mut self) -> Key128 {
        let mut k = [0u8; KEY_LEN];
        self.rng.fill_bytes(&mut k);
        Key128::new(k)
    }

    /// Uniform duration in `[0, max]`, millisecond granularity
    pub fn uniform_duration(&mut self, max: Duration) -> Duration {
        let millis = max.as_millis() as u64;
        Duration::from_millis(self.rng.gen_range(0..=millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_stream() {
        let mut a = Prng::from_seed([0x5A; SEED_LEN], 1);
        let mut b = Prng::from_seed([0x5A; SEED_LEN], 1);
        assert_eq!(a.challenge(), b.challenge());
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_boot_count_changes_stream() {
        let mut a = Prng::from_seed([0x5A; SEED_LEN], 1);
        let mut b = Prng::from_seed([0x5A; SEED_LEN], 2);
        assert_ne!(a.challenge(), b.challenge());
    }

    #[test]
    fn test_uniform_duration_bounded() {
        let mut rng = Prng::from_seed([0x01; SEED_LEN], 0);
        let max = Duration::from_secs(5);
        for _ in 0..200 {
            assert!(rng.uniform_duration(max) <= max);
        }
    }

    #[test]
    fn test_zero_max_duration() {
        let mut rng = Prng::from_seed([0x02; SEED_LEN], 0);
        assert_eq!(rng.uniform_duration(Duration::ZERO), Duration::ZERO);
    }
}
