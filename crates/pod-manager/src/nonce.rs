//! The nonce generator.
//!
//! A pure, stateful PRNG seeded from a pod's lot+serial. It does not hold a
//! back-reference to the pod; the sync slot it reacts to lives on
//! `RuntimeVariables` and is threaded in explicitly by the caller.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const FIXED_KEY: u32 = 0x4e6f6e65; // "None", a deterministic PRNG mix constant.

fn mix_seed(lot: u32, serial: u32) -> u64 {
    let mut seed = (lot as u64) << 32 | serial as u64;
    seed ^= (FIXED_KEY as u64).rotate_left(13);
    seed
}

/// Stateful per-message nonce sequence.
pub struct NonceGenerator {
    rng: StdRng,
    lot: u32,
    serial: u32,
}

impl NonceGenerator {
    pub fn new(lot: u32, serial: u32) -> Self {
        Self {
            rng: StdRng::seed_from_u64(mix_seed(lot, serial)),
            lot,
            serial,
        }
    }

    /// Produce the next nonce in the sequence.
    pub fn next_nonce(&mut self) -> u32 {
        self.rng.gen()
    }

    /// Reseed from a pod-supplied sync hint after a reject response.
    ///
    /// The hint augments (rather than replaces) the lot/serial seed so the
    /// resulting sequence stays deterministic per pod while diverging from
    /// the rejected one.
    pub fn resync(&mut self, sync_hint: u16) {
        let seed = mix_seed(self.lot, self.serial) ^ (sync_hint as u64).rotate_left(7);
        self.rng = StdRng::seed_from_u64(seed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_same_identity() {
        let mut a = NonceGenerator::new(111, 222);
        let mut b = NonceGenerator::new(111, 222);
        assert_eq!(a.next_nonce(), b.next_nonce());
    }

    #[test]
    fn differs_across_identities() {
        let mut a = NonceGenerator::new(111, 222);
        let mut b = NonceGenerator::new(111, 223);
        assert_ne!(a.next_nonce(), b.next_nonce());
    }

    #[test]
    fn resync_changes_the_sequence() {
        let mut gen = NonceGenerator::new(111, 222);
        let before = gen.next_nonce();
        gen.resync(42);
        let after = gen.next_nonce();
        assert_ne!(before, after);
    }
}
