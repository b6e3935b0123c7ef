//! Deterministic random number generation.
//!
//! RULE: Schedule-affecting randomness (retry jitter, A/B assignment)
//! never comes from a platform RNG. Streams are derived from the entity
//! id and purpose, so every sweep worker computes the identical jitter
//! and group for the same entity, and a retried pass reproduces the
//! schedule it computed before crashing.

use rand::{RngCore, SeedableRng};
use rand_pcg::Pcg64Mcg;

/// A deterministic RNG stream for one (purpose, entity, counter) triple.
pub struct EntityRng {
    inner: Pcg64Mcg,
}

impl EntityRng {
    /// Derive a stream for an entity. `counter` distinguishes successive
    /// draws for the same entity (e.g. the retry attempt number).
    pub fn for_entity(purpose: &str, entity_id: &str, counter: u64) -> Self {
        let seed = fnv1a(purpose.as_bytes())
            ^ fnv1a(entity_id.as_bytes())
            ^ counter.wrapping_mul(0x9e37_79b9_7f4a_7c15);
        Self {
            inner: Pcg64Mcg::seed_from_u64(seed),
        }
    }

    /// Roll a float in [0.0, 1.0).
    pub fn next_f64(&mut self) -> f64 {
        let bits = self.inner.next_u64();
        (bits >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// Draw a raw u64 (full range).
    pub fn next_u64(&mut self) -> u64 {
        self.inner.next_u64()
    }

    /// Roll a u64 in [0, n).
    pub fn next_u64_below(&mut self, n: u64) -> u64 {
        assert!(n > 0, "n must be > 0");
        self.inner.next_u64() % n
    }

    /// Bernoulli trial: returns true with probability p.
    pub fn chance(&mut self, p: f64) -> bool {
        self.next_f64() < p
    }
}

/// FNV-1a, enough mixing for seed derivation.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
