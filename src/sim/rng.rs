//! Seeded randomness for simulation

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sha2::{Digest, Sha256};

pub struct DeterministicRng {
    rng: ChaCha8Rng,
}

impl DeterministicRng {
    pub fn new(seed: u64) -> Self {
        DeterministicRng {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// RNG for one named decision, independent of call order
    ///
    /// Concurrent fetch workers reach the fault injector in whatever order
    /// the scheduler picks; deriving each decision from (seed, label) keeps a
    /// seed reproducible anyway.
    pub fn for_label(seed: u64, label: &str) -> Self {
        DeterministicRng {
            rng: ChaCha8Rng::from_seed(label_seed(seed, label)),
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }

    pub fn gen_range(&mut self, min: u64, max: u64) -> u64 {
        if min >= max {
            return min;
        }
        min + (self.next_u64() % (max - min))
    }

    pub fn gen_bool(&mut self, probability: f64) -> bool {
        let val = self.next_u64() as f64 / u64::MAX as f64;
        val < probability
    }

    pub fn pick<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        if items.is_empty() {
            return None;
        }
        let idx = self.gen_range(0, items.len() as u64) as usize;
        items.get(idx)
    }
}

/// SHA-256 of the little-endian seed followed by the label
fn label_seed(seed: u64, label: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(seed.to_le_bytes());
    hasher.update(label.as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_sequence() {
        let mut a = DeterministicRng::new(7);
        let mut b = DeterministicRng::new(7);
        for _ in 0..32 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn test_labelled_rngs_ignore_call_order() {
        let first = DeterministicRng::for_label(1, "a.json#v1#0").next_u64();
        let _ = DeterministicRng::for_label(1, "b.json#v1#0").next_u64();
        let again = DeterministicRng::for_label(1, "a.json#v1#0").next_u64();
        assert_eq!(first, again);
        assert_ne!(first, DeterministicRng::for_label(2, "a.json#v1#0").next_u64());
    }

    #[test]
    fn test_label_seed_is_pinned() {
        // Fixed derivation, so recorded seeds replay on any toolchain
        assert_eq!(
            hex::encode(label_seed(1, "a.json#v1#0")),
            "94165779ce94657abe8e9bb18162a3aa31963cbd409469ea601336e132b5ff90"
        );
    }

    #[test]
    fn test_gen_range_bounds() {
        let mut rng = DeterministicRng::new(3);
        for _ in 0..1000 {
            let v = rng.gen_range(5, 10);
            assert!((5..10).contains(&v));
        }
        assert_eq!(rng.gen_range(4, 4), 4);
    }
}
