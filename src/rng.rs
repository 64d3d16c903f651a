//! # Randomness
//!
//! A uniform qubit and byte stream abstraction consumed by preparation
//! and by marker selection. The actual secret randomness generator is an
//! external oracle; this module only defines the interface stage code is
//! written against, plus an OS-backed implementation and a seeded
//! implementation for reproducible tests.

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

use crate::qubit::Qubit;

/// A source of uniform qubits and uniform bytes.
///
/// Single-producer on the transmitter side: callers are expected to hold
/// one `RandomSource` per emitting thread rather than share one across
/// threads.
pub trait RandomSource {
    /// Produce one uniformly random qubit value in `[0,3]`.
    fn next_qubit(&mut self) -> Qubit;

    /// Produce `count` uniformly random, distinct slot indices in
    /// `[0, frame_slot_count)`, used to select alignment markers for
    /// `GetAlignmentMarkers`. If `count >= frame_slot_count` all slots
    /// are returned.
    fn sample_distinct_slots(&mut self, frame_slot_count: u32, count: u32) -> Vec<u32>;

    /// Produce `len` uniformly random bytes, e.g. for a seed.
    fn fill_bytes(&mut self, buf: &mut [u8]);
}

/// An OS-entropy-backed `RandomSource` suitable for production use.
pub struct OsRandomSource {
    rng: rand::rngs::ThreadRng,
}

impl OsRandomSource {
    pub fn new() -> OsRandomSource {
        OsRandomSource { rng: rand::thread_rng() }
    }
}

impl Default for OsRandomSource {
    fn default() -> Self {
        OsRandomSource::new()
    }
}

impl RandomSource for OsRandomSource {
    fn next_qubit(&mut self) -> Qubit {
        Qubit::new(self.rng.gen_range(0..=3)).expect("gen_range bounded to [0,3]")
    }

    fn sample_distinct_slots(&mut self, frame_slot_count: u32, count: u32) -> Vec<u32> {
        sample_distinct_slots_with(&mut self.rng, frame_slot_count, count)
    }

    fn fill_bytes(&mut self, buf: &mut [u8]) {
        self.rng.fill_bytes(buf);
    }
}

/// A deterministic `RandomSource` seeded explicitly, for reproducible
/// tests and for replaying a scenario.
pub struct SeededRandomSource {
    rng: StdRng,
}

impl SeededRandomSource {
    pub fn from_seed(seed: u64) -> SeededRandomSource {
        SeededRandomSource {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl RandomSource for SeededRandomSource {
    fn next_qubit(&mut self) -> Qubit {
        Qubit::new(self.rng.gen_range(0..=3)).expect("gen_range bounded to [0,3]")
    }

    fn sample_distinct_slots(&mut self, frame_slot_count: u32, count: u32) -> Vec<u32> {
        sample_distinct_slots_with(&mut self.rng, frame_slot_count, count)
    }

    fn fill_bytes(&mut self, buf: &mut [u8]) {
        self.rng.fill_bytes(buf);
    }
}

fn sample_distinct_slots_with<R: RngCore>(rng: &mut R, frame_slot_count: u32, count: u32) -> Vec<u32> {
    if count >= frame_slot_count {
        return (0..frame_slot_count).collect();
    }
    // Partial Fisher-Yates over an index vector: fine for the marker
    // counts this protocol uses (a small fraction of frame_slot_count).
    let mut pool: Vec<u32> = (0..frame_slot_count).collect();
    let mut picked = Vec::with_capacity(count as usize);
    for i in 0..count {
        let remaining = pool.len() - i as usize;
        let j = rng.gen_range(0..remaining);
        picked.push(pool[i as usize + j]);
        pool.swap(i as usize, i as usize + j);
    }
    picked
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_source_is_reproducible() {
        let mut a = SeededRandomSource::from_seed(42);
        let mut b = SeededRandomSource::from_seed(42);
        let qa: Vec<u8> = (0..10).map(|_| a.next_qubit().value()).collect();
        let qb: Vec<u8> = (0..10).map(|_| b.next_qubit().value()).collect();
        assert_eq!(qa, qb);
    }

    #[test]
    fn sample_distinct_slots_returns_distinct_in_range() {
        let mut src = SeededRandomSource::from_seed(1);
        let slots = src.sample_distinct_slots(1024, 16);
        assert_eq!(slots.len(), 16);
        let mut sorted = slots.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 16);
        assert!(slots.iter().all(|&s| s < 1024));
    }

    #[test]
    fn sample_all_slots_when_count_exceeds_total() {
        let mut src = SeededRandomSource::from_seed(2);
        let slots = src.sample_distinct_slots(8, 100);
        assert_eq!(slots.len(), 8);
    }
}
