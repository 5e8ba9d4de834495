//! Player id minting
//!
//! The session owns one generator and hands it to whoever assigns ids, so
//! tests can swap the random source for a predictable sequence.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub trait IdGenerator: Send {
    /// Returns a candidate id; callers still check it against the roster
    fn next_id(&mut self) -> i32;
}

/// Random positive ids
pub struct RandomIds {
    rng: StdRng,
}

impl RandomIds {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    #[cfg(test)]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomIds {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for RandomIds {
    fn next_id(&mut self) -> i32 {
        self.rng.gen_range(1..=i32::MAX)
    }
}

/// Counts up from a starting value
pub struct SequentialIds {
    next: i32,
}

impl SequentialIds {
    pub fn starting_at(first: i32) -> Self {
        Self { next: first }
    }
}

impl IdGenerator for SequentialIds {
    fn next_id(&mut self) -> i32 {
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        id
    }
}

/// Draws ids until one is non-zero and not rejected by `taken`
pub fn mint_unique(ids: &mut dyn IdGenerator, taken: impl Fn(i32) -> bool) -> i32 {
    loop {
        let id = ids.next_id();
        if id != 0 && !taken(id) {
            return id;
        }
    }
}
