//! Session Random Source
//!
//! Every session owns one [`DeterministicRng`], seeded from the genesis
//! record. Application code gets it through `Context::rng` and nowhere else,
//! so a replayed journal draws exactly the same numbers as the live session.
//!
//! The generator is Xorshift128+ with both words seeded through SplitMix64.
//! Its full state is two words and compares by value, which is how the store
//! notices a call that consumed randomness without touching state.

/// Seeded Xorshift128+ generator.
///
/// ```
/// use statesync::core::rng::DeterministicRng;
///
/// let mut live = DeterministicRng::new(0xD1CE);
/// let mut replayed = DeterministicRng::new(0xD1CE);
/// assert_eq!(live.next_int_range(1, 6), replayed.next_int_range(1, 6));
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeterministicRng {
    s0: u64,
    s1: u64,
}

impl Default for DeterministicRng {
    fn default() -> Self {
        Self::new(0)
    }
}

impl DeterministicRng {
    /// Generator for a journaled seed.
    pub fn new(seed: u64) -> Self {
        let mut mix = seed;
        let s0 = splitmix64(&mut mix);
        let s1 = splitmix64(&mut mix);
        if s0 | s1 == 0 {
            // All-zero is a fixed point of xorshift
            return Self { s0: 1, s1: 1 };
        }
        Self { s0, s1 }
    }

    /// Next raw 64-bit output.
    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.s0;
        let y = self.s1;
        let out = x.wrapping_add(y);
        self.s0 = y;
        x ^= x << 23;
        self.s1 = x ^ y ^ (x >> 17) ^ (y >> 26);
        out
    }

    /// Next 32-bit output (high half of the 64-bit draw).
    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    /// Uniform value in `[0, bound)`. Returns 0 for a zero bound.
    pub fn below(&mut self, bound: u64) -> u64 {
        if bound == 0 {
            return 0;
        }
        // Reject the short top zone so every residue is equally likely
        let zone = u64::MAX - (u64::MAX % bound);
        loop {
            let draw = self.next_u64();
            if draw < zone {
                return draw % bound;
            }
        }
    }

    /// Uniform integer in `[min, max]`. Returns `min` if the range is empty.
    pub fn next_int_range(&mut self, min: i32, max: i32) -> i32 {
        if min >= max {
            return min;
        }
        let span = (max as i64 - min as i64) as u64 + 1;
        (min as i64 + self.below(span) as i64) as i32
    }

    /// Uniform float in `[0, 1)` with 24 bits of precision.
    #[inline]
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u64() >> 40) as f32 * (1.0 / (1u32 << 24) as f32)
    }

    /// Bernoulli draw with probability `p`.
    pub fn chance(&mut self, p: f32) -> bool {
        self.next_f32() < p
    }
}

#[inline]
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Seed for a new session, from the OS-seeded thread generator.
///
/// Only `NEW_SESSION` calls this; the result goes into the genesis record.
pub fn fresh_seed() -> u64 {
    rand::random()
}
