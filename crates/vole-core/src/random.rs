// Random — seeded random-number stream owned by a network
//
// Each network owns exactly one stream. It drives parameter initialisation
// for nodes created with it and every stochastic decision (dropout masks)
// made during a run. Reference networks receive their own stream on
// creation, so sibling references never contend on, or perturb, each
// other's sequence.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A seeded, reproducible random-number stream.
#[derive(Debug, Clone)]
pub struct Random {
    seed: u64,
    rng: StdRng,
}

impl Random {
    /// Create a stream from a seed. Equal seeds yield equal sequences.
    pub fn new(seed: u64) -> Self {
        Random {
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// The seed this stream was created from.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Restart the sequence from the original seed.
    pub fn reset(&mut self) {
        self.rng = StdRng::seed_from_u64(self.seed);
    }

    /// Uniform sample in `[low, high)`.
    pub fn uniform(&mut self, low: f64, high: f64) -> f64 {
        if low >= high {
            return low;
        }
        self.rng.gen_range(low..high)
    }

    /// `true` with probability `p`.
    pub fn bernoulli(&mut self, p: f64) -> bool {
        self.rng.gen_bool(p.clamp(0.0, 1.0))
    }

    /// Raw 64-bit sample, e.g. to seed a derived stream.
    pub fn next_u64(&mut self) -> u64 {
        self.rng.gen()
    }

    /// Fill a buffer with uniform samples in `[low, high)`.
    pub fn fill_uniform(&mut self, out: &mut [f32], low: f32, high: f32) {
        for v in out.iter_mut() {
            *v = self.uniform(low as f64, high as f64) as f32;
        }
    }
}

impl Default for Random {
    fn default() -> Self {
        Random::new(0)
    }
}
