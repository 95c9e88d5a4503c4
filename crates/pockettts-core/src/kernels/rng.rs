use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

/// A deterministic pseudo-random generator. Given the same seed and the
/// same sequence of calls, `next_normal`/`next_uniform` reproduce bitwise
/// identical outputs, satisfying the replay invariant in §8.
pub struct DeterministicRng {
    inner: StdRng,
}

impl DeterministicRng {
    pub fn from_seed(seed: u64) -> Self {
        DeterministicRng {
            inner: StdRng::seed_from_u64(seed),
        }
    }

    /// Seed from a process-wide entropy source, used when the caller does
    /// not supply an explicit seed.
    pub fn from_entropy() -> Self {
        DeterministicRng {
            inner: StdRng::from_entropy(),
        }
    }

    pub fn next_uniform(&mut self) -> f32 {
        self.inner.gen::<f32>()
    }

    pub fn next_normal(&mut self) -> f32 {
        let dist = Normal::new(0.0f32, 1.0f32).expect("standard normal is always valid");
        dist.sample(&mut self.inner)
    }

    /// Draw a single index from a discrete distribution given by `probs`,
    /// via inverse-CDF sampling.
    pub fn sample_categorical(&mut self, probs: &[f32]) -> usize {
        let u = self.next_uniform();
        let mut cumulative = 0.0f32;
        for (i, &p) in probs.iter().enumerate() {
            cumulative += p;
            if u < cumulative {
                return i;
            }
        }
        probs.len().saturating_sub(1)
    }
}
