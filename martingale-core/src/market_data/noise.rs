//! Random noise sources for the price walk

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use std::collections::VecDeque;

/// Supplies standard normal samples to the price generator
pub trait NoiseSource: Send {
    fn sample(&mut self) -> f64;
}

/// Gaussian noise backed by a seedable RNG
pub struct GaussianNoise {
    rng: StdRng,
}

impl GaussianNoise {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }
}

impl NoiseSource for GaussianNoise {
    fn sample(&mut self) -> f64 {
        StandardNormal.sample(&mut self.rng)
    }
}

/// Replays a fixed script of samples, cycling when exhausted
pub struct ScriptedNoise {
    samples: VecDeque<f64>,
}

impl ScriptedNoise {
    pub fn new(samples: impl IntoIterator<Item = f64>) -> Self {
        Self {
            samples: samples.into_iter().collect(),
        }
    }

    /// Always returns zero, so prices never move
    pub fn flat() -> Self {
        Self::new([0.0])
    }
}

impl NoiseSource for ScriptedNoise {
    fn sample(&mut self) -> f64 {
        match self.samples.pop_front() {
            Some(value) => {
                self.samples.push_back(value);
                value
            }
            None => 0.0,
        }
    }
}
