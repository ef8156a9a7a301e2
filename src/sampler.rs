use crate::model::Distribution;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Source of uniform draws in [0, 1) for outcome selection
pub trait Sampler {
    fn draw(&mut self) -> f64;

    /// Draw once and map it onto the distribution
    fn sample<'a>(&mut self, distribution: &'a Distribution) -> Option<&'a str> {
        let draw = self.draw();
        pick_outcome(distribution, draw)
    }
}

/// Seeded sampler; one per rally so results do not depend on scheduling
pub struct RallySampler {
    rng: StdRng,
}

impl RallySampler {
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Sampler for the rally at `index` of a run seeded with `seed`
    pub fn for_rally(seed: u64, index: u64) -> Self {
        Self::from_seed(seed.wrapping_add(index))
    }
}

impl Sampler for RallySampler {
    fn draw(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }
}

/// First outcome whose cumulative probability reaches `draw`.
///
/// Falls back to the last configured outcome when rounding leaves the
/// cumulative sum short of the draw. `None` only for an empty distribution.
pub fn pick_outcome(distribution: &Distribution, draw: f64) -> Option<&str> {
    let mut cumulative = 0.0;
    let mut last = None;
    for (outcome, probability) in distribution.iter() {
        cumulative += probability;
        if cumulative >= draw {
            return Some(outcome);
        }
        last = Some(outcome);
    }
    last
}
