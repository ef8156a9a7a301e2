//! Point-to-set amplification: the chance of winning a race to `target`
//! points with a two-point margin when each point is won independently.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Largest accepted race target
pub const MAX_TARGET: u32 = 100;

/// Scoring of one set
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaceConfig {
    /// Points needed to win the set (21, or 15 in a deciding set)
    pub target: u32,
    /// Required lead, 1 or 2
    pub margin: u32,
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            target: 21,
            margin: 2,
        }
    }
}

impl RaceConfig {
    pub fn deciding_set() -> Self {
        Self {
            target: 15,
            margin: 2,
        }
    }

    fn check(&self) -> Result<()> {
        if !(1..=MAX_TARGET).contains(&self.target) {
            return Err(Error::InvalidConfig(format!(
                "race target must be in 1..={}, got {}",
                MAX_TARGET, self.target
            )));
        }
        if !(1..=2).contains(&self.margin) {
            return Err(Error::InvalidConfig(format!(
                "race margin must be 1 or 2, got {}",
                self.margin
            )));
        }
        Ok(())
    }

    /// Probability of winning from (target - 1, target - 1)
    fn tail(&self, p: f64) -> f64 {
        if self.margin == 1 {
            return p;
        }
        // Each two-point exchange either ends the set or returns to deuce
        let q = 1.0 - p;
        let win_two = p * p;
        let lose_two = q * q;
        if win_two + lose_two == 0.0 {
            0.5
        } else {
            win_two / (win_two + lose_two)
        }
    }

    /// Set-win probability for point-win probability `p`
    pub fn win_probability(&self, p: f64) -> Result<f64> {
        self.check()?;
        if !(0.0..=1.0).contains(&p) {
            return Err(Error::OutOfRangeProbability {
                location: "point win probability".to_string(),
                value: p,
            });
        }

        let t = self.target as usize;
        let q = 1.0 - p;
        // row[b]: probability of taking the set from score a-b, filled for
        // a = t-1 down to 0; `above` holds row a+1 (all ones once a+1 == t)
        let mut above = vec![1.0f64; t];
        let mut row = vec![0.0f64; t];
        for a in (0..t).rev() {
            for b in (0..t).rev() {
                row[b] = if a == t - 1 && b == t - 1 {
                    self.tail(p)
                } else {
                    let on_loss = if b + 1 == t { 0.0 } else { row[b + 1] };
                    p * above[b] + q * on_loss
                };
            }
            std::mem::swap(&mut above, &mut row);
        }
        Ok(above[0])
    }

    /// Set-level change for a point-level move from `p0` to `p1`
    pub fn match_delta(&self, p0: f64, p1: f64) -> Result<f64> {
        Ok(self.win_probability(p1)? - self.win_probability(p0)?)
    }

    /// Set-level delta divided by point-level delta
    pub fn amplification_factor(&self, p0: f64, p1: f64) -> Result<f64> {
        if p0 == p1 {
            return Err(Error::InvalidConfig(
                "amplification needs two distinct point probabilities".to_string(),
            ));
        }
        Ok(self.match_delta(p0, p1)? / (p1 - p0))
    }
}

/// Race to 21, win by 2
pub fn set_win_probability(p: f64) -> Result<f64> {
    RaceConfig::default().win_probability(p)
}

/// Alias of `set_win_probability`
pub fn amplify(p: f64) -> Result<f64> {
    set_win_probability(p)
}

pub fn match_delta(p0: f64, p1: f64) -> Result<f64> {
    RaceConfig::default().match_delta(p0, p1)
}

pub fn amplification_factor(p0: f64, p1: f64) -> Result<f64> {
    RaceConfig::default().amplification_factor(p0, p1)
}
