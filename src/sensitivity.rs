//! Skill sensitivity: how far a probability change moves the point and set
//! win rate, with confidence intervals over repeated seeded trials.
//!
//! Every trial runs the baseline and the perturbed team on the same seed, so
//! an override that changes nothing produces a delta of exactly zero.

use crate::amplifier::RaceConfig;
use crate::error::{Error, Result};
use crate::model::{ParameterPath, ProbabilityModel};
use crate::simulation::SimulationRunner;
use crate::types::{ImpactLevel, SimulationConfig, Team};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Gap between consecutive trial seeds; each trial consumes one sub-seed per point
pub const TRIAL_SEED_STRIDE: u64 = 1 << 32;

/// Upper bound on values in one sweep
const MAX_SWEEP_VALUES: usize = 10_000;

/// Sensitivity analysis parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SensitivityConfig {
    /// Rallies simulated per trial, for baseline and perturbed team alike
    pub points_per_test: u64,
    /// Number of trials (R)
    pub runs: usize,
    pub confidence_level: f64,
    pub base_seed: u64,
    /// Explicit trial seeds; overrides `runs` and `base_seed` when set
    pub seeds: Option<Vec<u64>>,
    pub simulation: SimulationConfig,
    pub race: RaceConfig,
}

impl Default for SensitivityConfig {
    fn default() -> Self {
        Self {
            points_per_test: 20_000,
            runs: 5,
            confidence_level: 0.95,
            base_seed: 42,
            seeds: None,
            simulation: SimulationConfig::default(),
            race: RaceConfig::default(),
        }
    }
}

impl SensitivityConfig {
    pub fn trial_seeds(&self) -> Vec<u64> {
        match &self.seeds {
            Some(seeds) => seeds.clone(),
            None => (0..self.runs as u64)
                .map(|t| self.base_seed.wrapping_add(t.wrapping_mul(TRIAL_SEED_STRIDE)))
                .collect(),
        }
    }

    fn check(&self) -> Result<()> {
        if self.points_per_test == 0 {
            return Err(Error::InsufficientSamples(
                "points_per_test must be at least 1".to_string(),
            ));
        }
        let seeds = self.trial_seeds();
        let trials = seeds.len();
        if trials < 2 {
            return Err(Error::InsufficientSamples(format!(
                "a confidence interval needs at least 2 trials, got {}",
                trials
            )));
        }
        let mut distinct = seeds.clone();
        distinct.sort_unstable();
        distinct.dedup();
        if distinct.len() != trials {
            return Err(Error::InvalidConfig(format!(
                "trial seeds must be distinct, got {} repeated",
                trials - distinct.len()
            )));
        }
        if !(self.confidence_level > 0.0 && self.confidence_level < 1.0) {
            return Err(Error::InvalidConfig(format!(
                "confidence level must be in (0, 1), got {}",
                self.confidence_level
            )));
        }
        Ok(())
    }
}

/// Normal-approximation interval over per-trial values
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub mean: f64,
    /// Sample standard deviation (n - 1)
    pub std_dev: f64,
    pub lower: f64,
    pub upper: f64,
    pub level: f64,
    /// True iff the interval excludes zero
    pub significant: bool,
}

impl ConfidenceInterval {
    /// mean ± z·s/√n with z the two-sided normal quantile for `level`
    pub fn from_samples(samples: &[f64], level: f64) -> Result<Self> {
        let n = samples.len();
        if n < 2 {
            return Err(Error::InsufficientSamples(format!(
                "{} sample(s) cannot give an interval",
                n
            )));
        }
        let normal = Normal::new(0.0, 1.0).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        let z = normal.inverse_cdf((1.0 + level) / 2.0);
        if !z.is_finite() {
            return Err(Error::InvalidConfig(format!(
                "no normal quantile for confidence level {}",
                level
            )));
        }

        let mean = samples.iter().sum::<f64>() / n as f64;
        let variance = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
        let std_dev = variance.sqrt();
        let half_width = z * std_dev / (n as f64).sqrt();
        let (lower, upper) = (mean - half_width, mean + half_width);

        Ok(Self {
            mean,
            std_dev,
            lower,
            upper,
            level,
            significant: lower > 0.0 || upper < 0.0,
        })
    }

    pub fn contains(&self, value: f64) -> bool {
        self.lower <= value && value <= self.upper
    }
}

/// One leaf moved by a perturbation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterChange {
    pub path: ParameterPath,
    pub from: f64,
    pub to: f64,
}

/// Named bundle of additive deltas applied together
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    pub deltas: Vec<(ParameterPath, f64)>,
}

impl Scenario {
    pub fn new(name: &str, deltas: Vec<(ParameterPath, f64)>) -> Self {
        Self {
            name: name.to_string(),
            deltas,
        }
    }
}

/// Measured effect of one perturbation across all trials
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImpactReport {
    pub label: String,
    pub changes: Vec<ParameterChange>,
    pub trial_seeds: Vec<u64>,
    pub baseline_win_rates: Vec<f64>,
    pub perturbed_win_rates: Vec<f64>,
    /// Perturbed minus baseline point-win rate, per trial
    pub point_deltas: Vec<f64>,
    /// Same deltas carried through to set-win probability
    pub match_deltas: Vec<f64>,
    pub baseline_mean: f64,
    pub perturbed_mean: f64,
    pub point_impact: ConfidenceInterval,
    pub match_impact: ConfidenceInterval,
    /// Classified from the match-impact mean
    pub impact_level: ImpactLevel,
}

/// A perturbation that failed model validation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub label: String,
    pub reason: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SweepPoint {
    Measured { value: f64, report: ImpactReport },
    Rejected { value: f64, reason: String },
}

impl SweepPoint {
    pub fn value(&self) -> f64 {
        match self {
            SweepPoint::Measured { value, .. } | SweepPoint::Rejected { value, .. } => *value,
        }
    }
}

/// Range-mode result for one parameter
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SweepReport {
    pub path: ParameterPath,
    pub compensate: Option<ParameterPath>,
    pub base_value: f64,
    pub points: Vec<SweepPoint>,
    /// Max minus min of the measured point-impact means
    pub impact_range: f64,
    pub impact_level: ImpactLevel,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanEntry {
    pub path: ParameterPath,
    /// Sibling that gave up the probability mass
    pub compensate: ParameterPath,
    pub report: ImpactReport,
}

/// Every leaf nudged by the same delta, ranked by point impact
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SkillScan {
    pub delta: f64,
    pub ranked: Vec<ScanEntry>,
    pub rejected: Vec<Rejection>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScenarioScan {
    pub ranked: Vec<ImpactReport>,
    pub rejected: Vec<Rejection>,
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn by_point_impact(a: &ImpactReport, b: &ImpactReport) -> std::cmp::Ordering {
    b.point_impact
        .mean
        .abs()
        .total_cmp(&a.point_impact.mean.abs())
}

/// Measures perturbations of one team against a fixed opponent
pub struct SensitivityAnalyzer {
    team: ProbabilityModel,
    opponent: ProbabilityModel,
    config: SensitivityConfig,
    seeds: Vec<u64>,
    baseline: Vec<f64>,
}

impl SensitivityAnalyzer {
    /// Validates both teams and runs the baseline once per trial seed
    pub fn new(team: ProbabilityModel, opponent: ProbabilityModel, config: SensitivityConfig) -> Result<Self> {
        config.check()?;
        let mut config = config;
        config.simulation.retain_rallies = 0;
        let seeds = config.trial_seeds();

        let runner = SimulationRunner::new(team.clone(), opponent.clone(), config.simulation.clone())?;
        let mut analyzer = Self {
            team,
            opponent,
            config,
            seeds,
            baseline: Vec::new(),
        };
        analyzer.baseline = analyzer.win_rates(&runner)?;
        info!(
            "Baseline {} vs {}: {} trials of {} points",
            analyzer.team.name,
            analyzer.opponent.name,
            analyzer.seeds.len(),
            analyzer.config.points_per_test
        );
        Ok(analyzer)
    }

    pub fn config(&self) -> &SensitivityConfig {
        &self.config
    }

    /// Baseline point-win rate per trial
    pub fn baseline(&self) -> &[f64] {
        &self.baseline
    }

    fn win_rates(&self, runner: &SimulationRunner) -> Result<Vec<f64>> {
        let points = self.config.points_per_test;

        #[cfg(feature = "parallel")]
        let seeds = self.seeds.par_iter();
        #[cfg(not(feature = "parallel"))]
        let seeds = self.seeds.iter();

        seeds
            .map(|seed| -> Result<f64> {
                let rate = runner.run(points, *seed)?.win_rate(Team::A);
                debug!("Trial seed {}: win rate {:.4}", seed, rate);
                Ok(rate)
            })
            .collect()
    }

    /// Apply `deltas`, run every trial and summarize against the baseline
    fn measure(&self, label: String, deltas: &[(ParameterPath, f64)]) -> Result<ImpactReport> {
        let perturbed = self.team.with_deltas(deltas)?;
        let changes = deltas
            .iter()
            .map(|(path, _)| -> Result<ParameterChange> {
                Ok(ParameterChange {
                    path: path.clone(),
                    from: self.team.value_at(path)?,
                    to: perturbed.value_at(path)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let runner = SimulationRunner::new(perturbed, self.opponent.clone(), self.config.simulation.clone())?;
        let perturbed_rates = self.win_rates(&runner)?;

        let point_deltas: Vec<f64> = perturbed_rates
            .iter()
            .zip(&self.baseline)
            .map(|(p, b)| p - b)
            .collect();
        let match_deltas = self
            .baseline
            .iter()
            .zip(&perturbed_rates)
            .map(|(b, p)| self.config.race.match_delta(*b, *p))
            .collect::<Result<Vec<_>>>()?;

        let level = self.config.confidence_level;
        let point_impact = ConfidenceInterval::from_samples(&point_deltas, level)?;
        let match_impact = ConfidenceInterval::from_samples(&match_deltas, level)?;

        Ok(ImpactReport {
            label,
            changes,
            trial_seeds: self.seeds.clone(),
            baseline_mean: mean(&self.baseline),
            perturbed_mean: mean(&perturbed_rates),
            baseline_win_rates: self.baseline.clone(),
            perturbed_win_rates: perturbed_rates,
            point_deltas,
            match_deltas,
            impact_level: ImpactLevel::classify(match_impact.mean),
            point_impact,
            match_impact,
        })
    }

    fn compensated(
        path: &ParameterPath,
        delta: f64,
        compensate: Option<&ParameterPath>,
    ) -> Result<Vec<(ParameterPath, f64)>> {
        let mut deltas = vec![(path.clone(), delta)];
        if let Some(other) = compensate {
            if other == path {
                return Err(Error::InvalidParameterPath {
                    path: other.to_string(),
                    reason: "cannot compensate a parameter with itself".to_string(),
                });
            }
            deltas.push((other.clone(), -delta));
        }
        Ok(deltas)
    }

    /// Shift one leaf by `delta`, optionally taking the mass from `compensate`
    pub fn test_delta(
        &self,
        path: &ParameterPath,
        delta: f64,
        compensate: Option<&ParameterPath>,
    ) -> Result<ImpactReport> {
        self.team.value_at(path)?;
        let deltas = Self::compensated(path, delta, compensate)?;
        self.measure(path.to_string(), &deltas)
    }

    /// Set one leaf to `value`, optionally balancing through `compensate`
    pub fn test_value(
        &self,
        path: &ParameterPath,
        value: f64,
        compensate: Option<&ParameterPath>,
    ) -> Result<ImpactReport> {
        let current = self.team.value_at(path)?;
        self.test_delta(path, value - current, compensate)
    }

    pub fn test_scenario(&self, scenario: &Scenario) -> Result<ImpactReport> {
        self.measure(scenario.name.clone(), &scenario.deltas)
    }

    /// Test every value in `min..=max` by `step`
    pub fn sweep(
        &self,
        path: &ParameterPath,
        min: f64,
        max: f64,
        step: f64,
        compensate: Option<&ParameterPath>,
    ) -> Result<SweepReport> {
        if !(step > 0.0) || !(min <= max) {
            return Err(Error::InvalidConfig(format!(
                "sweep range {}..={} by {} is empty",
                min, max, step
            )));
        }
        let steps = ((max - min) / step + 1e-9).floor();
        if !steps.is_finite() || steps >= MAX_SWEEP_VALUES as f64 {
            return Err(Error::InvalidConfig(format!(
                "sweep of {} values exceeds the limit of {}",
                steps + 1.0,
                MAX_SWEEP_VALUES
            )));
        }
        let count = steps as usize + 1;
        let base_value = self.team.value_at(path)?;
        if let Some(other) = compensate {
            self.team.value_at(other)?;
        }

        let mut points = Vec::with_capacity(count);
        for k in 0..count {
            let value = min + k as f64 * step;
            let deltas = Self::compensated(path, value - base_value, compensate)?;
            match self.measure(path.to_string(), &deltas) {
                Ok(report) => points.push(SweepPoint::Measured { value, report }),
                Err(err) if err.is_invalid_distribution() => {
                    warn!("Sweep {} = {:.4} rejected: {}", path, value, err);
                    points.push(SweepPoint::Rejected {
                        value,
                        reason: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }

        let means: Vec<f64> = points
            .iter()
            .filter_map(|p| match p {
                SweepPoint::Measured { report, .. } => Some(report.point_impact.mean),
                SweepPoint::Rejected { .. } => None,
            })
            .collect();
        let impact_range = match (
            means.iter().copied().reduce(f64::min),
            means.iter().copied().reduce(f64::max),
        ) {
            (Some(lo), Some(hi)) => hi - lo,
            _ => 0.0,
        };

        Ok(SweepReport {
            path: path.clone(),
            compensate: compensate.cloned(),
            base_value,
            points,
            impact_range,
            impact_level: ImpactLevel::classify(impact_range),
        })
    }

    /// Largest other outcome in the same distribution
    fn largest_sibling(&self, path: &ParameterPath) -> Option<ParameterPath> {
        let distribution = self
            .team
            .distribution(path.category, path.condition.as_deref())
            .ok()?;
        let mut best: Option<(&str, f64)> = None;
        for (outcome, value) in distribution.iter() {
            if outcome == path.outcome {
                continue;
            }
            if best.map_or(true, |(_, v)| value > v) {
                best = Some((outcome, value));
            }
        }
        best.map(|(outcome, _)| path.sibling(outcome))
    }

    /// Move `delta` into every leaf from its largest sibling and rank the effects
    pub fn skill_scan(&self, delta: f64) -> Result<SkillScan> {
        let mut ranked = Vec::new();
        let mut rejected = Vec::new();

        for path in self.team.parameter_paths() {
            let Some(compensate) = self.largest_sibling(&path) else {
                rejected.push(Rejection {
                    label: path.to_string(),
                    reason: "no sibling outcome to compensate".to_string(),
                });
                continue;
            };
            let deltas = [(path.clone(), delta), (compensate.clone(), -delta)];
            match self.measure(path.to_string(), &deltas) {
                Ok(report) => ranked.push(ScanEntry {
                    path,
                    compensate,
                    report,
                }),
                Err(err) if err.is_invalid_distribution() => {
                    warn!("Skill scan {} rejected: {}", path, err);
                    rejected.push(Rejection {
                        label: path.to_string(),
                        reason: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }

        ranked.sort_by(|a, b| by_point_impact(&a.report, &b.report));
        info!(
            "Skill scan: {} measured, {} rejected",
            ranked.len(),
            rejected.len()
        );
        Ok(SkillScan {
            delta,
            ranked,
            rejected,
        })
    }

    /// Test each scenario and rank them by point impact
    pub fn scenario_scan(&self, scenarios: &[Scenario]) -> Result<ScenarioScan> {
        let mut ranked = Vec::new();
        let mut rejected = Vec::new();

        for scenario in scenarios {
            match self.test_scenario(scenario) {
                Ok(report) => ranked.push(report),
                Err(err) if err.is_invalid_distribution() => {
                    warn!("Scenario {} rejected: {}", scenario.name, err);
                    rejected.push(Rejection {
                        label: scenario.name.clone(),
                        reason: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }

        ranked.sort_by(by_point_impact);
        Ok(ScenarioScan { ranked, rejected })
    }
}
