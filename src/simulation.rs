use crate::error::{Error, Result};
use crate::model::ProbabilityModel;
use crate::rally::{coverage_gaps, RallyStateMachine};
use crate::sampler::RallySampler;
use crate::types::*;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Rally length statistics for one point type
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationStats {
    pub count: u64,
    pub total: u64,
    pub min: u64,
    pub max: u64,
}

impl DurationStats {
    fn record(&mut self, duration: u64) {
        if self.count == 0 || duration < self.min {
            self.min = duration;
        }
        self.max = self.max.max(duration);
        self.count += 1;
        self.total += duration;
    }

    fn merge(&mut self, other: &DurationStats) {
        if other.count == 0 {
            return;
        }
        self.min = if self.count == 0 {
            other.min
        } else {
            self.min.min(other.min)
        };
        self.max = self.max.max(other.max);
        self.count += other.count;
        self.total += other.total;
    }

    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total as f64 / self.count as f64
        }
    }
}

/// Aggregate of a batch of rallies. All counters are integers so merging
/// partial results gives the same totals in any order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    pub total_points: u64,
    /// Indexed by `Team::index`
    pub wins: [u64; 2],
    pub point_types: BTreeMap<PointType, u64>,
    /// Rally length -> count
    pub durations: BTreeMap<u64, u64>,
    pub duration_by_type: BTreeMap<PointType, DurationStats>,
    /// Point types per winning team
    pub point_types_by_team: [BTreeMap<PointType, u64>; 2],
    pub serves: [u64; 2],
    /// Points won by the serving side, per server
    pub serve_wins: [u64; 2],
    /// Lowest-index rallies kept for inspection
    pub rallies: Vec<Rally>,
    /// Cap on `rallies`; kept through JSON so a reloaded result merges like a live one
    #[serde(default)]
    retain_limit: usize,
}

impl SimulationResult {
    pub fn new(retain_limit: usize) -> Self {
        Self {
            retain_limit,
            ..Default::default()
        }
    }

    /// Fold one rally into the running totals
    pub fn record(&mut self, rally: Rally) {
        let duration = rally.duration() as u64;
        self.total_points += 1;
        self.wins[rally.winner.index()] += 1;
        *self.point_types.entry(rally.point_type).or_insert(0) += 1;
        *self.durations.entry(duration).or_insert(0) += 1;
        self.duration_by_type
            .entry(rally.point_type)
            .or_default()
            .record(duration);
        *self.point_types_by_team[rally.winner.index()]
            .entry(rally.point_type)
            .or_insert(0) += 1;
        self.serves[rally.serving_team.index()] += 1;
        if rally.winner == rally.serving_team {
            self.serve_wins[rally.serving_team.index()] += 1;
        }

        if self.rallies.len() < self.retain_limit {
            self.rallies.push(rally);
        }
    }

    /// Combine with another partial result; order of merging does not matter
    pub fn merge(&mut self, other: SimulationResult) {
        self.total_points += other.total_points;
        for team in [Team::A, Team::B] {
            let i = team.index();
            self.wins[i] += other.wins[i];
            self.serves[i] += other.serves[i];
            self.serve_wins[i] += other.serve_wins[i];
            for (point_type, count) in &other.point_types_by_team[i] {
                *self.point_types_by_team[i].entry(*point_type).or_insert(0) += count;
            }
        }
        for (point_type, count) in &other.point_types {
            *self.point_types.entry(*point_type).or_insert(0) += count;
        }
        for (duration, count) in &other.durations {
            *self.durations.entry(*duration).or_insert(0) += count;
        }
        for (point_type, stats) in &other.duration_by_type {
            self.duration_by_type
                .entry(*point_type)
                .or_default()
                .merge(stats);
        }

        self.retain_limit = self.retain_limit.max(other.retain_limit);
        self.rallies.extend(other.rallies);
        self.rallies.sort_by_key(|r| r.index);
        self.rallies.truncate(self.retain_limit);
    }

    pub fn wins_for(&self, team: Team) -> u64 {
        self.wins[team.index()]
    }

    /// Fraction of points won by `team`; 0 for an empty result
    pub fn win_rate(&self, team: Team) -> f64 {
        if self.total_points == 0 {
            0.0
        } else {
            self.wins_for(team) as f64 / self.total_points as f64
        }
    }

    pub fn point_type_count(&self, point_type: PointType) -> u64 {
        self.point_types.get(&point_type).copied().unwrap_or(0)
    }
}

/// Runs batches of independent rallies between two validated teams
pub struct SimulationRunner {
    team_a: ProbabilityModel,
    team_b: ProbabilityModel,
    config: SimulationConfig,
}

impl SimulationRunner {
    /// Rejects invalid or incomplete teams before any rally is played
    pub fn new(team_a: ProbabilityModel, team_b: ProbabilityModel, config: SimulationConfig) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be positive".to_string()));
        }
        if config.max_touches == 0 {
            return Err(Error::InvalidConfig("max_touches must be positive".to_string()));
        }
        team_a.ensure_valid()?;
        team_b.ensure_valid()?;
        if let Some(gap) = coverage_gaps(&team_a, &team_b).into_iter().next() {
            return Err(gap);
        }

        Ok(Self {
            team_a,
            team_b,
            config,
        })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn team(&self, team: Team) -> &ProbabilityModel {
        match team {
            Team::A => &self.team_a,
            Team::B => &self.team_b,
        }
    }

    /// Run `points` rallies; rally `i` is seeded with `seed + i`
    pub fn run(&self, points: u64, seed: u64) -> Result<SimulationResult> {
        let result = self.run_range(seed, 0, points)?;
        info!(
            "Simulated {} points ({} vs {}): A won {:.1}%",
            result.total_points,
            self.team_a.name,
            self.team_b.name,
            result.win_rate(Team::A) * 100.0
        );
        Ok(result)
    }

    /// Run rallies `start..start + count` of the run seeded with `seed`.
    ///
    /// Hosts call this repeatedly and `merge` the results to stay interruptible
    /// between batches.
    pub fn run_range(&self, seed: u64, start: u64, count: u64) -> Result<SimulationResult> {
        self.fold_range(seed, start, start.saturating_add(count))
    }

    /// Chunk the range by `batch_size` and reduce the partial results
    #[cfg(feature = "parallel")]
    fn fold_range(&self, seed: u64, start: u64, end: u64) -> Result<SimulationResult> {
        let batch = self.config.batch_size as u64;
        let chunks: Vec<(u64, u64)> = (start..end)
            .step_by(self.config.batch_size)
            .map(|from| (from, from.saturating_add(batch).min(end)))
            .collect();
        let limit = self.config.retain_rallies;

        chunks
            .into_par_iter()
            .map(|(from, to)| self.run_chunk(seed, from, to))
            .try_reduce(
                || SimulationResult::new(limit),
                |mut acc, part| {
                    acc.merge(part);
                    Ok(acc)
                },
            )
    }

    #[cfg(not(feature = "parallel"))]
    fn fold_range(&self, seed: u64, start: u64, end: u64) -> Result<SimulationResult> {
        self.run_chunk(seed, start, end)
    }

    /// Sequential rallies `from..to`
    fn run_chunk(&self, seed: u64, from: u64, to: u64) -> Result<SimulationResult> {
        let machine = RallyStateMachine::new(&self.team_a, &self.team_b, self.config.max_touches);
        let mut result = SimulationResult::new(self.config.retain_rallies);

        for index in from..to {
            let mut sampler = RallySampler::for_rally(seed, index);
            let serving = self.config.rotation.server_for(index);
            result.record(machine.play(index, serving, &mut sampler)?);
        }

        debug!("Chunk {}..{} done (seed {})", from, to, seed);
        Ok(result)
    }
}

/// One ordered pairing from a round robin
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PairResult {
    /// Index of the side playing as team A
    pub team_a: usize,
    pub team_b: usize,
    pub result: SimulationResult,
}

/// Every ordered pair (i as A, j as B), i != j, each on its own seed block
pub fn round_robin(
    teams: &[ProbabilityModel],
    points: u64,
    seed: u64,
    config: &SimulationConfig,
) -> Result<Vec<PairResult>> {
    if teams.len() < 2 {
        return Err(Error::InsufficientSamples(format!(
            "round robin needs at least two teams, got {}",
            teams.len()
        )));
    }

    let mut pairs = Vec::with_capacity(teams.len() * (teams.len() - 1));
    let mut pair_index: u64 = 0;
    for (i, team_a) in teams.iter().enumerate() {
        for (j, team_b) in teams.iter().enumerate() {
            if i == j {
                continue;
            }
            let runner = SimulationRunner::new(team_a.clone(), team_b.clone(), config.clone())?;
            let pair_seed = seed.wrapping_add(pair_index.wrapping_mul(points));
            pairs.push(PairResult {
                team_a: i,
                team_b: j,
                result: runner.run(points, pair_seed)?,
            });
            pair_index += 1;
        }
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ParameterPath;

    fn create_test_runner(retain: usize) -> SimulationRunner {
        let config = SimulationConfig {
            retain_rallies: retain,
            batch_size: 256,
            ..Default::default()
        };
        SimulationRunner::new(
            ProbabilityModel::basic_template("A"),
            ProbabilityModel::basic_template("B"),
            config,
        )
        .unwrap()
    }

    #[test]
    fn test_identical_seeds_identical_results() {
        let runner = create_test_runner(10);
        let first = runner.run(2_000, 99).unwrap();
        let second = runner.run(2_000, 99).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );

        let other = runner.run(2_000, 100).unwrap();
        assert_ne!(first.rallies, other.rallies);
    }

    #[test]
    fn test_prefix_stability() {
        let runner = create_test_runner(1_000);
        let short = runner.run(1_000, 7).unwrap();
        let long = runner.run(5_000, 7).unwrap();

        // Same first 1000 rallies, in index order
        assert_eq!(short.rallies.len(), 1_000);
        assert_eq!(short.rallies, long.rallies);
        assert_eq!(long.rallies.last().unwrap().index, 999);
        assert_eq!(long.total_points, 5_000);
    }

    #[test]
    fn test_end_to_end_serve_override() {
        let path = |s: &str| s.parse::<ParameterPath>().unwrap();
        let team_a = ProbabilityModel::basic_template("Aces")
            .with_override(&path("serve_probabilities.ace"), 0.15)
            .unwrap()
            .with_override(&path("serve_probabilities.in_play"), 0.80)
            .unwrap()
            .with_override(&path("serve_probabilities.error"), 0.05)
            .unwrap();
        let runner = SimulationRunner::new(
            team_a,
            ProbabilityModel::basic_template("Default"),
            SimulationConfig::default(),
        )
        .unwrap();

        let result = runner.run(10_000, 12345).unwrap();
        assert_eq!(result.total_points, 10_000);
        assert_eq!(result.wins_for(Team::A) + result.wins_for(Team::B), 10_000);

        let rerun = runner.run(10_000, 12345).unwrap();
        assert_eq!(rerun.wins, result.wins);

        // Better serving shows up as more A points
        assert!(result.win_rate(Team::A) > 0.5);
    }

    #[test]
    fn test_merged_batches_match_single_run() {
        let runner = create_test_runner(50);
        let whole = runner.run(5_000, 42).unwrap();

        let mut first = runner.run_range(42, 3_000, 2_000).unwrap();
        let second = runner.run_range(42, 0, 3_000).unwrap();
        first.merge(second);
        assert_eq!(first, whole);
    }

    #[test]
    fn test_reloaded_result_keeps_retained_rallies() {
        let runner = create_test_runner(50);
        let whole = runner.run(2_000, 8).unwrap();

        let json = serde_json::to_string(&runner.run_range(8, 0, 1_000).unwrap()).unwrap();
        let mut reloaded: SimulationResult = serde_json::from_str(&json).unwrap();
        assert_eq!(reloaded.rallies.len(), 50);

        reloaded.merge(runner.run_range(8, 1_000, 1_000).unwrap());
        assert_eq!(reloaded.rallies.len(), 50);
        assert_eq!(reloaded, whole);
    }

    #[test]
    fn test_chunked_matches_sequential() {
        let runner = create_test_runner(20);
        let chunked = runner.run_range(5, 0, 3_000).unwrap();
        let sequential = runner.run_chunk(5, 0, 3_000).unwrap();
        assert_eq!(chunked, sequential);
    }

    #[test]
    fn test_counters_are_consistent() {
        let runner = create_test_runner(0);
        let result = runner.run(4_000, 1).unwrap();

        assert!(result.rallies.is_empty());
        assert_eq!(result.point_types.values().sum::<u64>(), 4_000);
        assert_eq!(result.durations.values().sum::<u64>(), 4_000);
        assert_eq!(result.serves, [2_000, 2_000]);
        for team in [Team::A, Team::B] {
            let by_team: u64 = result.point_types_by_team[team.index()].values().sum();
            assert_eq!(by_team, result.wins_for(team));
        }
        let stats = &result.duration_by_type[&PointType::Ace];
        assert_eq!((stats.min, stats.max), (1, 1));
        assert_eq!(stats.count, result.point_type_count(PointType::Ace));
        assert!((result.win_rate(Team::A) + result.win_rate(Team::B) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_fixed_rotation() {
        let config = SimulationConfig {
            rotation: ServeRotation::Fixed(Team::B),
            retain_rallies: 5,
            ..Default::default()
        };
        let runner = SimulationRunner::new(
            ProbabilityModel::basic_template("A"),
            ProbabilityModel::basic_template("B"),
            config,
        )
        .unwrap();
        let result = runner.run(500, 3).unwrap();
        assert_eq!(result.serves, [0, 500]);
        assert!(result.rallies.iter().all(|r| r.serving_team == Team::B));
    }

    #[test]
    fn test_rejects_invalid_teams() {
        let broken = ProbabilityModel::basic_template("Broken")
            .with_override(&"serve_probabilities.ace".parse().unwrap(), 0.5)
            .unwrap();
        let err = SimulationRunner::new(
            broken,
            ProbabilityModel::basic_template("B"),
            SimulationConfig::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::InvalidProbabilityDistribution { .. }));

        let json = ProbabilityModel::basic_template("Gap")
            .to_json()
            .unwrap()
            .replace("deflected_defense", "deflected_defence");
        let gap = ProbabilityModel::from_json(&json).unwrap();
        let err = SimulationRunner::new(
            ProbabilityModel::basic_template("A"),
            gap,
            SimulationConfig::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::UnknownConditionKey { ref condition, .. } if condition == "deflected_defense"));
    }

    #[test]
    fn test_round_robin_pairs() {
        let teams = vec![
            ProbabilityModel::basic_template("One"),
            ProbabilityModel::basic_template("Two"),
            ProbabilityModel::basic_template("Three"),
        ];
        let pairs = round_robin(&teams, 300, 11, &SimulationConfig::default()).unwrap();
        assert_eq!(pairs.len(), 6);
        assert!(pairs.iter().all(|p| p.team_a != p.team_b));
        assert!(pairs.iter().all(|p| p.result.total_points == 300));

        assert!(round_robin(&teams[..1], 300, 11, &SimulationConfig::default()).is_err());
    }
}
