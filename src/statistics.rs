use crate::error::{Error, Result};
use crate::simulation::{DurationStats, PairResult, SimulationResult};
use crate::types::{PointType, Team};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Rally length summary in number of touches
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DurationSummary {
    pub average: f64,
    pub min: u64,
    pub max: u64,
}

impl From<&DurationStats> for DurationSummary {
    fn from(stats: &DurationStats) -> Self {
        Self {
            average: stats.average(),
            min: stats.min,
            max: stats.max,
        }
    }
}

/// Per-team view of a run
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TeamSummary {
    pub wins: u64,
    pub win_rate: f64,
    pub win_percent: f64,
    /// How this team's points were won
    pub point_types: BTreeMap<PointType, u64>,
    pub serves: u64,
    /// Fraction of this team's serves that it converted
    pub serve_win_rate: f64,
}

/// Derived statistics for one `SimulationResult`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub total_points: u64,
    pub team_a: TeamSummary,
    pub team_b: TeamSummary,
    pub point_types: BTreeMap<PointType, u64>,
    pub point_type_percentages: BTreeMap<PointType, f64>,
    pub duration: DurationSummary,
    pub duration_by_type: BTreeMap<PointType, DurationSummary>,
    /// Fraction of all points won by the serving side
    pub server_win_rate: f64,
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn team_summary(result: &SimulationResult, team: Team) -> TeamSummary {
    let i = team.index();
    TeamSummary {
        wins: result.wins[i],
        win_rate: result.win_rate(team),
        win_percent: result.win_rate(team) * 100.0,
        point_types: result.point_types_by_team[i].clone(),
        serves: result.serves[i],
        serve_win_rate: ratio(result.serve_wins[i], result.serves[i]),
    }
}

/// Win rates, point-type shares, rally lengths and serving figures
pub fn summarize(result: &SimulationResult) -> Summary {
    let total = result.total_points;

    let point_type_percentages = result
        .point_types
        .iter()
        .map(|(point_type, count)| (*point_type, ratio(*count, total) * 100.0))
        .collect();

    let touches: u64 = result.durations.iter().map(|(d, count)| d * count).sum();
    let duration = DurationSummary {
        average: ratio(touches, total),
        min: result.durations.keys().next().copied().unwrap_or(0),
        max: result.durations.keys().next_back().copied().unwrap_or(0),
    };

    let duration_by_type = result
        .duration_by_type
        .iter()
        .map(|(point_type, stats)| (*point_type, DurationSummary::from(stats)))
        .collect();

    Summary {
        total_points: total,
        team_a: team_summary(result, Team::A),
        team_b: team_summary(result, Team::B),
        point_types: result.point_types.clone(),
        point_type_percentages,
        duration,
        duration_by_type,
        server_win_rate: ratio(result.serve_wins.iter().sum(), result.serves.iter().sum()),
    }
}

/// Team position in a round robin
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ranking {
    pub name: String,
    /// Mean win rate over every opponent faced
    pub average_win_rate: f64,
}

/// Pairwise point-win rates and the resulting ranking
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComparisonMatrix {
    pub teams: Vec<String>,
    /// `win_rates[i][j]`: rate of team i playing as A against team j as B
    pub win_rates: Vec<Vec<Option<f64>>>,
    pub rankings: Vec<Ranking>,
}

impl ComparisonMatrix {
    pub fn win_rate(&self, team: usize, opponent: usize) -> Option<f64> {
        self.win_rates.get(team)?.get(opponent).copied().flatten()
    }
}

/// Build the matrix from round-robin pairings; i -> j and j -> i are kept
/// as measured, not forced to sum to one
pub fn comparison_matrix(names: &[String], pairs: &[PairResult]) -> Result<ComparisonMatrix> {
    let n = names.len();
    if n < 2 {
        return Err(Error::InsufficientSamples(format!(
            "comparison needs at least two teams, got {}",
            n
        )));
    }

    let mut win_rates = vec![vec![None; n]; n];
    for pair in pairs {
        if pair.team_a >= n || pair.team_b >= n || pair.team_a == pair.team_b {
            return Err(Error::InvalidConfig(format!(
                "pairing {} vs {} does not fit {} teams",
                pair.team_a, pair.team_b, n
            )));
        }
        win_rates[pair.team_a][pair.team_b] = Some(pair.result.win_rate(Team::A));
    }

    let mut rankings: Vec<Ranking> = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let measured: Vec<f64> = win_rates[i].iter().flatten().copied().collect();
            let average_win_rate = if measured.is_empty() {
                0.0
            } else {
                measured.iter().sum::<f64>() / measured.len() as f64
            };
            Ranking {
                name: name.clone(),
                average_win_rate,
            }
        })
        .collect();
    rankings.sort_by(|a, b| b.average_win_rate.total_cmp(&a.average_win_rate));

    Ok(ComparisonMatrix {
        teams: names.to_vec(),
        win_rates,
        rankings,
    })
}
