pub mod amplifier;
pub mod error;
pub mod model;
pub mod rally;
pub mod sampler;
pub mod sensitivity;
pub mod simulation;
pub mod statistics;
pub mod types;

pub use error::{Error, Result};
pub use model::{Category, ConditionalTable, Distribution, ParameterPath, ProbabilityModel};
pub use rally::RallyStateMachine;
pub use sampler::{RallySampler, Sampler};
pub use sensitivity::{ConfidenceInterval, ImpactReport, Scenario, SensitivityAnalyzer, SensitivityConfig};
pub use simulation::{SimulationResult, SimulationRunner};
pub use types::*;

use amplifier::RaceConfig;
use statistics::{comparison_matrix, summarize};
use wasm_bindgen::prelude::*;

/// Initialize panic hook for better error messages
#[wasm_bindgen(start)]
pub fn init() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

fn to_js(err: Error) -> JsValue {
    JsValue::from_str(&err.to_string())
}

/// Team from JSON; the basic template when the string is blank
fn parse_team(json: &str, fallback_name: &str) -> Result<ProbabilityModel> {
    if json.trim().is_empty() {
        Ok(ProbabilityModel::basic_template(fallback_name))
    } else {
        ProbabilityModel::from_json(json)
    }
}

fn parse_config<T: Default + serde::de::DeserializeOwned>(json: &str) -> Result<T> {
    if json.trim().is_empty() {
        Ok(T::default())
    } else {
        Ok(serde_json::from_str(json)?)
    }
}

fn parse_path(path: &str) -> Result<Option<ParameterPath>> {
    if path.trim().is_empty() {
        Ok(None)
    } else {
        path.trim().parse::<ParameterPath>().map(Some)
    }
}

/// WASM-exposed incremental rally runner
#[wasm_bindgen]
pub struct SimulationEngine {
    runner: SimulationRunner,
    seed: u64,
    result: SimulationResult,
}

impl SimulationEngine {
    pub fn with_teams(seed: u64, team_a_json: &str, team_b_json: &str, config_json: &str) -> Result<Self> {
        let config: SimulationConfig = parse_config(config_json)?;
        let retain = config.retain_rallies;
        let runner = SimulationRunner::new(
            parse_team(team_a_json, "Team A")?,
            parse_team(team_b_json, "Team B")?,
            config,
        )?;
        Ok(Self {
            runner,
            seed,
            result: SimulationResult::new(retain),
        })
    }

    /// Play the next `points` rallies of the run and fold them in
    pub fn advance(&mut self, points: u64) -> Result<()> {
        let batch = self
            .runner
            .run_range(self.seed, self.result.total_points, points)?;
        self.result.merge(batch);
        Ok(())
    }

    pub fn result(&self) -> &SimulationResult {
        &self.result
    }
}

#[wasm_bindgen]
impl SimulationEngine {
    /// Create an engine with two default teams
    #[wasm_bindgen(constructor)]
    pub fn new(seed: u64) -> Result<SimulationEngine, JsValue> {
        SimulationEngine::with_teams(seed, "", "", "").map_err(to_js)
    }

    /// Create with custom teams and run config; blank strings use defaults
    pub fn new_with_teams(
        seed: u64,
        team_a_json: &str,
        team_b_json: &str,
        config_json: &str,
    ) -> Result<SimulationEngine, JsValue> {
        SimulationEngine::with_teams(seed, team_a_json, team_b_json, config_json).map_err(to_js)
    }

    /// Run the next batch of points
    pub fn run(&mut self, points: u64) -> Result<(), JsValue> {
        self.advance(points).map_err(to_js)
    }

    /// Get points played so far
    pub fn get_points_played(&self) -> u64 {
        self.result.total_points
    }

    /// Get raw counters as JSON
    pub fn get_result(&self) -> String {
        serde_json::to_string(&self.result).unwrap_or_default()
    }

    /// Get derived statistics as JSON
    pub fn get_stats(&self) -> String {
        serde_json::to_string(&summarize(&self.result)).unwrap_or_default()
    }

    /// Get retained rallies in compact notation
    pub fn get_rallies(&self) -> String {
        let rallies: Vec<String> = self.result.rallies.iter().map(|r| r.to_string()).collect();
        serde_json::to_string(&rallies).unwrap_or_default()
    }

    /// Reset statistics (keep teams and seed)
    pub fn reset_stats(&mut self) {
        self.result = SimulationResult::new(self.runner.config().retain_rallies);
    }

    /// Get default run config as JSON
    pub fn get_default_config() -> String {
        serde_json::to_string(&SimulationConfig::default()).unwrap_or_default()
    }
}

pub fn sensitivity_json(
    team_json: &str,
    opponent_json: &str,
    path: &str,
    delta: f64,
    compensate: &str,
    config_json: &str,
) -> Result<String> {
    let analyzer = SensitivityAnalyzer::new(
        parse_team(team_json, "Team")?,
        parse_team(opponent_json, "Opponent")?,
        parse_config(config_json)?,
    )?;
    let path: ParameterPath = path.trim().parse()?;
    let report = analyzer.test_delta(&path, delta, parse_path(compensate)?.as_ref())?;
    Ok(serde_json::to_string(&report)?)
}

#[allow(clippy::too_many_arguments)]
pub fn sweep_json(
    team_json: &str,
    opponent_json: &str,
    path: &str,
    min: f64,
    max: f64,
    step: f64,
    compensate: &str,
    config_json: &str,
) -> Result<String> {
    let analyzer = SensitivityAnalyzer::new(
        parse_team(team_json, "Team")?,
        parse_team(opponent_json, "Opponent")?,
        parse_config(config_json)?,
    )?;
    let path: ParameterPath = path.trim().parse()?;
    let report = analyzer.sweep(&path, min, max, step, parse_path(compensate)?.as_ref())?;
    Ok(serde_json::to_string(&report)?)
}

pub fn skill_scan_json(team_json: &str, opponent_json: &str, delta: f64, config_json: &str) -> Result<String> {
    let analyzer = SensitivityAnalyzer::new(
        parse_team(team_json, "Team")?,
        parse_team(opponent_json, "Opponent")?,
        parse_config(config_json)?,
    )?;
    Ok(serde_json::to_string(&analyzer.skill_scan(delta)?)?)
}

pub fn scenarios_json(
    team_json: &str,
    opponent_json: &str,
    scenario_list_json: &str,
    config_json: &str,
) -> Result<String> {
    let scenarios: Vec<Scenario> = serde_json::from_str(scenario_list_json)?;
    let analyzer = SensitivityAnalyzer::new(
        parse_team(team_json, "Team")?,
        parse_team(opponent_json, "Opponent")?,
        parse_config(config_json)?,
    )?;
    Ok(serde_json::to_string(&analyzer.scenario_scan(&scenarios)?)?)
}

pub fn compare_json(teams_json: &str, points: u64, seed: u64, config_json: &str) -> Result<String> {
    let teams: Vec<ProbabilityModel> = serde_json::from_str(teams_json)?;
    let config: SimulationConfig = parse_config(config_json)?;
    let pairs = simulation::round_robin(&teams, points, seed, &config)?;
    let names: Vec<String> = teams.iter().map(|t| t.name.clone()).collect();
    Ok(serde_json::to_string(&comparison_matrix(&names, &pairs)?)?)
}

/// Test one parameter change against an opponent
#[wasm_bindgen]
pub fn run_sensitivity(
    team_json: &str,
    opponent_json: &str,
    path: &str,
    delta: f64,
    compensate: &str,
    config_json: &str,
) -> Result<String, JsValue> {
    sensitivity_json(team_json, opponent_json, path, delta, compensate, config_json).map_err(to_js)
}

/// Run a parameter sweep experiment
#[wasm_bindgen]
#[allow(clippy::too_many_arguments)]
pub fn run_sweep(
    team_json: &str,
    opponent_json: &str,
    path: &str,
    min: f64,
    max: f64,
    step: f64,
    compensate: &str,
    config_json: &str,
) -> Result<String, JsValue> {
    sweep_json(team_json, opponent_json, path, min, max, step, compensate, config_json).map_err(to_js)
}

/// Nudge every skill by `delta` and rank the effects
#[wasm_bindgen]
pub fn run_skill_scan(
    team_json: &str,
    opponent_json: &str,
    delta: f64,
    config_json: &str,
) -> Result<String, JsValue> {
    skill_scan_json(team_json, opponent_json, delta, config_json).map_err(to_js)
}

/// Rank named improvement scenarios
#[wasm_bindgen]
pub fn run_scenarios(
    team_json: &str,
    opponent_json: &str,
    scenario_list_json: &str,
    config_json: &str,
) -> Result<String, JsValue> {
    scenarios_json(team_json, opponent_json, scenario_list_json, config_json).map_err(to_js)
}

/// Round-robin comparison of a JSON array of teams
#[wasm_bindgen]
pub fn compare_teams(teams_json: &str, points: u64, seed: u64, config_json: &str) -> Result<String, JsValue> {
    compare_json(teams_json, points, seed, config_json).map_err(to_js)
}

/// Chance of winning a set to 21 (or `target`) given the point-win chance
#[wasm_bindgen]
pub fn set_win_probability(p: f64, target: u32) -> Result<f64, JsValue> {
    let race = RaceConfig {
        target,
        ..RaceConfig::default()
    };
    race.win_probability(p).map_err(to_js)
}

/// Get the basic team template as JSON
#[wasm_bindgen]
pub fn default_team(name: &str) -> String {
    ProbabilityModel::basic_template(name)
        .to_json()
        .unwrap_or_default()
}
