use serde::{Deserialize, Serialize};
use std::fmt;

/// Side of the net
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Team {
    A,
    B,
}

impl Team {
    pub fn other(self) -> Team {
        match self {
            Team::A => Team::B,
            Team::B => Team::A,
        }
    }

    /// Slot in per-team arrays (A = 0, B = 1)
    pub fn index(self) -> usize {
        match self {
            Team::A => 0,
            Team::B => 1,
        }
    }
}

impl fmt::Display for Team {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Team::A => write!(f, "A"),
            Team::B => write!(f, "B"),
        }
    }
}

/// Kind of ball contact
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Serve,
    Receive,
    Set,
    Attack,
    Block,
    Dig,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Serve => "serve",
            Action::Receive => "receive",
            Action::Set => "set",
            Action::Attack => "attack",
            Action::Block => "block",
            Action::Dig => "dig",
        }
    }

    fn abbrev(&self) -> &'static str {
        match self {
            Action::Serve => "srv",
            Action::Receive => "rcv",
            Action::Set => "set",
            Action::Attack => "att",
            Action::Block => "blk",
            Action::Dig => "dig",
        }
    }
}

/// How a rally ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointType {
    Ace,
    Kill,
    ServeError,
    AttackError,
    ReceiveError,
    SetError,
    Stuff,
    DigError,
}

impl PointType {
    pub const ALL: [PointType; 8] = [
        PointType::Ace,
        PointType::Kill,
        PointType::ServeError,
        PointType::AttackError,
        PointType::ReceiveError,
        PointType::SetError,
        PointType::Stuff,
        PointType::DigError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PointType::Ace => "ace",
            PointType::Kill => "kill",
            PointType::ServeError => "serve_error",
            PointType::AttackError => "attack_error",
            PointType::ReceiveError => "receive_error",
            PointType::SetError => "set_error",
            PointType::Stuff => "stuff",
            PointType::DigError => "dig_error",
        }
    }

    /// Whether the point was won by the team that made the final touch
    pub fn is_winning_touch(&self) -> bool {
        matches!(self, PointType::Ace | PointType::Kill | PointType::Stuff)
    }
}

impl fmt::Display for PointType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One touch of the ball
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RallyState {
    pub team: Team,
    pub action: Action,
    /// Outcome label drawn from the team's distribution
    pub quality: String,
}

impl RallyState {
    pub fn new(team: Team, action: Action, quality: impl Into<String>) -> Self {
        Self {
            team,
            action,
            quality: quality.into(),
        }
    }
}

/// A complete point from serve to conclusion
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rally {
    /// Position of this rally within its run (also its sub-seed offset)
    pub index: u64,
    pub serving_team: Team,
    pub winner: Team,
    pub point_type: PointType,
    pub states: Vec<RallyState>,
}

impl Rally {
    pub fn duration(&self) -> usize {
        self.states.len()
    }
}

fn quality_abbrev(quality: &str) -> &str {
    match quality {
        "excellent" => "exc",
        "good" => "gd",
        "poor" => "pr",
        "error" => "err",
        "in_play" => "ok",
        "defended" => "def",
        "deflection_to_attack" => "def→att",
        "deflection_to_defense" => "def→def",
        "no_touch" => "miss",
        other => other,
    }
}

/// Compact notation, e.g. `[B] A→srv(ok)→B→rcv(gd)→B→set(exc)→B→att(kill) → kill`
impl fmt::Display for Rally {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}] ", self.winner)?;
        for (i, state) in self.states.iter().enumerate() {
            if i > 0 {
                write!(f, "→")?;
            }
            write!(
                f,
                "{}→{}({})",
                state.team,
                state.action.abbrev(),
                quality_abbrev(&state.quality)
            )?;
        }
        write!(f, " → {}", self.point_type)
    }
}

/// Which side serves each rally of a run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServeRotation {
    /// The same team serves every rally
    Fixed(Team),
    /// Even indices served by `first`, odd indices by the other team
    Alternate { first: Team },
}

impl ServeRotation {
    pub fn server_for(&self, index: u64) -> Team {
        match *self {
            ServeRotation::Fixed(team) => team,
            ServeRotation::Alternate { first } => {
                if index % 2 == 0 {
                    first
                } else {
                    first.other()
                }
            }
        }
    }
}

impl Default for ServeRotation {
    fn default() -> Self {
        ServeRotation::Alternate { first: Team::A }
    }
}

/// Simulation run parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Serving side per rally
    pub rotation: ServeRotation,
    /// Keep at most this many rallies (lowest indices) in the result
    pub retain_rallies: usize,
    /// Touch cap per rally; only degenerate tables ever reach it
    pub max_touches: usize,
    /// Rallies per worker chunk when running in parallel
    pub batch_size: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            rotation: ServeRotation::default(),
            retain_rallies: 0,
            max_touches: 500,
            batch_size: 4096,
        }
    }
}

/// Magnitude bucket for a win-probability change
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ImpactLevel {
    Low,
    Medium,
    High,
}

impl ImpactLevel {
    /// Below 2 percentage points is LOW, above 5 is HIGH
    pub fn classify(magnitude: f64) -> ImpactLevel {
        let magnitude = magnitude.abs();
        if magnitude < 0.02 {
            ImpactLevel::Low
        } else if magnitude <= 0.05 {
            ImpactLevel::Medium
        } else {
            ImpactLevel::High
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alternate_rotation() {
        let rotation = ServeRotation::Alternate { first: Team::B };
        assert_eq!(rotation.server_for(0), Team::B);
        assert_eq!(rotation.server_for(1), Team::A);
        assert_eq!(rotation.server_for(10), Team::B);
        assert_eq!(ServeRotation::Fixed(Team::A).server_for(7), Team::A);
    }

    #[test]
    fn test_rally_notation() {
        let rally = Rally {
            index: 0,
            serving_team: Team::A,
            winner: Team::B,
            point_type: PointType::Kill,
            states: vec![
                RallyState::new(Team::A, Action::Serve, "in_play"),
                RallyState::new(Team::B, Action::Receive, "good"),
                RallyState::new(Team::B, Action::Set, "excellent"),
                RallyState::new(Team::B, Action::Attack, "kill"),
            ],
        };
        assert_eq!(rally.duration(), 4);
        assert_eq!(
            rally.to_string(),
            "[B] A→srv(ok)→B→rcv(gd)→B→set(exc)→B→att(kill) → kill"
        );
    }

    #[test]
    fn test_impact_thresholds() {
        assert_eq!(ImpactLevel::classify(0.0199), ImpactLevel::Low);
        assert_eq!(ImpactLevel::classify(-0.03), ImpactLevel::Medium);
        assert_eq!(ImpactLevel::classify(0.05), ImpactLevel::Medium);
        assert_eq!(ImpactLevel::classify(0.0501), ImpactLevel::High);
    }

    #[test]
    fn test_point_type_serializes_snake_case() {
        let json = serde_json::to_string(&PointType::ServeError).unwrap();
        assert_eq!(json, "\"serve_error\"");
        assert_eq!(
            serde_json::to_string(&ImpactLevel::Medium).unwrap(),
            "\"MEDIUM\""
        );
    }
}
