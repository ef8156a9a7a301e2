//! Rally state machine: one point from serve to conclusion.

use crate::error::{Error, Result};
use crate::model::{Category, ProbabilityModel};
use crate::sampler::Sampler;
use crate::types::{Action, PointType, Rally, RallyState, Team};

pub const POWER_ATTACK: &str = "power_attack";
pub const UNBLOCKED_ATTACK: &str = "unblocked_attack";
pub const DEFLECTED_ATTACK: &str = "deflected_attack";
pub const DEFLECTED_DEFENSE: &str = "deflected_defense";

/// Condition key for a receive following serve outcome `quality`
pub fn serve_key(quality: &str) -> String {
    format!("{}_serve", quality)
}

/// Condition key for a set following a receive or dig of `quality`
pub fn reception_key(quality: &str) -> String {
    format!("{}_reception", quality)
}

/// Condition key for an attack following a set of `quality`
pub fn set_key(quality: &str) -> String {
    format!("{}_set", quality)
}

/// The four modeled block outcomes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockOutcome {
    Stuff,
    DeflectionToAttack,
    DeflectionToDefense,
    NoTouch,
}

impl BlockOutcome {
    pub fn parse(label: &str) -> Option<BlockOutcome> {
        match label {
            "stuff" => Some(BlockOutcome::Stuff),
            "deflection_to_attack" => Some(BlockOutcome::DeflectionToAttack),
            "deflection_to_defense" => Some(BlockOutcome::DeflectionToDefense),
            "no_touch" => Some(BlockOutcome::NoTouch),
            _ => None,
        }
    }
}

fn category_of(action: Action) -> Category {
    match action {
        Action::Serve => Category::Serve,
        Action::Receive => Category::Receive,
        Action::Set => Category::Set,
        Action::Attack => Category::Attack,
        Action::Block => Category::Block,
        Action::Dig => Category::Dig,
    }
}

/// What follows a sampled touch
#[derive(Clone, Debug, PartialEq)]
enum Transition {
    Point { winner: Team, point_type: PointType },
    Touch { team: Team, action: Action, condition: String },
}

fn point(winner: Team, point_type: PointType) -> Result<Transition> {
    Ok(Transition::Point { winner, point_type })
}

fn touch(team: Team, action: Action, condition: String) -> Result<Transition> {
    Ok(Transition::Touch {
        team,
        action,
        condition,
    })
}

/// Transition for `team` having produced `outcome` on `action`
fn transition(team: Team, action: Action, outcome: &str) -> Result<Transition> {
    match (action, outcome) {
        (Action::Serve, "ace") => point(team, PointType::Ace),
        (Action::Serve, "error") => point(team.other(), PointType::ServeError),
        (Action::Serve, q) => touch(team.other(), Action::Receive, serve_key(q)),

        (Action::Receive, "error") => point(team.other(), PointType::ReceiveError),
        (Action::Receive, q) => touch(team, Action::Set, reception_key(q)),

        (Action::Set, "error") => point(team.other(), PointType::SetError),
        (Action::Set, q) => touch(team, Action::Attack, set_key(q)),

        (Action::Attack, "kill") => point(team, PointType::Kill),
        (Action::Attack, "error") => point(team.other(), PointType::AttackError),
        (Action::Attack, _) => touch(team.other(), Action::Block, POWER_ATTACK.to_string()),

        (Action::Block, label) => match BlockOutcome::parse(label) {
            Some(BlockOutcome::Stuff) => point(team, PointType::Stuff),
            Some(BlockOutcome::NoTouch) => touch(team, Action::Dig, UNBLOCKED_ATTACK.to_string()),
            // Ball stays on the attacker's side
            Some(BlockOutcome::DeflectionToAttack) => {
                touch(team.other(), Action::Dig, DEFLECTED_ATTACK.to_string())
            }
            // The block counted as a touch; no dig allowed
            Some(BlockOutcome::DeflectionToDefense) => {
                touch(team, Action::Set, DEFLECTED_DEFENSE.to_string())
            }
            None => Err(Error::UnknownOutcome {
                category: Category::Block.field_name().to_string(),
                outcome: label.to_string(),
            }),
        },

        (Action::Dig, "error") => point(team.other(), PointType::DigError),
        (Action::Dig, q) => touch(team, Action::Set, reception_key(q)),
    }
}

/// Plays single rallies between two fixed teams
pub struct RallyStateMachine<'m> {
    teams: [&'m ProbabilityModel; 2],
    max_touches: usize,
}

impl<'m> RallyStateMachine<'m> {
    pub fn new(team_a: &'m ProbabilityModel, team_b: &'m ProbabilityModel, max_touches: usize) -> Self {
        Self {
            teams: [team_a, team_b],
            max_touches,
        }
    }

    fn model(&self, team: Team) -> &'m ProbabilityModel {
        self.teams[team.index()]
    }

    /// Run one rally to completion using only `sampler` for randomness
    pub fn play<S: Sampler>(&self, index: u64, serving: Team, sampler: &mut S) -> Result<Rally> {
        let mut states = Vec::with_capacity(8);
        let mut team = serving;
        let mut action = Action::Serve;
        let mut condition: Option<String> = None;

        loop {
            if states.len() >= self.max_touches {
                return Err(Error::RallyLimitExceeded {
                    index,
                    limit: self.max_touches,
                });
            }

            let category = category_of(action);
            let distribution = self
                .model(team)
                .distribution(category, condition.as_deref())?;
            let outcome = sampler.sample(distribution).ok_or_else(|| {
                Error::InvalidProbabilityDistribution {
                    location: match &condition {
                        Some(c) => format!("{}.{}", category, c),
                        None => category.to_string(),
                    },
                    sum: distribution.sum(),
                }
            })?;
            states.push(RallyState::new(team, action, outcome));

            match transition(team, action, outcome)? {
                Transition::Point { winner, point_type } => {
                    return Ok(Rally {
                        index,
                        serving_team: serving,
                        winner,
                        point_type,
                        states,
                    });
                }
                Transition::Touch {
                    team: next_team,
                    action: next_action,
                    condition: next_condition,
                } => {
                    team = next_team;
                    action = next_action;
                    condition = Some(next_condition);
                }
            }
        }
    }
}

fn non_error_labels(model: &ProbabilityModel, category: Category) -> Vec<&str> {
    let mut labels: Vec<&str> = Vec::new();
    match model.table(category) {
        None => labels.extend(model.serve().labels()),
        Some(table) => {
            for (_, distribution) in table.iter() {
                labels.extend(distribution.labels());
            }
        }
    }
    labels.retain(|l| *l != "error");
    labels.sort_unstable();
    labels.dedup();
    labels
}

/// Condition keys reachable in a match between the two teams that a team does
/// not configure, plus block outcomes with no transition.
pub fn coverage_gaps(team_a: &ProbabilityModel, team_b: &ProbabilityModel) -> Vec<Error> {
    let mut gaps: Vec<Error> = Vec::new();

    for team in [Team::A, Team::B] {
        let (own, opponent) = match team {
            Team::A => (team_a, team_b),
            Team::B => (team_b, team_a),
        };
        let mut require = |category: Category, condition: String| {
            let configured = own
                .table(category)
                .map_or(true, |table| table.contains(&condition));
            let gap = Error::UnknownConditionKey {
                category: format!("team {} {}", team, category),
                condition,
            };
            if !configured && !gaps.contains(&gap) {
                gaps.push(gap);
            }
        };

        for q in non_error_labels(opponent, Category::Serve) {
            if q != "ace" {
                require(Category::Receive, serve_key(q));
            }
        }
        for q in non_error_labels(own, Category::Receive) {
            require(Category::Set, reception_key(q));
        }
        for q in non_error_labels(own, Category::Dig) {
            require(Category::Set, reception_key(q));
        }
        for q in non_error_labels(own, Category::Set) {
            require(Category::Attack, set_key(q));
        }
        if non_error_labels(opponent, Category::Attack)
            .iter()
            .any(|q| *q != "kill")
        {
            require(Category::Block, POWER_ATTACK.to_string());
        }
        for label in non_error_labels(own, Category::Block) {
            match BlockOutcome::parse(label) {
                Some(BlockOutcome::NoTouch) => require(Category::Dig, UNBLOCKED_ATTACK.to_string()),
                Some(BlockOutcome::DeflectionToDefense) => {
                    require(Category::Set, DEFLECTED_DEFENSE.to_string())
                }
                _ => {}
            }
        }
        if non_error_labels(opponent, Category::Block).contains(&"deflection_to_attack") {
            require(Category::Dig, DEFLECTED_ATTACK.to_string());
        }
    }

    for (team, model) in [(Team::A, team_a), (Team::B, team_b)] {
        let Some(table) = model.table(Category::Block) else {
            continue;
        };
        for (_, distribution) in table.iter() {
            for label in distribution.labels() {
                let gap = Error::UnknownOutcome {
                    category: format!("team {} {}", team, Category::Block),
                    outcome: label.to_string(),
                };
                if BlockOutcome::parse(label).is_none() && !gaps.contains(&gap) {
                    gaps.push(gap);
                }
            }
        }
    }

    gaps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConditionalTable, Distribution, ParameterPath};
    use crate::sampler::RallySampler;

    /// Replays a fixed list of draws
    struct Scripted(std::vec::IntoIter<f64>);

    impl Scripted {
        fn new(draws: &[f64]) -> Self {
            Scripted(draws.to_vec().into_iter())
        }
    }

    impl Sampler for Scripted {
        fn draw(&mut self) -> f64 {
            self.0.next().expect("script exhausted")
        }
    }

    fn actions(rally: &Rally) -> Vec<(Team, Action, &str)> {
        rally
            .states
            .iter()
            .map(|s| (s.team, s.action, s.quality.as_str()))
            .collect()
    }

    #[test]
    fn test_deflection_to_defense_skips_dig() {
        let team = ProbabilityModel::basic_template("T");
        let machine = RallyStateMachine::new(&team, &team, 500);
        // in_play, excellent receive, excellent set, defended, deflection_to_defense,
        // excellent set, kill
        let mut script = Scripted::new(&[0.5, 0.1, 0.1, 0.9, 0.3, 0.1, 0.0]);
        let rally = machine.play(0, Team::A, &mut script).unwrap();

        assert_eq!(
            actions(&rally),
            vec![
                (Team::A, Action::Serve, "in_play"),
                (Team::B, Action::Receive, "excellent"),
                (Team::B, Action::Set, "excellent"),
                (Team::B, Action::Attack, "defended"),
                (Team::A, Action::Block, "deflection_to_defense"),
                (Team::A, Action::Set, "excellent"),
                (Team::A, Action::Attack, "kill"),
            ]
        );
        assert_eq!(rally.winner, Team::A);
        assert_eq!(rally.point_type, PointType::Kill);
        assert_eq!(rally.duration(), 7);
    }

    #[test]
    fn test_deflection_to_attack_returns_to_attacker() {
        let team = ProbabilityModel::basic_template("T");
        let machine = RallyStateMachine::new(&team, &team, 500);
        let mut script = Scripted::new(&[0.5, 0.1, 0.1, 0.9, 0.2, 0.1, 0.1, 0.0]);
        let rally = machine.play(0, Team::A, &mut script).unwrap();

        assert_eq!(
            actions(&rally)[4..],
            [
                (Team::A, Action::Block, "deflection_to_attack"),
                (Team::B, Action::Dig, "excellent"),
                (Team::B, Action::Set, "excellent"),
                (Team::B, Action::Attack, "kill"),
            ]
        );
        assert_eq!(rally.winner, Team::B);
    }

    #[test]
    fn test_no_touch_then_dig_error() {
        let team = ProbabilityModel::basic_template("T");
        let machine = RallyStateMachine::new(&team, &team, 500);
        let mut script = Scripted::new(&[0.5, 0.1, 0.1, 0.9, 0.9, 0.99]);
        let rally = machine.play(3, Team::A, &mut script).unwrap();

        assert_eq!(rally.states[5].team, Team::A);
        assert_eq!(rally.states[5].action, Action::Dig);
        assert_eq!(rally.winner, Team::B);
        assert_eq!(rally.point_type, PointType::DigError);
        assert_eq!(rally.index, 3);
    }

    #[test]
    fn test_serve_terminals() {
        let team = ProbabilityModel::basic_template("T");
        let machine = RallyStateMachine::new(&team, &team, 500);

        let ace = machine.play(0, Team::B, &mut Scripted::new(&[0.01])).unwrap();
        assert_eq!((ace.winner, ace.point_type), (Team::B, PointType::Ace));

        let fault = machine.play(0, Team::B, &mut Scripted::new(&[0.99])).unwrap();
        assert_eq!((fault.winner, fault.point_type), (Team::A, PointType::ServeError));
        assert_eq!(fault.duration(), 1);
    }

    #[test]
    fn test_empty_distribution_is_reported() {
        let team = ProbabilityModel::basic_template("T");
        let silent = ProbabilityModel::new(
            "Silent",
            Distribution::new(Vec::<(&str, f64)>::new()),
            ConditionalTable::default(),
            ConditionalTable::default(),
            ConditionalTable::default(),
            ConditionalTable::default(),
            ConditionalTable::default(),
        );
        assert!(silent.ensure_valid().is_err());

        let machine = RallyStateMachine::new(&silent, &team, 50);
        let err = machine
            .play(0, Team::A, &mut RallySampler::for_rally(1, 0))
            .unwrap_err();
        assert_eq!(
            err,
            Error::InvalidProbabilityDistribution {
                location: "serve_probabilities".to_string(),
                sum: 0.0,
            }
        );
    }

    #[test]
    fn test_unknown_condition_key_is_fatal() {
        let team = ProbabilityModel::basic_template("T");
        let float_server = ProbabilityModel::new(
            "Float",
            Distribution::new([("float", 1.0)]),
            ConditionalTable::default(),
            ConditionalTable::default(),
            ConditionalTable::default(),
            ConditionalTable::default(),
            ConditionalTable::default(),
        );
        let machine = RallyStateMachine::new(&float_server, &team, 500);
        let err = machine
            .play(0, Team::A, &mut RallySampler::from_seed(1))
            .unwrap_err();
        assert_eq!(
            err,
            Error::UnknownConditionKey {
                category: "receive_probabilities".to_string(),
                condition: "float_serve".to_string(),
            }
        );
    }

    #[test]
    fn test_unknown_block_outcome() {
        let odd_block = ProbabilityModel::basic_template("T");
        let json = odd_block
            .to_json()
            .unwrap()
            .replace("\"no_touch\"", "\"tip\"");
        let odd_block = ProbabilityModel::from_json(&json).unwrap();
        let machine = RallyStateMachine::new(&odd_block, &odd_block, 500);
        let err = machine
            .play(0, Team::A, &mut Scripted::new(&[0.5, 0.1, 0.1, 0.9, 0.9]))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownOutcome { ref outcome, .. } if outcome == "tip"));
    }

    #[test]
    fn test_touch_limit() {
        let always = |label: &str| Distribution::new([(label, 1.0)]);
        let wall = ProbabilityModel::new(
            "Wall",
            always("in_play"),
            ConditionalTable::new([("in_play_serve", always("good"))]),
            ConditionalTable::new([("good_reception", always("good"))]),
            ConditionalTable::new([("good_set", always("defended"))]),
            ConditionalTable::new([(POWER_ATTACK, always("no_touch"))]),
            ConditionalTable::new([(UNBLOCKED_ATTACK, always("good"))]),
        );
        assert!(wall.validate().is_empty());
        assert!(coverage_gaps(&wall, &wall).is_empty());

        let machine = RallyStateMachine::new(&wall, &wall, 50);
        let err = machine
            .play(9, Team::A, &mut RallySampler::from_seed(0))
            .unwrap_err();
        assert_eq!(err, Error::RallyLimitExceeded { index: 9, limit: 50 });
    }

    #[test]
    fn test_rally_validity() {
        let team = ProbabilityModel::basic_template("T");
        let machine = RallyStateMachine::new(&team, &team, 500);

        for seed in 0..2_000u64 {
            let serving = if seed % 2 == 0 { Team::A } else { Team::B };
            let rally = machine
                .play(seed, serving, &mut RallySampler::from_seed(seed))
                .unwrap();
            let states = &rally.states;

            assert_eq!(states[0].action, Action::Serve);
            assert_eq!(states[0].team, serving);
            assert_eq!(rally.duration(), states.len());

            let first_block = states
                .iter()
                .position(|s| s.action == Action::Block)
                .unwrap_or(states.len());
            for s in &states[1..first_block] {
                assert_eq!(s.team, serving.other(), "rally {}", rally);
            }

            for pair in states.windows(2) {
                let (prev, next) = (&pair[0], &pair[1]);
                if next.action == Action::Block {
                    assert_eq!(prev.action, Action::Attack);
                    assert_ne!(prev.team, next.team);
                }
                if next.action == Action::Dig {
                    assert_eq!(prev.action, Action::Block);
                    let expected = match prev.quality.as_str() {
                        "no_touch" => prev.team,
                        "deflection_to_attack" => prev.team.other(),
                        other => panic!("dig after block outcome {}", other),
                    };
                    assert_eq!(next.team, expected);
                }
                if prev.quality == "deflection_to_defense" {
                    assert_eq!(next.action, Action::Set);
                    assert_eq!(next.team, prev.team);
                }
            }

            let last = states.last().unwrap();
            let expected_winner = if rally.point_type.is_winning_touch() {
                last.team
            } else {
                last.team.other()
            };
            assert_eq!(rally.winner, expected_winner);
        }
    }

    #[test]
    fn test_same_seed_same_rally() {
        let team = ProbabilityModel::basic_template("T");
        let machine = RallyStateMachine::new(&team, &team, 500);
        for seed in [1u64, 77, 12345] {
            let a = machine.play(0, Team::A, &mut RallySampler::from_seed(seed)).unwrap();
            let b = machine.play(0, Team::A, &mut RallySampler::from_seed(seed)).unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_excellent_set_kill_rate_converges() {
        let path = |s: &str| s.parse::<ParameterPath>().unwrap();
        let attacker = ProbabilityModel::basic_template("Attacker")
            .with_override(&path("attack_probabilities.excellent_set.kill"), 0.9)
            .unwrap()
            .with_override(&path("attack_probabilities.excellent_set.error"), 0.05)
            .unwrap()
            .with_override(&path("attack_probabilities.excellent_set.defended"), 0.05)
            .unwrap();
        assert!(attacker.validate().is_empty());
        let defender = ProbabilityModel::basic_template("Defender");
        let machine = RallyStateMachine::new(&attacker, &defender, 500);

        let target = 50_000;
        let (mut attacks, mut kills) = (0usize, 0usize);
        let mut index = 0u64;
        while attacks < target {
            let rally = machine
                .play(index, Team::B, &mut RallySampler::for_rally(2024, index))
                .unwrap();
            index += 1;
            for pair in rally.states.windows(2) {
                let (set, attack) = (&pair[0], &pair[1]);
                if attack.team == Team::A
                    && attack.action == Action::Attack
                    && set.action == Action::Set
                    && set.quality == "excellent"
                    && attacks < target
                {
                    attacks += 1;
                    if attack.quality == "kill" {
                        kills += 1;
                    }
                }
            }
        }
        let rate = kills as f64 / attacks as f64;
        assert!((rate - 0.9).abs() < 0.01, "kill rate {}", rate);
    }

    #[test]
    fn test_coverage_gaps() {
        let team = ProbabilityModel::basic_template("T");
        assert!(coverage_gaps(&team, &team).is_empty());

        let json = team
            .to_json()
            .unwrap()
            .replace("\"in_play\":0.85", "\"jump_float\":0.85");
        let floater = ProbabilityModel::from_json(&json).unwrap();
        let gaps = coverage_gaps(&floater, &team);
        assert_eq!(
            gaps,
            vec![Error::UnknownConditionKey {
                category: "team B receive_probabilities".to_string(),
                condition: "jump_float_serve".to_string(),
            }]
        );

        let json = team.to_json().unwrap().replace("\"no_touch\"", "\"tip\"");
        let tipper = ProbabilityModel::from_json(&json).unwrap();
        let gaps = coverage_gaps(&team, &tipper);
        assert!(gaps.contains(&Error::UnknownOutcome {
            category: "team B block_probabilities".to_string(),
            outcome: "tip".to_string(),
        }));
    }
}
