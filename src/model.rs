//! Team probability model: per-skill outcome distributions, conditioned on the
//! quality of the previous touch.
//!
//! Tables are held behind `Arc` so that overriding one leaf for a sensitivity
//! trial clones only the category table and distribution on the edited path;
//! every other table stays shared with the source model.

use crate::error::{Error, Result};
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::Arc;

/// Allowed deviation of a distribution's sum from 1.0
pub const SUM_TOLERANCE: f64 = 0.001;

/// One broken invariant found by `ProbabilityModel::validate`
pub type Violation = Error;

/// Label-keyed map that keeps configured order through serde
#[derive(Clone, Debug, PartialEq, Default)]
struct OrderedMap<V> {
    entries: Vec<(String, V)>,
}

impl<V> OrderedMap<V> {
    fn get(&self, key: &str) -> Option<&V> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    fn get_mut(&mut self, key: &str) -> Option<&mut V> {
        self.entries.iter_mut().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

impl<V: Serialize> Serialize for OrderedMap<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

struct OrderedMapVisitor<V>(PhantomData<V>);

impl<'de, V: Deserialize<'de>> Visitor<'de> for OrderedMapVisitor<V> {
    type Value = OrderedMap<V>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map keyed by outcome or condition label")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Self::Value, A::Error> {
        let mut entries: Vec<(String, V)> = Vec::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((key, value)) = access.next_entry::<String, V>()? {
            if entries.iter().any(|(k, _)| *k == key) {
                return Err(de::Error::custom(format!("duplicate key '{}'", key)));
            }
            entries.push((key, value));
        }
        Ok(OrderedMap { entries })
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for OrderedMap<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_map(OrderedMapVisitor(PhantomData))
    }
}

/// Ordered outcome -> probability mapping
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Distribution {
    outcomes: OrderedMap<f64>,
}

impl Distribution {
    pub fn new<S: Into<String>>(outcomes: impl IntoIterator<Item = (S, f64)>) -> Self {
        Self {
            outcomes: OrderedMap {
                entries: outcomes.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            },
        }
    }

    pub fn get(&self, outcome: &str) -> Option<f64> {
        self.outcomes.get(outcome).copied()
    }

    /// Outcomes in configured order
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.outcomes.entries.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.outcomes.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.outcomes.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.entries.is_empty()
    }

    pub fn sum(&self) -> f64 {
        self.outcomes.entries.iter().map(|(_, v)| v).sum()
    }

    /// Replace one value in place; false if the outcome is not configured
    fn set(&mut self, outcome: &str, value: f64) -> bool {
        match self.outcomes.get_mut(outcome) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    fn check(&self, location: &str, violations: &mut Vec<Violation>) {
        for (outcome, value) in self.iter() {
            if !(0.0..=1.0).contains(&value) {
                violations.push(Error::OutOfRangeProbability {
                    location: format!("{}.{}", location, outcome),
                    value,
                });
            }
        }
        let sum = self.sum();
        if !((sum - 1.0).abs() <= SUM_TOLERANCE) {
            violations.push(Error::InvalidProbabilityDistribution {
                location: location.to_string(),
                sum,
            });
        }
    }
}

/// Condition key -> distribution, in configured order
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConditionalTable {
    conditions: OrderedMap<Arc<Distribution>>,
}

impl ConditionalTable {
    pub fn new<S: Into<String>>(conditions: impl IntoIterator<Item = (S, Distribution)>) -> Self {
        Self {
            conditions: OrderedMap {
                entries: conditions
                    .into_iter()
                    .map(|(k, d)| (k.into(), Arc::new(d)))
                    .collect(),
            },
        }
    }

    pub fn get(&self, condition: &str) -> Option<&Distribution> {
        self.conditions.get(condition).map(|d| d.as_ref())
    }

    pub fn contains(&self, condition: &str) -> bool {
        self.conditions.get(condition).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Distribution)> {
        self.conditions
            .entries
            .iter()
            .map(|(k, d)| (k.as_str(), d.as_ref()))
    }

    fn get_shared_mut(&mut self, condition: &str) -> Option<&mut Arc<Distribution>> {
        self.conditions.get_mut(condition)
    }
}

/// Skill category of a probability table
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Serve,
    Receive,
    Set,
    Attack,
    Block,
    Dig,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Serve,
        Category::Receive,
        Category::Set,
        Category::Attack,
        Category::Block,
        Category::Dig,
    ];

    /// Field name used in team configuration and parameter paths
    pub fn field_name(&self) -> &'static str {
        match self {
            Category::Serve => "serve_probabilities",
            Category::Receive => "receive_probabilities",
            Category::Set => "set_probabilities",
            Category::Attack => "attack_probabilities",
            Category::Block => "block_probabilities",
            Category::Dig => "dig_probabilities",
        }
    }

    pub fn from_field_name(name: &str) -> Option<Category> {
        Category::ALL.into_iter().find(|c| c.field_name() == name)
    }

    /// Serve is the only unconditioned table
    pub fn is_conditional(&self) -> bool {
        !matches!(self, Category::Serve)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.field_name())
    }
}

/// Dotted address of one leaf probability, e.g. `attack_probabilities.excellent_set.kill`
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ParameterPath {
    pub category: Category,
    /// Absent for `serve_probabilities`
    pub condition: Option<String>,
    pub outcome: String,
}

impl ParameterPath {
    pub fn new(category: Category, condition: Option<&str>, outcome: &str) -> Self {
        Self {
            category,
            condition: condition.map(str::to_string),
            outcome: outcome.to_string(),
        }
    }

    /// Path to a sibling outcome in the same distribution
    pub fn sibling(&self, outcome: &str) -> ParameterPath {
        ParameterPath {
            category: self.category,
            condition: self.condition.clone(),
            outcome: outcome.to_string(),
        }
    }

    fn distribution_location(&self) -> String {
        match &self.condition {
            Some(condition) => format!("{}.{}", self.category, condition),
            None => self.category.to_string(),
        }
    }
}

impl FromStr for ParameterPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidParameterPath {
            path: s.to_string(),
            reason: reason.to_string(),
        };
        let parts: Vec<&str> = s.split('.').collect();
        let category = Category::from_field_name(parts[0])
            .ok_or_else(|| invalid("unknown probability category"))?;
        if parts.iter().any(|p| p.is_empty()) {
            return Err(invalid("empty path segment"));
        }
        match (category.is_conditional(), parts.len()) {
            (false, 2) => Ok(ParameterPath::new(category, None, parts[1])),
            (true, 3) => Ok(ParameterPath::new(category, Some(parts[1]), parts[2])),
            (false, _) => Err(invalid("expected serve_probabilities.<outcome>")),
            (true, _) => Err(invalid("expected <category>.<condition>.<outcome>")),
        }
    }
}

impl TryFrom<String> for ParameterPath {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ParameterPath> for String {
    fn from(path: ParameterPath) -> String {
        path.to_string()
    }
}

impl fmt::Display for ParameterPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.distribution_location(), self.outcome)
    }
}

/// A team's complete set of conditional probability tables
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProbabilityModel {
    #[serde(default)]
    pub name: String,
    serve_probabilities: Arc<Distribution>,
    receive_probabilities: Arc<ConditionalTable>,
    set_probabilities: Arc<ConditionalTable>,
    attack_probabilities: Arc<ConditionalTable>,
    block_probabilities: Arc<ConditionalTable>,
    dig_probabilities: Arc<ConditionalTable>,
}

impl ProbabilityModel {
    pub fn new(
        name: &str,
        serve: Distribution,
        receive: ConditionalTable,
        set: ConditionalTable,
        attack: ConditionalTable,
        block: ConditionalTable,
        dig: ConditionalTable,
    ) -> Self {
        Self {
            name: name.to_string(),
            serve_probabilities: Arc::new(serve),
            receive_probabilities: Arc::new(receive),
            set_probabilities: Arc::new(set),
            attack_probabilities: Arc::new(attack),
            block_probabilities: Arc::new(block),
            dig_probabilities: Arc::new(dig),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Default team used when the host supplies none
    pub fn basic_template(name: &str) -> Self {
        let quality = |excellent: f64, good: f64, poor: f64, error: f64| {
            Distribution::new([
                ("excellent", excellent),
                ("good", good),
                ("poor", poor),
                ("error", error),
            ])
        };
        let attack = |kill: f64, error: f64, defended: f64| {
            Distribution::new([("kill", kill), ("error", error), ("defended", defended)])
        };

        Self::new(
            name,
            Distribution::new([("ace", 0.08), ("in_play", 0.85), ("error", 0.07)]),
            ConditionalTable::new([("in_play_serve", quality(0.35, 0.40, 0.20, 0.05))]),
            ConditionalTable::new([
                ("excellent_reception", quality(0.55, 0.35, 0.08, 0.02)),
                ("good_reception", quality(0.30, 0.48, 0.19, 0.03)),
                ("poor_reception", quality(0.10, 0.40, 0.44, 0.06)),
                ("deflected_defense", quality(0.15, 0.40, 0.38, 0.07)),
            ]),
            ConditionalTable::new([
                ("excellent_set", attack(0.60, 0.08, 0.32)),
                ("good_set", attack(0.45, 0.12, 0.43)),
                ("poor_set", attack(0.25, 0.18, 0.57)),
            ]),
            ConditionalTable::new([(
                "power_attack",
                Distribution::new([
                    ("stuff", 0.12),
                    ("deflection_to_attack", 0.10),
                    ("deflection_to_defense", 0.13),
                    ("no_touch", 0.65),
                ]),
            )]),
            ConditionalTable::new([
                ("unblocked_attack", quality(0.15, 0.30, 0.30, 0.25)),
                ("deflected_attack", quality(0.25, 0.35, 0.25, 0.15)),
            ]),
        )
    }

    pub fn serve(&self) -> &Distribution {
        &self.serve_probabilities
    }

    /// Conditional table for a category; `None` for serve
    pub fn table(&self, category: Category) -> Option<&ConditionalTable> {
        match category {
            Category::Serve => None,
            Category::Receive => Some(&self.receive_probabilities),
            Category::Set => Some(&self.set_probabilities),
            Category::Attack => Some(&self.attack_probabilities),
            Category::Block => Some(&self.block_probabilities),
            Category::Dig => Some(&self.dig_probabilities),
        }
    }

    fn table_mut(&mut self, category: Category) -> Option<&mut Arc<ConditionalTable>> {
        match category {
            Category::Serve => None,
            Category::Receive => Some(&mut self.receive_probabilities),
            Category::Set => Some(&mut self.set_probabilities),
            Category::Attack => Some(&mut self.attack_probabilities),
            Category::Block => Some(&mut self.block_probabilities),
            Category::Dig => Some(&mut self.dig_probabilities),
        }
    }

    /// Distribution for a category under a condition key (ignored for serve)
    pub fn distribution(&self, category: Category, condition: Option<&str>) -> Result<&Distribution> {
        match self.table(category) {
            None => Ok(self.serve()),
            Some(table) => {
                let condition = condition.unwrap_or_default();
                table.get(condition).ok_or_else(|| Error::UnknownConditionKey {
                    category: category.field_name().to_string(),
                    condition: condition.to_string(),
                })
            }
        }
    }

    pub fn get(&self, category: Category, condition: Option<&str>, outcome: &str) -> Result<f64> {
        let distribution = self.distribution(category, condition)?;
        distribution.get(outcome).ok_or_else(|| Error::MissingOutcome {
            location: match (category.is_conditional(), condition) {
                (true, Some(c)) => format!("{}.{}", category, c),
                _ => category.to_string(),
            },
            outcome: outcome.to_string(),
        })
    }

    /// Leaf value addressed by a parameter path
    pub fn value_at(&self, path: &ParameterPath) -> Result<f64> {
        self.get(path.category, path.condition.as_deref(), &path.outcome)
            .map_err(|e| Error::InvalidParameterPath {
                path: path.to_string(),
                reason: e.to_string(),
            })
    }

    /// Every violation of the distribution invariants; empty when valid
    pub fn validate(&self) -> Vec<Violation> {
        let mut violations = Vec::new();
        self.serve()
            .check(Category::Serve.field_name(), &mut violations);
        for category in Category::ALL.into_iter().filter(Category::is_conditional) {
            if let Some(table) = self.table(category) {
                for (condition, distribution) in table.iter() {
                    let location = format!("{}.{}", category, condition);
                    distribution.check(&location, &mut violations);
                }
            }
        }
        violations
    }

    /// First violation as an error, for callers that treat any as fatal
    pub fn ensure_valid(&self) -> Result<()> {
        match self.validate().into_iter().next() {
            Some(violation) => Err(violation),
            None => Ok(()),
        }
    }

    /// Copy with exactly one leaf replaced; siblings are not renormalized
    pub fn with_override(&self, path: &ParameterPath, value: f64) -> Result<ProbabilityModel> {
        // Resolve first so an unknown path never produces a partial copy
        self.value_at(path)?;

        let unresolved = || Error::InvalidParameterPath {
            path: path.to_string(),
            reason: "path does not resolve to a leaf".to_string(),
        };

        let mut model = self.clone();
        let distribution = if path.category.is_conditional() {
            let condition = path.condition.as_deref().unwrap_or_default();
            let table = model.table_mut(path.category).ok_or_else(unresolved)?;
            Arc::make_mut(table)
                .get_shared_mut(condition)
                .ok_or_else(unresolved)?
        } else {
            &mut model.serve_probabilities
        };
        if !Arc::make_mut(distribution).set(&path.outcome, value) {
            return Err(unresolved());
        }
        Ok(model)
    }

    /// Copy with each path shifted by its additive delta, applied in order
    pub fn with_deltas(&self, deltas: &[(ParameterPath, f64)]) -> Result<ProbabilityModel> {
        deltas.iter().try_fold(self.clone(), |model, (path, delta)| {
            let current = model.value_at(path)?;
            model.with_override(path, current + delta)
        })
    }

    /// All leaf paths in configured order
    pub fn parameter_paths(&self) -> Vec<ParameterPath> {
        let mut paths: Vec<ParameterPath> = self
            .serve()
            .labels()
            .map(|outcome| ParameterPath::new(Category::Serve, None, outcome))
            .collect();
        for category in Category::ALL.into_iter().filter(Category::is_conditional) {
            if let Some(table) = self.table(category) {
                for (condition, distribution) in table.iter() {
                    paths.extend(
                        distribution
                            .labels()
                            .map(|outcome| ParameterPath::new(category, Some(condition), outcome)),
                    );
                }
            }
        }
        paths
    }
}
