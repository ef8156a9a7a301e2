use thiserror::Error;

/// Errors raised by the team model, rally engine and statistics layers
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("{location}: probabilities must sum to 1.0, got {sum:.4}")]
    InvalidProbabilityDistribution { location: String, sum: f64 },

    #[error("{location}: probability {value} is outside [0, 1]")]
    OutOfRangeProbability { location: String, value: f64 },

    #[error("{location}: missing outcome '{outcome}'")]
    MissingOutcome { location: String, outcome: String },

    #[error("{category}: unknown condition key '{condition}'")]
    UnknownConditionKey { category: String, condition: String },

    #[error("{category}: outcome '{outcome}' has no rally transition")]
    UnknownOutcome { category: String, outcome: String },

    #[error("invalid parameter path '{path}': {reason}")]
    InvalidParameterPath { path: String, reason: String },

    #[error("insufficient samples: {0}")]
    InsufficientSamples(String),

    #[error("rally {index} exceeded {limit} touches without a point")]
    RallyLimitExceeded { index: u64, limit: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("JSON error: {0}")]
    Json(String),
}

impl Error {
    /// Whether a table holds a value or sum outside the probability invariants
    pub fn is_invalid_distribution(&self) -> bool {
        matches!(
            self,
            Error::InvalidProbabilityDistribution { .. } | Error::OutOfRangeProbability { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
