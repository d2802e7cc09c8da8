//! Value objects returned to the control process.

use std::fmt;

use indexmap::IndexMap;

/// A loosely-typed diagnostic value, mirroring the `info` dictionaries of
/// Gymnasium-style environments.
#[derive(Clone, Debug, PartialEq)]
pub enum InfoValue {
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating-point number.
    Float(f64),
    /// Free-form text.
    Text(String),
}

impl fmt::Display for InfoValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for InfoValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for InfoValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for InfoValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for InfoValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for InfoValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Per-call diagnostics. Insertion order is preserved.
pub type Info = IndexMap<String, InfoValue>;

/// Options passed to `reset`, keyed by name.
pub type ResetOptions = IndexMap<String, InfoValue>;

/// Result of one `step`: `(observation, reward, terminated, truncated, info)`.
#[derive(Clone, Debug, PartialEq)]
pub struct StepResult<O> {
    /// Observation after the step.
    pub observation: O,
    /// Reward earned by the step.
    pub reward: f64,
    /// The episode reached a terminal state.
    pub terminated: bool,
    /// The episode was cut short (e.g. time limit).
    pub truncated: bool,
    /// Environment-specific diagnostics.
    pub info: Info,
}

impl<O> StepResult<O> {
    /// Whether the episode is over for either reason.
    pub fn is_done(&self) -> bool {
        self.terminated || self.truncated
    }
}

/// Result of one `reset`: `(observation, info)`.
#[derive(Clone, Debug, PartialEq)]
pub struct ResetResult<O> {
    /// Initial observation of the new episode.
    pub observation: O,
    /// Environment-specific diagnostics.
    pub info: Info,
}
