/// Error types at the library seams.
///
/// `TailError` is always transient: the pipeline logs it and retries on the
/// next cycle. `ConfigError` is fatal and only raised before the pipeline
/// starts (or when a profile switch is requested with a bad rule set).
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TailError {
    #[error("failed to read {path}: {source}")]
    Io {
        path:   PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("log read timed out after {after_ms} ms")]
    TimedOut { after_ms: u64 },

    #[error("log read worker failed: {0}")]
    Worker(String),
}

impl TailError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}

/// One problem found while validating a rule definition.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuleError {
    #[error("rule #{index} has an empty id")]
    EmptyId { index: usize },

    #[error("duplicate rule id '{0}'")]
    DuplicateId(String),

    #[error("rule '{0}' does not list any event kinds")]
    NoEvents(String),

    #[error("rule '{0}' has an empty message")]
    EmptyMessage(String),

    #[error("rule '{id}': cooldown {cooldown_ms} ms exceeds the maximum of {max_ms} ms")]
    CooldownTooLong { id: String, cooldown_ms: u64, max_ms: u64 },

    #[error("rule '{id}': threshold {value} is invalid ({reason})")]
    InvalidThreshold { id: String, value: f64, reason: &'static str },

    #[error("rule '{id}': trigger '{trigger}' cannot apply to event kind '{kind}'")]
    TriggerKindMismatch { id: String, trigger: &'static str, kind: String },

    #[error("rule '{id}': hit count bounds are invalid (min {min_hits}, max {max_hits:?})")]
    InvalidHitCount { id: String, min_hits: u32, max_hits: Option<u32> },

    #[error("rule '{id}': windowed sum needs a non-zero total and window")]
    InvalidWindow { id: String },

    #[error("rule '{0}': unless_module_active must name a module")]
    EmptyModuleGate(String),

    #[error("rule '{id}': message template is malformed: {reason}")]
    MalformedTemplate { id: String, reason: String },

    #[error("rule '{id}': placeholder '{{{field}}}' is not available for event kind '{kind}'")]
    UnknownField { id: String, field: String, kind: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path:   PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("unknown profile '{0}'")]
    UnknownProfile(String),

    #[error("{} invalid rule(s): {}", .0.len(), join_errors(.0))]
    InvalidRules(Vec<RuleError>),
}

fn join_errors(errors: &[RuleError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
