//! Error types shared by the engine, the metrics registry and the options loader.

use thiserror::Error;

use crate::stats::MetricKind;

/// Problems detected before any virtual user starts. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no run plan: set `vus` + `duration`, `iterations`, or `stages`")]
    NoPlan,

    #[error("conflicting options: {0}")]
    Conflict(String),

    #[error("invalid duration '{value}' for `{field}`")]
    InvalidDuration { field: String, value: String },

    #[error("`{0}` must be greater than zero")]
    NonPositive(String),

    #[error("unknown metric kind '{0}' (expected counter, rate, trend or gauge)")]
    UnknownMetricKind(String),

    #[error("metric '{name}' is already registered as a {bound}, cannot use it as a {requested}")]
    KindMismatch {
        name: String,
        bound: MetricKind,
        requested: MetricKind,
    },

    #[error("invalid threshold '{expression}' on '{metric}': {reason}")]
    InvalidThreshold {
        metric: String,
        expression: String,
        reason: String,
    },

    #[error("failed to read options file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse options: {0}")]
    Parse(String),
}

/// Errors that stop a run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("clock went backwards: run started after the current tick")]
    ClockRegression,
}
