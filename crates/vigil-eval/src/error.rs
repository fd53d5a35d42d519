//! Compile-time, evaluation-time and store error types.

use thiserror::Error;
use vigil_rules::RuleError;

/// A rule definition that cannot be installed.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// The definition tree itself was malformed.
    #[error("rule error: {0}")]
    Rule(#[from] RuleError),

    /// A wildcard pattern could not be built into a regex.
    #[error("invalid regex pattern: {0}")]
    InvalidRegex(#[from] regex::Error),

    /// A CIDR pattern failed to parse.
    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),

    /// A block referenced in a condition was not found.
    #[error("unknown detection identifier: {0}")]
    UnknownDetection(String),

    /// A `N of <glob>` selector matched no block.
    #[error("selector matches no detection: {0}")]
    EmptySelector(String),

    /// A modifier combination is invalid.
    #[error("invalid modifier combination: {0}")]
    InvalidModifiers(String),

    /// A value type is incompatible with the modifier.
    #[error("incompatible value for modifier: {0}")]
    IncompatibleValue(String),

    /// `expand` with a placeholder other than `%DomainControllers%`.
    #[error("unsupported expand placeholder: {0}")]
    UnsupportedPlaceholder(String),

    #[error("unknown correlation type: {0}")]
    UnknownCorrelationType(String),

    /// The aggregation threshold is not a 64-bit integer.
    #[error("invalid aggregation threshold: {0}")]
    InvalidThreshold(String),

    /// An aggregation without a timespan / timeframe.
    #[error("aggregation rule '{0}' declares no time window")]
    MissingWindow(String),

    /// A time window without any aggregation to apply it to.
    #[error("rule '{0}' declares a time window but no aggregation")]
    MissingAggregation(String),

    #[error("invalid correlation: {0}")]
    InvalidCorrelation(String),
}

/// Failure while evaluating a compiled predicate against an event.
///
/// Regex execution is the only operation that can fail at evaluation time.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EvalError {
    #[error("regex '{pattern}' failed: {reason}")]
    Regex { pattern: String, reason: String },
}

/// Failure reported by a windowed store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("windowed store unavailable: {0}")]
    Unavailable(String),
}

/// Convenience result type; compile-time errors by default.
pub type Result<T, E = DefinitionError> = std::result::Result<T, E>;
