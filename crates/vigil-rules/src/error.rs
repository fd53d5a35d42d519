use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Why a rule definition could not be turned into the typed model.
///
/// These are authoring errors: the rule is rejected before it reaches the
/// compiler, and the message is shown to the rule author as-is.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("rule text is not valid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Document-level shape problems (`action`, empty definitions).
    #[error("rule document rejected: {0}")]
    InvalidDocument(String),

    #[error("rule document has no `{0}`")]
    MissingField(String),

    #[error("selection block rejected: {0}")]
    InvalidSelection(String),

    #[error("selection key `{0}` is malformed")]
    InvalidFieldSpec(String),

    #[error("`{0}` is not a known value modifier")]
    UnknownModifier(String),

    /// Condition grammar, including the `| count()` pipe.
    #[error("condition: {0}")]
    Condition(String),

    #[error("count declaration rejected: {0}")]
    InvalidCorrelation(String),

    #[error("`{0}` is not a window length (a positive count followed by s, m, h, d or w)")]
    InvalidTimespan(String),
}

impl RuleError {
    pub(crate) fn read(path: &std::path::Path, source: io::Error) -> Self {
        RuleError::Read {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, RuleError>;
