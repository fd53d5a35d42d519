//! Engine configuration.
//!
//! Plain serde structs with defaults; the CLI layers a file and environment
//! variables on top with the `config` crate.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::compiler::{CompileOptions, DEFAULT_REGEX_SIZE_LIMIT};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub batch: BatchSettings,
    pub regex: RegexSettings,
    pub compile: CompileSettings,
}

/// Aggregation micro-batcher settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Flush once this many candidates are buffered.
    pub max_batch_size: usize,
    /// Flush a non-empty batch at least this often.
    pub flush_interval_ms: u64,
    /// Bound of the producer → consumer channel.
    pub channel_capacity: usize,
}

impl BatchSettings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl Default for BatchSettings {
    fn default() -> Self {
        BatchSettings {
            max_batch_size: 512,
            flush_interval_ms: 1_000,
            channel_capacity: 8_192,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegexSettings {
    /// Compiled program size limit in bytes for `re` patterns.
    pub size_limit: usize,
}

impl Default for RegexSettings {
    fn default() -> Self {
        RegexSettings {
            size_limit: DEFAULT_REGEX_SIZE_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileSettings {
    /// Legacy `fieldref`: a missing side counts as a match.
    pub fieldref_null_matches: bool,
}

impl EngineConfig {
    pub fn compile_options(&self) -> CompileOptions {
        CompileOptions {
            fieldref_null_matches: self.compile.fieldref_null_matches,
            regex_size_limit: self.regex.size_limit,
        }
    }
}
