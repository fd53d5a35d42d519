//! Configuration for the `vigil` binary.
//!
//! Loaded from, in increasing priority:
//! 1. Default values
//! 2. `vigil.toml` in the working directory (optional), or the file given
//!    with `--config`
//! 3. Environment variables with the `VIGIL__` prefix
//!
//! Example overrides:
//! VIGIL__LOGGING__LEVEL=debug
//! VIGIL__ENGINE__COMPILE__FIELDREF_NULL_MATCHES=true

use std::path::{Path, PathBuf};

use serde::Deserialize;
use vigil_eval::EngineConfig;
use vigil_eval::compiler::DEFAULT_REGEX_SIZE_LIMIT;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    pub logging: LogConfig,
    /// YAML mapping of field aliases to canonical names.
    pub aliases_path: Option<PathBuf>,
    /// Newline-separated domain controller host names.
    pub domain_controllers_path: Option<PathBuf>,
    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    pub level: String,
}

impl AppConfig {
    /// Load defaults, then the config file, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let file = match path {
            Some(p) => config::File::from(p).required(true),
            None => config::File::with_name("vigil").required(false),
        };

        let s = config::Config::builder()
            // Logging
            .set_default("logging.level", "warn")?
            // Engine
            .set_default("engine.batch.max_batch_size", 512)?
            .set_default("engine.batch.flush_interval_ms", 1000)?
            .set_default("engine.batch.channel_capacity", 8192)?
            .set_default("engine.regex.size_limit", DEFAULT_REGEX_SIZE_LIMIT as u64)?
            .set_default("engine.compile.fieldref_null_matches", false)?
            // Sources
            .add_source(file)
            .add_source(config::Environment::with_prefix("VIGIL").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
