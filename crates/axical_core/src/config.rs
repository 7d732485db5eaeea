//! Runtime configuration for the persistence core.
//!
//! # Responsibility
//! - Collect store, logging and repository settings from an optional JSON
//!   file and `AXICAL_*` environment variables.
//! - Reject out-of-range values before anything is opened.
//!
//! # Invariants
//! - Every field has a default; an empty source yields `CoreConfig::default()`.
//! - Environment variables override file values.
//! - `validate()` is called by every constructor except `Default`.

use crate::db::OpenOptions;
use crate::logging::{default_log_level, parse_level};
use crate::repo::theme_repo::LinkWriteStrategy;
use crate::store::DEFAULT_PAGE_SIZE;
use ::config::builder::DefaultState;
use ::config::{Config, ConfigBuilder, Environment, File, FileFormat, Map};
use serde::Deserialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of environment overrides, e.g. `AXICAL_PAGE_SIZE` sets `page_size`.
pub const ENV_PREFIX: &str = "AXICAL";

pub const MAX_PAGE_SIZE: usize = 1000;
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug)]
pub enum ConfigError {
    /// A source could not be read or did not match the expected shape.
    Source(::config::ConfigError),
    InvalidValue { key: &'static str, message: String },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Source(err) => write!(f, "invalid configuration: {err}"),
            Self::InvalidValue { key, message } => write!(f, "invalid `{key}`: {message}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Source(err) => Some(err),
            Self::InvalidValue { .. } => None,
        }
    }
}

impl From<::config::ConfigError> for ConfigError {
    fn from(value: ::config::ConfigError) -> Self {
        Self::Source(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    /// SQLite file; `None` keeps everything in memory.
    pub db_path: Option<PathBuf>,
    pub log_level: String,
    /// Absolute directory for rotating log files; `None` disables file logs.
    pub log_dir: Option<PathBuf>,
    /// Items evaluated per query or scan page.
    pub page_size: usize,
    pub busy_timeout_ms: u64,
    pub theme_link_strategy: LinkWriteStrategy,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            log_level: default_log_level().to_string(),
            log_dir: None,
            page_size: DEFAULT_PAGE_SIZE,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            theme_link_strategy: LinkWriteStrategy::default(),
        }
    }
}

impl CoreConfig {
    /// Loads configuration from defaults, then the JSON file at `path` (if
    /// given), then `AXICAL_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder
                .add_source(File::new(&path.to_string_lossy(), FileFormat::Json).required(true));
        }
        Self::build(builder.add_source(env_source()))
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Self::build(Config::builder().add_source(File::from_str(json, FileFormat::Json)))
    }

    /// Like [`CoreConfig::from_env`], but reads variables from `vars`
    /// instead of the process environment.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars = vars
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect::<Map<String, String>>();
        Self::build(Config::builder().add_source(env_source().source(Some(vars))))
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(ConfigError::InvalidValue {
                key: "page_size",
                message: format!("{} is outside 1..={MAX_PAGE_SIZE}", self.page_size),
            });
        }
        parse_level(&self.log_level).map_err(|err| ConfigError::InvalidValue {
            key: "log_level",
            message: err.to_string(),
        })?;
        if let Some(dir) = &self.log_dir {
            if !dir.is_absolute() {
                return Err(ConfigError::InvalidValue {
                    key: "log_dir",
                    message: format!("`{}` is not an absolute path", dir.display()),
                });
            }
        }
        if let Some(path) = &self.db_path {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "db_path",
                    message: "path cannot be empty".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn open_options(&self) -> OpenOptions {
        OpenOptions {
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
        }
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .try_parsing(true)
        .ignore_empty(true)
}
