//! Operator configuration.
//!
//! Settings are read from a TOML file and then overridden by `MAIL_IMPORT_*`
//! environment variables, so the same file can be reused across environments.

use crate::error::ErrorPolicy;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// SQLSTATE for unique-constraint violations.
pub const UNIQUE_VIOLATION: &str = "23505";

/// Default recursion bound for the part tree builder.
pub const DEFAULT_MAX_PART_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration value for {key}: {message}")]
    Invalid { key: String, message: String },
    #[error("database_url is not configured (set it in the file or MAIL_IMPORT_DATABASE_URL)")]
    MissingDatabaseUrl,
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| strip_quotes(&value).to_string())
        .filter(|value| !value.is_empty())
}

fn env_bool(key: &str) -> Option<bool> {
    env_string(key).map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

fn parse_number<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse::<T>().map_err(|e| ConfigError::Invalid {
        key: key.to_string(),
        message: format!("{:?}: {}", value, e),
    })
}

fn env_usize(key: &str) -> Result<Option<usize>, ConfigError> {
    env_string(key)
        .map(|value| parse_number(key, &value))
        .transpose()
}

fn env_u32(key: &str) -> Result<Option<u32>, ConfigError> {
    env_string(key)
        .map(|value| parse_number(key, &value))
        .transpose()
}

/// Trim whitespace and one pair of surrounding double quotes.
fn strip_quotes(value: &str) -> &str {
    let value = value.trim();
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

/// Parse a comma-separated list of store error codes.
pub fn parse_error_codes(list: &str) -> Vec<String> {
    strip_quotes(list)
        .split(',')
        .map(strip_quotes)
        .filter(|code| !code.is_empty())
        .map(str::to_string)
        .collect()
}

/// Runtime configuration of an import run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImportConfig {
    pub database_url: Option<String>,
    pub max_connections: Option<u32>,
    pub max_concurrent_mailboxes: usize,
    pub ignorable_error_codes: Vec<String>,
    pub autocommit: bool,
    pub truncate_on_connect: bool,
    pub run_migrations: bool,
    pub mail_root: PathBuf,
    pub max_part_depth: usize,
    pub debug: bool,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: None,
            max_concurrent_mailboxes: num_cpus::get(),
            ignorable_error_codes: vec![UNIQUE_VIOLATION.to_string()],
            autocommit: false,
            truncate_on_connect: false,
            run_migrations: true,
            mail_root: PathBuf::from("."),
            max_part_depth: DEFAULT_MAX_PART_DEPTH,
            debug: false,
        }
    }
}

impl ImportConfig {
    /// Load the configuration file and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml(&raw)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(url) = env_string("MAIL_IMPORT_DATABASE_URL").or_else(|| env_string("DATABASE_URL")) {
            self.database_url = Some(url);
        }
        if let Some(threads) = env_usize("MAIL_IMPORT_THREADS")? {
            self.max_concurrent_mailboxes = threads;
        }
        if let Some(connections) = env_u32("MAIL_IMPORT_MAX_CONNECTIONS")? {
            self.max_connections = Some(connections);
        }
        if let Some(codes) = env_string("MAIL_IMPORT_IGNORE_ERROR_CODES") {
            self.ignorable_error_codes = parse_error_codes(&codes);
        }
        if let Some(autocommit) = env_bool("MAIL_IMPORT_AUTOCOMMIT") {
            self.autocommit = autocommit;
        }
        if let Some(truncate) = env_bool("MAIL_IMPORT_TRUNCATE") {
            self.truncate_on_connect = truncate;
        }
        if let Some(migrate) = env_bool("MAIL_IMPORT_MIGRATE") {
            self.run_migrations = migrate;
        }
        if let Some(root) = env_string("MAIL_IMPORT_MAIL_ROOT") {
            self.mail_root = PathBuf::from(root);
        }
        if let Some(depth) = env_usize("MAIL_IMPORT_MAX_PART_DEPTH")? {
            self.max_part_depth = depth;
        }
        if let Some(debug) = env_bool("MAIL_IMPORT_DEBUG") {
            self.debug = debug;
        }
        Ok(())
    }

    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.max_concurrent_mailboxes == 0 {
            return Err(ConfigError::Invalid {
                key: "max_concurrent_mailboxes".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.max_part_depth == 0 {
            return Err(ConfigError::Invalid {
                key: "max_part_depth".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        self.ignorable_error_codes = self
            .ignorable_error_codes
            .iter()
            .map(|code| strip_quotes(code).to_string())
            .filter(|code| !code.is_empty())
            .collect();
        Ok(())
    }

    pub fn database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::MissingDatabaseUrl)
    }

    /// Pool size: every mailbox worker holds its session connection and
    /// borrows a second one for subscriber and envelope statements.
    pub fn pool_size(&self) -> u32 {
        self.max_connections
            .unwrap_or_else(|| {
                u32::try_from(self.max_concurrent_mailboxes)
                    .unwrap_or(u32::MAX)
                    .saturating_mul(2)
            })
            .max(1)
    }

    pub fn error_policy(&self) -> ErrorPolicy {
        ErrorPolicy::new(self.ignorable_error_codes.iter().cloned())
    }

    pub fn log_filter(&self) -> &'static str {
        if self.debug {
            "debug,sqlx=warn"
        } else {
            "info,sqlx=warn"
        }
    }
}
