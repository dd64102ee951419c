//! Typed configuration from a TOML file and environment variables.
//!
//! Loads once at startup, fails fast on invalid values. Environment
//! variables override the file. In local dev, call `dotenvy::dotenv().ok()`
//! before loading.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::Duration;
use serde::Deserialize;

use crate::engine::claims::{MAX_LEASE_SECONDS, MIN_LEASE_SECONDS};
use crate::engine::{EngineConfig, ParentPolicy};
use crate::error::{Error, Result};

/// File read when no explicit path is given, if it exists.
pub const DEFAULT_CONFIG_FILE: &str = "ticketq.toml";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// SQLite database file.
    pub database: PathBuf,
    /// Default lease length in seconds.
    pub lease_secs: i64,
    /// `max_retries` for new tickets.
    pub max_retries: u32,
    pub auto_accept_parent: bool,
    pub parent_policy: ParentPolicy,
    pub sweep_interval_secs: u64,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: PathBuf::from("ticketq.db"),
            lease_secs: 3600,
            max_retries: 3,
            auto_accept_parent: false,
            parent_policy: ParentPolicy::RequireSuccess,
            sweep_interval_secs: 60,
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Defaults, then `ticketq.toml` if present, then the environment.
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Like [`Config::from_env`], reading `path` instead of the default
    /// file. An explicit path that does not exist is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("invalid config file: {e}")))
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(db) = var("TICKETQ_DB") {
            self.database = PathBuf::from(db);
        }
        if let Some(v) = var("TICKETQ_LEASE_SECS") {
            self.lease_secs = parse_var("TICKETQ_LEASE_SECS", &v)?;
        }
        if let Some(v) = var("TICKETQ_MAX_RETRIES") {
            self.max_retries = parse_var("TICKETQ_MAX_RETRIES", &v)?;
        }
        if let Some(v) = var("TICKETQ_AUTO_ACCEPT_PARENT") {
            self.auto_accept_parent = parse_bool("TICKETQ_AUTO_ACCEPT_PARENT", &v)?;
        }
        if let Some(v) = var("TICKETQ_PARENT_POLICY") {
            self.parent_policy = match v.as_str() {
                "require_success" => ParentPolicy::RequireSuccess,
                "allow_closed" => ParentPolicy::AllowClosed,
                _ => return Err(invalid("TICKETQ_PARENT_POLICY", &v)),
            };
        }
        if let Some(v) = var("TICKETQ_SWEEP_INTERVAL_SECS") {
            self.sweep_interval_secs = parse_var("TICKETQ_SWEEP_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = var("OTEL_ENDPOINT") {
            self.otel_endpoint = Some(v);
        }
        if let Some(v) = var("LOG_LEVEL") {
            self.log_level = v;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if !(MIN_LEASE_SECONDS..=MAX_LEASE_SECONDS).contains(&self.lease_secs) {
            return Err(Error::Config(format!(
                "lease_secs must be between {MIN_LEASE_SECONDS} and {MAX_LEASE_SECONDS}, got {}",
                self.lease_secs
            )));
        }
        if self.sweep_interval_secs == 0 {
            return Err(Error::Config("sweep_interval_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            default_max_retries: self.max_retries,
            default_lease: Duration::seconds(self.lease_secs),
            auto_accept_parent: self.auto_accept_parent,
            parent_policy: self.parent_policy,
        }
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs)
    }
}

/// A set, non-empty environment variable.
fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| invalid(name, value))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(name, value)),
    }
}

fn invalid(name: &str, value: &str) -> Error {
    Error::Config(format!("invalid value for {name}: {value:?}"))
}
