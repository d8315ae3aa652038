// Copyright 2022-Present Spyderbat, Inc. https://www.spyderbat.com/
// SPDX-License-Identifier: Apache-2.0

//! Forwarder configuration: YAML file loading and validation.
//!
//! Configuration comes from a single YAML file (default `config.yaml`)
//! loaded through figment. [`Config::load`] parses the file, fills
//! defaults, and validates everything that can be validated without
//! network access; the returned value is immutable for the lifetime of
//! the process.

pub mod webhook;

use std::path::{Path, PathBuf};

use figment::providers::{Format, Yaml};
use figment::Figment;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

pub use webhook::{
    AuthMethod, AuthParameters, CompressionAlgo, WebhookAuthentication, WebhookConfig,
};

const DEFAULT_API_HOST: &str = "api.prod.spyderbat.com";
const DEFAULT_LOG_PATH: &str = "./";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("no value for required config key '{0}'")]
    MissingKey(&'static str),

    #[error("failed to validate config key '{key}': {reason}")]
    InvalidValue { key: &'static str, reason: String },

    #[error("cannot use both 'expr' and 'matching_filters'")]
    ConflictingFilters,

    #[error("failed to compile regex '{pattern}': {reason}")]
    InvalidRegex { pattern: String, reason: String },

    #[error("failed to compile expression: {0}")]
    InvalidExpression(String),

    #[error("{0}")]
    Webhook(String),
}

/// Immutable forwarder configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Upstream API host, HTTPS implied.
    pub api_host: String,

    /// Writable directory for the event log, iterator checkpoint, and
    /// dedup journal.
    pub log_path: PathBuf,

    /// Organization to pull events for.
    #[serde(rename = "spyderbat_org_uid")]
    pub org_uid: String,

    /// Bearer token for the upstream API.
    #[serde(rename = "spyderbat_secret_api_key")]
    pub api_key: String,

    /// Also write enriched records to the local syslog.
    pub local_syslog_forwarding: bool,

    /// Also write enriched records to stdout.
    pub stdout: bool,

    /// Regex allow-list: a record is emitted when any pattern matches its
    /// raw bytes. Mutually exclusive with `expr`.
    pub matching_filters: Vec<String>,

    /// Boolean expression allow-list over the record's top-level fields.
    /// Mutually exclusive with `matching_filters`.
    pub expr: Option<String>,

    /// Optional webhook destination.
    pub webhook: Option<WebhookConfig>,
}

impl Config {
    /// Loads and validates the YAML config at `path`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        info!(path = %path.display(), "loading config");

        let mut config: Config = Figment::new()
            .merge(Yaml::file_exact(path))
            .extract()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        config.prepare_and_validate()?;
        Ok(config)
    }

    /// Fills defaults and validates field values. Called automatically by
    /// [`Config::load`]; public for tests that build configs directly.
    pub fn prepare_and_validate(&mut self) -> Result<(), ConfigError> {
        if self.api_host.is_empty() {
            self.api_host = DEFAULT_API_HOST.to_string();
        }
        if self.log_path.as_os_str().is_empty() {
            self.log_path = PathBuf::from(DEFAULT_LOG_PATH);
        }
        validate_log_path(&self.log_path)?;

        if self.org_uid.is_empty() {
            return Err(ConfigError::MissingKey("spyderbat_org_uid"));
        }
        if self.api_key.is_empty() {
            return Err(ConfigError::MissingKey("spyderbat_secret_api_key"));
        }

        if !self.matching_filters.is_empty() && self.expr.as_deref().is_some_and(|e| !e.is_empty())
        {
            return Err(ConfigError::ConflictingFilters);
        }

        if let Some(webhook) = self.webhook.as_mut() {
            webhook.prepare_and_validate()?;
        }

        Ok(())
    }
}

// The log path must be an existing directory we can create files in; the
// journal, iterator checkpoint, and event log all live there.
fn validate_log_path(path: &Path) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidValue {
        key: "log_path",
        reason,
    };

    let meta = std::fs::metadata(path).map_err(|e| invalid(e.to_string()))?;
    if !meta.is_dir() {
        return Err(invalid(format!("{}: not a directory", path.display())));
    }

    let probe = path.join(".sef_write_check");
    std::fs::write(&probe, b"").map_err(|e| {
        invalid(format!("unable to write to {}: {e}", path.display()))
    })?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}
