//! TOML-based configuration for the planner.
//!
//! Example configuration:
//! ```toml
//! [planner]
//! dialect = "postgres"
//! default_prefix = "${TENANT_SCHEMA}"
//!
//! [cache]
//! enabled = true
//! fingerprint = true
//! ```

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::dialect::Dialect;

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub planner: PlannerSettings,
    pub cache: CacheSettings,
}

/// Planner configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PlannerSettings {
    /// Dialect whose capabilities are checked when none is passed explicitly.
    pub dialect: String,

    /// Prefix used when neither the clause, the schema nor the query sets one.
    /// Supports `${ENV_VAR}` expansion.
    pub default_prefix: Option<String>,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            dialect: "postgres".to_string(),
            default_prefix: None,
        }
    }
}

impl PlannerSettings {
    /// Get the dialect.
    pub fn dialect(&self) -> Result<Dialect, SettingsError> {
        self.dialect
            .parse()
            .map_err(|e: crate::dialect::UnknownDialect| SettingsError::InvalidConfig(e.to_string()))
    }

    /// Get the default prefix with environment variables expanded.
    pub fn resolved_default_prefix(&self) -> Result<Option<String>, SettingsError> {
        match &self.default_prefix {
            Some(prefix) => {
                let expanded = expand_env_vars(prefix)?;
                Ok(if expanded.is_empty() {
                    None
                } else {
                    Some(expanded)
                })
            }
            None => Ok(None),
        }
    }
}

/// Plan-cache key configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheSettings {
    /// When disabled every plan reports an uncacheable key.
    pub enabled: bool,

    /// Compute a SHA-256 fingerprint for cacheable keys.
    pub fingerprint: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            fingerprint: true,
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate settings from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, SettingsError> {
        let settings: Settings = toml::from_str(content)?;
        settings.planner.dialect()?;
        Ok(settings)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `SIEVE_CONFIG`
    /// 2. `./sieve.toml`
    /// 3. `~/.config/sieve/config.toml`
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = env::var("SIEVE_CONFIG") {
            return Self::from_file(&path);
        }

        let local_config = PathBuf::from("sieve.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("sieve").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        Ok(Settings::default())
    }
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }

        let mut var_name = String::new();
        if chars.peek() == Some(&'{') {
            chars.next();
            for ch in chars.by_ref() {
                if ch == '}' {
                    break;
                }
                var_name.push(ch);
            }
        } else {
            while let Some(ch) = chars.next_if(|ch| ch.is_alphanumeric() || *ch == '_') {
                var_name.push(ch);
            }
            if var_name.is_empty() {
                // Just a lone $, keep it
                result.push('$');
                continue;
            }
        }

        let value =
            env::var(&var_name).map_err(|_| SettingsError::MissingEnvVar(var_name.clone()))?;
        result.push_str(&value);
    }

    Ok(result)
}
