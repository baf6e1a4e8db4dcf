//! Configuration module.
//!
//! Handles planner settings loaded from TOML and environment variables.

mod settings;

pub use settings::{expand_env_vars, CacheSettings, PlannerSettings, Settings, SettingsError};
