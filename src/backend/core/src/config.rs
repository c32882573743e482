//! Configuration management.

use serde::Deserialize;

use crate::sync::{NewLevelPolicy, ReconcileOptions};
use crate::telemetry::LoggingConfig;

/// Prefix of environment overrides, e.g. `RESTRAINT__DATABASE__URL`.
pub const ENV_PREFIX: &str = "RESTRAINT";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Reconciliation defaults
    #[serde(default)]
    pub sync: SyncSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Apply embedded migrations on connect
    #[serde(default)]
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            run_migrations: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncSettings {
    /// Declared schema file used when none is given explicitly
    pub schema_path: Option<String>,

    /// Reset owned grants to their declared levels on every sync
    #[serde(default)]
    pub flush_default_access: bool,

    /// How new levels of existing permissions treat existing grants
    #[serde(default)]
    pub new_levels: NewLevelPolicy,
}

impl SyncSettings {
    pub fn options(&self) -> ReconcileOptions {
        ReconcileOptions {
            flush_default_access: self.flush_default_access,
            new_levels: self.new_levels,
        }
    }
}

// Default value functions
fn default_max_connections() -> u32 { 10 }
fn default_min_connections() -> u32 { 1 }

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
}

impl Settings {
    /// Load configuration from the environment only.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(environment())
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        Ok(settings)
    }

    /// Load from a specific file path, with environment overrides on top.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(environment())
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert!(settings.database.url.is_none());
        assert_eq!(settings.database.max_connections, 10);
        assert!(!settings.sync.flush_default_access);
        assert_eq!(settings.sync.new_levels, NewLevelPolicy::Ignore);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[database]
url = "postgres://localhost/restraint"
max_connections = 4

[logging]
level = "debug"
format = "json"

[sync]
schema_path = "schema.toml"
flush_default_access = true
new_levels = "apply"
"#
        )
        .unwrap();

        let settings = Settings::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(settings.database.url.as_deref(), Some("postgres://localhost/restraint"));
        assert_eq!(settings.database.max_connections, 4);
        assert_eq!(settings.database.min_connections, 1);
        assert_eq!(settings.logging.level, "debug");
        assert_eq!(settings.sync.schema_path.as_deref(), Some("schema.toml"));

        let options = settings.sync.options();
        assert!(options.flush_default_access);
        assert_eq!(options.new_levels, NewLevelPolicy::Apply);
    }
}
