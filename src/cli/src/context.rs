//! Shared setup for commands: settings, logging and the store.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use restraint_core::config::Settings;
use restraint_core::db::PgAccessStore;
use restraint_core::telemetry::init_logging;
use tracing::debug;

/// Resolved settings plus a lazily opened store.
pub struct Context {
    pub settings: Settings,
}

impl Context {
    /// Load `.env`, settings and logging.
    ///
    /// An explicit `database_url` overrides the settings file.
    pub fn load(config_path: Option<&str>, database_url: Option<String>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut settings = match config_path {
            Some(path) => Settings::from_file(path).with_context(|| format!("Failed to load {}", path))?,
            None => Settings::load().context("Failed to load settings from the environment")?,
        };
        if database_url.is_some() {
            settings.database.url = database_url;
        }

        init_logging(&settings.logging)?;
        debug!(config = ?config_path, "Settings loaded");

        Ok(Self { settings })
    }

    /// Connect to PostgreSQL, applying migrations if configured.
    pub async fn store(&self) -> Result<Arc<PgAccessStore>> {
        let db = &self.settings.database;
        let url = db
            .url
            .as_deref()
            .context("No database URL: pass --database-url or set DATABASE_URL")?;

        let store = PgAccessStore::connect(url, db.max_connections, db.min_connections).await?;
        if db.run_migrations {
            store.migrate().await?;
        }
        Ok(Arc::new(store))
    }
}
