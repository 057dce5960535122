use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::workflows::{TerminalStates, STATE_CANCELLED, SYSTEM_ACTOR};

/// Main configuration structure for Deskflow
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeskflowConfig {
    /// Database settings. Required by every command that touches workflows.
    pub database: Option<DatabaseConfig>,
    /// Logging settings
    pub observability: ObservabilityConfig,
    /// Workflow engine settings
    pub engine: EngineConfig,
    /// Expiry sweep settings
    pub sweep: SweepConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Database URL (SQLite file path or connection string)
    pub url: String,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// Enable automatic migrations
    pub auto_migrate: bool,
    /// How long a writer waits on a locked database before giving up
    pub busy_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level / filter directive, overridden by RUST_LOG
    pub log_level: String,
    /// Emit JSON lines instead of human-readable output
    pub json_logs: bool,
    /// Log engine counters on shutdown
    pub metrics_enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Extra state labels that end a workflow, on top of the built-in
    /// COMPLETED, FAILED and EXPIRED
    pub terminal_states: Vec<String>,
}

impl EngineConfig {
    pub fn terminal_states(&self) -> TerminalStates {
        TerminalStates::new(self.terminal_states.iter().cloned())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SweepConfig {
    /// Seconds between expiry passes in watch mode
    pub interval_seconds: u64,
    /// Actor recorded on expiry transitions
    pub actor: String,
    /// Reason recorded on expiry transitions
    pub reason: String,
}

impl Default for DeskflowConfig {
    fn default() -> Self {
        Self {
            database: Some(DatabaseConfig {
                url: "sqlite://.deskflow/deskflow.db".to_string(),
                max_connections: 10,
                auto_migrate: true,
                busy_timeout_seconds: 5,
            }),
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                json_logs: true,
                metrics_enabled: true,
            },
            engine: EngineConfig {
                terminal_states: vec![STATE_CANCELLED.to_string()],
            },
            sweep: SweepConfig {
                interval_seconds: 60,
                actor: SYSTEM_ACTOR.to_string(),
                reason: "expired".to_string(),
            },
        }
    }
}

impl DeskflowConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (deskflow.toml, .deskflow-rc)
    /// 3. Environment variables (prefixed with DESKFLOW_, `__` between sections)
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("."))
    }

    /// Same as `load`, resolving configuration files relative to `dir`
    pub fn load_from(dir: &Path) -> Result<Self> {
        let defaults = Config::try_from(&DeskflowConfig::default())?;
        let mut builder = Config::builder().add_source(defaults);

        let toml_path = dir.join("deskflow.toml");
        if toml_path.exists() {
            builder = builder.add_source(File::from(toml_path));
        }

        let rc_path = dir.join(".deskflow-rc");
        if rc_path.exists() {
            builder = builder.add_source(File::from(rc_path).format(config::FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("DESKFLOW")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("engine.terminal_states")
                .try_parsing(true),
        );

        let config: DeskflowConfig = builder.build()?.try_deserialize()?;

        // DATABASE_URL is the conventional override for sqlx tooling
        let mut config = config;
        if let Ok(url) = std::env::var("DATABASE_URL") {
            if let Some(db) = config.database.as_mut() {
                db.url = url;
            }
        }

        Ok(config)
    }

    /// Database settings, or an error when none are configured
    pub fn require_database(&self) -> Result<&DatabaseConfig> {
        self.database
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("No [database] section configured; the workflow store is unavailable"))
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}
