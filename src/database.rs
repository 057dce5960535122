#[cfg(feature = "database")]
use anyhow::Result;
#[cfg(feature = "database")]
use sqlx::{
    migrate::MigrateDatabase,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};
#[cfg(feature = "database")]
use std::{str::FromStr, time::Duration};
#[cfg(feature = "database")]
use tracing::info;

#[cfg(feature = "database")]
use crate::config::DatabaseConfig;
#[cfg(feature = "database")]
use crate::workflows::SqliteWorkflowStore;

#[cfg(feature = "database")]
/// Owns the connection pool backing the workflow store
pub struct DatabaseManager {
    pool: SqlitePool,
}

#[cfg(feature = "database")]
impl DatabaseManager {
    /// Connect to the configured database, creating it and running migrations as configured
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        if !sqlx::Sqlite::database_exists(&config.url).await.unwrap_or(false) {
            info!("Creating database at {}", config.url);
            if let Some(parent) = sqlite_file_parent(&config.url) {
                std::fs::create_dir_all(parent)?;
            }
            sqlx::Sqlite::create_database(&config.url).await?;
        }

        let options = SqliteConnectOptions::from_str(&config.url)?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(config.busy_timeout_seconds));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await?;

        let manager = Self { pool };
        if config.auto_migrate {
            manager.migrate().await?;
        }

        Ok(manager)
    }

    /// Apply embedded schema migrations
    pub async fn migrate(&self) -> Result<()> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Get database pool for queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Workflow store sharing this manager's pool
    pub fn workflow_store(&self) -> SqliteWorkflowStore {
        SqliteWorkflowStore::new(self.pool.clone())
    }

    /// Close database connections gracefully
    pub async fn shutdown(&self) {
        info!("Shutting down database connections...");
        self.pool.close().await;
        info!("Database connections closed");
    }
}

#[cfg(feature = "database")]
fn sqlite_file_parent(url: &str) -> Option<&std::path::Path> {
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() || path.starts_with(":memory:") {
        return None;
    }
    std::path::Path::new(path)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
}

#[cfg(all(test, feature = "database"))]
mod tests {
    use super::*;

    #[test]
    fn parent_directory_is_derived_from_url() {
        assert_eq!(
            sqlite_file_parent("sqlite://.deskflow/deskflow.db"),
            Some(std::path::Path::new(".deskflow"))
        );
        assert_eq!(sqlite_file_parent("sqlite:flows.db"), None);
        assert_eq!(sqlite_file_parent("sqlite::memory:"), None);
    }

    #[tokio::test]
    async fn connect_creates_database_and_schema() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/nested/flows.db", dir.path().display());
        let config = DatabaseConfig {
            url,
            max_connections: 2,
            auto_migrate: true,
            busy_timeout_seconds: 5,
        };

        let manager = DatabaseManager::connect(&config).await.unwrap();
        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'workflows'",
        )
        .fetch_one(manager.pool())
        .await
        .unwrap();
        assert_eq!(tables, 1);
        manager.shutdown().await;
    }
}
