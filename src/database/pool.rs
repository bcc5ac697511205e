use crate::config::Config;
use crate::error::{Result, TrailError};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// How long a writer waits on SQLite's lock before giving up
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database connection pool wrapper
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) the SQLite database named by the config
    pub async fn new(config: &Config) -> Result<Self> {
        let database_url = config.database_url();

        info!(
            path = %config.database.path,
            max_connections = config.database.max_connections,
            "Opening database"
        );

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| TrailError::DatabaseConnection(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.database.max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(30 * 60)) // 30 minutes
            .max_lifetime(Duration::from_secs(60 * 60)) // 1 hour
            .connect_with(options)
            .await
            .map_err(|e| TrailError::DatabaseConnection(e.to_string()))?;

        info!("Database connection pool established");

        Ok(Database { pool })
    }

    /// Private in-memory database on a single pinned connection.
    ///
    /// Every connection to `sqlite::memory:` gets its own database, so the pool
    /// never opens a second one nor recycles the first.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| TrailError::DatabaseConnection(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| TrailError::DatabaseConnection(e.to_string()))?;

        Ok(Database { pool })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Round-trip a trivial query, returning its latency
    pub async fn health_check(&self) -> Result<Duration> {
        let start = std::time::Instant::now();

        sqlx::query("SELECT 1").execute(&self.pool).await?;

        Ok(start.elapsed())
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        super::migrations::run_migrations(&self.pool).await?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Close the connection pool
    pub async fn close(&self) {
        info!("Closing database connection pool");
        self.pool.close().await;
    }
}
