use crate::error::Result;
use sqlx::SqlitePool;
use tracing::info;

/// Run all database migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Create migrations table if not exists
    create_migrations_table(pool).await?;

    for (version, name, sql) in get_migrations() {
        if !is_migration_applied(pool, version).await? {
            info!(version = version, name = name, "Applying migration");

            sqlx::query(sql).execute(pool).await?;
            record_migration(pool, version, name).await?;

            info!(version = version, name = name, "Migration applied successfully");
        }
    }

    Ok(())
}

/// Create the migrations tracking table
async fn create_migrations_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Check if a migration has been applied
async fn is_migration_applied(pool: &SqlitePool, version: i32) -> Result<bool> {
    let result =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM schema_migrations WHERE version = ?")
            .bind(version)
            .fetch_one(pool)
            .await?;

    Ok(result > 0)
}

/// Record a migration as applied
async fn record_migration(pool: &SqlitePool, version: i32, name: &str) -> Result<()> {
    sqlx::query("INSERT INTO schema_migrations (version, name) VALUES (?, ?)")
        .bind(version)
        .bind(name)
        .execute(pool)
        .await?;

    Ok(())
}

/// Get all migrations in order
fn get_migrations() -> Vec<(i32, &'static str, &'static str)> {
    vec![
        (1, "requests_table", MIGRATION_001_REQUESTS_TABLE),
        (2, "requests_captured_at_index", MIGRATION_002_CAPTURED_AT_INDEX),
    ]
}

// Migration 1: one row per recorded plain-HTTP transaction
const MIGRATION_001_REQUESTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request TEXT NOT NULL,
    response TEXT NOT NULL,
    captured_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
)
"#;

// Migration 2: time-ordered inspection
const MIGRATION_002_CAPTURED_AT_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_requests_captured_at ON requests(captured_at)
"#;
