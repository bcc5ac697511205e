use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::Result;
use crate::models::{StoredTransaction, TransactionRecord};

/// Destination for recorded transactions.
///
/// Implementations write one record atomically: begin, insert one row, commit.
/// A failed write must leave nothing behind.
#[async_trait]
pub trait TransactionSink: Send + Sync {
    async fn persist(&self, record: &TransactionRecord) -> Result<()>;
}

/// Repository for the `requests` table
#[derive(Clone)]
pub struct TransactionRepository {
    pool: SqlitePool,
}

impl TransactionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Number of recorded transactions
    pub async fn count(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM requests")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    /// Most recent transactions, newest first
    pub async fn recent(&self, limit: i64) -> Result<Vec<StoredTransaction>> {
        let rows = sqlx::query_as::<_, StoredTransaction>(
            r#"
            SELECT id, request, response, captured_at
            FROM requests
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit.clamp(1, 1000))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

#[async_trait]
impl TransactionSink for TransactionRepository {
    async fn persist(&self, record: &TransactionRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO requests (request, response, captured_at) VALUES (?, ?, ?)",
        )
        .bind(&record.request)
        .bind(&record.response)
        .bind(record.captured_at)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            if let Err(rollback) = tx.rollback().await {
                debug!(error = %rollback, "Rollback after failed insert also failed");
            }
            return Err(e.into());
        }

        tx.commit().await?;
        Ok(())
    }
}
