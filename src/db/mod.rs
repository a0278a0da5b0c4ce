use serde::Serialize;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::Result;

/// Durable de-duplication ledger keyed by (watch_name, listing_id). A row's
/// presence is the sole authority for "already notified"; rows are written
/// only after a delivery attempt was committed downstream.
#[derive(Clone)]
pub struct SeenStore {
    pool: SqlitePool,
}

#[derive(Debug, Serialize)]
pub struct StoreStats {
    pub seen_listings: i64,
    pub notifications: i64,
}

impl SeenStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn has(&self, watch_name: &str, listing_id: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM seen_listings WHERE watch_name = ? AND listing_id = ?",
        )
        .bind(watch_name)
        .bind(listing_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// Idempotent: re-marking an existing pair is a no-op.
    pub async fn mark_seen(&self, watch_name: &str, listing_id: &str, at: u64) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO seen_listings (watch_name, listing_id, first_seen_at) \
             VALUES (?, ?, ?)",
        )
        .bind(watch_name)
        .bind(listing_id)
        .bind(at as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove all seen records for one watch, re-surfacing its listings.
    /// Returns the number of rows deleted (0 is a valid no-op).
    pub async fn clear(&self, watch_name: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM seen_listings WHERE watch_name = ?")
            .bind(watch_name)
            .execute(&self.pool)
            .await?;
        debug!(watch = watch_name, deleted = result.rows_affected(), "Cleared seen records");
        Ok(result.rows_affected())
    }

    /// Retention cleanup. Safe to run while executors read and write.
    pub async fn purge_older_than(&self, days: u32) -> Result<u64> {
        let cutoff = crate::types::now_secs().saturating_sub(days as u64 * 86_400) as i64;
        let result = sqlx::query("DELETE FROM seen_listings WHERE first_seen_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Audit row for one delivered notification.
    pub async fn record_notification(
        &self,
        watch_name: &str,
        listing_id: &str,
        at: u64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO notifications (watch_name, listing_id, notified_at) VALUES (?, ?, ?)",
        )
        .bind(watch_name)
        .bind(listing_id)
        .bind(at as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let seen_listings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM seen_listings")
            .fetch_one(&self.pool)
            .await?;
        let notifications: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM notifications")
            .fetch_one(&self.pool)
            .await?;
        Ok(StoreStats { seen_listings, notifications })
    }
}
