//! SQLite-backed persisted state.
//!
//! Whole-record key/value semantics over a single table: every logical
//! record (queue contents, anchor, acknowledged watermarks) is read fully
//! at startup and replaced atomically as a whole on every mutation. No
//! partial-field updates.
//!
//! Schema:
//! ```sql
//! CREATE TABLE sync_state (
//!   key TEXT PRIMARY KEY,
//!   value TEXT NOT NULL,
//!   updated_at INTEGER NOT NULL
//! )
//! ```

use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, info};

use crate::resilience::retry::{retry, RetryConfig};
use crate::segment::epoch_millis;
use crate::storage::traits::{StateError, StateStore};

pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    /// Open (creating if needed) the state database at `connection_string`,
    /// e.g. `sqlite:///var/lib/transcript-sync/state.db?mode=rwc`.
    ///
    /// Uses startup-mode retry: a wrong path or locked file fails fast
    /// instead of backing off forever.
    pub async fn open(connection_string: &str) -> Result<Self, StateError> {
        let pool = retry("state_db_connect", &RetryConfig::startup(), || async {
            SqlitePoolOptions::new()
                .max_connections(4)
                .acquire_timeout(Duration::from_secs(10))
                .connect(connection_string)
                .await
                .map_err(|e| StateError::Backend(e.to_string()))
        })
        .await?;

        let store = Self { pool };
        store.enable_wal_mode().await?;
        store.init_schema().await?;
        info!(connection = %connection_string, "State database ready");
        Ok(store)
    }

    /// WAL keeps reads from blocking the frequent whole-record writes.
    async fn enable_wal_mode(&self) -> Result<(), StateError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StateError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StateError::Backend(format!("Failed to set synchronous mode: {}", e)))?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StateError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StateError::Backend(format!("Failed to create schema: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn load(&self, key: &str) -> Result<Option<String>, StateError> {
        let row = sqlx::query("SELECT value FROM sync_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StateError::Backend(e.to_string()))?;

        Ok(match row {
            Some(row) => Some(
                row.try_get::<String, _>("value")
                    .map_err(|e| StateError::Corrupt {
                        key: key.to_string(),
                        reason: e.to_string(),
                    })?,
            ),
            None => None,
        })
    }

    async fn replace(&self, key: &str, value: &str) -> Result<(), StateError> {
        sqlx::query("INSERT OR REPLACE INTO sync_state (key, value, updated_at) VALUES (?, ?, ?)")
            .bind(key)
            .bind(value)
            .bind(epoch_millis())
            .execute(&self.pool)
            .await
            .map_err(|e| StateError::Backend(e.to_string()))?;
        debug!(key = %key, bytes = value.len(), "Replaced state record");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StateError> {
        sqlx::query("DELETE FROM sync_state WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| StateError::Backend(e.to_string()))?;
        Ok(())
    }
}
