use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::backend::KvStore;
use super::types::StorageError;

// ============================================================================
// SQLite Store
// ============================================================================

/// How long a second process waits for the database before giving up.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Durable [`KvStore`] backed by a single SQLite table.
///
/// The file is opened in exclusive locking mode on a single long-lived
/// connection: one process owns the database until [`close`](KvStore::close)
/// or exit, and any other process fails to open it with
/// `StorageError::Locked`. Read-modify-write cycles are only serialized
/// in-process, so sharing the file between processes is not supported.
#[derive(Clone)]
pub struct SqliteStore {
    pub(crate) pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`, run migrations and
    /// take the exclusive lock.
    ///
    /// `":memory:"` opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Locked` if another process holds the database
    /// past [`BUSY_TIMEOUT`], `StorageError::Migration` if the schema cannot
    /// be created.
    pub async fn open(path: &str) -> Result<Self, StorageError> {
        Self::open_with_busy_timeout(path, BUSY_TIMEOUT).await
    }

    /// [`open`](Self::open) with a custom wait for a database held elsewhere.
    pub async fn open_with_busy_timeout(
        path: &str,
        busy_timeout: Duration,
    ) -> Result<Self, StorageError> {
        let in_memory = path == ":memory:";
        let url = format!("sqlite:{}?mode=rwc", path);

        // Pre-create the file user-only so it never exists with umask permissions
        #[cfg(unix)]
        if !in_memory {
            use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
            let db_path = std::path::Path::new(path);
            if db_path.exists() {
                if let Err(e) =
                    std::fs::set_permissions(db_path, std::fs::Permissions::from_mode(0o600))
                {
                    tracing::warn!(path = %path, error = %e, "Failed to set database file permissions");
                }
            } else if db_path.parent().is_some_and(|p| p.as_os_str().is_empty() || p.exists()) {
                // If this fails SQLite reports the real error at connect time
                let _ = std::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(0o600)
                    .open(db_path);
            }
        }

        // One connection that is never recycled: in exclusive mode the lock
        // lives as long as the connection
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(StorageError::from_sqlx)?
            .journal_mode(SqliteJournalMode::Delete)
            .locking_mode(SqliteLockingMode::Exclusive)
            .busy_timeout(busy_timeout);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(StorageError::from_sqlx)?;

        let store = Self { pool };
        store.migrate().await.map_err(|e| match StorageError::from_sqlx(e) {
            StorageError::Locked => StorageError::Locked,
            other => StorageError::Migration(other.to_string()),
        })?;
        store.claim().await.map_err(StorageError::from_sqlx)?;
        tracing::debug!(path = %path, "SQLite store opened");
        Ok(store)
    }

    /// Take the exclusive lock now instead of at the first write, so a second
    /// process fails at open rather than midway through a sync.
    async fn claim(&self) -> Result<(), sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN EXCLUSIVE").execute(&mut *conn).await?;
        sqlx::query("COMMIT").execute(&mut *conn).await?;
        Ok(())
    }

    /// Create the key-value table. Idempotent.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(StorageError::from_sqlx)?;

        Ok(row.map(|(value,)| value))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, updated_at)
            VALUES (?, ?, datetime('now'))
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(StorageError::from_sqlx)?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(StorageError::from_sqlx)?;

        Ok(result.rows_affected() > 0)
    }

    async fn close(&self) {
        self.pool.close().await;
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> SqliteStore {
        SqliteStore::open(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_get_missing_key() {
        let store = test_store().await;
        assert_eq!(store.get("sources").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let store = test_store().await;
        store.set("sources", "[]").await.unwrap();
        assert_eq!(store.get("sources").await.unwrap().as_deref(), Some("[]"));
    }

    #[tokio::test]
    async fn test_set_upsert_replaces_value() {
        let store = test_store().await;
        store.set("k", "1").await.unwrap();
        store.set("k", "2").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_delete() {
        let store = test_store().await;
        store.set("k", "1").await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let store = test_store().await;
        store.set("k", "1").await.unwrap();
        store.migrate().await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_file_database_persists_across_opens() {
        let dir = std::env::temp_dir().join(format!("feedwatch_sqlite_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("store.db");
        let path_str = path.to_str().unwrap();

        {
            let store = SqliteStore::open(path_str).await.unwrap();
            store.set("sources", "[1]").await.unwrap();
            store.pool.close().await;
        }

        let reopened = SqliteStore::open(path_str).await.unwrap();
        assert_eq!(reopened.get("sources").await.unwrap().as_deref(), Some("[1]"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        reopened.pool.close().await;
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_second_open_is_locked_out_until_close() {
        let dir = std::env::temp_dir().join(format!("feedwatch_sqlite_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("store.db");
        let path_str = path.to_str().unwrap();

        let owner = SqliteStore::open(path_str).await.unwrap();
        owner.set("sources", "[]").await.unwrap();

        let err = SqliteStore::open_with_busy_timeout(path_str, Duration::from_millis(100))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StorageError::Locked), "got {:?}", err);

        owner.close().await;
        let next = SqliteStore::open_with_busy_timeout(path_str, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(next.get("sources").await.unwrap().as_deref(), Some("[]"));

        next.close().await;
        std::fs::remove_dir_all(&dir).ok();
    }
}
