use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

use super::types::DatabaseError;

// ============================================================================
// Database
// ============================================================================

/// SQLite-backed store for feeds and articles.
///
/// Cloning is cheap; clones share the pool and the writer lock.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
    /// SQLite allows one writer at a time. Write transactions take this lock
    /// so concurrent refreshes queue here instead of failing with SQLITE_LOCKED.
    writer: Arc<Mutex<()>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Open a database connection and run migrations.
    ///
    /// Pass `":memory:"` for a private in-memory database (used by tests).
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::InstanceLocked` if another process has the
    /// database locked (SQLITE_BUSY, SQLITE_LOCKED, SQLITE_CANTOPEN).
    /// Returns `DatabaseError::Migration` when the schema cannot be applied.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // Set database file permissions before pool creation so the file
        // never exists with default umask permissions
        #[cfg(unix)]
        if path != ":memory:" {
            use std::os::unix::fs::PermissionsExt;
            let db_path = std::path::Path::new(path);
            if db_path.exists() {
                let perms = std::fs::Permissions::from_mode(0o600);
                if let Err(e) = std::fs::set_permissions(path, perms) {
                    tracing::warn!(path = %path, error = %e, "Failed to set database file permissions");
                }
            } else if let Some(parent) = db_path.parent() {
                if parent.exists() {
                    use std::os::unix::fs::OpenOptionsExt;
                    let _file = std::fs::OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .mode(0o600)
                        .open(db_path)
                        .ok(); // If creation fails, SQLite will report the error at connect_with.
                }
            }
        }

        // busy_timeout=5000: wait up to 5 seconds for another process to
        // release its lock before returning SQLITE_BUSY.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .foreign_keys(true)
            .pragma("busy_timeout", "5000");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        let db = Self {
            pool,
            writer: Arc::new(Mutex::new(())),
        };
        db.migrate().await.map_err(|e| match DatabaseError::from_sqlx(e) {
            DatabaseError::InstanceLocked => DatabaseError::InstanceLocked,
            other => DatabaseError::Migration(other.to_string()),
        })?;
        Ok(db)
    }

    /// Serializes write transactions within this process.
    pub(crate) async fn write_lock(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().await
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// All migrations use `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let _guard = self.write_lock().await;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id INTEGER PRIMARY KEY,
                url TEXT UNIQUE NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                site_url TEXT,
                image_url TEXT,
                format TEXT NOT NULL DEFAULT 'rss',
                enabled INTEGER NOT NULL DEFAULT 1,
                refresh_interval_minutes INTEGER,
                last_fetched INTEGER,
                last_attempted INTEGER,
                last_error TEXT,
                unread_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // source_id is the dedup key; the UNIQUE constraint backs up the
        // in-memory check so a feed can never hold the same item twice
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS articles (
                id INTEGER PRIMARY KEY,
                feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                source_id TEXT NOT NULL,
                title TEXT NOT NULL,
                summary TEXT,
                content TEXT,
                url TEXT,
                published INTEGER NOT NULL,
                discovered_at INTEGER NOT NULL,
                authors TEXT NOT NULL DEFAULT '[]',
                categories TEXT NOT NULL DEFAULT '[]',
                read INTEGER NOT NULL DEFAULT 0,
                read_at INTEGER,
                bookmarked INTEGER NOT NULL DEFAULT 0,
                bookmarked_at INTEGER,
                content_fetched INTEGER NOT NULL DEFAULT 0,
                content_fetched_at INTEGER,
                lead_image_url TEXT,
                UNIQUE(feed_id, source_id)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Unread recount filters by (feed_id, read)
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_articles_feed_read ON articles(feed_id, read)")
            .execute(&mut *tx)
            .await?;

        // Link-keyed dedup looks up existing URLs per feed
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_articles_feed_url ON articles(feed_id, url)")
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_articles_feed_published ON articles(feed_id, published DESC)",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_articles_bookmarked ON articles(bookmarked, published DESC)",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory_is_idempotent() {
        let db = Database::open(":memory:").await.unwrap();
        // Running migrations twice must not fail
        db.migrate().await.unwrap();
        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('feeds', 'articles') ORDER BY name",
        )
        .fetch_all(&db.pool)
        .await
        .unwrap();
        assert_eq!(tables.len(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_database_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir().join(format!("feedsync-db-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("feeds.db");
        let _ = std::fs::remove_file(&path);

        let _db = Database::open(path.to_str().unwrap()).await.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
