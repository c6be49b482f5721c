//! Database manager
//!
//! SQLite connection pool (r2d2) with async wrappers that move blocking
//! work onto the tokio blocking pool.

use crate::core::error::{ExtensionError, Result};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task;

fn pool_error(e: r2d2::Error) -> ExtensionError {
    ExtensionError::StorageError(format!("connection pool: {}", e))
}

/// Database manager with connection pool
#[derive(Clone)]
pub struct DatabaseManager {
    pool: Pool<SqliteConnectionManager>,
    db_path: PathBuf,
}

impl DatabaseManager {
    /// Open (or create) the database file and apply pending migrations
    pub fn new(db_path: &Path, pool_size: u32, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(db_path)
            .with_init(move |conn| {
                conn.execute_batch("PRAGMA foreign_keys = ON;")?;
                conn.busy_timeout(busy_timeout)?;
                conn.execute_batch("PRAGMA journal_mode = WAL;")?;
                Ok(())
            });

        let pool = Pool::builder()
            .max_size(pool_size)
            .connection_timeout(Duration::from_secs(30))
            .build(manager)
            .map_err(pool_error)?;

        let manager = Self {
            pool,
            db_path: db_path.to_path_buf(),
        };

        manager.migrate()?;

        Ok(manager)
    }

    /// In-memory database for tests and ephemeral hosts
    pub fn new_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| {
                conn.execute_batch("PRAGMA foreign_keys = ON;")?;
                Ok(())
            });

        // Every pooled connection to `:memory:` is its own database
        let pool = Pool::builder()
            .max_size(1)
            .connection_timeout(Duration::from_secs(30))
            .build(manager)
            .map_err(pool_error)?;

        let manager = Self {
            pool,
            db_path: PathBuf::from(":memory:"),
        };

        manager.migrate()?;

        Ok(manager)
    }

    pub fn get_connection(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(pool_error)
    }

    /// Run a database operation on the blocking pool
    pub async fn execute<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();

        task::spawn_blocking(move || {
            let conn = pool.get().map_err(pool_error)?;
            f(&conn)
        })
        .await
        .map_err(|e| ExtensionError::StorageError(format!("database task panicked: {}", e)))?
    }

    /// Run a database operation inside a transaction.
    ///
    /// Commits when the closure returns `Ok`, rolls back otherwise.
    pub async fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();

        task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(pool_error)?;
            let tx = conn.transaction()?;
            let result = f(&tx)?;
            tx.commit()?;
            Ok(result)
        })
        .await
        .map_err(|e| ExtensionError::StorageError(format!("transaction task panicked: {}", e)))?
    }

    pub fn migrate(&self) -> Result<()> {
        let mut conn = self.get_connection()?;
        crate::db::migrations::run_migrations(&mut conn)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn pool_size(&self) -> u32 {
        self.pool.max_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_db() -> (DatabaseManager, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("host.db");
        let manager = DatabaseManager::new(&db_path, 4, Duration::from_secs(5)).unwrap();
        (manager, temp_dir)
    }

    #[test]
    fn test_creates_parent_directory() {
        let (manager, temp_dir) = create_test_db();
        assert_eq!(manager.pool_size(), 4);
        assert!(temp_dir.path().join("nested").join("host.db").exists());
    }

    #[tokio::test]
    async fn test_migrations_create_tables() {
        let manager = DatabaseManager::new_in_memory().unwrap();
        let tables: Vec<String> = manager
            .execute(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'extension%' ORDER BY name",
                )?;
                let names = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(names)
            })
            .await
            .unwrap();
        assert_eq!(tables, vec!["extension_storage", "extensions"]);
    }

    #[tokio::test]
    async fn test_transaction_rollback() {
        let (manager, _temp_dir) = create_test_db();

        let result: Result<()> = manager
            .transaction(|tx| {
                tx.execute(
                    "INSERT INTO extension_storage (namespace, key, value) VALUES ('a', 'k', '1')",
                    [],
                )?;
                Err(ExtensionError::InvalidState("abort".into()))
            })
            .await;
        assert!(result.is_err());

        let count: i64 = manager
            .execute(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM extension_storage", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let (manager, _temp_dir) = create_test_db();
        manager.migrate().unwrap();
        manager.migrate().unwrap();
    }
}
