use rand::Rng;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database connection error: {0}")]
    Connection(String),

    #[error("database migration error: {0}")]
    Migration(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("gateway already exists: {0}")]
    AlreadyExists(String),

    #[error("{0} not found")]
    NotFound(String),
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the store at `path`. The parent directory is
    /// created if missing; failure here is an unrecoverable startup error.
    pub async fn new(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::Connection(e.to_string()))?;
            }
        }

        let db_url = format!("sqlite:{}?mode=rwc", path.display());

        info!("connecting to database at {}", path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        // WAL mode allows concurrent reads during writes; NORMAL sync
        // reduces fsync overhead.
        if let Err(e) = sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await {
            warn!("failed to set journal_mode=WAL: {}", e);
        }
        if let Err(e) = sqlx::query("PRAGMA synchronous=NORMAL").execute(&pool).await {
            warn!("failed to set synchronous=NORMAL: {}", e);
        }

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    pub async fn in_memory() -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn run_migrations(&self) -> Result<(), StorageError> {
        info!("running database migrations");

        for migration in crate::schema::ALL_MIGRATIONS {
            sqlx::query(migration)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Migration(e.to_string()))?;
        }

        Ok(())
    }
}

const BUSY_RETRY_ATTEMPTS: u32 = 5;

fn is_busy(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => {
            let message = db.message();
            message.contains("database is locked") || message.contains("database is busy")
        }
        _ => false,
    }
}

/// Run a write operation, retrying transient SQLite busy/locked failures
/// with a short randomized sleep. Persistent errors surface on the last
/// attempt.
pub async fn with_busy_retry<T, F, Fut>(mut op: F) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if is_busy(&e) && attempt + 1 < BUSY_RETRY_ATTEMPTS => {
                attempt += 1;
                let jitter = rand::thread_rng().gen_range(5..25);
                let delay = Duration::from_millis(u64::from(attempt) * 20 + jitter);
                warn!(attempt, "database busy, retrying in {:?}", delay);
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(StorageError::Query(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn in_memory_runs_migrations() {
        let db = Database::in_memory().await.unwrap();
        // All four tables must exist after migration.
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN \
             ('gateways', 'sessions', 'messages', 'federated_sessions')",
        )
        .fetch_one(db.pool())
        .await
        .unwrap();
        assert_eq!(count.0, 4);
    }

    /// Stand-in for the driver's SQLITE_BUSY error.
    #[derive(Debug)]
    struct BusyError;

    impl std::fmt::Display for BusyError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "database is locked")
        }
    }

    impl std::error::Error for BusyError {}

    impl sqlx::error::DatabaseError for BusyError {
        fn message(&self) -> &str {
            "database is locked"
        }

        fn kind(&self) -> sqlx::error::ErrorKind {
            sqlx::error::ErrorKind::Other
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }
    }

    fn busy() -> sqlx::Error {
        sqlx::Error::Database(Box::new(BusyError))
    }

    #[tokio::test]
    async fn busy_retry_eventually_succeeds() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, StorageError> = with_busy_retry(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(busy())
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn busy_retry_gives_up_after_bound() {
        let calls = AtomicU32::new(0);
        let result: Result<(), StorageError> = with_busy_retry(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(busy()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), BUSY_RETRY_ATTEMPTS);
    }
}
