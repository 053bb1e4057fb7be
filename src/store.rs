//! Shared SQLite plumbing for the broker queue and the live log store.
//!
//! Both stores are plain SQLite files opened by every driver and worker
//! process. WAL mode plus a busy timeout gives single-statement atomicity
//! across processes; all statements run on the blocking pool.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rusqlite::Connection;

use crate::error::BrokerError;

/// How long a statement waits on a lock held by another process.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply `schema`.
    pub async fn open(path: &Path, schema: &'static str) -> Result<Self, BrokerError> {
        let db_path = path.to_path_buf();
        let unavailable = |message: String| BrokerError::Unavailable {
            path: path.to_path_buf(),
            message,
        };

        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| unavailable(format!("failed to create directory: {e}")))?;
        }

        let open_path = db_path.clone();
        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&open_path)?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.execute_batch(schema)?;
            Ok::<_, rusqlite::Error>(conn)
        })
        .await
        .map_err(|e| BrokerError::Join(e.to_string()))?
        .map_err(|e| unavailable(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: db_path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the connection on the blocking pool.
    pub async fn call<F, R>(&self, f: F) -> Result<R, BrokerError>
    where
        F: FnOnce(&Connection) -> Result<R, BrokerError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&conn)
        })
        .await
        .map_err(|e| BrokerError::Join(e.to_string()))?
    }
}
