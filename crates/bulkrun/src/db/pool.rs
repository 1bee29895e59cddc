//! Bounded SQLite connection pool.
//!
//! Wraps an `r2d2` pool of WAL-mode connections. Connections are health-checked
//! when they are checked out. If the pool cannot hand out a connection within
//! the acquire timeout, a temporary connection is opened instead so a burst of
//! callers never blocks a worker indefinitely.

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::time::Duration;

use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use super::StoreError;

/// Sizing and timeouts for the connection pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Fixed number of pooled connections.
    pub max_size: u32,
    /// How long a caller waits for a pooled connection before falling back
    /// to a temporary one.
    pub acquire_timeout_ms: u64,
    /// SQLite busy timeout applied to every connection.
    pub busy_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            acquire_timeout_ms: 5_000,
            busy_timeout_ms: 30_000,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Applies the per-connection pragmas. Shared by pooled and temporary
/// connections so both behave identically.
fn init_connection(conn: &Connection, busy_timeout_ms: u64) -> Result<(), rusqlite::Error> {
    conn.execute_batch(&format!(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA foreign_keys=ON;
         PRAGMA temp_store=MEMORY;
         PRAGMA busy_timeout={};",
        busy_timeout_ms
    ))
}

/// A fixed-capacity pool of connections to one database file.
pub struct ConnectionPool {
    pool: r2d2::Pool<SqliteConnectionManager>,
    path: PathBuf,
    config: PoolConfig,
}

impl ConnectionPool {
    /// Opens (or creates) the database file and fills the pool.
    pub fn open(path: &Path, config: &PoolConfig) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Io {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }

        let busy_timeout_ms = config.busy_timeout_ms;
        let manager = SqliteConnectionManager::file(path)
            .with_init(move |conn| init_connection(conn, busy_timeout_ms));

        let pool = r2d2::Pool::builder()
            .max_size(config.max_size.max(1))
            .connection_timeout(config.acquire_timeout())
            .test_on_check_out(true)
            .build(manager)?;

        log::info!(
            "Connection pool opened at {} (max_size={})",
            path.display(),
            pool.max_size()
        );

        Ok(Self {
            pool,
            path: path.to_path_buf(),
            config: config.clone(),
        })
    }

    /// Checks out a connection, falling back to a temporary connection when
    /// the pool stays exhausted for longer than the acquire timeout.
    pub fn get(&self) -> Result<PooledConn, StoreError> {
        match self.pool.get_timeout(self.config.acquire_timeout()) {
            Ok(conn) => Ok(PooledConn::Pooled(conn)),
            Err(e) => {
                log::warn!(
                    "Connection pool exhausted ({}), opening temporary connection",
                    e
                );
                let conn = Connection::open(&self.path)?;
                init_connection(&conn, self.config.busy_timeout_ms)?;
                Ok(PooledConn::Temporary(conn))
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_size(&self) -> u32 {
        self.pool.max_size()
    }

    /// Connections currently idle in the pool.
    pub fn idle_connections(&self) -> u32 {
        self.pool.state().idle_connections
    }
}

/// A connection borrowed from [`ConnectionPool`]. Pooled connections return
/// to the pool on drop; temporary ones are closed.
pub enum PooledConn {
    Pooled(r2d2::PooledConnection<SqliteConnectionManager>),
    Temporary(Connection),
}

impl PooledConn {
    pub fn is_temporary(&self) -> bool {
        matches!(self, PooledConn::Temporary(_))
    }
}

impl Deref for PooledConn {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match self {
            PooledConn::Pooled(conn) => &**conn,
            PooledConn::Temporary(conn) => conn,
        }
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Connection {
        match self {
            PooledConn::Pooled(conn) => &mut **conn,
            PooledConn::Temporary(conn) => conn,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool(dir: &Path, max_size: u32) -> ConnectionPool {
        let config = PoolConfig {
            max_size,
            acquire_timeout_ms: 50,
            busy_timeout_ms: 1_000,
        };
        ConnectionPool::open(&dir.join("pool.db"), &config).unwrap()
    }

    #[test]
    fn test_pool_connections_use_wal() {
        let dir = tempfile::tempdir().unwrap();
        let pool = small_pool(dir.path(), 2);
        let conn = pool.get().unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |r| r.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        assert!(!conn.is_temporary());
    }

    #[test]
    fn test_exhausted_pool_falls_back_to_temporary_connection() {
        let dir = tempfile::tempdir().unwrap();
        let pool = small_pool(dir.path(), 1);

        let held = pool.get().unwrap();
        assert!(!held.is_temporary());

        let fallback = pool.get().unwrap();
        assert!(fallback.is_temporary());
        let one: i64 = fallback.query_row("SELECT 1", [], |r| r.get(0)).unwrap();
        assert_eq!(one, 1);
    }

    #[test]
    fn test_connection_returns_to_pool_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let pool = small_pool(dir.path(), 1);

        {
            let _conn = pool.get().unwrap();
            assert_eq!(pool.idle_connections(), 0);
        }
        assert_eq!(pool.idle_connections(), 1);

        let again = pool.get().unwrap();
        assert!(!again.is_temporary());
    }

    #[test]
    fn test_open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("data").join("jobs.db");
        let pool = ConnectionPool::open(&path, &PoolConfig::default()).unwrap();
        assert!(path.exists());
        assert_eq!(pool.path(), path.as_path());
    }
}
