//! Durable job and batch state.
//!
//! SQLite in WAL mode behind a bounded [`ConnectionPool`]. Every write runs in
//! an immediate transaction that rolls back on error, so other readers never
//! observe a half-applied status change. The store never retries; retry
//! policy belongs to the worker.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::Serialize;

pub mod batch_repo;
pub mod error;
pub mod job_repo;
pub mod migrations;
pub mod pool;

pub use error::StoreError;
pub use pool::{ConnectionPool, PoolConfig, PooledConn};

/// Thread-safe job store handle.
///
/// Cloning is cheap (inner `Arc`); all clones share the same pool.
#[derive(Clone)]
pub struct JobStore {
    pool: Arc<ConnectionPool>,
}

impl JobStore {
    /// Wraps an already opened pool and brings the schema up to date.
    pub fn new(pool: ConnectionPool) -> Result<Self, StoreError> {
        {
            let mut conn = pool.get()?;
            migrations::run_all(&mut conn)?;
        }
        log::info!("Job store ready at {}", pool.path().display());
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Opens (or creates) the database at the given path.
    pub fn open(path: &Path, config: &PoolConfig) -> Result<Self, StoreError> {
        Self::new(ConnectionPool::open(path, config)?)
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Runs a read against a pooled connection.
    pub(crate) fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self.pool.get()?;
        f(&conn)
    }

    /// Runs `f` inside `BEGIN IMMEDIATE … COMMIT`. Any error rolls the
    /// transaction back before it is returned.
    pub(crate) fn with_tx<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                log::debug!("Transaction rolled back: {}", e);
                // Dropping `tx` would also roll back; doing it explicitly
                // surfaces a failed rollback in the logs.
                if let Err(rollback_err) = tx.rollback() {
                    log::error!("Rollback failed: {}", rollback_err);
                }
                Err(e)
            }
        }
    }
}

/// Snapshot reported by [`JobStore::health`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreHealth {
    pub path: PathBuf,
    pub schema_version: u32,
    pub latest_schema_version: u32,
    pub tables: Vec<String>,
    pub total_jobs: u64,
    pub running_jobs: u64,
    pub pool_size: u32,
    pub idle_connections: u32,
}

impl StoreHealth {
    /// Connected and migrated to the latest schema.
    pub fn is_healthy(&self) -> bool {
        self.schema_version == self.latest_schema_version
            && ["jobs", "batches"]
                .iter()
                .all(|t| self.tables.iter().any(|name| name == t))
    }
}

impl JobStore {
    /// Round-trips a query and reports schema and job counts.
    pub fn health(&self) -> Result<StoreHealth, StoreError> {
        let pool = self.pool();
        self.with_conn(|conn| {
            let _: i64 = conn.query_row("SELECT 1", [], |r| r.get(0))?;
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
                 ORDER BY name",
            )?;
            let tables = stmt
                .query_map([], |r| r.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            let total_jobs: u64 = conn.query_row("SELECT COUNT(*) FROM jobs", [], |r| r.get(0))?;
            let running_jobs: u64 = conn.query_row(
                "SELECT COUNT(*) FROM jobs WHERE status = 'running'",
                [],
                |r| r.get(0),
            )?;

            Ok(StoreHealth {
                path: pool.path().to_path_buf(),
                schema_version: migrations::current_version(conn)?,
                latest_schema_version: migrations::latest_version(),
                tables,
                total_jobs,
                running_jobs,
                pool_size: pool.max_size(),
                idle_connections: pool.idle_connections(),
            })
        })
    }
}

/// Returns the canonical database path: `~/.bulkrun/data/jobs.db`.
pub fn default_database_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".bulkrun").join("data").join("jobs.db"))
}

pub(crate) fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(
    table: &'static str,
    id: i64,
    raw: &str,
) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow {
            table,
            id,
            reason: format!("bad timestamp '{}': {}", raw, e),
        })
}

pub(crate) fn parse_optional_timestamp(
    table: &'static str,
    id: i64,
    raw: Option<String>,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.map(|s| parse_timestamp(table, id, &s)).transpose()
}
