pub mod db_pool;
pub mod db_utils;
pub mod schema;

use crate::config::DatabaseConfig;
use crate::db::db_pool::DuckDBConnectionManager;
use crate::error::{QueryError, Result};
use duckdb::Connection;
use parking_lot::Mutex;
use r2d2::Pool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Owned handle to the query memory database.
///
/// Built once at startup and cloned into every component. DuckDB work runs on
/// the blocking pool; each call is bounded by the configured timeout. All
/// mutations pass through a single write gate so that read-then-write
/// sections (hit counters, template aggregates, log sealing) never interleave.
#[derive(Clone)]
pub struct Store {
    pool: Pool<DuckDBConnectionManager>,
    write_gate: Arc<Mutex<()>>,
    timeout: Duration,
}

impl Store {
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        info!("Opening query memory database at {}", config.connection_string);
        let manager = DuckDBConnectionManager::new(config.connection_string.clone())?;
        Self::from_manager(manager, config.pool_size as u32, config.timeout())
    }

    pub fn open_in_memory() -> Result<Self> {
        let manager = DuckDBConnectionManager::new(":memory:".to_string())?;
        Self::from_manager(manager, 4, Duration::from_secs(5))
    }

    fn from_manager(
        manager: DuckDBConnectionManager,
        pool_size: u32,
        timeout: Duration,
    ) -> Result<Self> {
        debug!(
            "Building pool of {} connections for {}",
            pool_size,
            manager.connection_string()
        );
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .connection_timeout(timeout)
            .build(manager)?;

        let conn = pool.get()?;
        schema::bootstrap(&conn)?;

        Ok(Self {
            pool,
            write_gate: Arc::new(Mutex::new(())),
            timeout,
        })
    }

    /// Runs a read-only closure on a pooled connection.
    pub async fn read<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        self.run(op, move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await
    }

    /// Runs a mutating closure while holding the write gate.
    pub async fn write<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        let gate = Arc::clone(&self.write_gate);
        self.run(op, move || {
            let _guard = gate.lock();
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await
    }

    async fn run<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let task = tokio::task::spawn_blocking(f);

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(QueryError::Storage(format!(
                "{} task failed: {}",
                op, join_err
            ))),
            Err(_) => {
                warn!("Storage call {} exceeded {:?}", op, self.timeout);
                Err(QueryError::StorageUnavailable(format!(
                    "{} timed out after {}ms",
                    op,
                    self.timeout.as_millis()
                )))
            }
        }
    }
}
