use async_trait::async_trait;
use duckdb::params_from_iter;
use duckdb::types::Value as DuckValue;
use r2d2::Pool;
use serde_json::{Map, Value};
use std::error::Error;
use std::fmt;
use std::time::Instant;
use tracing::{debug, warn};

use crate::config::WarehouseConfig;
use crate::db::db_pool::DuckDBConnectionManager;
use crate::db::db_utils::{duck_to_json, json_to_duck, json_type_name};
use crate::execution::{ColumnInfo, QueryResult, ResultMetadata};
use crate::templates::BoundQuery;

#[derive(Debug)]
pub enum ExecutionError {
    /// The statement was rejected or failed while running.
    Query(String),
    /// No warehouse connection could be obtained.
    Unavailable(String),
    Task(String),
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionError::Query(msg) => write!(f, "Query error: {}", msg),
            ExecutionError::Unavailable(msg) => write!(f, "Warehouse unavailable: {}", msg),
            ExecutionError::Task(msg) => write!(f, "Execution task failed: {}", msg),
        }
    }
}

impl Error for ExecutionError {}

impl From<duckdb::Error> for ExecutionError {
    fn from(err: duckdb::Error) -> Self {
        ExecutionError::Query(err.to_string())
    }
}

impl From<r2d2::Error> for ExecutionError {
    fn from(err: r2d2::Error) -> Self {
        ExecutionError::Unavailable(err.to_string())
    }
}

/// Runs bound SQL against the data being asked about.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute(&self, query: &BoundQuery) -> Result<QueryResult, ExecutionError>;
}

/// Executes against a DuckDB warehouse. Parameters are always bound
/// positionally.
#[derive(Clone)]
pub struct DuckDbExecutor {
    pool: Pool<DuckDBConnectionManager>,
    max_rows: usize,
}

impl DuckDbExecutor {
    pub fn open(config: &WarehouseConfig) -> Result<Self, ExecutionError> {
        let manager = DuckDBConnectionManager::new(config.connection_string.clone())?;
        Self::from_manager(manager, config.pool_size as u32, config.max_rows)
    }

    pub fn in_memory(max_rows: usize) -> Result<Self, ExecutionError> {
        let manager = DuckDBConnectionManager::new(":memory:".to_string())?;
        Self::from_manager(manager, 2, max_rows)
    }

    fn from_manager(
        manager: DuckDBConnectionManager,
        pool_size: u32,
        max_rows: usize,
    ) -> Result<Self, ExecutionError> {
        debug!("Opening warehouse {}", manager.connection_string());
        let pool = Pool::builder().max_size(pool_size.max(1)).build(manager)?;
        Ok(Self { pool, max_rows })
    }

    /// Runs statements without results, e.g. to load data.
    pub fn execute_batch(&self, sql: &str) -> Result<(), ExecutionError> {
        let conn = self.pool.get()?;
        conn.execute_batch(sql)?;
        Ok(())
    }

    fn run(
        pool: &Pool<DuckDBConnectionManager>,
        query: &BoundQuery,
        max_rows: usize,
    ) -> Result<QueryResult, ExecutionError> {
        let started = Instant::now();
        let conn = pool.get()?;
        let mut stmt = conn.prepare(&query.sql)?;
        let values: Vec<DuckValue> = query.params.iter().map(json_to_duck).collect();

        let mut records: Vec<Vec<Value>> = Vec::new();
        let mut truncated = false;
        {
            let mut rows = stmt.query(params_from_iter(values))?;
            while let Some(row) = rows.next()? {
                if records.len() >= max_rows {
                    truncated = true;
                    break;
                }
                let width = row.as_ref().column_count();
                let mut cells = Vec::with_capacity(width);
                for i in 0..width {
                    cells.push(duck_to_json(row.get::<_, DuckValue>(i)?));
                }
                records.push(cells);
            }
        }
        let names = stmt.column_names();

        let columns = names
            .iter()
            .enumerate()
            .map(|(i, name)| ColumnInfo {
                name: name.clone(),
                data_type: records
                    .iter()
                    .map(|r| &r[i])
                    .find(|v| !v.is_null())
                    .map(json_type_name)
                    .unwrap_or("null")
                    .to_string(),
            })
            .collect();

        let rows: Vec<Value> = records
            .into_iter()
            .map(|cells| {
                let record: Map<String, Value> = names.iter().cloned().zip(cells).collect();
                Value::Object(record)
            })
            .collect();

        let mut warnings = Vec::new();
        if truncated {
            warn!("Result truncated to {} rows", max_rows);
            warnings.push(format!("Result truncated to the first {} rows", max_rows));
        }

        Ok(QueryResult {
            metadata: ResultMetadata {
                row_count: rows.len(),
                columns,
                execution_time_ms: started.elapsed().as_millis() as u64,
                warnings,
            },
            rows,
        })
    }
}

#[async_trait]
impl SqlExecutor for DuckDbExecutor {
    async fn execute(&self, query: &BoundQuery) -> Result<QueryResult, ExecutionError> {
        debug!("Executing SQL with {} bound parameters: {}", query.params.len(), query.sql);
        let pool = self.pool.clone();
        let query = query.clone();
        let max_rows = self.max_rows;

        tokio::task::spawn_blocking(move || Self::run(&pool, &query, max_rows))
            .await
            .map_err(|e| ExecutionError::Task(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn warehouse() -> DuckDbExecutor {
        let executor = DuckDbExecutor::in_memory(3).unwrap();
        executor
            .execute_batch(
                "CREATE TABLE fees (student VARCHAR, month VARCHAR, amount INTEGER);
                 INSERT INTO fees VALUES
                     ('ana', '2024-05', 120), ('ben', '2024-05', 80),
                     ('cy', '2024-05', 95), ('dee', '2024-05', 60),
                     ('ana', '2024-06', 130);",
            )
            .unwrap();
        executor
    }

    #[tokio::test]
    async fn binds_parameters_positionally() {
        let executor = warehouse();
        let result = executor
            .execute(&BoundQuery {
                sql: "SELECT student, amount FROM fees WHERE month = ? AND amount > ? ORDER BY student"
                    .into(),
                params: vec![json!("2024-05"), json!(90)],
            })
            .await
            .unwrap();

        assert_eq!(result.metadata.row_count, 2);
        assert_eq!(result.rows[0], json!({"student": "ana", "amount": 120}));
        assert_eq!(result.metadata.columns[0].name, "student");
        assert_eq!(result.metadata.columns[0].data_type, "text");
        assert_eq!(result.metadata.columns[1].data_type, "integer");
        assert!(result.metadata.warnings.is_empty());
    }

    #[tokio::test]
    async fn injected_text_is_treated_as_a_value() {
        let executor = warehouse();
        let result = executor
            .execute(&BoundQuery {
                sql: "SELECT COUNT(*) AS n FROM fees WHERE student = ?".into(),
                params: vec![json!("ana' OR '1'='1")],
            })
            .await
            .unwrap();
        assert_eq!(result.rows, vec![json!({"n": 0})]);
    }

    #[tokio::test]
    async fn caps_rows_with_a_warning() {
        let executor = warehouse();
        let result = executor
            .execute(&BoundQuery::raw("SELECT * FROM fees"))
            .await
            .unwrap();
        assert_eq!(result.metadata.row_count, 3);
        assert_eq!(result.metadata.warnings.len(), 1);
    }

    #[tokio::test]
    async fn bad_sql_is_a_query_error() {
        let executor = warehouse();
        let err = executor
            .execute(&BoundQuery::raw("SELECT nope FROM missing_table"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Query(_)));
    }
}
