//! Append-only record of every query attempt.
//!
//! Entries are created `pending` by [`ExecutionLog::begin`] and sealed exactly
//! once by one of the `complete_*` calls. Sealing is a conditional update on
//! `status = 'pending'`, so a second completion (or one against an id that
//! was never begun) is rejected with `InvalidLogTransition`.

use chrono::{DateTime, Utc};
use duckdb::types::Value as DuckValue;
use duckdb::{Connection, Row, params, params_from_iter};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::db::Store;
use crate::db::db_utils::{
    from_json_text, from_millis, opt_from_json_text, opt_from_millis, query_opt, to_json_text,
    to_millis,
};
use crate::error::{QueryError, Result};
use crate::execution::{
    ComplexityTier, ExecutionStatus, FailureKind, IntentAnalysis, QueryResult, ResultMetadata,
    Timings, TokenUsage,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub id: i64,
    pub user_id: i64,
    pub session_id: Option<String>,
    pub query_text: String,
    pub intent: Option<IntentAnalysis>,
    pub generated_sql: Option<String>,
    pub final_sql: Option<String>,
    pub status: ExecutionStatus,
    pub execution_time_ms: Option<u64>,
    pub ai_processing_time_ms: Option<u64>,
    pub result: Option<QueryResult>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub tokens_used: Option<u32>,
    pub model: Option<String>,
    pub cache_hit: bool,
    pub complexity: Option<i32>,
    /// Cache key this attempt produced or was served from.
    pub query_hash: Option<String>,
    pub template_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionLogEntry {
    /// `"<category>: <message>"` for failed attempts.
    pub fn failure_summary(&self) -> Option<String> {
        let message = self.error_message.as_deref()?;
        let label = self
            .error_type
            .as_deref()
            .and_then(FailureKind::parse)
            .map(|kind| kind.label())
            .unwrap_or("The query failed");
        Some(format!("{}: {}", label, message))
    }
}

/// Everything known about an attempt that produced a result.
#[derive(Debug, Clone, Default)]
pub struct SuccessRecord {
    pub generated_sql: Option<String>,
    pub final_sql: String,
    pub result: QueryResult,
    pub timings: Timings,
    pub token_usage: Option<TokenUsage>,
    pub cache_hit: bool,
    pub intent: Option<IntentAnalysis>,
    pub complexity: Option<i32>,
    pub query_hash: Option<String>,
    pub template_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogFilter {
    pub user_id: Option<i64>,
    pub status: Option<ExecutionStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub model: Option<String>,
    pub cache_hit: Option<bool>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageReport {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub pending: u64,
    pub cache_hits: u64,
    pub cache_hit_rate: f64,
    pub avg_execution_time_ms: f64,
    pub total_tokens: u64,
    pub by_model: BTreeMap<String, u64>,
    pub by_complexity: BTreeMap<String, u64>,
}

const LOG_COLUMNS: &str = "id, user_id, session_id, query_text, intent, generated_sql, final_sql, \
     status, execution_time_ms, ai_processing_time_ms, result_rows, result_metadata, error_type, \
     error_message, tokens_used, model, cache_hit, complexity, query_hash, template_name, \
     created_at, completed_at";

#[derive(Clone)]
pub struct ExecutionLog {
    store: Store,
}

impl ExecutionLog {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Opens a `pending` entry and returns its id.
    pub async fn begin(
        &self,
        user_id: i64,
        query_text: &str,
        session_id: Option<&str>,
    ) -> Result<i64> {
        let query_text = query_text.to_string();
        let session_id = session_id.map(str::to_string);
        let now = to_millis(Utc::now());

        let id = self
            .store
            .write("log.begin", move |conn| {
                Ok(conn.query_row(
                    "INSERT INTO query_logs (user_id, session_id, query_text, status, created_at)
                     VALUES (?, ?, ?, 'pending', ?) RETURNING id",
                    params![user_id, session_id, query_text, now],
                    |row| row.get::<_, i64>(0),
                )?)
            })
            .await?;

        debug!("Opened execution log {} for user {}", id, user_id);
        Ok(id)
    }

    pub async fn complete_success(&self, log_id: i64, record: SuccessRecord) -> Result<()> {
        let rows = to_json_text(&record.result.rows)?;
        let metadata = to_json_text(&record.result.metadata)?;
        let intent = record.intent.as_ref().map(to_json_text).transpose()?;
        let complexity = record
            .complexity
            .or_else(|| record.intent.as_ref().and_then(|i| i.complexity));
        let (tokens, model) = match record.token_usage {
            Some(usage) => (Some(usage.tokens_used as i64), Some(usage.model)),
            None => (None, None),
        };
        let now = to_millis(Utc::now());

        self.store
            .write("log.complete_success", move |conn| {
                let updated = conn.execute(
                    "UPDATE query_logs SET status = 'success', generated_sql = ?, final_sql = ?,
                         execution_time_ms = ?, ai_processing_time_ms = ?, result_rows = ?,
                         result_metadata = ?, tokens_used = ?, model = ?, cache_hit = ?,
                         intent = ?, complexity = ?, query_hash = ?, template_name = ?,
                         completed_at = ?
                     WHERE id = ? AND status = 'pending'",
                    params![
                        record.generated_sql,
                        record.final_sql,
                        record.timings.execution_ms.map(|v| v as i64),
                        record.timings.ai_processing_ms.map(|v| v as i64),
                        rows,
                        metadata,
                        tokens,
                        model,
                        record.cache_hit,
                        intent,
                        complexity,
                        record.query_hash,
                        record.template_name,
                        now,
                        log_id
                    ],
                )?;
                ensure_transitioned(conn, log_id, updated)
            })
            .await
    }

    pub async fn complete_failure(
        &self,
        log_id: i64,
        kind: FailureKind,
        message: impl Into<String>,
        timings: Timings,
    ) -> Result<()> {
        let message = message.into();
        let now = to_millis(Utc::now());

        self.store
            .write("log.complete_failure", move |conn| {
                let updated = conn.execute(
                    "UPDATE query_logs SET status = 'failed', error_type = ?, error_message = ?,
                         execution_time_ms = ?, ai_processing_time_ms = ?, completed_at = ?
                     WHERE id = ? AND status = 'pending'",
                    params![
                        kind.as_str(),
                        message,
                        timings.execution_ms.map(|v| v as i64),
                        timings.ai_processing_ms.map(|v| v as i64),
                        now,
                        log_id
                    ],
                )?;
                ensure_transitioned(conn, log_id, updated)
            })
            .await
    }

    /// Seals an attempt the caller abandoned on purpose.
    pub async fn cancel(&self, log_id: i64) -> Result<()> {
        let now = to_millis(Utc::now());
        self.store
            .write("log.cancel", move |conn| {
                let updated = conn.execute(
                    "UPDATE query_logs SET status = 'cancelled', completed_at = ?
                     WHERE id = ? AND status = 'pending'",
                    params![now, log_id],
                )?;
                ensure_transitioned(conn, log_id, updated)
            })
            .await
    }

    pub async fn get(&self, log_id: i64) -> Result<ExecutionLogEntry> {
        self.store
            .read("log.get", move |conn| {
                let sql = format!("SELECT {} FROM query_logs WHERE id = ?", LOG_COLUMNS);
                let raw = query_opt(conn, &sql, params![log_id], RawLog::from_row)?
                    .ok_or_else(|| QueryError::NotFound(format!("execution log {}", log_id)))?;
                raw.into_entry()
            })
            .await
    }

    /// Current status, or `None` when the id was never begun.
    pub async fn status(&self, log_id: i64) -> Result<Option<ExecutionStatus>> {
        self.store
            .read("log.status", move |conn| current_status(conn, log_id))
            .await
    }

    /// Newest first.
    pub async fn list(&self, filter: LogFilter) -> Result<Vec<ExecutionLogEntry>> {
        self.store
            .read("log.list", move |conn| {
                let (clause, values) = where_clause(&filter);
                let mut sql = format!(
                    "SELECT {} FROM query_logs{} ORDER BY created_at DESC, id DESC",
                    LOG_COLUMNS, clause
                );
                if let Some(limit) = filter.limit {
                    sql.push_str(&format!(" LIMIT {}", limit));
                }

                let mut stmt = conn.prepare(&sql)?;
                let raws = stmt
                    .query_map(params_from_iter(values), RawLog::from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                raws.into_iter().map(RawLog::into_entry).collect()
            })
            .await
    }

    /// Seals `pending` entries older than `max_age` as timed out.
    pub async fn expire_stale_pending(&self, max_age: Duration) -> Result<usize> {
        let now = Utc::now();
        let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        let cutoff = to_millis(now).saturating_sub(max_age_ms);
        let completed_at = to_millis(now);

        let expired = self
            .store
            .write("log.expire_stale_pending", move |conn| {
                Ok(conn.execute(
                    "UPDATE query_logs SET status = 'failed', error_type = ?,
                         error_message = 'abandoned before completion', completed_at = ?
                     WHERE status = 'pending' AND created_at <= ?",
                    params![FailureKind::Timeout.as_str(), completed_at, cutoff],
                )?)
            })
            .await?;

        if expired > 0 {
            warn!("Sealed {} abandoned pending execution(s) as timed out", expired);
        }
        Ok(expired)
    }

    pub async fn usage_report(&self, filter: LogFilter) -> Result<UsageReport> {
        let report = self
            .store
            .read("log.usage_report", move |conn| {
                let (clause, values) = where_clause(&filter);
                let sql = format!(
                    "SELECT status, cache_hit, model, complexity, execution_time_ms, tokens_used
                     FROM query_logs{}",
                    clause
                );

                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params_from_iter(values), |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, bool>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, Option<i32>>(3)?,
                            row.get::<_, Option<i64>>(4)?,
                            row.get::<_, Option<i64>>(5)?,
                        ))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;

                let mut report = UsageReport::default();
                let mut timed = 0u64;
                let mut time_sum = 0f64;

                for (status, cache_hit, model, complexity, execution_ms, tokens) in rows {
                    report.total += 1;
                    match status.parse::<ExecutionStatus>()? {
                        ExecutionStatus::Pending => report.pending += 1,
                        ExecutionStatus::Success => {
                            report.success += 1;
                            if let Some(ms) = execution_ms {
                                timed += 1;
                                time_sum += ms as f64;
                            }
                        }
                        ExecutionStatus::Failed => report.failed += 1,
                        ExecutionStatus::Cancelled => report.cancelled += 1,
                    }
                    if cache_hit {
                        report.cache_hits += 1;
                    }
                    if let Some(model) = model {
                        *report.by_model.entry(model).or_default() += 1;
                    }
                    if let Some(score) = complexity {
                        let tier = ComplexityTier::from_score(score).as_str().to_string();
                        *report.by_complexity.entry(tier).or_default() += 1;
                    }
                    report.total_tokens += tokens.unwrap_or(0).max(0) as u64;
                }

                if report.total > 0 {
                    report.cache_hit_rate = report.cache_hits as f64 / report.total as f64;
                }
                if timed > 0 {
                    report.avg_execution_time_ms = time_sum / timed as f64;
                }
                Ok(report)
            })
            .await?;

        info!(
            "Usage report: {} attempts, {} succeeded, {} cache hits",
            report.total, report.success, report.cache_hits
        );
        Ok(report)
    }
}

fn current_status(conn: &Connection, log_id: i64) -> Result<Option<ExecutionStatus>> {
    query_opt(
        conn,
        "SELECT status FROM query_logs WHERE id = ?",
        params![log_id],
        |row| row.get::<_, String>(0),
    )?
    .map(|s| s.parse())
    .transpose()
}

fn ensure_transitioned(conn: &Connection, log_id: i64, updated: usize) -> Result<()> {
    if updated == 1 {
        return Ok(());
    }
    let current = current_status(conn, log_id)?;
    warn!(
        "Rejected completion of execution log {} (current state: {:?})",
        log_id, current
    );
    Err(QueryError::InvalidLogTransition { log_id, current })
}

fn where_clause(filter: &LogFilter) -> (String, Vec<DuckValue>) {
    let mut conditions = Vec::new();
    let mut values = Vec::new();

    if let Some(user_id) = filter.user_id {
        conditions.push("user_id = ?");
        values.push(DuckValue::BigInt(user_id));
    }
    if let Some(status) = filter.status {
        conditions.push("status = ?");
        values.push(DuckValue::Text(status.as_str().to_string()));
    }
    if let Some(since) = filter.since {
        conditions.push("created_at >= ?");
        values.push(DuckValue::BigInt(to_millis(since)));
    }
    if let Some(until) = filter.until {
        conditions.push("created_at < ?");
        values.push(DuckValue::BigInt(to_millis(until)));
    }
    if let Some(model) = &filter.model {
        conditions.push("model = ?");
        values.push(DuckValue::Text(model.clone()));
    }
    if let Some(cache_hit) = filter.cache_hit {
        conditions.push("cache_hit = ?");
        values.push(DuckValue::Boolean(cache_hit));
    }

    if conditions.is_empty() {
        (String::new(), values)
    } else {
        (format!(" WHERE {}", conditions.join(" AND ")), values)
    }
}

/// Column values as stored, before JSON decoding.
struct RawLog {
    id: i64,
    user_id: i64,
    session_id: Option<String>,
    query_text: String,
    intent: Option<String>,
    generated_sql: Option<String>,
    final_sql: Option<String>,
    status: String,
    execution_time_ms: Option<i64>,
    ai_processing_time_ms: Option<i64>,
    result_rows: Option<String>,
    result_metadata: Option<String>,
    error_type: Option<String>,
    error_message: Option<String>,
    tokens_used: Option<i64>,
    model: Option<String>,
    cache_hit: bool,
    complexity: Option<i32>,
    query_hash: Option<String>,
    template_name: Option<String>,
    created_at: i64,
    completed_at: Option<i64>,
}

impl RawLog {
    fn from_row(row: &Row<'_>) -> duckdb::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            session_id: row.get(2)?,
            query_text: row.get(3)?,
            intent: row.get(4)?,
            generated_sql: row.get(5)?,
            final_sql: row.get(6)?,
            status: row.get(7)?,
            execution_time_ms: row.get(8)?,
            ai_processing_time_ms: row.get(9)?,
            result_rows: row.get(10)?,
            result_metadata: row.get(11)?,
            error_type: row.get(12)?,
            error_message: row.get(13)?,
            tokens_used: row.get(14)?,
            model: row.get(15)?,
            cache_hit: row.get(16)?,
            complexity: row.get(17)?,
            query_hash: row.get(18)?,
            template_name: row.get(19)?,
            created_at: row.get(20)?,
            completed_at: row.get(21)?,
        })
    }

    fn into_entry(self) -> Result<ExecutionLogEntry> {
        let result = match (self.result_rows, self.result_metadata) {
            (Some(rows), Some(metadata)) => Some(QueryResult {
                rows: from_json_text(&rows)?,
                metadata: from_json_text::<ResultMetadata>(&metadata)?,
            }),
            _ => None,
        };

        Ok(ExecutionLogEntry {
            id: self.id,
            user_id: self.user_id,
            session_id: self.session_id,
            query_text: self.query_text,
            intent: opt_from_json_text(self.intent)?,
            generated_sql: self.generated_sql,
            final_sql: self.final_sql,
            status: self.status.parse()?,
            execution_time_ms: self.execution_time_ms.map(|v| v.max(0) as u64),
            ai_processing_time_ms: self.ai_processing_time_ms.map(|v| v.max(0) as u64),
            result,
            error_type: self.error_type,
            error_message: self.error_message,
            tokens_used: self.tokens_used.map(|v| v.max(0) as u32),
            model: self.model,
            cache_hit: self.cache_hit,
            complexity: self.complexity,
            query_hash: self.query_hash,
            template_name: self.template_name,
            created_at: from_millis(self.created_at),
            completed_at: opt_from_millis(self.completed_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ColumnInfo;
    use serde_json::json;

    fn log() -> ExecutionLog {
        ExecutionLog::new(Store::open_in_memory().unwrap())
    }

    fn sample_success(model: &str) -> SuccessRecord {
        SuccessRecord {
            generated_sql: Some("SELECT count(*) AS n FROM payments".into()),
            final_sql: "SELECT count(*) AS n FROM payments".into(),
            result: QueryResult {
                rows: vec![json!({"n": 12})],
                metadata: ResultMetadata {
                    row_count: 1,
                    columns: vec![ColumnInfo {
                        name: "n".into(),
                        data_type: "integer".into(),
                    }],
                    execution_time_ms: 14,
                    warnings: vec![],
                },
            },
            timings: Timings {
                execution_ms: Some(14),
                ai_processing_ms: Some(850),
            },
            token_usage: Some(TokenUsage {
                tokens_used: 420,
                model: model.into(),
            }),
            complexity: Some(2),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn begin_then_success_fills_result_fields() {
        let log = log();
        let id = log.begin(7, "how many payments", Some("s-1")).await.unwrap();

        let pending = log.get(id).await.unwrap();
        assert_eq!(pending.status, ExecutionStatus::Pending);
        assert_eq!(pending.session_id.as_deref(), Some("s-1"));

        log.complete_success(id, sample_success("sqlcoder")).await.unwrap();

        let entry = log.get(id).await.unwrap();
        assert_eq!(entry.status, ExecutionStatus::Success);
        assert_eq!(entry.tokens_used, Some(420));
        assert_eq!(entry.model.as_deref(), Some("sqlcoder"));
        assert_eq!(entry.result.unwrap().rows, vec![json!({"n": 12})]);
        assert_eq!(entry.ai_processing_time_ms, Some(850));
        assert!(entry.completed_at.is_some());
    }

    #[tokio::test]
    async fn ids_are_monotonic() {
        let log = log();
        let first = log.begin(1, "a", None).await.unwrap();
        let second = log.begin(1, "b", None).await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn sealed_entries_reject_second_completion() {
        let log = log();
        let id = log.begin(1, "q", None).await.unwrap();
        log.complete_success(id, sample_success("m")).await.unwrap();

        let again = log.complete_success(id, sample_success("m")).await.unwrap_err();
        assert!(matches!(
            again,
            QueryError::InvalidLogTransition {
                current: Some(ExecutionStatus::Success),
                ..
            }
        ));

        let failure = log
            .complete_failure(id, FailureKind::Execution, "boom", Timings::default())
            .await
            .unwrap_err();
        assert!(matches!(failure, QueryError::InvalidLogTransition { .. }));

        // the sealed entry is untouched
        assert_eq!(log.get(id).await.unwrap().status, ExecutionStatus::Success);
    }

    #[tokio::test]
    async fn completing_unknown_id_is_invalid_transition() {
        let log = log();
        let err = log
            .complete_failure(999, FailureKind::Generation, "x", Timings::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QueryError::InvalidLogTransition {
                log_id: 999,
                current: None
            }
        ));
    }

    #[tokio::test]
    async fn failure_keeps_partial_telemetry_and_summary() {
        let log = log();
        let id = log.begin(3, "q", None).await.unwrap();
        log.complete_failure(
            id,
            FailureKind::Execution,
            "column \"fee\" not found",
            Timings {
                execution_ms: Some(31),
                ai_processing_ms: Some(900),
            },
        )
        .await
        .unwrap();

        let entry = log.get(id).await.unwrap();
        assert_eq!(entry.status, ExecutionStatus::Failed);
        assert_eq!(entry.error_type.as_deref(), Some("execution"));
        assert_eq!(entry.execution_time_ms, Some(31));
        assert_eq!(
            entry.failure_summary().unwrap(),
            "The query could not be run: column \"fee\" not found"
        );
    }

    #[tokio::test]
    async fn cancel_seals_pending_entry() {
        let log = log();
        let id = log.begin(3, "q", None).await.unwrap();
        log.cancel(id).await.unwrap();
        assert_eq!(log.status(id).await.unwrap(), Some(ExecutionStatus::Cancelled));
        assert!(log.cancel(id).await.is_err());
    }

    #[tokio::test]
    async fn list_filters_by_user_status_and_cache_hit() {
        let log = log();
        let a = log.begin(1, "a", None).await.unwrap();
        let b = log.begin(2, "b", None).await.unwrap();
        let c = log.begin(1, "c", None).await.unwrap();
        log.complete_success(a, sample_success("m1")).await.unwrap();
        let mut cached = sample_success("m2");
        cached.cache_hit = true;
        log.complete_success(b, cached).await.unwrap();
        log.complete_failure(c, FailureKind::Generation, "no sql", Timings::default())
            .await
            .unwrap();

        let user_one = log
            .list(LogFilter {
                user_id: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(user_one.iter().map(|e| e.id).collect::<Vec<_>>(), vec![c, a]);

        let hits = log
            .list(LogFilter {
                cache_hit: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, b);

        let failed = log
            .list(LogFilter {
                status: Some(ExecutionStatus::Failed),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);

        let by_model = log
            .list(LogFilter {
                model: Some("m1".into()),
                limit: Some(5),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_model.len(), 1);
    }

    #[tokio::test]
    async fn stale_pending_entries_are_sealed_as_timeouts() {
        let log = log();
        let stale = log.begin(1, "q", None).await.unwrap();
        let done = log.begin(1, "q2", None).await.unwrap();
        log.complete_success(done, sample_success("m")).await.unwrap();

        let sealed = log.expire_stale_pending(Duration::ZERO).await.unwrap();
        assert_eq!(sealed, 1);

        let entry = log.get(stale).await.unwrap();
        assert_eq!(entry.status, ExecutionStatus::Failed);
        assert_eq!(entry.error_type.as_deref(), Some("timeout"));

        let untouched = log.expire_stale_pending(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(untouched, 0);
    }

    #[tokio::test]
    async fn huge_max_age_expires_nothing() {
        let log = log();
        let pending = log.begin(1, "q", None).await.unwrap();

        assert_eq!(log.expire_stale_pending(Duration::MAX).await.unwrap(), 0);
        assert_eq!(
            log.expire_stale_pending(Duration::from_millis(u64::MAX)).await.unwrap(),
            0
        );
        assert_eq!(log.get(pending).await.unwrap().status, ExecutionStatus::Pending);
    }

    #[tokio::test]
    async fn usage_report_aggregates_outcomes() {
        let log = log();
        let a = log.begin(1, "a", None).await.unwrap();
        let b = log.begin(1, "b", None).await.unwrap();
        let c = log.begin(1, "c", None).await.unwrap();
        let _pending = log.begin(1, "d", None).await.unwrap();

        log.complete_success(a, sample_success("m1")).await.unwrap();
        let mut hit = sample_success("m1");
        hit.cache_hit = true;
        hit.timings.execution_ms = Some(6);
        hit.complexity = Some(8);
        log.complete_success(b, hit).await.unwrap();
        log.complete_failure(c, FailureKind::Execution, "x", Timings::default())
            .await
            .unwrap();

        let report = log.usage_report(LogFilter::default()).await.unwrap();
        assert_eq!(report.total, 4);
        assert_eq!(report.success, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.pending, 1);
        assert_eq!(report.cache_hits, 1);
        assert_eq!(report.cache_hit_rate, 0.25);
        assert_eq!(report.avg_execution_time_ms, 10.0);
        assert_eq!(report.total_tokens, 840);
        assert_eq!(report.by_model.get("m1"), Some(&2));
        assert_eq!(report.by_complexity.get("simple"), Some(&1));
        assert_eq!(report.by_complexity.get("complex"), Some(&1));
    }
}
