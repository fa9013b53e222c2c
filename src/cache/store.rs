use chrono::{DateTime, TimeDelta, Utc};
use duckdb::{Row, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

use crate::cache::key::{derive_context_hash, derive_query_hash};
use crate::db::Store;
use crate::db::db_utils::{
    from_json_text, from_millis, opt_from_millis, query_opt, to_json_text, to_millis,
};
use crate::error::{QueryError, Result};
use crate::execution::{QueryResult, ResultMetadata};

/// A remembered answer to one (question, context) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub query_hash: String,
    pub query_text: String,
    pub context_hash: String,
    pub generated_sql: String,
    pub result: QueryResult,
    pub hit_count: i64,
    pub last_hit_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub is_valid: bool,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(
        query_text: &str,
        context: &Value,
        generated_sql: impl Into<String>,
        result: QueryResult,
        ttl: Duration,
    ) -> Self {
        let context_hash = derive_context_hash(context);
        let now = Utc::now();
        let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);

        Self {
            query_hash: derive_query_hash(query_text, &context_hash),
            query_text: query_text.to_string(),
            context_hash,
            generated_sql: generated_sql.into(),
            result,
            hit_count: 0,
            last_hit_at: None,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            is_valid: true,
            created_at: now,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Entries whose stored expiry is still in the future.
    pub total: u64,
    pub valid: u64,
    pub invalid: u64,
    /// Entries that crossed their expiry between the scan and the TTL check.
    pub expired: u64,
    pub total_hits: u64,
    pub avg_hits_per_entry: f64,
}

const CACHE_COLUMNS: &str = "query_hash, query_text, context_hash, generated_sql, result_rows, \
     result_metadata, hit_count, last_hit_at, expires_at, is_valid, created_at";

#[derive(Clone)]
pub struct QueryCacheStore {
    store: Store,
    default_ttl: Duration,
}

impl QueryCacheStore {
    pub fn new(store: Store, default_ttl: Duration) -> Self {
        Self { store, default_ttl }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Builds an entry that expires after the configured TTL.
    pub fn entry_for(
        &self,
        query_text: &str,
        context: &Value,
        generated_sql: impl Into<String>,
        result: QueryResult,
    ) -> CacheEntry {
        CacheEntry::new(query_text, context, generated_sql, result, self.default_ttl)
    }

    /// Returns the entry only while it is valid and unexpired. Does not count
    /// as a hit; callers serving the entry follow up with [`Self::record_hit`].
    pub async fn lookup(&self, query_text: &str, context: &Value) -> Result<Option<CacheEntry>> {
        let query_hash = derive_query_hash(query_text, &derive_context_hash(context));
        let now = Utc::now();
        let now_ms = to_millis(now);

        let lookup_hash = query_hash.clone();
        let entry = self
            .store
            .read("cache.lookup", move |conn| {
                let sql = format!(
                    "SELECT {} FROM query_cache WHERE query_hash = ? AND is_valid AND expires_at > ?",
                    CACHE_COLUMNS
                );
                query_opt(conn, &sql, params![lookup_hash, now_ms], RawEntry::from_row)?
                    .map(RawEntry::into_entry)
                    .transpose()
            })
            .await?
            .filter(|entry| entry.is_valid && !entry.is_expired_at(now));

        match &entry {
            Some(_) => debug!("Cache hit for {}", query_hash),
            None => debug!("Cache miss for {}", query_hash),
        }
        Ok(entry)
    }

    /// Any stored entry, including invalid or expired ones.
    pub async fn get(&self, query_hash: &str) -> Result<Option<CacheEntry>> {
        let query_hash = query_hash.to_string();
        self.store
            .read("cache.get", move |conn| {
                let sql = format!("SELECT {} FROM query_cache WHERE query_hash = ?", CACHE_COLUMNS);
                query_opt(conn, &sql, params![query_hash], RawEntry::from_row)?
                    .map(RawEntry::into_entry)
                    .transpose()
            })
            .await
    }

    /// Inserts the entry, or replaces SQL, result, expiry and validity of the
    /// entry already stored under the same key. Hit accounting is kept.
    pub async fn put(&self, entry: &CacheEntry) -> Result<()> {
        let rows = to_json_text(&entry.result.rows)?;
        let metadata = to_json_text(&entry.result.metadata)?;
        let entry = entry.clone();

        self.store
            .write("cache.put", move |conn| {
                conn.execute(
                    "INSERT INTO query_cache (query_hash, query_text, context_hash, generated_sql,
                         result_rows, result_metadata, hit_count, last_hit_at, expires_at,
                         is_valid, created_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT (query_hash) DO UPDATE SET
                         query_text = excluded.query_text,
                         generated_sql = excluded.generated_sql,
                         result_rows = excluded.result_rows,
                         result_metadata = excluded.result_metadata,
                         expires_at = excluded.expires_at,
                         is_valid = excluded.is_valid",
                    params![
                        entry.query_hash,
                        entry.query_text,
                        entry.context_hash,
                        entry.generated_sql,
                        rows,
                        metadata,
                        entry.hit_count,
                        entry.last_hit_at.map(to_millis),
                        to_millis(entry.expires_at),
                        entry.is_valid,
                        to_millis(entry.created_at)
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Counts one serve of `entry`. The increment happens in a single SQL
    /// statement; `entry` is refreshed with the stored counter afterwards.
    pub async fn record_hit(&self, entry: &mut CacheEntry) -> Result<()> {
        let query_hash = entry.query_hash.clone();
        let now = Utc::now();
        let now_ms = to_millis(now);

        let hit_count = self
            .store
            .write("cache.record_hit", move |conn| {
                let updated = conn.execute(
                    "UPDATE query_cache SET hit_count = hit_count + 1, last_hit_at = ?
                     WHERE query_hash = ?",
                    params![now_ms, query_hash],
                )?;
                if updated == 0 {
                    return Err(QueryError::NotFound(format!("cache entry {}", query_hash)));
                }
                Ok(conn.query_row(
                    "SELECT hit_count FROM query_cache WHERE query_hash = ?",
                    params![query_hash],
                    |row| row.get::<_, i64>(0),
                )?)
            })
            .await?;

        entry.hit_count = hit_count;
        entry.last_hit_at = Some(from_millis(now_ms));
        Ok(())
    }

    pub async fn invalidate(&self, entry: &mut CacheEntry) -> Result<bool> {
        let found = self.invalidate_key(&entry.query_hash).await?;
        entry.is_valid = false;
        Ok(found)
    }

    /// Marks the entry invalid without deleting it. Returns whether it existed.
    pub async fn invalidate_key(&self, query_hash: &str) -> Result<bool> {
        let query_hash = query_hash.to_string();
        let updated = self
            .store
            .write("cache.invalidate", move |conn| {
                Ok(conn.execute(
                    "UPDATE query_cache SET is_valid = false WHERE query_hash = ?",
                    params![query_hash],
                )?)
            })
            .await?;
        Ok(updated > 0)
    }

    /// Invalidates every entry computed under one execution context.
    pub async fn invalidate_context(&self, context_hash: &str) -> Result<usize> {
        let context_hash = context_hash.to_string();
        let updated = self
            .store
            .write("cache.invalidate_context", move |conn| {
                Ok(conn.execute(
                    "UPDATE query_cache SET is_valid = false WHERE context_hash = ? AND is_valid",
                    params![context_hash],
                )?)
            })
            .await?;
        info!("Invalidated {} cache entries for context", updated);
        Ok(updated)
    }

    pub async fn sweep_expired(&self) -> Result<usize> {
        let now_ms = to_millis(Utc::now());
        let removed = self
            .store
            .write("cache.sweep_expired", move |conn| {
                Ok(conn.execute(
                    "DELETE FROM query_cache WHERE expires_at < ?",
                    params![now_ms],
                )?)
            })
            .await?;
        info!("Swept {} expired cache entries", removed);
        Ok(removed)
    }

    /// Invalid entries are kept for inspection until they have also expired.
    pub async fn sweep_invalid(&self) -> Result<usize> {
        let now_ms = to_millis(Utc::now());
        let removed = self
            .store
            .write("cache.sweep_invalid", move |conn| {
                Ok(conn.execute(
                    "DELETE FROM query_cache WHERE NOT is_valid AND expires_at < ?",
                    params![now_ms],
                )?)
            })
            .await?;
        info!("Swept {} invalid cache entries", removed);
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        let scan_ms = to_millis(Utc::now());
        let rows = self
            .store
            .read("cache.stats", move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT is_valid, hit_count, expires_at FROM query_cache WHERE expires_at > ?",
                )?;
                let rows = stmt
                    .query_map(params![scan_ms], |row| {
                        Ok((
                            row.get::<_, bool>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                        ))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        // second pass uses a fresh clock
        let now = Utc::now();
        let mut stats = CacheStats::default();
        for (is_valid, hits, expires_at) in rows {
            stats.total += 1;
            stats.total_hits += hits.max(0) as u64;
            if now >= from_millis(expires_at) {
                stats.expired += 1;
            } else if is_valid {
                stats.valid += 1;
            } else {
                stats.invalid += 1;
            }
        }
        if stats.total > 0 {
            stats.avg_hits_per_entry = stats.total_hits as f64 / stats.total as f64;
        }
        Ok(stats)
    }

    /// Most served entries first; ties go to the most recently served.
    pub async fn top_entries(&self, limit: usize) -> Result<Vec<CacheEntry>> {
        let now_ms = to_millis(Utc::now());
        self.store
            .read("cache.top_entries", move |conn| {
                let sql = format!(
                    "SELECT {} FROM query_cache
                     WHERE is_valid AND expires_at > ?
                     ORDER BY hit_count DESC, last_hit_at DESC NULLS LAST
                     LIMIT {}",
                    CACHE_COLUMNS, limit
                );
                let mut stmt = conn.prepare(&sql)?;
                let raws = stmt
                    .query_map(params![now_ms], RawEntry::from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                raws.into_iter().map(RawEntry::into_entry).collect()
            })
            .await
    }
}

struct RawEntry {
    query_hash: String,
    query_text: String,
    context_hash: String,
    generated_sql: String,
    result_rows: String,
    result_metadata: String,
    hit_count: i64,
    last_hit_at: Option<i64>,
    expires_at: i64,
    is_valid: bool,
    created_at: i64,
}

impl RawEntry {
    fn from_row(row: &Row<'_>) -> duckdb::Result<Self> {
        Ok(Self {
            query_hash: row.get(0)?,
            query_text: row.get(1)?,
            context_hash: row.get(2)?,
            generated_sql: row.get(3)?,
            result_rows: row.get(4)?,
            result_metadata: row.get(5)?,
            hit_count: row.get(6)?,
            last_hit_at: row.get(7)?,
            expires_at: row.get(8)?,
            is_valid: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    fn into_entry(self) -> Result<CacheEntry> {
        Ok(CacheEntry {
            query_hash: self.query_hash,
            query_text: self.query_text,
            context_hash: self.context_hash,
            generated_sql: self.generated_sql,
            result: QueryResult {
                rows: from_json_text(&self.result_rows)?,
                metadata: from_json_text::<ResultMetadata>(&self.result_metadata)?,
            },
            hit_count: self.hit_count,
            last_hit_at: opt_from_millis(self.last_hit_at),
            expires_at: from_millis(self.expires_at),
            is_valid: self.is_valid,
            created_at: from_millis(self.created_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache() -> QueryCacheStore {
        QueryCacheStore::new(Store::open_in_memory().unwrap(), Duration::from_secs(3600))
    }

    fn result(n: i64) -> QueryResult {
        QueryResult {
            rows: vec![json!({"total": n})],
            metadata: ResultMetadata {
                row_count: 1,
                execution_time_ms: 3,
                ..Default::default()
            },
        }
    }

    fn expired(mut entry: CacheEntry) -> CacheEntry {
        entry.expires_at = Utc::now() - TimeDelta::seconds(30);
        entry
    }

    #[tokio::test]
    async fn put_then_lookup_returns_entry() {
        let cache = cache();
        let ctx = json!({"kindergartenId": 7});
        let entry = cache.entry_for("Fees this month", &ctx, "SELECT 1", result(5));
        cache.put(&entry).await.unwrap();

        let found = cache.lookup("  fees THIS month", &ctx).await.unwrap().unwrap();
        assert_eq!(found.query_hash, entry.query_hash);
        assert_eq!(found.result, entry.result);
        assert_eq!(found.hit_count, 0);

        let other_ctx = json!({"kindergartenId": 8});
        assert!(cache.lookup("fees this month", &other_ctx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalidated_and_expired_entries_are_misses() {
        let cache = cache();
        let ctx = json!({});

        let mut live = cache.entry_for("live", &ctx, "SELECT 1", result(1));
        cache.put(&live).await.unwrap();
        assert!(cache.invalidate(&mut live).await.unwrap());
        assert!(!live.is_valid);
        assert!(cache.lookup("live", &ctx).await.unwrap().is_none());
        // still physically present
        assert!(cache.get(&live.query_hash).await.unwrap().is_some());

        let old = expired(cache.entry_for("old", &ctx, "SELECT 2", result(2)));
        cache.put(&old).await.unwrap();
        assert!(cache.lookup("old", &ctx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_put_updates_in_place_and_keeps_hits() {
        let cache = cache();
        let ctx = json!({"tenant": 1});
        let mut first = cache.entry_for("q", &ctx, "SELECT 1", result(1));
        cache.put(&first).await.unwrap();
        cache.record_hit(&mut first).await.unwrap();
        cache.invalidate(&mut first).await.unwrap();

        let second = cache.entry_for("q", &ctx, "SELECT 2", result(2));
        cache.put(&second).await.unwrap();

        let found = cache.lookup("q", &ctx).await.unwrap().unwrap();
        assert_eq!(found.generated_sql, "SELECT 2");
        assert_eq!(found.result, result(2));
        assert_eq!(found.hit_count, 1);
        assert!(found.is_valid);
    }

    #[tokio::test]
    async fn concurrent_hits_are_all_counted() {
        let cache = cache();
        let entry = cache.entry_for("busy", &json!({}), "SELECT 1", result(1));
        cache.put(&entry).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..25 {
            let cache = cache.clone();
            let mut entry = entry.clone();
            handles.push(tokio::spawn(async move {
                cache.record_hit(&mut entry).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stored = cache.get(&entry.query_hash).await.unwrap().unwrap();
        assert_eq!(stored.hit_count, 25);
        assert!(stored.last_hit_at.is_some());
    }

    #[tokio::test]
    async fn record_hit_on_missing_entry_is_not_found() {
        let cache = cache();
        let mut ghost = cache.entry_for("ghost", &json!({}), "SELECT 1", result(1));
        let err = cache.record_hit(&mut ghost).await.unwrap_err();
        assert!(matches!(err, QueryError::NotFound(_)));
    }

    #[tokio::test]
    async fn sweeps_respect_grace_period_for_invalid_entries() {
        let cache = cache();
        let ctx = json!({});

        let mut invalid_live = cache.entry_for("a", &ctx, "SELECT 1", result(1));
        cache.put(&invalid_live).await.unwrap();
        cache.invalidate(&mut invalid_live).await.unwrap();

        let mut invalid_old = expired(cache.entry_for("b", &ctx, "SELECT 1", result(1)));
        invalid_old.is_valid = false;
        cache.put(&invalid_old).await.unwrap();

        let valid_old = expired(cache.entry_for("c", &ctx, "SELECT 1", result(1)));
        cache.put(&valid_old).await.unwrap();

        assert_eq!(cache.sweep_invalid().await.unwrap(), 1);
        assert!(cache.get(&invalid_live.query_hash).await.unwrap().is_some());
        assert!(cache.get(&invalid_old.query_hash).await.unwrap().is_none());

        assert_eq!(cache.sweep_expired().await.unwrap(), 1);
        assert!(cache.get(&valid_old.query_hash).await.unwrap().is_none());
        assert!(cache.get(&invalid_live.query_hash).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stats_exclude_rows_past_stored_expiry() {
        let cache = cache();
        let ctx = json!({});

        let mut a = cache.entry_for("a", &ctx, "SELECT 1", result(1));
        cache.put(&a).await.unwrap();
        cache.record_hit(&mut a).await.unwrap();
        cache.record_hit(&mut a).await.unwrap();

        let mut b = cache.entry_for("b", &ctx, "SELECT 1", result(1));
        cache.put(&b).await.unwrap();
        cache.invalidate(&mut b).await.unwrap();

        cache
            .put(&expired(cache.entry_for("c", &ctx, "SELECT 1", result(1))))
            .await
            .unwrap();

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.valid, 1);
        assert_eq!(stats.invalid, 1);
        assert_eq!(stats.expired, 0);
        assert_eq!(stats.total_hits, 2);
        assert_eq!(stats.avg_hits_per_entry, 1.0);
    }

    #[tokio::test]
    async fn top_entries_order_by_hits_then_recency() {
        let cache = cache();
        let ctx = json!({});

        let mut low = cache.entry_for("low", &ctx, "SELECT 1", result(1));
        let mut tie_old = cache.entry_for("tie old", &ctx, "SELECT 1", result(1));
        let mut tie_new = cache.entry_for("tie new", &ctx, "SELECT 1", result(1));
        let mut hidden = cache.entry_for("hidden", &ctx, "SELECT 1", result(1));
        for e in [&low, &tie_old, &tie_new, &hidden] {
            cache.put(e).await.unwrap();
        }

        cache.record_hit(&mut low).await.unwrap();
        for _ in 0..5 {
            cache.record_hit(&mut hidden).await.unwrap();
        }
        cache.invalidate(&mut hidden).await.unwrap();

        cache.record_hit(&mut tie_old).await.unwrap();
        cache.record_hit(&mut tie_old).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.record_hit(&mut tie_new).await.unwrap();
        cache.record_hit(&mut tie_new).await.unwrap();

        let top = cache.top_entries(10).await.unwrap();
        let texts: Vec<&str> = top.iter().map(|e| e.query_text.as_str()).collect();
        assert_eq!(texts, vec!["tie new", "tie old", "low"]);

        assert_eq!(cache.top_entries(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn context_invalidation_only_touches_that_context() {
        let cache = cache();
        let seven = json!({"kindergartenId": 7});
        let eight = json!({"kindergartenId": 8});
        cache.put(&cache.entry_for("a", &seven, "SELECT 1", result(1))).await.unwrap();
        cache.put(&cache.entry_for("b", &seven, "SELECT 1", result(1))).await.unwrap();
        cache.put(&cache.entry_for("a", &eight, "SELECT 1", result(1))).await.unwrap();

        let touched = cache
            .invalidate_context(&derive_context_hash(&seven))
            .await
            .unwrap();
        assert_eq!(touched, 2);
        assert!(cache.lookup("a", &seven).await.unwrap().is_none());
        assert!(cache.lookup("a", &eight).await.unwrap().is_some());
    }
}
