use chrono::Utc;
use duckdb::{Connection, Row, params, params_from_iter};
use tracing::{debug, info, warn};

use super::{
    Feedback, FeedbackCategory, FeedbackStats, NewFeedback, QualityReport, ReviewStatus,
    TemplateSummary,
};
use crate::cache::QueryCacheStore;
use crate::db::Store;
use crate::db::db_utils::{from_millis, opt_from_millis, query_opt, to_millis};
use crate::error::{QueryError, Result};
use crate::execution::ExecutionStatus;
use crate::execution::log::{ExecutionLog, LogFilter};
use crate::templates::TemplateRepository;

const FEEDBACK_COLUMNS: &str = "id, log_id, user_id, rating, category, comment, corrected_sql, \
     suggestion, is_helpful, status, reviewer_id, reviewed_at, admin_response, created_at";

/// Collects user ratings on sealed executions and turns them into quality
/// signals for the cache, templates and reports.
#[derive(Clone)]
pub struct FeedbackAggregator {
    store: Store,
    log: ExecutionLog,
    cache: QueryCacheStore,
    templates: TemplateRepository,
}

impl FeedbackAggregator {
    pub fn new(
        store: Store,
        log: ExecutionLog,
        cache: QueryCacheStore,
        templates: TemplateRepository,
    ) -> Self {
        Self {
            store,
            log,
            cache,
            templates,
        }
    }

    pub async fn submit_feedback(&self, input: NewFeedback) -> Result<Feedback> {
        if !(1..=5).contains(&input.rating) {
            return Err(QueryError::InvalidRating(input.rating));
        }

        let entry = self.log.get(input.log_id).await?;
        if entry.status == ExecutionStatus::Pending {
            return Err(QueryError::FeedbackOnPendingExecution(input.log_id));
        }

        let negative = input.category == FeedbackCategory::Incorrect || !input.is_helpful;
        let created_at = Utc::now();
        let created_ms = to_millis(created_at);
        let row = input.clone();
        let (id, first_negative) = self
            .store
            .write("feedback.submit", move |conn| {
                let earlier_negative: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM query_feedback
                     WHERE log_id = ? AND (category = ? OR NOT is_helpful)",
                    params![row.log_id, FeedbackCategory::Incorrect.as_str()],
                    |r| r.get(0),
                )?;
                let id = conn.query_row(
                    "INSERT INTO query_feedback (log_id, user_id, rating, category, comment,
                         corrected_sql, suggestion, is_helpful, status, created_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                     RETURNING id",
                    params![
                        row.log_id,
                        row.user_id,
                        row.rating,
                        row.category.as_str(),
                        row.comment,
                        row.corrected_sql,
                        row.suggestion,
                        row.is_helpful,
                        ReviewStatus::Pending.as_str(),
                        created_ms
                    ],
                    |r| r.get::<_, i64>(0),
                )?;
                Ok((id, earlier_negative == 0))
            })
            .await?;

        info!(
            "Recorded feedback {} on execution {} (rating {}, {})",
            id,
            input.log_id,
            input.rating,
            input.category.as_str()
        );

        // The feedback is stored; what follows only adjusts derived state.
        if input.category == FeedbackCategory::Incorrect {
            match &entry.query_hash {
                Some(hash) => match self.cache.invalidate_key(hash).await {
                    Ok(true) => {
                        info!("Invalidated cache entry {} after incorrect-answer feedback", hash)
                    }
                    Ok(false) => debug!("Cache entry {} was already gone", hash),
                    Err(err) => warn!("Could not invalidate cache entry {}: {}", hash, err),
                },
                None => debug!("Execution {} has no cache key to invalidate", input.log_id),
            }
        }

        // One retraction per execution, however many complaints it gets.
        if negative && first_negative && entry.status == ExecutionStatus::Success {
            if let Some(name) = &entry.template_name {
                match self.templates.retract_success(name).await {
                    Ok(aggregates) => info!(
                        "Template {} success rate now {:.2} after negative feedback",
                        name, aggregates.success_rate
                    ),
                    Err(err) => warn!("Could not update template {}: {}", name, err),
                }
            }
        }

        Ok(Feedback {
            id,
            log_id: input.log_id,
            user_id: input.user_id,
            rating: input.rating,
            category: input.category,
            comment: input.comment,
            corrected_sql: input.corrected_sql,
            suggestion: input.suggestion,
            is_helpful: input.is_helpful,
            status: ReviewStatus::Pending,
            reviewer_id: None,
            reviewed_at: None,
            admin_response: None,
            created_at: from_millis(created_ms),
        })
    }

    pub async fn get(&self, feedback_id: i64) -> Result<Feedback> {
        self.store
            .read("feedback.get", move |conn| {
                load(conn, feedback_id)?
                    .ok_or_else(|| QueryError::NotFound(format!("feedback {}", feedback_id)))
            })
            .await
    }

    /// Moves feedback out of `pending`. Each item can be reviewed once.
    pub async fn review_feedback(
        &self,
        feedback_id: i64,
        reviewer_id: i64,
        status: ReviewStatus,
        admin_response: Option<String>,
    ) -> Result<Feedback> {
        let reviewed_ms = to_millis(Utc::now());
        let feedback = self
            .store
            .write("feedback.review", move |conn| {
                let current = load(conn, feedback_id)?
                    .ok_or_else(|| QueryError::NotFound(format!("feedback {}", feedback_id)))?;
                if !current.status.can_transition_to(status) {
                    return Err(QueryError::InvalidReviewTransition {
                        feedback_id,
                        current: current.status,
                        requested: status,
                    });
                }

                let updated = conn.execute(
                    "UPDATE query_feedback
                     SET status = ?, reviewer_id = ?, reviewed_at = ?, admin_response = ?
                     WHERE id = ? AND status = 'pending'",
                    params![
                        status.as_str(),
                        reviewer_id,
                        reviewed_ms,
                        admin_response,
                        feedback_id
                    ],
                )?;
                if updated != 1 {
                    return Err(QueryError::InvalidReviewTransition {
                        feedback_id,
                        current: current.status,
                        requested: status,
                    });
                }

                Ok(Feedback {
                    status,
                    reviewer_id: Some(reviewer_id),
                    reviewed_at: Some(from_millis(reviewed_ms)),
                    admin_response,
                    ..current
                })
            })
            .await;

        if let Err(QueryError::InvalidReviewTransition { current, .. }) = &feedback {
            warn!(
                "Rejected review of feedback {}: already {}",
                feedback_id, current
            );
        }
        feedback
    }

    /// Newest first, optionally narrowed to one review state.
    pub async fn list_feedback(
        &self,
        status: Option<ReviewStatus>,
        limit: usize,
    ) -> Result<Vec<Feedback>> {
        self.store
            .read("feedback.list", move |conn| {
                let mut args = Vec::new();
                let where_sql = match status {
                    Some(status) => {
                        args.push(status.as_str());
                        " WHERE status = ?"
                    }
                    None => "",
                };
                let sql = format!(
                    "SELECT {} FROM query_feedback{} ORDER BY created_at DESC, id DESC LIMIT {}",
                    FEEDBACK_COLUMNS, where_sql, limit
                );
                let mut stmt = conn.prepare(&sql)?;
                let raws = stmt
                    .query_map(params_from_iter(args), RawFeedback::from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                raws.into_iter().map(RawFeedback::into_feedback).collect()
            })
            .await
    }

    pub async fn compute_stats(&self) -> Result<FeedbackStats> {
        self.store
            .read("feedback.stats", |conn| {
                let mut stmt =
                    conn.prepare("SELECT rating, category, status, is_helpful FROM query_feedback")?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, bool>(3)?,
                        ))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;

                let mut stats = FeedbackStats::default();
                let mut rating_sum = 0i64;
                for (rating, category, status, is_helpful) in rows {
                    stats.total_feedbacks += 1;
                    rating_sum += rating;
                    if is_helpful {
                        stats.positive_count += 1;
                    } else {
                        stats.negative_count += 1;
                    }
                    *stats.by_type.entry(category).or_default() += 1;
                    *stats.by_status.entry(status).or_default() += 1;
                }
                if stats.total_feedbacks > 0 {
                    stats.avg_rating = rating_sum as f64 / stats.total_feedbacks as f64;
                }
                Ok(stats)
            })
            .await
    }

    /// Global usage, feedback and template quality in one report.
    pub async fn quality_report(&self, top_templates: usize) -> Result<QualityReport> {
        let usage = self.log.usage_report(LogFilter::default()).await?;
        let feedback = self.compute_stats().await?;
        let top_templates = self
            .templates
            .most_used(top_templates)
            .await?
            .into_iter()
            .map(|t| TemplateSummary {
                name: t.name,
                display_name: t.display_name,
                category: t.category,
                usage_count: t.usage_count,
                success_rate: t.success_rate,
                avg_execution_time: t.avg_execution_time,
            })
            .collect();

        Ok(QualityReport {
            usage,
            feedback,
            top_templates,
        })
    }
}

fn load(conn: &Connection, feedback_id: i64) -> Result<Option<Feedback>> {
    let sql = format!("SELECT {} FROM query_feedback WHERE id = ?", FEEDBACK_COLUMNS);
    query_opt(conn, &sql, params![feedback_id], RawFeedback::from_row)?
        .map(RawFeedback::into_feedback)
        .transpose()
}

struct RawFeedback {
    id: i64,
    log_id: i64,
    user_id: i64,
    rating: i64,
    category: String,
    comment: Option<String>,
    corrected_sql: Option<String>,
    suggestion: Option<String>,
    is_helpful: bool,
    status: String,
    reviewer_id: Option<i64>,
    reviewed_at: Option<i64>,
    admin_response: Option<String>,
    created_at: i64,
}

impl RawFeedback {
    fn from_row(row: &Row<'_>) -> duckdb::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            log_id: row.get(1)?,
            user_id: row.get(2)?,
            rating: row.get(3)?,
            category: row.get(4)?,
            comment: row.get(5)?,
            corrected_sql: row.get(6)?,
            suggestion: row.get(7)?,
            is_helpful: row.get(8)?,
            status: row.get(9)?,
            reviewer_id: row.get(10)?,
            reviewed_at: row.get(11)?,
            admin_response: row.get(12)?,
            created_at: row.get(13)?,
        })
    }

    fn into_feedback(self) -> Result<Feedback> {
        Ok(Feedback {
            id: self.id,
            log_id: self.log_id,
            user_id: self.user_id,
            rating: self.rating,
            category: FeedbackCategory::parse(&self.category)?,
            comment: self.comment,
            corrected_sql: self.corrected_sql,
            suggestion: self.suggestion,
            is_helpful: self.is_helpful,
            status: ReviewStatus::parse(&self.status)?,
            reviewer_id: self.reviewer_id,
            reviewed_at: opt_from_millis(self.reviewed_at),
            admin_response: self.admin_response,
            created_at: from_millis(self.created_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::log::SuccessRecord;
    use crate::execution::{FailureKind, QueryResult, Timings};
    use crate::templates::QueryTemplate;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        log: ExecutionLog,
        cache: QueryCacheStore,
        templates: TemplateRepository,
        feedback: FeedbackAggregator,
    }

    fn fixture() -> Fixture {
        let store = Store::open_in_memory().unwrap();
        let log = ExecutionLog::new(store.clone());
        let cache = QueryCacheStore::new(store.clone(), Duration::from_secs(3600));
        let templates = TemplateRepository::new(store.clone());
        let feedback =
            FeedbackAggregator::new(store, log.clone(), cache.clone(), templates.clone());
        Fixture {
            log,
            cache,
            templates,
            feedback,
        }
    }

    fn rating(log_id: i64, rating: i64, category: FeedbackCategory, is_helpful: bool) -> NewFeedback {
        NewFeedback {
            log_id,
            user_id: 7,
            rating,
            category,
            comment: None,
            corrected_sql: None,
            suggestion: None,
            is_helpful,
        }
    }

    async fn sealed_log(f: &Fixture, query_hash: Option<String>) -> i64 {
        let id = f.log.begin(7, "fees this month", None).await.unwrap();
        f.log
            .complete_success(
                id,
                SuccessRecord {
                    final_sql: "SELECT 1".into(),
                    query_hash,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn low_rating_can_still_be_helpful() {
        let f = fixture();
        let log_id = sealed_log(&f, None).await;

        let fb = f
            .feedback
            .submit_feedback(rating(log_id, 2, FeedbackCategory::Suggestion, true))
            .await
            .unwrap();
        assert_eq!(fb.rating, 2);
        assert!(fb.is_helpful);
        assert_eq!(fb.status, ReviewStatus::Pending);

        let stored = f.feedback.get(fb.id).await.unwrap();
        assert_eq!(stored.rating, 2);
        assert!(stored.is_helpful);

        let stats = f.feedback.compute_stats().await.unwrap();
        assert_eq!(stats.positive_count, 1);
        assert_eq!(stats.negative_count, 0);
    }

    #[tokio::test]
    async fn rejects_bad_ratings_and_unsealed_or_unknown_logs() {
        let f = fixture();
        let pending = f.log.begin(7, "q", None).await.unwrap();

        assert!(matches!(
            f.feedback
                .submit_feedback(rating(pending, 0, FeedbackCategory::Helpful, true))
                .await,
            Err(QueryError::InvalidRating(0))
        ));
        assert!(matches!(
            f.feedback
                .submit_feedback(rating(pending, 6, FeedbackCategory::Helpful, true))
                .await,
            Err(QueryError::InvalidRating(6))
        ));
        assert!(matches!(
            f.feedback
                .submit_feedback(rating(pending, 4, FeedbackCategory::Helpful, true))
                .await,
            Err(QueryError::FeedbackOnPendingExecution(id)) if id == pending
        ));
        assert!(matches!(
            f.feedback
                .submit_feedback(rating(9999, 4, FeedbackCategory::Helpful, true))
                .await,
            Err(QueryError::NotFound(_))
        ));

        f.log
            .complete_failure(pending, FailureKind::Execution, "boom", Timings::default())
            .await
            .unwrap();
        f.feedback
            .submit_feedback(rating(pending, 1, FeedbackCategory::Confusing, false))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn incorrect_feedback_invalidates_the_cached_answer() {
        let f = fixture();
        let entry = f.cache.entry_for(
            "fees this month",
            &json!({"school": 1}),
            "SELECT 1",
            QueryResult::default(),
        );
        f.cache.put(&entry).await.unwrap();
        let log_id = sealed_log(&f, Some(entry.query_hash.clone())).await;

        f.feedback
            .submit_feedback(rating(log_id, 4, FeedbackCategory::Helpful, true))
            .await
            .unwrap();
        assert!(f.cache.get(&entry.query_hash).await.unwrap().unwrap().is_valid);

        f.feedback
            .submit_feedback(rating(log_id, 1, FeedbackCategory::Incorrect, false))
            .await
            .unwrap();
        assert!(!f.cache.get(&entry.query_hash).await.unwrap().unwrap().is_valid);
        assert!(
            f.cache
                .lookup("fees this month", &json!({"school": 1}))
                .await
                .unwrap()
                .is_none()
        );
    }

    async fn template_log(f: &Fixture, template: &str) -> i64 {
        let id = f.log.begin(7, "fee report", None).await.unwrap();
        f.log
            .complete_success(
                id,
                SuccessRecord {
                    final_sql: "SELECT 1".into(),
                    template_name: Some(template.into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn negative_feedback_lowers_template_success_rate_once() {
        let f = fixture();
        f.templates
            .create(&QueryTemplate::new("fees", "Fees", "finance", "SELECT 1"))
            .await
            .unwrap();
        f.templates.record_use("fees", true, 100.0).await.unwrap();
        f.templates.record_use("fees", true, 300.0).await.unwrap();

        let praised = template_log(&f, "fees").await;
        f.feedback
            .submit_feedback(rating(praised, 5, FeedbackCategory::Helpful, true))
            .await
            .unwrap();
        assert_eq!(f.templates.get("fees").await.unwrap().success_rate, 1.0);

        let wrong = template_log(&f, "fees").await;
        f.feedback
            .submit_feedback(rating(wrong, 1, FeedbackCategory::Incorrect, false))
            .await
            .unwrap();
        f.feedback
            .submit_feedback(rating(wrong, 2, FeedbackCategory::Confusing, false))
            .await
            .unwrap();

        let template = f.templates.get("fees").await.unwrap();
        assert_eq!(template.success_rate, 0.5);
        assert_eq!(template.usage_count, 2);
        assert_eq!(template.avg_execution_time, 200.0);
    }

    #[tokio::test]
    async fn feedback_is_kept_when_cache_invalidation_fails() {
        let f = fixture();
        let broken = Store::open_in_memory().unwrap();
        broken
            .write("test.drop_cache", |conn| {
                conn.execute_batch("DROP TABLE query_cache")?;
                Ok(())
            })
            .await
            .unwrap();
        let feedback = FeedbackAggregator::new(
            f.feedback.store.clone(),
            f.log.clone(),
            QueryCacheStore::new(broken, Duration::from_secs(60)),
            f.templates.clone(),
        );

        let log_id = sealed_log(&f, Some("abc".into())).await;
        let fb = feedback
            .submit_feedback(rating(log_id, 1, FeedbackCategory::Incorrect, false))
            .await
            .unwrap();
        assert_eq!(f.feedback.get(fb.id).await.unwrap().category, FeedbackCategory::Incorrect);
    }

    #[tokio::test]
    async fn review_is_single_shot() {
        let f = fixture();
        let log_id = sealed_log(&f, None).await;
        let fb = f
            .feedback
            .submit_feedback(rating(log_id, 3, FeedbackCategory::Slow, false))
            .await
            .unwrap();

        let reviewed = f
            .feedback
            .review_feedback(fb.id, 99, ReviewStatus::Resolved, Some("Added an index".into()))
            .await
            .unwrap();
        assert_eq!(reviewed.status, ReviewStatus::Resolved);
        assert_eq!(reviewed.reviewer_id, Some(99));
        assert!(reviewed.reviewed_at.is_some());

        let again = f
            .feedback
            .review_feedback(fb.id, 99, ReviewStatus::Dismissed, None)
            .await
            .unwrap_err();
        assert!(matches!(
            again,
            QueryError::InvalidReviewTransition {
                current: ReviewStatus::Resolved,
                requested: ReviewStatus::Dismissed,
                ..
            }
        ));
        assert!(matches!(
            f.feedback
                .review_feedback(12345, 1, ReviewStatus::Reviewed, None)
                .await,
            Err(QueryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn stats_listing_and_report() {
        let f = fixture();
        let log_id = sealed_log(&f, None).await;
        for (r, category, helpful) in [
            (5, FeedbackCategory::Helpful, true),
            (4, FeedbackCategory::Helpful, true),
            (1, FeedbackCategory::Incorrect, false),
        ] {
            f.feedback
                .submit_feedback(rating(log_id, r, category, helpful))
                .await
                .unwrap();
        }
        let first = f.feedback.list_feedback(None, 10).await.unwrap();
        assert_eq!(first.len(), 3);
        f.feedback
            .review_feedback(first[0].id, 1, ReviewStatus::Reviewed, None)
            .await
            .unwrap();

        let stats = f.feedback.compute_stats().await.unwrap();
        assert_eq!(stats.total_feedbacks, 3);
        assert!((stats.avg_rating - 10.0 / 3.0).abs() < 1e-12);
        assert_eq!(stats.positive_count, 2);
        assert_eq!(stats.negative_count, 1);
        assert_eq!(stats.by_type["helpful"], 2);
        assert_eq!(stats.by_type["incorrect"], 1);
        assert_eq!(stats.by_status["pending"], 2);
        assert_eq!(stats.by_status["reviewed"], 1);

        let pending = f
            .feedback
            .list_feedback(Some(ReviewStatus::Pending), 10)
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(f.feedback.list_feedback(None, 1).await.unwrap().len(), 1);

        f.templates
            .create(&QueryTemplate::new("fees", "Fees", "finance", "SELECT 1"))
            .await
            .unwrap();
        f.templates.record_use("fees", true, 10.0).await.unwrap();
        let report = f.feedback.quality_report(5).await.unwrap();
        assert_eq!(report.usage.total, 1);
        assert_eq!(report.usage.success, 1);
        assert_eq!(report.feedback.total_feedbacks, 3);
        assert_eq!(report.top_templates[0].name, "fees");
        assert_eq!(report.top_templates[0].usage_count, 1);
    }
}
