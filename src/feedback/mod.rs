pub mod aggregator;
pub mod stats;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::QueryError;
use crate::execution::log::UsageReport;

pub use aggregator::FeedbackAggregator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackCategory {
    Helpful,
    Incorrect,
    Slow,
    Confusing,
    Suggestion,
}

impl FeedbackCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackCategory::Helpful => "helpful",
            FeedbackCategory::Incorrect => "incorrect",
            FeedbackCategory::Slow => "slow",
            FeedbackCategory::Confusing => "confusing",
            FeedbackCategory::Suggestion => "suggestion",
        }
    }

    pub fn parse(s: &str) -> Result<Self, QueryError> {
        match s {
            "helpful" => Ok(FeedbackCategory::Helpful),
            "incorrect" => Ok(FeedbackCategory::Incorrect),
            "slow" => Ok(FeedbackCategory::Slow),
            "confusing" => Ok(FeedbackCategory::Confusing),
            "suggestion" => Ok(FeedbackCategory::Suggestion),
            other => Err(QueryError::Storage(format!(
                "unknown feedback category '{}'",
                other
            ))),
        }
    }
}

/// Reviewer workflow state. Only `Pending` may move, and only once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    Pending,
    Reviewed,
    Resolved,
    Dismissed,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::Reviewed => "reviewed",
            ReviewStatus::Resolved => "resolved",
            ReviewStatus::Dismissed => "dismissed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, QueryError> {
        match s {
            "pending" => Ok(ReviewStatus::Pending),
            "reviewed" => Ok(ReviewStatus::Reviewed),
            "resolved" => Ok(ReviewStatus::Resolved),
            "dismissed" => Ok(ReviewStatus::Dismissed),
            other => Err(QueryError::Storage(format!(
                "unknown review status '{}'",
                other
            ))),
        }
    }

    pub fn can_transition_to(&self, next: ReviewStatus) -> bool {
        *self == ReviewStatus::Pending && next != ReviewStatus::Pending
    }
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user's rating of one sealed execution.
///
/// `is_helpful` is recorded as submitted; it is not derived from `rating`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub id: i64,
    pub log_id: i64,
    pub user_id: i64,
    pub rating: i64,
    pub category: FeedbackCategory,
    pub comment: Option<String>,
    pub corrected_sql: Option<String>,
    pub suggestion: Option<String>,
    pub is_helpful: bool,
    pub status: ReviewStatus,
    pub reviewer_id: Option<i64>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub admin_response: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewFeedback {
    pub log_id: i64,
    pub user_id: i64,
    pub rating: i64,
    pub category: FeedbackCategory,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub corrected_sql: Option<String>,
    #[serde(default)]
    pub suggestion: Option<String>,
    pub is_helpful: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeedbackStats {
    pub total_feedbacks: u64,
    pub avg_rating: f64,
    /// Feedback marked helpful, whatever its rating.
    pub positive_count: u64,
    pub negative_count: u64,
    pub by_type: BTreeMap<String, u64>,
    pub by_status: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplateSummary {
    pub name: String,
    pub display_name: String,
    pub category: String,
    pub usage_count: i64,
    pub success_rate: f64,
    pub avg_execution_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityReport {
    pub usage: UsageReport,
    pub feedback: FeedbackStats,
    pub top_templates: Vec<TemplateSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn review_moves_only_out_of_pending() {
        assert!(ReviewStatus::Pending.can_transition_to(ReviewStatus::Resolved));
        assert!(!ReviewStatus::Pending.can_transition_to(ReviewStatus::Pending));
        assert!(!ReviewStatus::Reviewed.can_transition_to(ReviewStatus::Resolved));
        assert!(!ReviewStatus::Dismissed.can_transition_to(ReviewStatus::Pending));
    }

    #[test]
    fn categories_deserialize_from_lowercase() {
        let category: FeedbackCategory = serde_json::from_str("\"incorrect\"").unwrap();
        assert_eq!(category, FeedbackCategory::Incorrect);
        assert_eq!(FeedbackCategory::parse("slow").unwrap(), FeedbackCategory::Slow);
        assert!(FeedbackCategory::parse("rude").is_err());
    }
}
