pub mod log;
pub mod runner;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::QueryError;

/// Lifecycle of one query attempt. Only `Pending` may transition, and only once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Success,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_sealed(&self) -> bool {
        !matches!(self, ExecutionStatus::Pending)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "success" => Ok(ExecutionStatus::Success),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(QueryError::Storage(format!(
                "unknown execution status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub row_count: usize,
    pub columns: Vec<ColumnInfo>,
    pub execution_time_ms: u64,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Rows are opaque JSON records keyed by column name.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryResult {
    pub rows: Vec<serde_json::Value>,
    pub metadata: ResultMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    pub value: serde_json::Value,
    pub confidence: f64,
}

/// What the generation collaborator understood about a question.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IntentAnalysis {
    pub intent_type: String,
    pub confidence: f64,
    #[serde(default)]
    pub entities: Vec<ExtractedEntity>,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub business_domain: Option<String>,
    /// 1 (trivial lookup) to 10 (multi-join analytics).
    pub complexity: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityTier {
    Simple,
    Medium,
    Complex,
}

impl ComplexityTier {
    pub fn from_score(score: i32) -> Self {
        if score <= 3 {
            ComplexityTier::Simple
        } else if score <= 6 {
            ComplexityTier::Medium
        } else {
            ComplexityTier::Complex
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ComplexityTier::Simple => "simple",
            ComplexityTier::Medium => "medium",
            ComplexityTier::Complex => "complex",
        }
    }
}

/// Why an attempt ended as `failed`; stored as the log's error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Generation,
    Execution,
    Timeout,
    Validation,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Generation => "generation",
            FailureKind::Execution => "execution",
            FailureKind::Timeout => "timeout",
            FailureKind::Validation => "validation",
        }
    }

    /// Human readable category shown to end users.
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::Generation => "Could not understand the question",
            FailureKind::Execution => "The query could not be run",
            FailureKind::Timeout => "The query took too long",
            FailureKind::Validation => "The request was invalid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "generation" => Some(FailureKind::Generation),
            "execution" => Some(FailureKind::Execution),
            "timeout" => Some(FailureKind::Timeout),
            "validation" => Some(FailureKind::Validation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Timings {
    pub execution_ms: Option<u64>,
    pub ai_processing_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub tokens_used: u32,
    pub model: String,
}
