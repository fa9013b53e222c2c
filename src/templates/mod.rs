pub mod matcher;
pub mod params;
pub mod repository;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::feedback::stats::{update_avg_execution_time, update_success_rate};

pub use matcher::{RankedTemplate, TemplateMatcher, rank_templates};
pub use params::{BoundQuery, fill_parameters, validate_parameters};
pub use repository::{TemplateFilter, TemplateRepository};

/// Role entries that make a template available to everyone.
pub const ROLE_WILDCARDS: [&str; 2] = ["all", "*"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    #[default]
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "easy" => Some(Difficulty::Easy),
            "medium" => Some(Difficulty::Medium),
            "hard" => Some(Difficulty::Hard),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    /// `YYYY-MM-DD` text.
    Date,
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParamType::String => "string",
            ParamType::Number => "number",
            ParamType::Integer => "integer",
            ParamType::Boolean => "boolean",
            ParamType::Date => "date",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    /// Allowed values; any value is accepted when absent.
    #[serde(default)]
    pub options: Option<Vec<Value>>,
    #[serde(default)]
    pub description: Option<String>,
}

/// A reusable SQL skeleton with keyword metadata.
///
/// `sql_template` marks parameters as `{{name}}`. Markers become positional
/// bind parameters, so they must stand where a value is expected, never
/// inside a quoted literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryTemplate {
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub category: String,
    pub sql_template: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterSpec>,
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub business_domain: Option<String>,
    #[serde(default = "default_roles")]
    pub allowed_roles: Vec<String>,
    #[serde(default)]
    pub difficulty: Difficulty,
    #[serde(default)]
    pub usage_count: i64,
    #[serde(default)]
    pub success_rate: f64,
    #[serde(default)]
    pub avg_execution_time: f64,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub created_by: Option<i64>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_roles() -> Vec<String> {
    vec!["all".to_string()]
}

fn default_active() -> bool {
    true
}

impl QueryTemplate {
    pub fn new(
        name: impl Into<String>,
        display_name: impl Into<String>,
        category: impl Into<String>,
        sql_template: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            display_name: display_name.into(),
            description: None,
            category: category.into(),
            sql_template: sql_template.into(),
            parameters: BTreeMap::new(),
            examples: Vec::new(),
            keywords: Vec::new(),
            business_domain: None,
            allowed_roles: default_roles(),
            difficulty: Difficulty::default(),
            usage_count: 0,
            success_rate: 0.0,
            avg_execution_time: 0.0,
            is_active: true,
            created_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, spec: ParameterSpec) -> Self {
        self.parameters.insert(name.into(), spec);
        self
    }

    /// Advisory eligibility check; not an authorization boundary.
    pub fn allows_role(&self, role: &str) -> bool {
        self.allowed_roles
            .iter()
            .any(|r| r == role || ROLE_WILDCARDS.contains(&r.as_str()))
    }

    /// `usage_count` must already include the use being reported.
    pub fn update_success_rate(&mut self, is_success: bool) {
        self.success_rate = update_success_rate(self.usage_count, self.success_rate, is_success);
    }

    /// `usage_count` must already include the use being reported.
    pub fn update_avg_execution_time(&mut self, observed_ms: f64) {
        self.avg_execution_time =
            update_avg_execution_time(self.usage_count, self.avg_execution_time, observed_ms);
    }
}
