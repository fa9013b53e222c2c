use chrono::NaiveDate;
use regex::{Captures, Regex};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::LazyLock;

use super::{ParamType, ParameterSpec, QueryTemplate};
use crate::error::{QueryError, Result};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("placeholder pattern is valid")
});

/// SQL text with `?` markers plus the values to bind to them, in order.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct BoundQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

impl BoundQuery {
    /// A statement with nothing to bind, e.g. generated SQL.
    pub fn raw(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }
}

/// Substitutes `{{name}}` placeholders with positional bind markers.
///
/// Supplied values are never spliced into the SQL text. Placeholders with no
/// supplied value are left as written so the executor rejects them loudly.
pub fn fill_parameters(sql_template: &str, params: &Map<String, Value>) -> BoundQuery {
    let mut bound = Vec::new();
    let sql = PLACEHOLDER
        .replace_all(sql_template, |caps: &Captures<'_>| {
            match params.get(&caps[1]) {
                Some(value) => {
                    bound.push(value.clone());
                    "?".to_string()
                }
                None => caps[0].to_string(),
            }
        })
        .into_owned();

    BoundQuery { sql, params: bound }
}

/// Placeholder names in order of appearance, duplicates included.
pub fn placeholders(sql_template: &str) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(sql_template)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Checks supplied values against the template's declared parameters and
/// fills in defaults. Undeclared keys pass through untouched.
pub fn validate_parameters(
    template: &QueryTemplate,
    supplied: &Map<String, Value>,
) -> Result<Map<String, Value>> {
    let mut resolved = supplied.clone();

    for (name, spec) in &template.parameters {
        let value = match supplied.get(name).filter(|v| !v.is_null()) {
            Some(v) => v.clone(),
            None => match &spec.default {
                Some(default) => default.clone(),
                None if spec.required => {
                    return Err(QueryError::InvalidParameters(format!(
                        "missing required parameter '{}'",
                        name
                    )));
                }
                None => continue,
            },
        };

        check_value(name, spec, &value)?;
        resolved.insert(name.clone(), value);
    }

    Ok(resolved)
}

fn check_value(name: &str, spec: &ParameterSpec, value: &Value) -> Result<()> {
    let type_ok = match spec.param_type {
        ParamType::String => value.is_string(),
        ParamType::Number => value.is_number(),
        ParamType::Integer => value.is_i64() || value.is_u64(),
        ParamType::Boolean => value.is_boolean(),
        ParamType::Date => value
            .as_str()
            .is_some_and(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()),
    };
    if !type_ok {
        return Err(QueryError::InvalidParameters(format!(
            "parameter '{}' expects a {} but got {}",
            name, spec.param_type, value
        )));
    }

    if let Some(options) = &spec.options {
        if !options.contains(value) {
            return Err(QueryError::InvalidParameters(format!(
                "parameter '{}' must be one of {}",
                name,
                Value::Array(options.clone())
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn values_become_bind_markers() {
        let bound = fill_parameters(
            "SELECT * FROM fees WHERE month = {{month}} AND amount > {{ min }}",
            &map(json!({"month": "2024-05", "min": 100})),
        );
        assert_eq!(bound.sql, "SELECT * FROM fees WHERE month = ? AND amount > ?");
        assert_eq!(bound.params, vec![json!("2024-05"), json!(100)]);
    }

    #[test]
    fn hostile_text_stays_out_of_the_sql() {
        let bound = fill_parameters(
            "SELECT * FROM students WHERE name = {{name}}",
            &map(json!({"name": "x'; DROP TABLE students; --"})),
        );
        assert_eq!(bound.sql, "SELECT * FROM students WHERE name = ?");
        assert_eq!(bound.params, vec![json!("x'; DROP TABLE students; --")]);
    }

    #[test]
    fn unknown_placeholders_are_left_verbatim() {
        let bound = fill_parameters(
            "SELECT {{a}}, {{b}}, {{a}}",
            &map(json!({"a": 1})),
        );
        assert_eq!(bound.sql, "SELECT ?, {{b}}, ?");
        assert_eq!(bound.params, vec![json!(1), json!(1)]);
        assert_eq!(placeholders("SELECT {{a}}, {{b}}, {{a}}"), vec!["a", "b", "a"]);
    }

    #[test]
    fn any_key_text_is_a_placeholder() {
        let sql = "SELECT * FROM fees WHERE day >= {{start-date}} AND class = {{ 班级 }}";
        let bound = fill_parameters(
            sql,
            &map(json!({"start-date": "2024-05-01", "班级": "大一班"})),
        );
        assert_eq!(bound.sql, "SELECT * FROM fees WHERE day >= ? AND class = ?");
        assert_eq!(bound.params, vec![json!("2024-05-01"), json!("大一班")]);
        assert_eq!(placeholders(sql), vec!["start-date", "班级"]);
    }

    fn template() -> QueryTemplate {
        QueryTemplate::new("t", "T", "finance", "SELECT {{grade}}, {{month}}, {{limit}}")
            .with_parameter(
                "grade",
                ParameterSpec {
                    param_type: ParamType::Integer,
                    required: true,
                    default: None,
                    options: Some(vec![json!(1), json!(2), json!(3)]),
                    description: None,
                },
            )
            .with_parameter(
                "month",
                ParameterSpec {
                    param_type: ParamType::Date,
                    required: false,
                    default: None,
                    options: None,
                    description: None,
                },
            )
            .with_parameter(
                "limit",
                ParameterSpec {
                    param_type: ParamType::Integer,
                    required: true,
                    default: Some(json!(10)),
                    options: None,
                    description: None,
                },
            )
    }

    #[test]
    fn defaults_fill_missing_values() {
        let resolved = validate_parameters(&template(), &map(json!({"grade": 2}))).unwrap();
        assert_eq!(resolved["limit"], json!(10));
        assert!(!resolved.contains_key("month"));
    }

    #[test]
    fn missing_required_parameter_is_rejected() {
        let err = validate_parameters(&template(), &map(json!({}))).unwrap_err();
        assert!(matches!(err, QueryError::InvalidParameters(msg) if msg.contains("grade")));
    }

    #[test]
    fn type_and_option_mismatches_are_rejected() {
        assert!(validate_parameters(&template(), &map(json!({"grade": "two"}))).is_err());
        assert!(validate_parameters(&template(), &map(json!({"grade": 9}))).is_err());
        assert!(
            validate_parameters(&template(), &map(json!({"grade": 1, "month": "May"}))).is_err()
        );
        assert!(
            validate_parameters(&template(), &map(json!({"grade": 1, "month": "2024-05-01"})))
                .is_ok()
        );
    }
}
