//! Cheap post-hoc reading of generated SQL for logs and usage reports.

use std::collections::HashSet;

use crate::execution::IntentAnalysis;

const STOP_WORDS: [&str; 12] = [
    "the", "a", "an", "of", "for", "in", "on", "and", "is", "are", "what", "how",
];

/// Scores how involved a statement is, from 1 (single-table lookup) to 10.
pub fn complexity_score(sql: &str) -> i32 {
    let upper = sql.to_uppercase();
    let count = |needle: &str| upper.matches(needle).count() as i32;

    let joins = count(" JOIN ");
    let subqueries = count("(SELECT").max(count("( SELECT"));
    let grouping = count("GROUP BY") + count("HAVING");
    let windows = count(" OVER ");
    let set_ops = count(" UNION ") + count(" INTERSECT ") + count(" EXCEPT ");
    let ctes = if upper.trim_start().starts_with("WITH") { 1 } else { 0 };

    (1 + joins + 2 * subqueries + grouping + windows + set_ops + ctes).clamp(1, 10)
}

/// Intent derived from the statement when the model reports none.
pub fn analyze(question: &str, sql: &str) -> IntentAnalysis {
    let intent_type = sql
        .split_whitespace()
        .next()
        .map(|w| w.to_uppercase())
        .unwrap_or_else(|| "SELECT".to_string());

    let mut seen = HashSet::new();
    let keywords: Vec<String> = question
        .split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|w| w.chars().count() > 2 && !STOP_WORDS.contains(&w.as_str()))
        .filter(|w| seen.insert(w.clone()))
        .collect();

    IntentAnalysis {
        intent_type,
        confidence: 0.5,
        keywords,
        complexity: Some(complexity_score(sql)),
        ..Default::default()
    }
}
