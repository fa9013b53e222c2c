use serde::Serialize;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use tracing::debug;

use super::params::{BoundQuery, fill_parameters};
use super::repository::{TemplateAggregates, TemplateRepository};
use super::QueryTemplate;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedTemplate {
    pub template: QueryTemplate,
    /// Fraction of the template's keywords found in the question.
    pub score: f64,
    pub matched_keywords: Vec<String>,
}

/// Scores one template against an already lowercased question.
fn keyword_score(template: &QueryTemplate, question: &str) -> (f64, Vec<String>) {
    let keywords: Vec<&String> = template
        .keywords
        .iter()
        .filter(|k| !k.trim().is_empty())
        .collect();
    if keywords.is_empty() {
        return (0.0, Vec::new());
    }

    let matched: Vec<String> = keywords
        .iter()
        .filter(|k| question.contains(&k.trim().to_lowercase()))
        .map(|k| k.to_string())
        .collect();

    (matched.len() as f64 / keywords.len() as f64, matched)
}

fn rank_order(a: &RankedTemplate, b: &RankedTemplate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.template.success_rate.total_cmp(&a.template.success_rate))
        .then_with(|| {
            a.template
                .avg_execution_time
                .total_cmp(&b.template.avg_execution_time)
        })
}

/// Ranks active templates the role may use by keyword overlap with the
/// question. Templates without keywords, or with no keyword present, are
/// left out. No threshold is applied.
pub fn rank_templates<I>(templates: I, question: &str, role: &str) -> Vec<RankedTemplate>
where
    I: IntoIterator<Item = QueryTemplate>,
{
    let question = question.to_lowercase();
    let mut ranked: Vec<RankedTemplate> = templates
        .into_iter()
        .filter(|t| t.is_active && t.allows_role(role))
        .filter_map(|template| {
            let (score, matched_keywords) = keyword_score(&template, &question);
            (score > 0.0).then_some(RankedTemplate {
                template,
                score,
                matched_keywords,
            })
        })
        .collect();

    ranked.sort_by(rank_order);
    ranked
}

/// Template lookup backed by the repository.
#[derive(Clone)]
pub struct TemplateMatcher {
    repository: TemplateRepository,
}

impl TemplateMatcher {
    pub fn new(repository: TemplateRepository) -> Self {
        Self { repository }
    }

    pub fn repository(&self) -> &TemplateRepository {
        &self.repository
    }

    pub async fn match_query(&self, question: &str, role: &str) -> Result<Vec<RankedTemplate>> {
        let templates = self.repository.list_active().await?;
        let ranked = rank_templates(templates, question, role);
        debug!(
            "Ranked {} templates for role {}: {:?}",
            ranked.len(),
            role,
            ranked
                .iter()
                .map(|r| (&r.template.name, r.score))
                .collect::<Vec<_>>()
        );
        Ok(ranked)
    }

    pub fn fill_parameters(&self, template: &QueryTemplate, params: &Map<String, Value>) -> BoundQuery {
        fill_parameters(&template.sql_template, params)
    }

    /// One use of a template and its outcome, counted together.
    pub async fn record_use(
        &self,
        name: &str,
        success: bool,
        execution_time_ms: f64,
    ) -> Result<TemplateAggregates> {
        self.repository
            .record_use(name, success, execution_time_ms)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;

    fn template(name: &str, keywords: &[&str]) -> QueryTemplate {
        QueryTemplate::new(name, name, "finance", "SELECT 1").with_keywords(keywords.iter().copied())
    }

    #[test]
    fn score_is_fraction_of_keywords_present() {
        let ranked = rank_templates(
            vec![
                template("partial", &["fee", "tuition", "refund"]),
                template("full", &["fee", "tuition"]),
            ],
            "What is the Tuition FEE this month?",
            "parent",
        );

        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].template.name, "full");
        assert_eq!(ranked[0].score, 1.0);
        assert_eq!(ranked[0].matched_keywords, vec!["fee", "tuition"]);
        assert!((ranked[1].score - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn keywordless_unmatched_and_ineligible_templates_are_dropped() {
        let mut inactive = template("inactive", &["fee"]);
        inactive.is_active = false;

        let ranked = rank_templates(
            vec![
                template("no_keywords", &[]),
                template("blank_keywords", &["  "]),
                template("unrelated", &["attendance"]),
                template("admins_only", &["fee"]).with_roles(["admin"]),
                template("starred", &["fee"]).with_roles(["*"]),
                inactive,
            ],
            "fee totals",
            "auditor",
        );

        let names: Vec<_> = ranked.iter().map(|r| r.template.name.as_str()).collect();
        assert_eq!(names, vec!["starred"]);
    }

    #[test]
    fn ties_break_on_success_rate_then_speed() {
        let mut slow = template("slow", &["fee"]);
        slow.success_rate = 0.9;
        slow.avg_execution_time = 500.0;
        let mut fast = template("fast", &["fee"]);
        fast.success_rate = 0.9;
        fast.avg_execution_time = 50.0;
        let mut reliable = template("reliable", &["fee"]);
        reliable.success_rate = 1.0;
        reliable.avg_execution_time = 900.0;

        let ranked = rank_templates(vec![slow, fast, reliable], "fee", "all");
        let names: Vec<_> = ranked.iter().map(|r| r.template.name.as_str()).collect();
        assert_eq!(names, vec!["reliable", "fast", "slow"]);
    }

    #[tokio::test]
    async fn matches_against_stored_catalog() {
        let repo = TemplateRepository::new(Store::open_in_memory().unwrap());
        repo.create(&template("fees", &["fee", "month"])).await.unwrap();
        repo.create(&template("grades", &["grade"])).await.unwrap();
        let matcher = TemplateMatcher::new(repo);

        let ranked = matcher.match_query("fees for this month", "parent").await.unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].template.name, "fees");

        let aggregates = matcher.record_use("fees", true, 12.0).await.unwrap();
        assert_eq!(aggregates.usage_count, 1);
        assert_eq!(aggregates.success_rate, 1.0);
        assert_eq!(aggregates.avg_execution_time, 12.0);
    }
}
