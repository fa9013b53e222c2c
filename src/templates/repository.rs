use chrono::Utc;
use duckdb::{Connection, Row, params, params_from_iter};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Difficulty, QueryTemplate};
use crate::db::Store;
use crate::db::db_utils::{from_json_text, from_millis, query_opt, to_json_text, to_millis};
use crate::error::{QueryError, Result};
use crate::feedback::stats;

const TEMPLATE_COLUMNS: &str = "name, display_name, description, category, sql_template, \
     parameters, examples, keywords, business_domain, allowed_roles, difficulty, usage_count, \
     success_rate, avg_execution_time, is_active, created_by, created_at, updated_at";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TemplateFilter {
    pub category: Option<String>,
    #[serde(default)]
    pub active_only: bool,
}

/// Running aggregates after an outcome has been folded in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TemplateAggregates {
    pub usage_count: i64,
    pub success_rate: f64,
    pub avg_execution_time: f64,
}

/// Durable catalog of query templates.
#[derive(Clone)]
pub struct TemplateRepository {
    store: Store,
}

impl TemplateRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn create(&self, template: &QueryTemplate) -> Result<QueryTemplate> {
        let mut template = template.clone();
        let now = Utc::now();
        template.created_at = now;
        template.updated_at = now;
        let row = TemplateRow::encode(&template)?;

        self.store
            .write("templates.create", move |conn| {
                if load(conn, &row.name)?.is_some() {
                    return Err(QueryError::InvalidRequest(format!(
                        "template '{}' already exists",
                        row.name
                    )));
                }
                row.insert(conn)
            })
            .await?;

        info!("Created template {}", template.name);
        Ok(template)
    }

    pub async fn get(&self, name: &str) -> Result<QueryTemplate> {
        let name = name.to_string();
        self.store
            .read("templates.get", move |conn| {
                load(conn, &name)?.ok_or_else(|| QueryError::NotFound(format!("template {}", name)))
            })
            .await
    }

    /// Templates ordered by category then name.
    pub async fn list(&self, filter: TemplateFilter) -> Result<Vec<QueryTemplate>> {
        self.store
            .read("templates.list", move |conn| {
                let mut clauses = Vec::new();
                let mut args: Vec<String> = Vec::new();
                if let Some(category) = filter.category {
                    clauses.push("category = ?");
                    args.push(category);
                }
                if filter.active_only {
                    clauses.push("is_active");
                }
                let where_sql = if clauses.is_empty() {
                    String::new()
                } else {
                    format!(" WHERE {}", clauses.join(" AND "))
                };

                let sql = format!(
                    "SELECT {} FROM query_templates{} ORDER BY category, name",
                    TEMPLATE_COLUMNS, where_sql
                );
                let mut stmt = conn.prepare(&sql)?;
                let raws = stmt
                    .query_map(params_from_iter(args), TemplateRow::from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                raws.into_iter().map(TemplateRow::decode).collect()
            })
            .await
    }

    pub async fn list_active(&self) -> Result<Vec<QueryTemplate>> {
        self.list(TemplateFilter {
            category: None,
            active_only: true,
        })
        .await
    }

    /// Replaces the definition of an existing template. Usage aggregates
    /// and creation metadata are kept from storage.
    pub async fn update(&self, template: &QueryTemplate) -> Result<QueryTemplate> {
        let incoming = template.clone();
        self.store
            .write("templates.update", move |conn| {
                let current = load(conn, &incoming.name)?
                    .ok_or_else(|| QueryError::NotFound(format!("template {}", incoming.name)))?;

                let merged = QueryTemplate {
                    usage_count: current.usage_count,
                    success_rate: current.success_rate,
                    avg_execution_time: current.avg_execution_time,
                    created_by: current.created_by.or(incoming.created_by),
                    created_at: current.created_at,
                    updated_at: Utc::now(),
                    ..incoming
                };
                let row = TemplateRow::encode(&merged)?;
                conn.execute(
                    "UPDATE query_templates SET display_name = ?, description = ?, category = ?,
                         sql_template = ?, parameters = ?, examples = ?, keywords = ?,
                         business_domain = ?, allowed_roles = ?, difficulty = ?, is_active = ?,
                         created_by = ?, updated_at = ?
                     WHERE name = ?",
                    params![
                        row.display_name,
                        row.description,
                        row.category,
                        row.sql_template,
                        row.parameters,
                        row.examples,
                        row.keywords,
                        row.business_domain,
                        row.allowed_roles,
                        row.difficulty,
                        row.is_active,
                        row.created_by,
                        row.updated_at,
                        row.name
                    ],
                )?;
                debug!("Updated template {}", merged.name);
                Ok(merged)
            })
            .await
    }

    /// Creates the template or replaces its definition. Used by bulk import.
    pub async fn upsert(&self, template: &QueryTemplate) -> Result<QueryTemplate> {
        match self.update(template).await {
            Err(QueryError::NotFound(_)) => self.create(template).await,
            other => other,
        }
    }

    pub async fn set_active(&self, name: &str, active: bool) -> Result<()> {
        let name = name.to_string();
        let now_ms = to_millis(Utc::now());
        let updated = self
            .store
            .write("templates.set_active", move |conn| {
                let updated = conn.execute(
                    "UPDATE query_templates SET is_active = ?, updated_at = ? WHERE name = ?",
                    params![active, now_ms, name],
                )?;
                if updated == 0 {
                    return Err(QueryError::NotFound(format!("template {}", name)));
                }
                Ok(updated)
            })
            .await?;
        debug!("Set active={} on {} template", active, updated);
        Ok(())
    }

    /// Deletes a template no log entry refers to. Referenced templates should
    /// be deactivated instead.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.store
            .write("templates.delete", move |conn| {
                let references: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM query_logs WHERE template_name = ?",
                    params![name],
                    |row| row.get(0),
                )?;
                if references > 0 {
                    return Err(QueryError::TemplateInUse(name));
                }
                let deleted =
                    conn.execute("DELETE FROM query_templates WHERE name = ?", params![name])?;
                if deleted == 0 {
                    return Err(QueryError::NotFound(format!("template {}", name)));
                }
                info!("Deleted template {}", name);
                Ok(())
            })
            .await
    }

    /// Records one use of the template and folds its outcome into the
    /// running success rate and mean execution time, all in one transaction.
    pub async fn record_use(
        &self,
        name: &str,
        success: bool,
        execution_time_ms: f64,
    ) -> Result<TemplateAggregates> {
        let name = name.to_string();
        self.store
            .write("templates.record_use", move |conn| {
                let tx = conn.transaction()?;
                let mut template = load(&tx, &name)?
                    .ok_or_else(|| QueryError::NotFound(format!("template {}", name)))?;

                template.usage_count += 1;
                template.update_success_rate(success);
                template.update_avg_execution_time(execution_time_ms);

                tx.execute(
                    "UPDATE query_templates
                     SET usage_count = ?, success_rate = ?, avg_execution_time = ?
                     WHERE name = ?",
                    params![
                        template.usage_count,
                        template.success_rate,
                        template.avg_execution_time,
                        name
                    ],
                )?;
                tx.commit()?;

                Ok(TemplateAggregates {
                    usage_count: template.usage_count,
                    success_rate: template.success_rate,
                    avg_execution_time: template.avg_execution_time,
                })
            })
            .await
    }

    /// Turns one previously successful use into a failure after the answer
    /// was reported wrong. Usage and timing are left alone.
    pub async fn retract_success(&self, name: &str) -> Result<TemplateAggregates> {
        let name = name.to_string();
        self.store
            .write("templates.retract_success", move |conn| {
                let tx = conn.transaction()?;
                let mut template = load(&tx, &name)?
                    .ok_or_else(|| QueryError::NotFound(format!("template {}", name)))?;

                template.success_rate =
                    stats::retract_success(template.usage_count, template.success_rate);

                tx.execute(
                    "UPDATE query_templates SET success_rate = ? WHERE name = ?",
                    params![template.success_rate, name],
                )?;
                tx.commit()?;

                Ok(TemplateAggregates {
                    usage_count: template.usage_count,
                    success_rate: template.success_rate,
                    avg_execution_time: template.avg_execution_time,
                })
            })
            .await
    }

    /// Active templates ranked by usage, for the quality report.
    pub async fn most_used(&self, limit: usize) -> Result<Vec<QueryTemplate>> {
        self.store
            .read("templates.most_used", move |conn| {
                let sql = format!(
                    "SELECT {} FROM query_templates WHERE is_active
                     ORDER BY usage_count DESC, success_rate DESC, name
                     LIMIT {}",
                    TEMPLATE_COLUMNS, limit
                );
                let mut stmt = conn.prepare(&sql)?;
                let raws = stmt
                    .query_map([], TemplateRow::from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                raws.into_iter().map(TemplateRow::decode).collect()
            })
            .await
    }
}

fn load(conn: &Connection, name: &str) -> Result<Option<QueryTemplate>> {
    let sql = format!("SELECT {} FROM query_templates WHERE name = ?", TEMPLATE_COLUMNS);
    query_opt(conn, &sql, params![name], TemplateRow::from_row)?
        .map(TemplateRow::decode)
        .transpose()
}

/// Storage shape of a template: JSON text for structured fields, epoch
/// millis for timestamps.
struct TemplateRow {
    name: String,
    display_name: String,
    description: Option<String>,
    category: String,
    sql_template: String,
    parameters: String,
    examples: String,
    keywords: String,
    business_domain: Option<String>,
    allowed_roles: String,
    difficulty: String,
    usage_count: i64,
    success_rate: f64,
    avg_execution_time: f64,
    is_active: bool,
    created_by: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl TemplateRow {
    fn encode(t: &QueryTemplate) -> Result<Self> {
        Ok(Self {
            name: t.name.clone(),
            display_name: t.display_name.clone(),
            description: t.description.clone(),
            category: t.category.clone(),
            sql_template: t.sql_template.clone(),
            parameters: to_json_text(&t.parameters)?,
            examples: to_json_text(&t.examples)?,
            keywords: to_json_text(&t.keywords)?,
            business_domain: t.business_domain.clone(),
            allowed_roles: to_json_text(&t.allowed_roles)?,
            difficulty: t.difficulty.as_str().to_string(),
            usage_count: t.usage_count,
            success_rate: t.success_rate,
            avg_execution_time: t.avg_execution_time,
            is_active: t.is_active,
            created_by: t.created_by,
            created_at: to_millis(t.created_at),
            updated_at: to_millis(t.updated_at),
        })
    }

    fn insert(self, conn: &Connection) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT INTO query_templates ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                TEMPLATE_COLUMNS
            ),
            params![
                self.name,
                self.display_name,
                self.description,
                self.category,
                self.sql_template,
                self.parameters,
                self.examples,
                self.keywords,
                self.business_domain,
                self.allowed_roles,
                self.difficulty,
                self.usage_count,
                self.success_rate,
                self.avg_execution_time,
                self.is_active,
                self.created_by,
                self.created_at,
                self.updated_at
            ],
        )?;
        Ok(())
    }

    fn from_row(row: &Row<'_>) -> duckdb::Result<Self> {
        Ok(Self {
            name: row.get(0)?,
            display_name: row.get(1)?,
            description: row.get(2)?,
            category: row.get(3)?,
            sql_template: row.get(4)?,
            parameters: row.get(5)?,
            examples: row.get(6)?,
            keywords: row.get(7)?,
            business_domain: row.get(8)?,
            allowed_roles: row.get(9)?,
            difficulty: row.get(10)?,
            usage_count: row.get(11)?,
            success_rate: row.get(12)?,
            avg_execution_time: row.get(13)?,
            is_active: row.get(14)?,
            created_by: row.get(15)?,
            created_at: row.get(16)?,
            updated_at: row.get(17)?,
        })
    }

    fn decode(self) -> Result<QueryTemplate> {
        let difficulty = Difficulty::parse(&self.difficulty).ok_or_else(|| {
            QueryError::Storage(format!(
                "template {} has unknown difficulty '{}'",
                self.name, self.difficulty
            ))
        })?;

        Ok(QueryTemplate {
            name: self.name,
            display_name: self.display_name,
            description: self.description,
            category: self.category,
            sql_template: self.sql_template,
            parameters: from_json_text(&self.parameters)?,
            examples: from_json_text(&self.examples)?,
            keywords: from_json_text(&self.keywords)?,
            business_domain: self.business_domain,
            allowed_roles: from_json_text(&self.allowed_roles)?,
            difficulty,
            usage_count: self.usage_count,
            success_rate: self.success_rate,
            avg_execution_time: self.avg_execution_time,
            is_active: self.is_active,
            created_by: self.created_by,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
        })
    }
}
