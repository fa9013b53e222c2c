//! Answers a natural-language question from the cache, a matching template,
//! or fresh generation, recording every attempt in the execution log.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::QueryCacheStore;
use crate::config::MatchingConfig;
use crate::error::{QueryError, Result};
use crate::execution::log::{ExecutionLog, SuccessRecord};
use crate::execution::runner::SqlExecutor;
use crate::execution::{FailureKind, QueryResult, Timings, TokenUsage};
use crate::llm::{SqlGenerator, analysis};
use crate::templates::{BoundQuery, QueryTemplate, TemplateMatcher, validate_parameters};

pub const MAX_QUESTION_CHARS: usize = 1000;

#[derive(Debug, Clone)]
pub struct AssistantSettings {
    /// Minimum keyword score for a template to be used instead of generation.
    pub match_threshold: f64,
    pub max_question_chars: usize,
}

impl Default for AssistantSettings {
    fn default() -> Self {
        Self {
            match_threshold: 0.6,
            max_question_chars: MAX_QUESTION_CHARS,
        }
    }
}

impl From<&MatchingConfig> for AssistantSettings {
    fn from(config: &MatchingConfig) -> Self {
        Self {
            match_threshold: config.threshold,
            ..Default::default()
        }
    }
}

fn default_role() -> String {
    "all".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub user_id: i64,
    #[serde(default = "default_role")]
    pub user_role: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub question: String,
    /// Execution context (tables, user scope). Part of the cache key.
    #[serde(default)]
    pub context: Value,
    /// Values for template parameters.
    #[serde(default)]
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub log_id: i64,
    pub sql: String,
    pub result: QueryResult,
    pub cache_hit: bool,
    pub template: Option<String>,
    /// Times the cached answer has been served, this request included.
    pub hit_count: i64,
}

/// Error plus whatever timings were measured before it happened.
struct Failure {
    error: QueryError,
    timings: Timings,
}

impl From<QueryError> for Failure {
    fn from(error: QueryError) -> Self {
        Self {
            error,
            timings: Timings::default(),
        }
    }
}

fn failure_kind(err: &QueryError) -> FailureKind {
    match err {
        QueryError::UpstreamGeneration(_) => FailureKind::Generation,
        QueryError::InvalidParameters(_) | QueryError::InvalidRequest(_) => FailureKind::Validation,
        QueryError::StorageUnavailable(_) => FailureKind::Timeout,
        _ => FailureKind::Execution,
    }
}

enum Plan {
    Template {
        template: QueryTemplate,
        bound: BoundQuery,
    },
    Generated {
        sql: String,
        tokens: Option<TokenUsage>,
        intent: Option<crate::execution::IntentAnalysis>,
    },
}

#[derive(Clone)]
pub struct QueryAssistant {
    log: ExecutionLog,
    cache: QueryCacheStore,
    matcher: TemplateMatcher,
    generator: Arc<dyn SqlGenerator>,
    executor: Arc<dyn SqlExecutor>,
    settings: AssistantSettings,
}

impl QueryAssistant {
    pub fn new(
        log: ExecutionLog,
        cache: QueryCacheStore,
        matcher: TemplateMatcher,
        generator: Arc<dyn SqlGenerator>,
        executor: Arc<dyn SqlExecutor>,
        settings: AssistantSettings,
    ) -> Self {
        Self {
            log,
            cache,
            matcher,
            generator,
            executor,
            settings,
        }
    }

    pub async fn ask(&self, request: QueryRequest) -> Result<QueryResponse> {
        let question = request.question.trim();
        if question.is_empty() {
            return Err(QueryError::InvalidRequest("question is empty".to_string()));
        }
        if question.chars().count() > self.settings.max_question_chars {
            return Err(QueryError::InvalidRequest(format!(
                "question exceeds {} characters",
                self.settings.max_question_chars
            )));
        }

        let log_id = self
            .log
            .begin(request.user_id, question, request.session_id.as_deref())
            .await?;
        debug!("Execution {} started for user {}", log_id, request.user_id);

        match self.answer(log_id, question, &request).await {
            Ok(response) => Ok(response),
            Err(Failure { error, timings }) => {
                let kind = failure_kind(&error);
                if let Err(seal_err) = self
                    .log
                    .complete_failure(log_id, kind, error.to_string(), timings)
                    .await
                {
                    warn!("Could not record failure of execution {}: {}", log_id, seal_err);
                }
                Err(error)
            }
        }
    }

    async fn answer(
        &self,
        log_id: i64,
        question: &str,
        request: &QueryRequest,
    ) -> std::result::Result<QueryResponse, Failure> {
        let cache_context = cache_context(request);

        if let Some(mut entry) = self.cache.lookup(question, &cache_context).await? {
            match self.cache.record_hit(&mut entry).await {
                Ok(()) => {
                    self.log
                        .complete_success(
                            log_id,
                            SuccessRecord {
                                generated_sql: Some(entry.generated_sql.clone()),
                                final_sql: entry.generated_sql.clone(),
                                result: entry.result.clone(),
                                timings: Timings {
                                    execution_ms: Some(0),
                                    ai_processing_ms: None,
                                },
                                cache_hit: true,
                                query_hash: Some(entry.query_hash.clone()),
                                ..Default::default()
                            },
                        )
                        .await?;
                    info!("Execution {} served from cache ({} hits)", log_id, entry.hit_count);
                    return Ok(QueryResponse {
                        log_id,
                        sql: entry.generated_sql,
                        result: entry.result,
                        cache_hit: true,
                        template: None,
                        hit_count: entry.hit_count,
                    });
                }
                // swept between lookup and hit
                Err(QueryError::NotFound(_)) => debug!("Cache entry vanished, treating as miss"),
                Err(err) => return Err(err.into()),
            }
        }

        let mut timings = Timings::default();
        let plan = match self.pick_template(question, request).await? {
            Some((template, params)) => {
                let bound = self.matcher.fill_parameters(&template, &params);
                info!("Execution {} uses template {}", log_id, template.name);
                Plan::Template { template, bound }
            }
            None => {
                let started = Instant::now();
                let generation = self
                    .generator
                    .generate_sql(question, &request.context)
                    .await;
                timings.ai_processing_ms = Some(started.elapsed().as_millis() as u64);
                let generation = generation.map_err(|e| Failure {
                    error: QueryError::UpstreamGeneration(e.to_string()),
                    timings,
                })?;
                Plan::Generated {
                    sql: generation.sql,
                    tokens: generation.tokens_used.map(|tokens_used| TokenUsage {
                        tokens_used,
                        model: generation.model.clone(),
                    }),
                    intent: generation.intent,
                }
            }
        };

        let bound = match &plan {
            Plan::Template { bound, .. } => bound.clone(),
            Plan::Generated { sql, .. } => BoundQuery::raw(sql.clone()),
        };

        let started = Instant::now();
        let executed = self.executor.execute(&bound).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        timings.execution_ms = Some(elapsed_ms);

        if let Plan::Template { template, .. } = &plan {
            let observed_ms = match &executed {
                Ok(result) => result.metadata.execution_time_ms as f64,
                Err(_) => elapsed_ms as f64,
            };
            self.record_template_use(&template.name, executed.is_ok(), observed_ms)
                .await;
        }

        let result = executed.map_err(|e| Failure {
            error: QueryError::UpstreamExecution(e.to_string()),
            timings,
        })?;

        let entry = self
            .cache
            .entry_for(question, &cache_context, bound.sql.clone(), result.clone());
        self.cache.put(&entry).await?;

        let (generated_sql, template_name, token_usage, intent) = match plan {
            Plan::Template { template, .. } => (None, Some(template.name), None, None),
            Plan::Generated {
                sql, tokens, intent, ..
            } => (Some(sql), None, tokens, intent),
        };
        let complexity = intent
            .as_ref()
            .and_then(|i| i.complexity)
            .unwrap_or_else(|| analysis::complexity_score(&bound.sql));

        self.log
            .complete_success(
                log_id,
                SuccessRecord {
                    generated_sql,
                    final_sql: bound.sql.clone(),
                    result: result.clone(),
                    timings,
                    token_usage,
                    cache_hit: false,
                    intent,
                    complexity: Some(complexity),
                    query_hash: Some(entry.query_hash.clone()),
                    template_name: template_name.clone(),
                },
            )
            .await?;

        info!(
            "Execution {} returned {} rows in {}ms",
            log_id, result.metadata.row_count, elapsed_ms
        );
        Ok(QueryResponse {
            log_id,
            sql: bound.sql,
            result,
            cache_hit: false,
            template: template_name,
            hit_count: entry.hit_count,
        })
    }

    /// Template statistics are secondary to the answer, so a failed write is
    /// only logged.
    async fn record_template_use(&self, name: &str, success: bool, observed_ms: f64) {
        match self.matcher.record_use(name, success, observed_ms).await {
            Ok(aggregates) => debug!(
                "Template {} now at {} uses, success rate {:.2}",
                name, aggregates.usage_count, aggregates.success_rate
            ),
            Err(err) => warn!("Could not record use of template {}: {}", name, err),
        }
    }

    /// Best template above the threshold whose parameters validate.
    async fn pick_template(
        &self,
        question: &str,
        request: &QueryRequest,
    ) -> Result<Option<(QueryTemplate, Map<String, Value>)>> {
        let ranked = self.matcher.match_query(question, &request.user_role).await?;
        Ok(ranked
            .into_iter()
            .take_while(|r| r.score >= self.settings.match_threshold)
            .find_map(|r| match validate_parameters(&r.template, &request.params) {
                Ok(params) => Some((r.template, params)),
                Err(err) => {
                    debug!("Skipping template {}: {}", r.template.name, err);
                    None
                }
            }))
    }
}

/// Template parameters change the answer, so they are part of the key.
fn cache_context(request: &QueryRequest) -> Value {
    if request.params.is_empty() {
        request.context.clone()
    } else {
        json!({"context": request.context, "params": request.params})
    }
}
