use crate::assistant::{AssistantSettings, QueryAssistant};
use crate::cache::QueryCacheStore;
use crate::config::AppConfig;
use crate::db::Store;
use crate::execution::log::ExecutionLog;
use crate::execution::runner::SqlExecutor;
use crate::feedback::FeedbackAggregator;
use crate::llm::SqlGenerator;
use crate::maintenance::Maintenance;
use crate::templates::{TemplateMatcher, TemplateRepository};
use std::sync::Arc;
use tracing::debug;

/// Shared application state for the web server
pub struct AppState {
    pub config: AppConfig,
    pub assistant: QueryAssistant,
    pub log: ExecutionLog,
    pub cache: QueryCacheStore,
    pub templates: TemplateRepository,
    pub matcher: TemplateMatcher,
    pub feedback: FeedbackAggregator,
    pub maintenance: Maintenance,
    pub startup_time: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        store: Store,
        generator: Arc<dyn SqlGenerator>,
        executor: Arc<dyn SqlExecutor>,
    ) -> Self {
        debug!("Wiring query memory components");
        let log = ExecutionLog::new(store.clone());
        let cache = QueryCacheStore::new(store.clone(), config.cache.ttl());
        let templates = TemplateRepository::new(store.clone());
        let matcher = TemplateMatcher::new(templates.clone());
        let feedback =
            FeedbackAggregator::new(store, log.clone(), cache.clone(), templates.clone());
        let maintenance =
            Maintenance::new(cache.clone(), log.clone(), config.cache.pending_timeout());
        let assistant = QueryAssistant::new(
            log.clone(),
            cache.clone(),
            matcher.clone(),
            generator,
            executor,
            AssistantSettings::from(&config.matching),
        );

        Self {
            config,
            assistant,
            log,
            cache,
            templates,
            matcher,
            feedback,
            maintenance,
            startup_time: chrono::Utc::now(),
        }
    }
}
