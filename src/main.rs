use clap::Parser;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use nl_cube_memo::cache::QueryCacheStore;
use nl_cube_memo::config::{AppConfig, CliArgs, Command};
use nl_cube_memo::db::Store;
use nl_cube_memo::execution::log::{ExecutionLog, LogFilter};
use nl_cube_memo::execution::runner::DuckDbExecutor;
use nl_cube_memo::feedback::FeedbackAggregator;
use nl_cube_memo::llm::LlmManager;
use nl_cube_memo::maintenance::Maintenance;
use nl_cube_memo::templates::{QueryTemplate, TemplateRepository};
use nl_cube_memo::util::logging::init_tracing;
use nl_cube_memo::web;
use nl_cube_memo::web::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    let config = AppConfig::new(&args)?;
    init_tracing(&config.logging);

    info!(
        "Opening query memory at {}",
        config.database.connection_string
    );
    let store = Store::open(&config.database)?;

    match args.command.clone().unwrap_or(Command::Serve) {
        Command::Serve => serve(config, store).await,
        Command::Sweep => sweep(&config, store).await,
        Command::Stats => stats(&config, store).await,
        Command::ImportTemplates { file } => import_templates(store, &file).await,
    }
}

async fn serve(config: AppConfig, store: Store) -> Result<(), Box<dyn std::error::Error>> {
    info!("Initializing LLM manager with backend: {}", config.llm.backend);
    let generator = LlmManager::new(&config.llm)?;

    info!("Opening warehouse at {}", config.warehouse.connection_string);
    let executor = DuckDbExecutor::open(&config.warehouse)?;

    let state = Arc::new(AppState::new(
        config.clone(),
        store,
        Arc::new(generator),
        Arc::new(executor),
    ));

    let maintenance = if config.cache.sweep_interval_secs > 0 {
        info!(
            "Running maintenance every {}s",
            config.cache.sweep_interval_secs
        );
        Some(
            state
                .maintenance
                .clone()
                .spawn(Duration::from_secs(config.cache.sweep_interval_secs)),
        )
    } else {
        None
    };

    info!(
        "Starting query memory server on {}:{}",
        config.web.host, config.web.port
    );
    let served = web::run_server(config.web.clone(), state).await;

    if let Some(handle) = maintenance {
        handle.abort();
    }

    match served {
        Ok(()) => {
            info!("Server stopped gracefully");
            Ok(())
        }
        Err(e) => {
            error!("Server error: {}", e);
            Err(e.into())
        }
    }
}

async fn sweep(config: &AppConfig, store: Store) -> Result<(), Box<dyn std::error::Error>> {
    let cache = QueryCacheStore::new(store.clone(), config.cache.ttl());
    let log = ExecutionLog::new(store);
    let report = Maintenance::new(cache, log, config.cache.pending_timeout())
        .run_once()
        .await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn stats(config: &AppConfig, store: Store) -> Result<(), Box<dyn std::error::Error>> {
    let cache = QueryCacheStore::new(store.clone(), config.cache.ttl());
    let log = ExecutionLog::new(store.clone());
    let templates = TemplateRepository::new(store.clone());
    let feedback = FeedbackAggregator::new(store, log.clone(), cache.clone(), templates);

    let cache_stats = cache.stats().await?;
    let quality = feedback.quality_report(10).await?;
    let failed_recently = log
        .list(LogFilter {
            status: Some(nl_cube_memo::execution::ExecutionStatus::Failed),
            limit: Some(5),
            ..Default::default()
        })
        .await?
        .into_iter()
        .filter_map(|entry| entry.failure_summary())
        .collect::<Vec<_>>();

    let output = json!({
        "cache": cache_stats,
        "usage": quality.usage,
        "feedback": quality.feedback,
        "top_templates": quality.top_templates,
        "recent_failures": failed_recently,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn import_templates(store: Store, file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(file)?;
    let templates: Vec<QueryTemplate> = serde_json::from_str(&text)?;
    info!("Importing {} templates from {}", templates.len(), file.display());

    let repository = TemplateRepository::new(store);
    let mut imported = 0;
    for template in &templates {
        match repository.upsert(template).await {
            Ok(_) => imported += 1,
            Err(e) => warn!("Skipping template {}: {}", template.name, e),
        }
    }

    info!("Imported {} of {} templates", imported, templates.len());
    Ok(())
}
