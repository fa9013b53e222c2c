pub mod analysis;
pub mod providers;

use crate::config::LlmConfig;
use crate::execution::IntentAnalysis;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::error::Error;
use std::fmt;
use tracing::debug;

#[derive(Debug)]
pub enum LlmError {
    ConnectionError(String),
    ResponseError(String),
    ConfigError(String),
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::ConnectionError(msg) => write!(f, "LLM connection error: {}", msg),
            LlmError::ResponseError(msg) => write!(f, "LLM response error: {}", msg),
            LlmError::ConfigError(msg) => write!(f, "LLM configuration error: {}", msg),
        }
    }
}

impl Error for LlmError {}

/// SQL produced for one question, with what the model reported about it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Generation {
    pub sql: String,
    pub intent: Option<IntentAnalysis>,
    pub tokens_used: Option<u32>,
    pub model: String,
}

#[async_trait]
pub trait SqlGenerator: Send + Sync {
    /// `context` describes what the question runs against (tables, scope).
    async fn generate_sql(&self, question: &str, context: &Value) -> Result<Generation, LlmError>;
}

pub struct LlmManager {
    generator: Box<dyn SqlGenerator + Send + Sync>,
}

impl LlmManager {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let generator: Box<dyn SqlGenerator + Send + Sync> = match config.backend.as_str() {
            "remote" => Box::new(providers::remote::RemoteLlmProvider::new(config)?),
            "ollama" => Box::new(providers::ollama::OllamaProvider::new(config)?),
            _ => {
                return Err(LlmError::ConfigError(format!(
                    "Unsupported LLM backend: {}",
                    config.backend
                )));
            }
        };

        debug!("Using {} backend with model {}", config.backend, config.model);
        Ok(Self { generator })
    }
}

#[async_trait]
impl SqlGenerator for LlmManager {
    async fn generate_sql(&self, question: &str, context: &Value) -> Result<Generation, LlmError> {
        let mut generation = self.generator.generate_sql(question, context).await?;
        generation.sql = strip_code_fence(&generation.sql);
        if generation.intent.is_none() {
            generation.intent = Some(analysis::analyze(question, &generation.sql));
        }
        Ok(generation)
    }
}

/// Drops a surrounding ``` fence (with optional language tag). Backticks
/// inside the statement are kept.
fn strip_code_fence(sql: &str) -> String {
    let mut lines: Vec<&str> = sql.trim().lines().collect();
    if lines.first().is_some_and(|l| l.trim_start().starts_with("```")) {
        lines.remove(0);
    }
    if lines.last().is_some_and(|l| l.trim() == "```") {
        lines.pop();
    }
    lines.join("\n").trim().to_string()
}
