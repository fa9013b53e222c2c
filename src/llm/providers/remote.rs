use crate::config::LlmConfig;
use crate::llm::providers::{extract_sql, prepare_prompt};
use crate::llm::{Generation, LlmError, SqlGenerator};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// OpenAI-compatible chat completions endpoint.
pub struct RemoteLlmProvider {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct PromptRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
    max_tokens: usize,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct PromptResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: String,
}

#[derive(Deserialize)]
struct Usage {
    total_tokens: u32,
}

impl RemoteLlmProvider {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_url = config.api_url.clone().ok_or_else(|| {
            LlmError::ConfigError("API URL is required for remote LLM provider".to_string())
        })?;

        let api_key = config.api_key.clone().ok_or_else(|| {
            LlmError::ConfigError("API key is required for remote LLM provider".to_string())
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LlmError::ConnectionError(e.to_string()))?;

        Ok(Self {
            client,
            api_url,
            api_key,
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl SqlGenerator for RemoteLlmProvider {
    async fn generate_sql(&self, question: &str, context: &Value) -> Result<Generation, LlmError> {
        let request = PromptRequest {
            model: self.model.clone(),
            messages: vec![Message {
                role: "user".to_string(),
                content: prepare_prompt(question, context),
            }],
            temperature: 0.1,
            max_tokens: 2000,
        };

        let response = self
            .client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::ConnectionError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(LlmError::ResponseError(format!(
                "API responded with status code: {}",
                response.status()
            )));
        }

        let prompt_response: PromptResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ResponseError(e.to_string()))?;

        let content = prompt_response
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| LlmError::ResponseError("No choices in response".to_string()))?;

        let sql = extract_sql(content);
        if sql.is_empty() {
            return Err(LlmError::ResponseError(
                "Failed to extract valid SQL from response".to_string(),
            ));
        }
        debug!("Remote model produced SQL: {}", sql);

        Ok(Generation {
            sql,
            intent: None,
            tokens_used: prompt_response.usage.map(|u| u.total_tokens),
            model: prompt_response.model.unwrap_or_else(|| self.model.clone()),
        })
    }
}
