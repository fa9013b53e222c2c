use crate::config::LlmConfig;
use crate::llm::providers::{extract_sql, prepare_prompt};
use crate::llm::{Generation, LlmError, SqlGenerator};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, info};

pub struct OllamaProvider {
    client: reqwest::Client,
    api_url: String,
    model: String,
}

#[derive(Serialize, Debug)]
struct OllamaRequest {
    model: String,
    prompt: String,
    temperature: f32,
    stream: bool,
}

#[derive(Deserialize, Debug)]
struct OllamaResponse {
    response: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

impl OllamaResponse {
    fn tokens_used(&self) -> Option<u32> {
        match (self.prompt_eval_count, self.eval_count) {
            (None, None) => None,
            (prompt, eval) => Some(prompt.unwrap_or(0).saturating_add(eval.unwrap_or(0))),
        }
    }
}

impl OllamaProvider {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_url = config
            .api_url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434/api/generate".to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LlmError::ConnectionError(e.to_string()))?;

        Ok(Self {
            client,
            api_url,
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl SqlGenerator for OllamaProvider {
    async fn generate_sql(&self, question: &str, context: &Value) -> Result<Generation, LlmError> {
        info!("Sending request to Ollama with model: {}", self.model);
        debug!("API URL: {}", self.api_url);

        let request = OllamaRequest {
            model: self.model.clone(),
            prompt: prepare_prompt(question, context),
            temperature: 0.1,
            stream: false,
        };

        let response = self
            .client
            .post(&self.api_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::ConnectionError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = match response.text().await {
                Ok(body) => format!(" - Response body: {}", body),
                Err(_) => String::new(),
            };

            error!("Ollama API responded with status code: {}{}", status, error_body);
            return Err(LlmError::ResponseError(format!(
                "Ollama API responded with status code: {}{}",
                status, error_body
            )));
        }

        let response_text = response
            .text()
            .await
            .map_err(|e| LlmError::ResponseError(format!("Failed to read response body: {}", e)))?;

        debug!("Raw response from Ollama: {}", response_text);

        let ollama_response = serde_json::from_str::<OllamaResponse>(&response_text).map_err(|e| {
            error!("Failed to parse Ollama response: {}", e);
            LlmError::ResponseError(format!(
                "Failed to parse Ollama response: {} - Response was: {}",
                e, response_text
            ))
        })?;

        let sql = extract_sql(&ollama_response.response);
        if sql.is_empty() {
            return Err(LlmError::ResponseError(
                "Failed to extract valid SQL from response".to_string(),
            ));
        }

        Ok(Generation {
            sql,
            intent: None,
            tokens_used: ollama_response.tokens_used(),
            model: ollama_response
                .model
                .clone()
                .unwrap_or_else(|| self.model.clone()),
        })
    }
}
