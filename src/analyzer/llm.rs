use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::AnalyzerConfig;
use crate::error::{PipelineError, Result};

/// Thin client for an OpenAI-style chat-completions endpoint.
pub struct ChatClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl ChatClient {
    pub fn new(config: &AnalyzerConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            PipelineError::ConfigError(format!(
                "API key environment variable '{}' is not set",
                config.api_key_env
            ))
        })?;

        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| {
                PipelineError::NetworkError(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// One chat completion; returns the assistant message content.
    pub async fn complete(
        &self,
        system: &str,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt},
            ],
            "max_tokens": max_tokens,
            "temperature": temperature,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::NetworkError(format!("Chat request failed: {}", e)))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(PipelineError::RateLimited(
                "Chat API returned 429 Too Many Requests".to_string(),
            )
            .into());
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(PipelineError::ApiError(format!(
                "Chat API rejected the API key ({})",
                status
            ))
            .into());
        }

        let data: Value = response.json().await.map_err(|e| {
            PipelineError::ApiError(format!("Failed to parse chat response: {}", e))
        })?;

        if let Some(error) = data.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            return Err(PipelineError::ApiError(format!("Chat API error: {}", message)).into());
        }

        let content = data["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                PipelineError::ApiError("No content in chat response".to_string())
            })?;
        debug!("Chat completion returned {} characters", content.len());
        Ok(content.trim().to_string())
    }
}

/// Strips a markdown code fence (optionally tagged ```json) around a model
/// response so the body parses as plain JSON.
pub fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim()
}
