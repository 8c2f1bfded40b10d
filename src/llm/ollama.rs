//! Local Ollama server (`/api/generate`).

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::ProviderError;
use crate::llm::provider::{
    CompletionRequest, CompletionResponse, DEFAULT_TIMEOUT, LlmProvider, extract_text,
    http_client, interval_for_rate, post_json,
};

pub struct OllamaProvider {
    host: String,
    model: String,
    min_interval: Option<Duration>,
    timeout: Duration,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(host: impl Into<String>, model: impl Into<String>, rate_per_minute: Option<u32>) -> Self {
        Self {
            host: host.into().trim_end_matches('/').to_string(),
            model: model.into(),
            min_interval: interval_for_rate(rate_per_minute),
            timeout: DEFAULT_TIMEOUT,
            client: http_client(DEFAULT_TIMEOUT),
        }
    }

    fn url(&self) -> String {
        format!("{}/api/generate", self.host)
    }

    fn build_body(&self, request: &CompletionRequest) -> Value {
        let mut body = json!({
            "model": self.model,
            "prompt": request.prompt,
            "stream": false,
            "options": { "temperature": request.temperature },
        });
        if request.json_mode {
            body["format"] = json!("json");
        }
        body
    }
}

/// Ollama replies `{"response": "..."}`.
fn parse_body(body: &Value) -> Result<String, ProviderError> {
    extract_text("ollama", body, "/response")
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn min_interval(&self) -> Option<Duration> {
        self.min_interval
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let body = self.build_body(request);
        let reply = post_json(
            self.name(),
            self.client.post(self.url()),
            &body,
            self.timeout,
        )
        .await?;
        Ok(CompletionResponse {
            content: parse_body(&reply)?,
        })
    }
}
