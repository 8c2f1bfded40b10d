//! Google Gemini `generateContent` API.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};

use crate::error::ProviderError;
use crate::llm::provider::{
    CompletionRequest, CompletionResponse, DEFAULT_TIMEOUT, LlmProvider, extract_text,
    http_client, interval_for_rate, post_json,
};

pub struct GeminiProvider {
    base_url: String,
    api_key: SecretString,
    model: String,
    min_interval: Option<Duration>,
    timeout: Duration,
    client: reqwest::Client,
}

impl GeminiProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: SecretString,
        model: impl Into<String>,
        rate_per_minute: Option<u32>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            min_interval: interval_for_rate(rate_per_minute),
            timeout: DEFAULT_TIMEOUT,
            client: http_client(DEFAULT_TIMEOUT),
        }
    }

    /// Base URL without the key; the key is appended as a query parameter
    /// and stripped again from any transport error.
    fn url(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }

    fn build_body(&self, request: &CompletionRequest) -> Value {
        let mut generation = json!({ "temperature": request.temperature });
        if request.json_mode {
            generation["responseMimeType"] = json!("application/json");
        }
        json!({
            "contents": [{ "parts": [{ "text": request.prompt }] }],
            "generationConfig": generation,
        })
    }
}

fn parse_body(body: &Value) -> Result<String, ProviderError> {
    extract_text("gemini", body, "/candidates/0/content/parts/0/text")
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
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
        let builder = self
            .client
            .post(self.url())
            .query(&[("key", self.api_key.expose_secret())]);
        let body = self.build_body(request);
        let reply = post_json(self.name(), builder, &body, self.timeout).await?;
        Ok(CompletionResponse {
            content: parse_body(&reply)?,
        })
    }
}
