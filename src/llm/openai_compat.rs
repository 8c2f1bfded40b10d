//! OpenAI-compatible chat completion APIs (Groq, Cerebras, OpenRouter).

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};

use crate::error::ProviderError;
use crate::llm::provider::{
    CompletionRequest, CompletionResponse, DEFAULT_TIMEOUT, LlmProvider, extract_text,
    http_client, interval_for_rate, post_json,
};

pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: SecretString,
    model: String,
    /// Extra headers some gateways want (OpenRouter attribution).
    extra_headers: Vec<(&'static str, String)>,
    min_interval: Option<Duration>,
    timeout: Duration,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: SecretString,
        model: impl Into<String>,
        rate_per_minute: Option<u32>,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            extra_headers: Vec::new(),
            min_interval: interval_for_rate(rate_per_minute),
            timeout: DEFAULT_TIMEOUT,
            client: http_client(DEFAULT_TIMEOUT),
        }
    }

    pub fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.extra_headers.push((name, value.into()));
        self
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn build_body(&self, request: &CompletionRequest) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": request.prompt }],
            "temperature": request.temperature,
        });
        if request.json_mode {
            body["response_format"] = json!({ "type": "json_object" });
        }
        body
    }
}

fn parse_body(provider: &str, body: &Value) -> Result<String, ProviderError> {
    extract_text(provider, body, "/choices/0/message/content")
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
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
        let mut builder = self
            .client
            .post(self.url())
            .bearer_auth(self.api_key.expose_secret());
        for (name, value) in &self.extra_headers {
            builder = builder.header(*name, value);
        }

        let body = self.build_body(request);
        let reply = post_json(&self.name, builder, &body, self.timeout).await?;
        Ok(CompletionResponse {
            content: parse_body(&self.name, &reply)?,
        })
    }
}
