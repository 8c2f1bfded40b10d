//! Provider-agnostic completion interface.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ProviderError;

/// Default per-request timeout for inference calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A single-prompt completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub temperature: f32,
    /// Ask the backend to constrain output to a JSON object when it can.
    pub json_mode: bool,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            temperature: 0.1,
            json_mode: true,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_json_mode(mut self, json_mode: bool) -> Self {
        self.json_mode = json_mode;
        self
    }
}

/// Free-text model output.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResponse {
    pub content: String,
}

/// A backend capable of producing a text completion for a prompt.
///
/// Each implementation owns its endpoint, auth scheme, request body and
/// response shape.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name used in logs and aggregate errors (e.g. "groq").
    fn name(&self) -> &str;

    fn model_name(&self) -> &str;

    /// Minimum spacing between calls derived from the provider's rate budget.
    fn min_interval(&self) -> Option<Duration> {
        None
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError>;
}

/// Convert a requests-per-minute budget into a minimum call spacing.
pub fn interval_for_rate(rate_per_minute: Option<u32>) -> Option<Duration> {
    match rate_per_minute {
        Some(rpm) if rpm > 0 => Some(Duration::from_millis(60_000 / u64::from(rpm))),
        _ => None,
    }
}

/// Build the shared HTTP client for inference calls.
pub(crate) fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

/// POST a JSON body and decode a JSON reply.
///
/// Non-2xx statuses, transport failures, timeouts and undecodable bodies all
/// map to a `ProviderError` so the selector can move on.
pub(crate) async fn post_json(
    provider: &str,
    request: reqwest::RequestBuilder,
    body: &Value,
    timeout: Duration,
) -> Result<Value, ProviderError> {
    let response = request
        .json(body)
        .send()
        .await
        .map_err(|e| ProviderError::from_reqwest(provider, timeout, e))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::HttpStatus {
            provider: provider.to_string(),
            status: status.as_u16(),
            body: truncate(&body, 300),
        });
    }

    response
        .json::<Value>()
        .await
        .map_err(|e| ProviderError::InvalidResponse {
            provider: provider.to_string(),
            reason: format!("body is not JSON: {}", e.without_url()),
        })
}

/// Pull a string out of a JSON document by pointer, or fail as malformed.
pub(crate) fn extract_text(provider: &str, body: &Value, pointer: &str) -> Result<String, ProviderError> {
    body.pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProviderError::InvalidResponse {
            provider: provider.to_string(),
            reason: format!("missing {pointer}"),
        })
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_budget_to_interval() {
        assert_eq!(interval_for_rate(Some(60)), Some(Duration::from_secs(1)));
        assert_eq!(interval_for_rate(Some(30)), Some(Duration::from_secs(2)));
        assert_eq!(interval_for_rate(Some(0)), None);
        assert_eq!(interval_for_rate(None), None);
    }

    #[test]
    fn extract_text_reports_missing_pointer() {
        let body = serde_json::json!({"choices": []});
        let err = extract_text("groq", &body, "/choices/0/message/content").unwrap_err();
        assert!(matches!(err, ProviderError::InvalidResponse { .. }));
        assert!(err.to_string().contains("groq"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "áéíóú".repeat(10);
        let t = truncate(&s, 5);
        assert!(t.ends_with("..."));
        assert_eq!(truncate("short", 10), "short");
    }

    #[test]
    fn request_builder_defaults() {
        let req = CompletionRequest::new("hola");
        assert!(req.json_mode);
        assert!((req.temperature - 0.1).abs() < f32::EPSILON);

        let req = req.with_temperature(0.3).with_json_mode(false);
        assert!(!req.json_mode);
        assert!((req.temperature - 0.3).abs() < f32::EPSILON);
    }
}
