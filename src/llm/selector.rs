//! Provider selection across multiple inference backends.
//!
//! One `complete` call is one classification request. The selection mode
//! decides which provider is tried first and whether others are tried after
//! a failure. The rotation cursor lives here and advances once per request.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tokio::time::Instant;

use crate::error::{ClassificationError, ProviderAttempt};
use crate::llm::provider::{CompletionRequest, CompletionResponse, LlmProvider};

/// How the selector picks a provider for each request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionMode {
    /// Always the first configured provider, no retries elsewhere.
    Fixed,
    /// Start at the rotation cursor, then try the rest in wrapping order.
    #[default]
    Rotate,
    /// Always start at the first provider and walk the list on failure.
    FallbackOnFailure,
}

impl fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SelectionMode::Fixed => "fixed",
            SelectionMode::Rotate => "rotate",
            SelectionMode::FallbackOnFailure => "fallback-on-failure",
        })
    }
}

impl FromStr for SelectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "fixed" => Ok(SelectionMode::Fixed),
            "rotate" | "round-robin" => Ok(SelectionMode::Rotate),
            "fallback-on-failure" | "fallback" => Ok(SelectionMode::FallbackOnFailure),
            other => Err(format!(
                "unknown selection mode '{other}', expected fixed, rotate or fallback-on-failure"
            )),
        }
    }
}

/// Successful completion together with the provider that produced it.
#[derive(Debug, Clone)]
pub struct SelectedCompletion {
    pub provider: String,
    pub response: CompletionResponse,
}

/// Ordered set of providers plus the selection state.
pub struct ProviderSelector {
    providers: Vec<Arc<dyn LlmProvider>>,
    mode: SelectionMode,
    cursor: usize,
    last_call: Vec<Option<Instant>>,
}

impl ProviderSelector {
    pub fn new(providers: Vec<Arc<dyn LlmProvider>>, mode: SelectionMode) -> Self {
        let last_call = vec![None; providers.len()];
        Self {
            providers,
            mode,
            cursor: 0,
            last_call,
        }
    }

    pub fn mode(&self) -> SelectionMode {
        self.mode
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Indices to try for the next request, in order. Advances the cursor in
    /// rotate mode whether or not the request later succeeds.
    fn next_order(&mut self) -> Vec<usize> {
        let n = self.providers.len();
        if n == 0 {
            return Vec::new();
        }
        match self.mode {
            SelectionMode::Fixed => vec![0],
            SelectionMode::FallbackOnFailure => (0..n).collect(),
            SelectionMode::Rotate => {
                let start = self.cursor % n;
                self.cursor = (start + 1) % n;
                (0..n).map(|i| (start + i) % n).collect()
            }
        }
    }

    /// Honour a provider's rate budget by sleeping until its next slot.
    async fn wait_for_slot(&mut self, idx: usize) {
        if let (Some(interval), Some(last)) =
            (self.providers[idx].min_interval(), self.last_call[idx])
        {
            let ready_at = last + interval;
            if ready_at > Instant::now() {
                tracing::debug!(
                    provider = self.providers[idx].name(),
                    wait_ms = (ready_at - Instant::now()).as_millis() as u64,
                    "Waiting for provider rate budget"
                );
                tokio::time::sleep_until(ready_at).await;
            }
        }
        self.last_call[idx] = Some(Instant::now());
    }

    /// Run one request through the configured providers.
    pub async fn complete(
        &mut self,
        request: &CompletionRequest,
    ) -> Result<SelectedCompletion, ClassificationError> {
        let order = self.next_order();
        if order.is_empty() {
            return Err(ClassificationError::NoProviders);
        }

        let mut attempts = Vec::new();
        for idx in order {
            self.wait_for_slot(idx).await;
            let provider = Arc::clone(&self.providers[idx]);
            match provider.complete(request).await {
                Ok(response) => {
                    if !attempts.is_empty() {
                        tracing::info!(
                            provider = provider.name(),
                            failed = attempts.len(),
                            "Provider succeeded after earlier failures"
                        );
                    }
                    return Ok(SelectedCompletion {
                        provider: provider.name().to_string(),
                        response,
                    });
                }
                Err(error) => {
                    tracing::warn!(
                        provider = provider.name(),
                        model = provider.model_name(),
                        error = %error,
                        "Provider failed"
                    );
                    attempts.push(ProviderAttempt {
                        provider: provider.name().to_string(),
                        error,
                    });
                }
            }
        }

        Err(ClassificationError::AllProvidersFailed { attempts })
    }
}
