//! Error types for mail-triage.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Mail error: {0}")]
    Mail(#[from] MailError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Classification error: {0}")]
    Classification(#[from] ClassificationError),
}

impl Error {
    /// Auth failures need an operator; everything else can wait for the next run.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            Error::Mail(MailError::AuthFailed { .. }) | Error::Notify(NotifyError::AuthFailed { .. })
        )
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Mail source errors.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Authentication failed for mail source {source_name}: {reason}")]
    AuthFailed { source_name: String, reason: String },

    #[error("Mail request failed: {0}")]
    Request(String),

    #[error("Invalid message {id}: {reason}")]
    InvalidMessage { id: String, reason: String },

    #[error("Token file error: {0}")]
    Token(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Notification channel errors.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Authentication failed for channel {name}: {reason}")]
    AuthFailed { name: String, reason: String },

    #[error("Failed to send on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Channel {name} rejected the message: {reason}")]
    Rejected { name: String, reason: String },
}

/// A single inference backend failure.
///
/// Never surfaced on its own: the selector moves on to the next provider and
/// only reports these as part of [`ClassificationError::AllProvidersFailed`].
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} returned HTTP {status}: {body}")]
    HttpStatus {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

impl ProviderError {
    /// Wrap a reqwest failure, keeping timeouts distinguishable.
    ///
    /// The URL is stripped: some backends carry their key in the query string.
    pub fn from_reqwest(provider: &str, timeout: Duration, err: reqwest::Error) -> Self {
        let err = err.without_url();
        if err.is_timeout() {
            ProviderError::Timeout {
                provider: provider.to_string(),
                timeout,
            }
        } else {
            ProviderError::RequestFailed {
                provider: provider.to_string(),
                reason: err.to_string(),
            }
        }
    }
}

/// One failed attempt inside a classification request.
#[derive(Debug)]
pub struct ProviderAttempt {
    pub provider: String,
    pub error: ProviderError,
}

/// Classification failures that abort processing of a single email.
#[derive(Debug, thiserror::Error)]
pub enum ClassificationError {
    #[error("No inference providers configured")]
    NoProviders,

    #[error("All providers failed: {}", format_attempts(.attempts))]
    AllProvidersFailed { attempts: Vec<ProviderAttempt> },
}

impl ClassificationError {
    /// Names of every provider that was tried, in attempt order.
    pub fn attempted_providers(&self) -> Vec<&str> {
        match self {
            ClassificationError::NoProviders => Vec::new(),
            ClassificationError::AllProvidersFailed { attempts } => {
                attempts.iter().map(|a| a.provider.as_str()).collect()
            }
        }
    }
}

fn format_attempts(attempts: &[ProviderAttempt]) -> String {
    attempts
        .iter()
        .map(|a| format!("[{}] {}", a.provider, a.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
