//! Gmail mail source over the REST API.
//!
//! Authentication reuses a token file minted by an interactive consent flow
//! run elsewhere. When the access token has expired and the file carries a
//! refresh token, a new access token is requested from `token_uri` and the
//! file is rewritten in place. Messages are fetched in `raw` format and
//! parsed locally with `mail-parser`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use mail_parser::MessageParser;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::config::Env;
use crate::error::{ConfigError, MailError};
use crate::mail::MailSource;
use crate::pipeline::types::Email;

const DEFAULT_API_URL: &str = "https://gmail.googleapis.com/gmail/v1";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Body characters kept per message.
const BODY_MAX_CHARS: usize = 2000;

/// Gmail rejects list pages larger than this.
const MAX_PAGE_SIZE: u32 = 500;

/// Refresh slightly before the recorded expiry to absorb clock skew.
const EXPIRY_SKEW_SECS: i64 = 60;

const SOURCE_NAME: &str = "gmail";

/// Gmail connection settings.
#[derive(Debug, Clone)]
pub struct GmailConfig {
    pub token_path: PathBuf,
    pub max_results: u32,
    pub query: String,
    pub api_url: String,
}

impl GmailConfig {
    pub fn from_env(env: &Env<'_>) -> Result<Self, ConfigError> {
        let max_results: u32 = env.parse_or("GMAIL_MAX_RESULTS", 50)?;
        if max_results == 0 || max_results > MAX_PAGE_SIZE {
            return Err(ConfigError::InvalidValue {
                key: "GMAIL_MAX_RESULTS".to_string(),
                message: format!("must be between 1 and {MAX_PAGE_SIZE}, got {max_results}"),
            });
        }
        Ok(Self {
            token_path: env
                .get("GMAIL_TOKEN_PATH")
                .unwrap_or_else(|| "./config/token.json".to_string())
                .into(),
            max_results,
            query: env
                .get("GMAIL_QUERY")
                .unwrap_or_else(|| "is:unread".to_string()),
            api_url: env
                .get("GMAIL_API_URL")
                .unwrap_or_else(|| DEFAULT_API_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
        })
    }
}

// ── Token file ──────────────────────────────────────────────────────

/// On-disk OAuth token. Unknown keys (scopes, account, ...) are carried
/// through a rewrite untouched.
#[derive(Clone, Serialize, Deserialize)]
struct StoredToken {
    #[serde(alias = "token")]
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default = "default_token_uri")]
    token_uri: String,
    #[serde(default, with = "expiry_format")]
    expiry: Option<DateTime<Utc>>,
    #[serde(flatten)]
    extra: serde_json::Map<String, Value>,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl StoredToken {
    async fn load(path: &Path) -> Result<Self, MailError> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            MailError::Token(format!("cannot read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| MailError::Token(format!("invalid token file {}: {e}", path.display())))
    }

    async fn save(&self, path: &Path) -> Result<(), MailError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| MailError::Token(format!("cannot serialize token: {e}")))?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// A token without an expiry is assumed valid until the API says otherwise.
    fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.expiry
            .is_some_and(|exp| exp - chrono::Duration::seconds(EXPIRY_SKEW_SECS) <= now)
    }
}

/// Expiry timestamps come as RFC 3339, or as a naive UTC timestamp from
/// older token writers.
mod expiry_format {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(dt) => serializer.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Micros, true)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            None => Ok(None),
            Some(s) => super::parse_expiry(&s)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid expiry '{s}'"))),
        }
    }
}

fn parse_expiry(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s.trim_end_matches('Z'), "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

// ── Source ──────────────────────────────────────────────────────────

/// Polls one Gmail mailbox.
pub struct GmailSource {
    config: GmailConfig,
    client: reqwest::Client,
    /// Loaded lazily; cleared after a 401 so the file is re-read.
    token: Mutex<Option<StoredToken>>,
}

impl GmailSource {
    pub fn new(config: GmailConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            config,
            client,
            token: Mutex::new(None),
        }
    }

    fn messages_url(&self) -> String {
        format!("{}/users/me/messages", self.config.api_url)
    }

    /// Current access token, refreshing and persisting it when expired.
    async fn access_token(&self) -> Result<String, MailError> {
        let mut guard = self.token.lock().await;
        let mut token = match guard.take() {
            Some(token) => token,
            None => StoredToken::load(&self.config.token_path).await?,
        };

        if token.needs_refresh(Utc::now()) {
            self.refresh(&mut token).await?;
            token.save(&self.config.token_path).await?;
            tracing::info!(
                path = %self.config.token_path.display(),
                "Refreshed Gmail access token"
            );
        }

        let access = token.access_token.clone();
        *guard = Some(token);
        Ok(access)
    }

    async fn refresh(&self, token: &mut StoredToken) -> Result<(), MailError> {
        let (Some(refresh_token), Some(client_id), Some(client_secret)) = (
            token.refresh_token.as_deref(),
            token.client_id.as_deref(),
            token.client_secret.as_deref(),
        ) else {
            return Err(auth_failed(
                "access token expired and the token file has no refresh credentials",
            ));
        };

        let response = self
            .client
            .post(&token.token_uri)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", client_id),
                ("client_secret", client_secret),
            ])
            .send()
            .await
            .map_err(|e| MailError::Request(format!("token refresh: {e}")))?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            let body = response.text().await.unwrap_or_default();
            return Err(auth_failed(&format!(
                "token refresh rejected ({status}): {}",
                clip(&body, 200)
            )));
        }
        if !status.is_success() {
            return Err(MailError::Request(format!("token refresh returned {status}")));
        }

        let refreshed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| MailError::Token(format!("invalid refresh response: {e}")))?;
        token.access_token = refreshed.access_token;
        token.expiry =
            Some(Utc::now() + chrono::Duration::seconds(refreshed.expires_in.unwrap_or(3600)));
        Ok(())
    }

    /// Send an authorized request and decode the JSON reply.
    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, MailError> {
        let access = self.access_token().await?;
        let response = request
            .bearer_auth(access)
            .send()
            .await
            .map_err(|e| MailError::Request(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            *self.token.lock().await = None;
            return Err(auth_failed("access token rejected (401)"));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MailError::Request(format!(
                "HTTP {status}: {}",
                clip(&body, 300)
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| MailError::Request(format!("response is not JSON: {e}")))
    }

    async fn fetch_message(&self, id: &str) -> Result<Email, MailError> {
        let url = format!("{}/{id}", self.messages_url());
        let body = self
            .send(self.client.get(url).query(&[("format", "raw")]))
            .await?;

        let raw = body
            .get("raw")
            .and_then(Value::as_str)
            .ok_or_else(|| MailError::InvalidMessage {
                id: id.to_string(),
                reason: "response has no raw field".to_string(),
            })?;
        let bytes = decode_raw(raw).map_err(|reason| MailError::InvalidMessage {
            id: id.to_string(),
            reason,
        })?;
        let internal_date = body
            .get("internalDate")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<i64>().ok());

        parse_raw_message(id, &bytes, internal_date)
    }
}

#[async_trait]
impl MailSource for GmailSource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    async fn fetch_unread(&self) -> Result<Vec<Email>, MailError> {
        let listing = self
            .send(self.client.get(self.messages_url()).query(&[
                ("q", self.config.query.clone()),
                ("maxResults", self.config.max_results.to_string()),
            ]))
            .await?;

        let ids = message_ids(&listing);
        tracing::debug!(count = ids.len(), query = %self.config.query, "Listed Gmail messages");

        let mut emails = Vec::with_capacity(ids.len());
        for id in ids {
            match self.fetch_message(&id).await {
                Ok(email) => emails.push(email),
                Err(e @ MailError::AuthFailed { .. }) => return Err(e),
                Err(e) => {
                    tracing::warn!(email_id = %id, error = %e, "Skipping message that could not be fetched");
                }
            }
        }
        Ok(emails)
    }

    async fn mark_read(&self, email_id: &str) -> Result<(), MailError> {
        let url = format!("{}/{email_id}/modify", self.messages_url());
        self.send(
            self.client
                .post(url)
                .json(&json!({ "removeLabelIds": ["UNREAD"] })),
        )
        .await?;
        Ok(())
    }

    async fn test_connection(&self) -> Result<(), MailError> {
        let url = format!("{}/users/me/profile", self.config.api_url);
        let profile = self.send(self.client.get(url)).await?;
        let address = profile
            .get("emailAddress")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("?");
        tracing::info!(email = address, "Gmail connection OK");
        Ok(())
    }
}

fn auth_failed(reason: &str) -> MailError {
    MailError::AuthFailed {
        source_name: SOURCE_NAME.to_string(),
        reason: reason.to_string(),
    }
}

fn clip(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Message ids from a `messages.list` reply. An empty mailbox omits the key.
fn message_ids(listing: &Value) -> Vec<String> {
    listing
        .get("messages")
        .and_then(Value::as_array)
        .map(|messages| {
            messages
                .iter()
                .filter_map(|m| m.get("id").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Gmail's `raw` is base64url; padding may or may not be present.
fn decode_raw(raw: &str) -> Result<Vec<u8>, String> {
    let trimmed: String = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .trim_end_matches('=')
        .to_string();
    base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(trimmed.as_bytes())
        .map_err(|e| format!("raw is not base64url: {e}"))
}

/// Build an [`Email`] from RFC 5322 bytes.
fn parse_raw_message(
    id: &str,
    bytes: &[u8],
    internal_date_ms: Option<i64>,
) -> Result<Email, MailError> {
    let parsed = MessageParser::default()
        .parse(bytes)
        .ok_or_else(|| MailError::InvalidMessage {
            id: id.to_string(),
            reason: "not an RFC 5322 message".to_string(),
        })?;

    let subject = parsed
        .subject()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("Sin asunto")
        .to_string();

    let body: String = parsed
        .body_text(0)
        .map(|text| text.trim().chars().take(BODY_MAX_CHARS).collect())
        .unwrap_or_default();

    let received_at = internal_date_ms
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .or_else(|| {
            parsed
                .date()
                .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0))
        })
        .unwrap_or_else(Utc::now);

    Ok(Email {
        id: id.to_string(),
        subject,
        sender: extract_sender(&parsed),
        body,
        received_at,
    })
}

/// `Name <address>` when both are present, otherwise whichever is.
fn extract_sender(parsed: &mail_parser::Message) -> String {
    let Some(addr) = parsed.from().and_then(|a| a.first()) else {
        return "Desconocido".to_string();
    };
    match (addr.name(), addr.address()) {
        (Some(name), Some(address)) => format!("{name} <{address}>"),
        (None, Some(address)) => address.to_string(),
        (Some(name), None) => name.to_string(),
        (None, None) => "Desconocido".to_string(),
    }
}
