//! Telegram notifier: Bot API `sendMessage` with HTML formatting.

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;

use crate::config::Env;
use crate::error::{ConfigError, NotifyError};
use crate::notify::Notifier;
use crate::pipeline::types::{Digest, ProcessedRecord};

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Normal-priority items listed by name in a digest; the rest are counted.
const DIGEST_NORMAL_LISTED: usize = 10;

/// Telegram credentials and endpoint.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    pub chat_id: String,
    /// Bot API base, overridable for tests and self-hosted API servers.
    pub api_url: String,
}

impl TelegramConfig {
    pub fn from_env(env: &Env<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            bot_token: SecretString::from(env.require(
                "TELEGRAM_BOT_TOKEN",
                "Create a bot with @BotFather and set its token.",
            )?),
            chat_id: env.require(
                "TELEGRAM_CHAT_ID",
                "Send a message to @userinfobot to find your chat id.",
            )?,
            api_url: env
                .get("TELEGRAM_API_URL")
                .unwrap_or_else(|| "https://api.telegram.org".to_string())
                .trim_end_matches('/')
                .to_string(),
        })
    }
}

/// Sends alerts and digests to one Telegram chat.
pub struct TelegramNotifier {
    config: TelegramConfig,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(config: TelegramConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.config.api_url,
            self.config.bot_token.expose_secret()
        )
    }

    /// Send a text message, splitting at Telegram's 4096 char limit.
    async fn send_message(&self, text: &str, silent: bool) -> Result<(), NotifyError> {
        for chunk in split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH) {
            self.send_message_chunk(&chunk, silent).await?;
        }
        Ok(())
    }

    /// Send a single chunk, HTML first with a plain text fallback.
    async fn send_message_chunk(&self, text: &str, silent: bool) -> Result<(), NotifyError> {
        let html_body = json!({
            "chat_id": self.config.chat_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_notification": silent,
        });

        let (html_status, html_err) = match self.post("sendMessage", &html_body).await? {
            None => return Ok(()),
            Some(failure) => failure,
        };
        if is_auth_status(html_status) {
            return Err(auth_failed(html_status, &html_err));
        }

        tracing::warn!(
            status = html_status,
            error = %html_err,
            "Telegram sendMessage with HTML failed; retrying without parse_mode"
        );

        let plain_body = json!({
            "chat_id": self.config.chat_id,
            "text": strip_html(text),
            "disable_notification": silent,
        });
        match self.post("sendMessage", &plain_body).await? {
            None => Ok(()),
            Some((status, err)) if is_auth_status(status) => Err(auth_failed(status, &err)),
            Some((status, err)) => Err(NotifyError::Rejected {
                name: "telegram".into(),
                reason: format!("sendMessage failed (html: {html_status} {html_err}, plain: {status} {err})"),
            }),
        }
    }

    /// POST a Bot API method. `Ok(None)` on success, `Ok(Some((status, description)))`
    /// when Telegram answered with an error.
    async fn post(
        &self,
        method: &str,
        body: &serde_json::Value,
    ) -> Result<Option<(u16, String)>, NotifyError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| NotifyError::SendFailed {
                name: "telegram".into(),
                reason: e.without_url().to_string(),
            })?;

        let status = resp.status();
        let payload: serde_json::Value = resp.json().await.unwrap_or_default();
        let ok = payload.get("ok").and_then(|v| v.as_bool()).unwrap_or(false);
        if status.is_success() && ok {
            return Ok(None);
        }
        let description = payload
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or("no description")
            .to_string();
        Ok(Some((status.as_u16(), description)))
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send_alert(&self, record: &ProcessedRecord) -> Result<(), NotifyError> {
        self.send_message(&format_alert(record), false).await?;
        tracing::info!(email_id = %record.email_id, "Telegram alert sent");
        Ok(())
    }

    async fn send_digest(&self, digest: &Digest) -> Result<(), NotifyError> {
        self.send_message(&format_digest(digest), true).await?;
        tracing::info!(items = digest.total(), "Telegram digest sent");
        Ok(())
    }

    async fn test_connection(&self) -> Result<(), NotifyError> {
        let resp = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|e| NotifyError::SendFailed {
                name: "telegram".into(),
                reason: e.without_url().to_string(),
            })?;

        let status = resp.status().as_u16();
        if resp.status().is_success() {
            Ok(())
        } else if is_auth_status(status) {
            Err(auth_failed(status, "getMe rejected the bot token"))
        } else {
            Err(NotifyError::SendFailed {
                name: "telegram".into(),
                reason: format!("getMe returned {status}"),
            })
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Telegram answers 401 for a bad token, 403 when the bot was blocked and
/// 404 for a malformed token path.
fn is_auth_status(status: u16) -> bool {
    matches!(status, 401 | 403 | 404)
}

fn auth_failed(status: u16, description: &str) -> NotifyError {
    NotifyError::AuthFailed {
        name: "telegram".into(),
        reason: format!("HTTP {status}: {description}"),
    }
}

/// Escape text for Telegram's HTML parse mode.
pub fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Plain-text rendering of an HTML message for the fallback send.
///
/// Content is escaped before formatting, so every literal `<` opens a tag.
fn strip_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_tag = false;
    for ch in s.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// "$1,234.56" style rendering.
pub fn format_amount(amount: Decimal) -> String {
    let rounded = amount.round_dp(2);
    let text = format!("{rounded:.2}");
    let (sign, digits) = match text.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", text.as_str()),
    };
    let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, "00"));

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    format!("{sign}${grouped}.{frac_part}")
}

/// Urgent alert message.
pub fn format_alert(record: &ProcessedRecord) -> String {
    let c = &record.classification;
    let mut msg = String::from("🚨 <b>CORREO URGENTE</b>\n\n");
    msg.push_str(&format!("<b>De:</b> {}\n", escape_html(&record.sender)));
    msg.push_str(&format!("<b>Asunto:</b> {}\n", escape_html(&record.subject)));
    msg.push_str(&format!("<b>Categoría:</b> {}\n", c.category));
    if let Some(amount) = c.amount {
        msg.push_str(&format!("<b>💰 Monto:</b> {}\n", format_amount(amount)));
    }
    if c.action_required {
        msg.push_str("<b>⚡ Requiere acción</b>\n");
    }
    let summary = if c.summary.is_empty() {
        "Sin resumen"
    } else {
        c.summary.as_str()
    };
    msg.push_str(&format!("\n<b>📝 Resumen:</b>\n{}", escape_html(summary)));
    msg
}

fn digest_line(record: &ProcessedRecord) -> String {
    let c = &record.classification;
    let label = if c.summary.is_empty() {
        &record.subject
    } else {
        &c.summary
    };
    match c.amount {
        Some(amount) => format!("  • {} ({})\n", escape_html(label), format_amount(amount)),
        None => format!("  • {}\n", escape_html(label)),
    }
}

/// Digest message: normal items listed, low-priority items counted.
pub fn format_digest(digest: &Digest) -> String {
    let mut msg = format!(
        "📊 <b>RESUMEN - {}</b>\n{}\n\n",
        digest.date.format("%d/%m/%Y"),
        "=".repeat(30)
    );
    msg.push_str(&format!("📬 Correos en este resumen: {}\n", digest.total()));
    if digest.urgent_today > 0 {
        msg.push_str(&format!(
            "🚨 Alertas urgentes enviadas hoy: {}\n",
            digest.urgent_today
        ));
    }
    msg.push('\n');

    if !digest.normal.is_empty() {
        msg.push_str(&format!("📧 <b>Normales ({}):</b>\n", digest.normal.len()));
        for record in digest.normal.iter().take(DIGEST_NORMAL_LISTED) {
            msg.push_str(&digest_line(record));
        }
        if digest.normal.len() > DIGEST_NORMAL_LISTED {
            msg.push_str(&format!(
                "  ... y {} más\n",
                digest.normal.len() - DIGEST_NORMAL_LISTED
            ));
        }
        msg.push('\n');
    }

    if !digest.low_priority.is_empty() {
        msg.push_str(&format!(
            "📭 Sin prioridad: {} correos\n",
            digest.low_priority.len()
        ));
    }
    msg
}

/// Split a message into chunks that fit Telegram's character limit.
/// Tries to split on newlines, then spaces, then hard-cuts on a char boundary.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut limit = max_len;
        while limit > 0 && !remaining.is_char_boundary(limit) {
            limit -= 1;
        }
        let chunk = &remaining[..limit];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .unwrap_or(limit);

        // Don't split at position 0 (infinite loop guard)
        let split_at = if split_at == 0 { limit } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

// ── Tests ───────────────────────────────────────────────────────────
