//! Mail sources: where unread bank mail comes from.

pub mod gmail;

pub use gmail::{GmailConfig, GmailSource};

use async_trait::async_trait;

use crate::error::MailError;
use crate::pipeline::types::Email;

/// A mailbox the orchestrator can poll.
#[async_trait]
pub trait MailSource: Send + Sync {
    /// Source name used in logs.
    fn name(&self) -> &str;

    /// Fetch unread messages, newest first as the provider returns them.
    ///
    /// Messages that cannot be decoded are logged and left out; an auth
    /// failure aborts the whole fetch.
    async fn fetch_unread(&self) -> Result<Vec<Email>, MailError>;

    /// Clear the unread flag so the message is not fetched again.
    async fn mark_read(&self, email_id: &str) -> Result<(), MailError>;

    /// Verify credentials with a cheap read-only call.
    async fn test_connection(&self) -> Result<(), MailError>;
}
