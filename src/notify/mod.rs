//! Outbound notifications: urgent alerts and the periodic digest.

pub mod telegram;

pub use telegram::{TelegramConfig, TelegramNotifier};

use async_trait::async_trait;

use crate::error::NotifyError;
use crate::pipeline::types::{Digest, ProcessedRecord};

/// A channel that can deliver triage results to a person.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Channel name used in logs.
    fn name(&self) -> &str;

    /// Push a single urgent record immediately.
    async fn send_alert(&self, record: &ProcessedRecord) -> Result<(), NotifyError>;

    /// Deliver a grouped digest of non-urgent records.
    async fn send_digest(&self, digest: &Digest) -> Result<(), NotifyError>;

    /// Verify credentials without sending a user-visible message.
    async fn test_connection(&self) -> Result<(), NotifyError>;
}
