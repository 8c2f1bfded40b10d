//! `Database` trait: single async interface for triage persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::DatabaseError;
use crate::pipeline::types::ProcessedRecord;

/// Number of processed records per priority in a time window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PriorityCounts {
    pub urgent: u64,
    pub normal: u64,
    pub low_priority: u64,
}

impl PriorityCounts {
    pub fn total(&self) -> u64 {
        self.urgent + self.normal + self.low_priority
    }
}

/// Backend-agnostic persistence for processed emails and digest deliveries.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Processed records ───────────────────────────────────────────

    /// Whether a record exists for this provider message id.
    async fn is_processed(&self, email_id: &str) -> Result<bool, DatabaseError>;

    /// Insert a new record. A second insert for the same id is a
    /// `DatabaseError::Constraint`; records are never replaced.
    async fn insert_record(&self, record: &ProcessedRecord) -> Result<(), DatabaseError>;

    async fn get_record(&self, email_id: &str) -> Result<Option<ProcessedRecord>, DatabaseError>;

    /// Delete one record and its digest delivery. Returns whether it existed.
    async fn delete_record(&self, email_id: &str) -> Result<bool, DatabaseError>;

    /// Delete records processed before `cutoff`. Returns how many were removed.
    async fn prune_records(&self, cutoff: DateTime<Utc>) -> Result<u64, DatabaseError>;

    /// Per-priority counts of records processed at or after `since`.
    async fn count_since(&self, since: DateTime<Utc>) -> Result<PriorityCounts, DatabaseError>;

    // ── Digest ──────────────────────────────────────────────────────

    /// Non-urgent records not yet included in a delivered digest, oldest first.
    async fn undigested_records(&self) -> Result<Vec<ProcessedRecord>, DatabaseError>;

    /// Record that these emails went out in a digest.
    async fn mark_digested(
        &self,
        email_ids: &[String],
        delivered_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;
}
