//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::classifier::normalize_amount;
use crate::error::DatabaseError;
use crate::pipeline::types::{Category, ClassificationResult, Priority, ProcessedRecord};
use crate::store::migrations;
use crate::store::traits::{Database, PriorityCounts};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

const RECORD_COLUMNS: &str = "email_id, subject, sender, category, priority, summary, amount, \
                              action_required, processed_at";

/// Canonical timestamp format. Fixed width so string comparison orders by time.
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

/// Map a libsql Row to a ProcessedRecord. Column order matches RECORD_COLUMNS.
///
/// Unknown vocabulary (from imported rows) degrades to the default
/// classification instead of failing the whole query.
fn row_to_record(row: &libsql::Row) -> Result<ProcessedRecord, libsql::Error> {
    let email_id: String = row.get(0)?;
    let subject: String = row.get(1)?;
    let sender: String = row.get(2)?;
    let category_str: String = row.get(3)?;
    let priority_str: String = row.get(4)?;
    let summary: String = row.get::<String>(5).unwrap_or_default();
    let amount_str: Option<String> = row.get(6).ok();
    let action_required: i64 = row.get::<i64>(7).unwrap_or(0);
    let processed_str: String = row.get(8)?;

    Ok(ProcessedRecord {
        email_id,
        subject,
        sender,
        classification: ClassificationResult {
            category: category_str.parse().unwrap_or(Category::Notificacion),
            priority: priority_str.parse().unwrap_or(Priority::SinPrioridad),
            amount: amount_str.as_deref().and_then(normalize_amount),
            summary,
            action_required: action_required != 0,
        },
        processed_at: parse_datetime(&processed_str),
    })
}

fn is_unique_violation(e: &libsql::Error) -> bool {
    let msg = e.to_string();
    msg.contains("UNIQUE constraint failed") || msg.contains("PRIMARY KEY")
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Processed records ───────────────────────────────────────────

    async fn is_processed(&self, email_id: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM processed_emails WHERE email_id = ?1",
                params![email_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("is_processed: {e}")))?;

        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(DatabaseError::Query(format!("is_processed: {e}"))),
        }
    }

    async fn insert_record(&self, record: &ProcessedRecord) -> Result<(), DatabaseError> {
        let c = &record.classification;
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO processed_emails ({RECORD_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    record.email_id.as_str(),
                    record.subject.as_str(),
                    record.sender.as_str(),
                    c.category.as_str(),
                    c.priority.as_str(),
                    c.summary.as_str(),
                    opt_text_owned(c.amount.map(|a| a.to_string())),
                    i64::from(c.action_required),
                    format_ts(record.processed_at),
                ],
            )
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DatabaseError::Constraint(format!(
                        "insert_record: {} already recorded",
                        record.email_id
                    ))
                } else {
                    DatabaseError::Query(format!("insert_record: {e}"))
                }
            })?;
        debug!(email_id = %record.email_id, "Recorded processed email");
        Ok(())
    }

    async fn get_record(&self, email_id: &str) -> Result<Option<ProcessedRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {RECORD_COLUMNS} FROM processed_emails WHERE email_id = ?1"),
                params![email_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_record: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let record = row_to_record(&row)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(Some(record))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_record: {e}"))),
        }
    }

    async fn delete_record(&self, email_id: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM digest_deliveries WHERE email_id = ?1",
            params![email_id],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("delete_record: {e}")))?;

        let affected = conn
            .execute(
                "DELETE FROM processed_emails WHERE email_id = ?1",
                params![email_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_record: {e}")))?;
        Ok(affected > 0)
    }

    async fn prune_records(&self, cutoff: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let conn = self.conn();
        let cutoff = format_ts(cutoff);

        conn.execute(
            "DELETE FROM digest_deliveries WHERE email_id IN
                (SELECT email_id FROM processed_emails WHERE processed_at < ?1)",
            params![cutoff.clone()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("prune_records: {e}")))?;

        let removed = conn
            .execute(
                "DELETE FROM processed_emails WHERE processed_at < ?1",
                params![cutoff],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("prune_records: {e}")))?;

        info!(removed, "Pruned processed records");
        Ok(removed)
    }

    async fn count_since(&self, since: DateTime<Utc>) -> Result<PriorityCounts, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT priority, COUNT(*) FROM processed_emails
                 WHERE processed_at >= ?1 GROUP BY priority",
                params![format_ts(since)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_since: {e}")))?;

        let mut counts = PriorityCounts::default();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("count_since: {e}")))?
        {
            let priority: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
            let n: i64 = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
            let n = u64::try_from(n).unwrap_or(0);
            match priority.parse::<Priority>() {
                Ok(Priority::Urgente) => counts.urgent += n,
                Ok(Priority::Normal) => counts.normal += n,
                _ => counts.low_priority += n,
            }
        }
        Ok(counts)
    }

    // ── Digest ──────────────────────────────────────────────────────

    async fn undigested_records(&self) -> Result<Vec<ProcessedRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM processed_emails p
                     WHERE p.priority != 'urgente'
                       AND NOT EXISTS (
                           SELECT 1 FROM digest_deliveries d WHERE d.email_id = p.email_id
                       )
                     ORDER BY p.processed_at ASC, p.email_id ASC"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("undigested_records: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("undigested_records: {e}")))?
        {
            records.push(
                row_to_record(&row).map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
            );
        }
        Ok(records)
    }

    async fn mark_digested(
        &self,
        email_ids: &[String],
        delivered_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let at = format_ts(delivered_at);
        for id in email_ids {
            conn.execute(
                "INSERT OR IGNORE INTO digest_deliveries (email_id, delivered_at) VALUES (?1, ?2)",
                params![id.as_str(), at.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_digested: {e}")))?;
        }
        Ok(())
    }
}
