//! Shared types for the triage pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ── Inbound email ───────────────────────────────────────────────────

/// An email as fetched from the mail source. Immutable once fetched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Email {
    /// Provider-assigned message id. This is the dedupe key.
    pub id: String,
    pub subject: String,
    pub sender: String,
    /// Plain-text body snippet (already truncated by the mail source).
    pub body: String,
    pub received_at: DateTime<Utc>,
}

// ── Classification vocabulary ───────────────────────────────────────

/// Bank-mail category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Pago,
    Transferencia,
    EstadoCuenta,
    Movimiento,
    Promocion,
    Notificacion,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Pago,
        Category::Transferencia,
        Category::EstadoCuenta,
        Category::Movimiento,
        Category::Promocion,
        Category::Notificacion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Pago => "pago",
            Category::Transferencia => "transferencia",
            Category::EstadoCuenta => "estado_cuenta",
            Category::Movimiento => "movimiento",
            Category::Promocion => "promocion",
            Category::Notificacion => "notificacion",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace([' ', '-'], "_");
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| format!("unknown category: '{s}'"))
    }
}

/// Triage priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgente,
    Normal,
    SinPrioridad,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Urgente => "urgente",
            Priority::Normal => "normal",
            Priority::SinPrioridad => "sin_prioridad",
        }
    }

    /// Urgent items are pushed immediately; the rest wait for the digest.
    pub fn is_urgent(&self) -> bool {
        matches!(self, Priority::Urgente)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace([' ', '-'], "_").as_str() {
            "urgente" => Ok(Priority::Urgente),
            "normal" => Ok(Priority::Normal),
            "sin_prioridad" => Ok(Priority::SinPrioridad),
            other => Err(format!("unknown priority: '{other}'")),
        }
    }
}

// ── Classification result ───────────────────────────────────────────

/// Outcome of classifying one email. Produced once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub category: Category,
    pub priority: Priority,
    pub amount: Option<Decimal>,
    /// One-line description for notifications. Falls back to the subject.
    pub summary: String,
    pub action_required: bool,
}

impl ClassificationResult {
    /// The classification used when the model reply is unparseable.
    pub fn fallback(summary: impl Into<String>) -> Self {
        Self {
            category: Category::Notificacion,
            priority: Priority::SinPrioridad,
            amount: None,
            summary: summary.into(),
            action_required: false,
        }
    }
}

// ── Persistence ─────────────────────────────────────────────────────

/// Dedupe record for a processed email. At most one per `email_id`.
#[derive(Debug, Clone)]
pub struct ProcessedRecord {
    pub email_id: String,
    pub subject: String,
    pub sender: String,
    pub classification: ClassificationResult,
    pub processed_at: DateTime<Utc>,
}

impl ProcessedRecord {
    pub fn new(email: &Email, classification: ClassificationResult) -> Self {
        Self {
            email_id: email.id.clone(),
            subject: email.subject.clone(),
            sender: email.sender.clone(),
            classification,
            processed_at: Utc::now(),
        }
    }
}

// ── Run statistics ──────────────────────────────────────────────────

/// Counters for a single orchestrator run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub fetched: usize,
    /// Already had a `ProcessedRecord`.
    pub skipped: usize,
    pub processed: usize,
    pub urgent: usize,
    pub failed: usize,
    /// Urgent records whose alert was not delivered. They stay recorded.
    pub alerts_failed: usize,
}

/// Non-urgent records grouped for a digest message.
#[derive(Debug, Clone, Default)]
pub struct Digest {
    pub date: chrono::NaiveDate,
    pub normal: Vec<ProcessedRecord>,
    pub low_priority: Vec<ProcessedRecord>,
    /// Urgent alerts already pushed today, shown as a count only.
    pub urgent_today: u64,
}

impl Digest {
    pub fn total(&self) -> usize {
        self.normal.len() + self.low_priority.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Group records by priority. Urgent records are dropped: they were
    /// already pushed individually.
    pub fn from_records(date: chrono::NaiveDate, records: Vec<ProcessedRecord>) -> Self {
        let mut digest = Digest {
            date,
            ..Default::default()
        };
        for record in records {
            match record.classification.priority {
                Priority::Urgente => {}
                Priority::Normal => digest.normal.push(record),
                Priority::SinPrioridad => digest.low_priority.push(record),
            }
        }
        digest
    }
}
