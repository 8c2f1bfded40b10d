//! Triage pipeline.
//!
//! Unread mail flows through:
//! 1. `MailSource::fetch_unread()`: mailbox I/O
//! 2. `Classifier::classify()`: provider call and reply parsing
//! 3. `Database::insert_record()`: dedupe record, written before any alert
//! 4. `Notifier::send_alert()`: urgent items only
//!
//! Everything else waits for `TriageRunner::send_digest()`.

pub mod orchestrator;
pub mod scheduler;
pub mod types;

pub use orchestrator::{DigestOutcome, TriageRunner};
pub use scheduler::serve;
