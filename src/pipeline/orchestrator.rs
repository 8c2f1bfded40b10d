//! Triage orchestrator: one pass over the unread mailbox, and the digest.
//!
//! Per email, strictly in order:
//! 1. skip if a `ProcessedRecord` already exists (still marked read)
//! 2. classify; on failure leave the email unrecorded and unread
//! 3. persist the record
//! 4. push an alert when urgent
//! 5. mark the email read
//!
//! Persisting before notifying means a crash between the two can lose an
//! alert but can never send one twice.

use std::sync::Arc;

use chrono::{Local, TimeZone, Utc};
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::classifier::Classifier;
use crate::error::{Error, NotifyError};
use crate::mail::MailSource;
use crate::notify::Notifier;
use crate::pipeline::types::{Digest, Email, ProcessedRecord, RunStats};
use crate::store::Database;

/// Summary of one digest delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestOutcome {
    /// Records included in the delivered digest. Zero when nothing was sent.
    pub delivered: usize,
}

/// Wires the mail source, classifier, store and notifier together.
pub struct TriageRunner {
    source: Arc<dyn MailSource>,
    classifier: Classifier,
    db: Arc<dyn Database>,
    notifier: Arc<dyn Notifier>,
}

impl TriageRunner {
    pub fn new(
        source: Arc<dyn MailSource>,
        classifier: Classifier,
        db: Arc<dyn Database>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            source,
            classifier,
            db,
            notifier,
        }
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Process every unread email once.
    ///
    /// Only mailbox-level failures (auth, listing) and store failures on the
    /// dedupe check abort the run; per-email classification failures are
    /// counted and the email is left for the next run.
    pub async fn run_once(&mut self) -> Result<RunStats, Error> {
        let run_id = Uuid::new_v4();
        let span = info_span!("triage_run", run_id = %run_id, source = self.source.name());
        self.run_inner().instrument(span).await
    }

    async fn run_inner(&mut self) -> Result<RunStats, Error> {
        let emails = self.source.fetch_unread().await?;
        let mut stats = RunStats {
            fetched: emails.len(),
            ..Default::default()
        };

        for email in &emails {
            if self.db.is_processed(&email.id).await? {
                stats.skipped += 1;
                self.mark_read(email).await;
                continue;
            }
            self.process_email(email, &mut stats).await?;
        }

        info!(
            fetched = stats.fetched,
            skipped = stats.skipped,
            processed = stats.processed,
            urgent = stats.urgent,
            failed = stats.failed,
            "Triage run complete"
        );
        Ok(stats)
    }

    async fn process_email(&mut self, email: &Email, stats: &mut RunStats) -> Result<(), Error> {
        let classification = match self.classifier.classify(email).await {
            Ok(c) => c,
            Err(e) => {
                error!(email_id = %email.id, error = %e, "Classification failed, leaving email unread");
                stats.failed += 1;
                return Ok(());
            }
        };

        let record = ProcessedRecord::new(email, classification);
        if let Err(e) = self.db.insert_record(&record).await {
            error!(email_id = %email.id, error = %e, "Failed to persist record, leaving email unread");
            stats.failed += 1;
            return Ok(());
        }
        stats.processed += 1;

        if record.classification.priority.is_urgent() {
            stats.urgent += 1;
            match self.notifier.send_alert(&record).await {
                Ok(()) => info!(email_id = %email.id, channel = self.notifier.name(), "Urgent alert sent"),
                Err(e @ NotifyError::AuthFailed { .. }) => {
                    error!(email_id = %email.id, error = %e, "Notifier rejected credentials");
                    stats.alerts_failed += 1;
                }
                Err(e) => {
                    warn!(email_id = %email.id, error = %e, "Urgent alert not delivered");
                    stats.alerts_failed += 1;
                }
            }
        }

        self.mark_read(email).await;
        Ok(())
    }

    /// A failed mark-read is retried implicitly: the next run fetches the
    /// email again, finds its record and marks it then.
    async fn mark_read(&self, email: &Email) {
        if let Err(e) = self.source.mark_read(&email.id).await {
            warn!(email_id = %email.id, error = %e, "Failed to mark email read");
        }
    }

    /// Deliver every non-urgent record not yet included in a digest.
    ///
    /// Records are marked as delivered only after the notifier accepts the
    /// message, so a failed send is retried on the next digest.
    pub async fn send_digest(&self) -> Result<DigestOutcome, Error> {
        let records = self.db.undigested_records().await?;
        let mut digest = Digest::from_records(Local::now().date_naive(), records);
        if digest.is_empty() {
            info!("Nothing to digest");
            return Ok(DigestOutcome::default());
        }

        digest.urgent_today = self.db.count_since(start_of_today()).await?.urgent;

        self.notifier.send_digest(&digest).await?;

        let ids: Vec<String> = digest
            .normal
            .iter()
            .chain(digest.low_priority.iter())
            .map(|r| r.email_id.clone())
            .collect();
        self.db.mark_digested(&ids, Utc::now()).await?;

        info!(
            normal = digest.normal.len(),
            low_priority = digest.low_priority.len(),
            urgent_today = digest.urgent_today,
            "Digest delivered"
        );
        Ok(DigestOutcome {
            delivered: ids.len(),
        })
    }
}

/// Local midnight as a UTC instant.
fn start_of_today() -> chrono::DateTime<Utc> {
    let midnight = Local::now().date_naive().and_time(chrono::NaiveTime::MIN);
    Local
        .from_local_datetime(&midnight)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc::now() - chrono::Duration::hours(24))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::classifier::CompiledRules;
    use crate::error::MailError;
    use crate::llm::selector::tests::ScriptedProvider;
    use crate::llm::{LlmProvider, ProviderSelector, SelectionMode};
    use crate::pipeline::types::Priority;
    use crate::store::LibSqlBackend;

    /// In-memory mailbox: everything not marked read is unread.
    pub(crate) struct FakeMailbox {
        pub emails: Vec<Email>,
        pub read: Mutex<Vec<String>>,
    }

    impl FakeMailbox {
        pub(crate) fn new(emails: Vec<Email>) -> Arc<Self> {
            Arc::new(Self {
                emails,
                read: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl MailSource for FakeMailbox {
        fn name(&self) -> &str {
            "fake"
        }

        async fn fetch_unread(&self) -> Result<Vec<Email>, MailError> {
            let read = self.read.lock().unwrap();
            Ok(self
                .emails
                .iter()
                .filter(|e| !read.contains(&e.id))
                .cloned()
                .collect())
        }

        async fn mark_read(&self, email_id: &str) -> Result<(), MailError> {
            self.read.lock().unwrap().push(email_id.to_string());
            Ok(())
        }

        async fn test_connection(&self) -> Result<(), MailError> {
            Ok(())
        }
    }

    /// Mailbox that never remembers reads, like a flaky modify call.
    struct StickyMailbox(Vec<Email>);

    #[async_trait]
    impl MailSource for StickyMailbox {
        fn name(&self) -> &str {
            "sticky"
        }

        async fn fetch_unread(&self) -> Result<Vec<Email>, MailError> {
            Ok(self.0.clone())
        }

        async fn mark_read(&self, _email_id: &str) -> Result<(), MailError> {
            Err(MailError::Request("modify failed".into()))
        }

        async fn test_connection(&self) -> Result<(), MailError> {
            Ok(())
        }
    }

    /// Records every alert and digest it is asked to send.
    #[derive(Default)]
    pub(crate) struct RecordingNotifier {
        pub alerts: Mutex<Vec<String>>,
        pub digests: Mutex<Vec<Digest>>,
        pub fail: bool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send_alert(&self, record: &ProcessedRecord) -> Result<(), NotifyError> {
            if self.fail {
                return Err(NotifyError::SendFailed {
                    name: "recording".into(),
                    reason: "down".into(),
                });
            }
            self.alerts.lock().unwrap().push(record.email_id.clone());
            Ok(())
        }

        async fn send_digest(&self, digest: &Digest) -> Result<(), NotifyError> {
            if self.fail {
                return Err(NotifyError::SendFailed {
                    name: "recording".into(),
                    reason: "down".into(),
                });
            }
            self.digests.lock().unwrap().push(digest.clone());
            Ok(())
        }

        async fn test_connection(&self) -> Result<(), NotifyError> {
            Ok(())
        }
    }

    fn email(id: &str, subject: &str) -> Email {
        Email {
            id: id.into(),
            subject: subject.into(),
            sender: "alertas@banco.com".into(),
            body: String::new(),
            received_at: Utc::now(),
        }
    }

    fn classifier(providers: Vec<Arc<dyn LlmProvider>>) -> Classifier {
        Classifier::new(
            ProviderSelector::new(providers, SelectionMode::FallbackOnFailure),
            CompiledRules::defaults(),
        )
    }

    async fn runner(
        source: Arc<dyn MailSource>,
        reply: &str,
        notifier: Arc<RecordingNotifier>,
    ) -> TriageRunner {
        let log = Arc::new(Mutex::new(Vec::new()));
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        TriageRunner::new(
            source,
            classifier(vec![ScriptedProvider::ok("groq", reply, &log)]),
            db,
            notifier,
        )
    }

    const URGENT_REPLY: &str = r#"{"category": "pago", "priority": "urgente", "summary": "Pago vencido", "amount": "1500"}"#;
    const NORMAL_REPLY: &str = r#"{"category": "transferencia", "priority": "normal", "summary": "SPEI recibido"}"#;

    #[tokio::test]
    async fn urgent_email_is_recorded_alerted_and_read() {
        let mailbox = FakeMailbox::new(vec![email("m1", "Pago vencido")]);
        let notifier = Arc::new(RecordingNotifier::default());
        let mut runner = runner(mailbox.clone(), URGENT_REPLY, notifier.clone()).await;

        let stats = runner.run_once().await.unwrap();
        assert_eq!(
            stats,
            RunStats {
                fetched: 1,
                processed: 1,
                urgent: 1,
                ..Default::default()
            }
        );
        assert_eq!(*notifier.alerts.lock().unwrap(), vec!["m1"]);
        assert_eq!(*mailbox.read.lock().unwrap(), vec!["m1"]);

        let record = runner.db().get_record("m1").await.unwrap().unwrap();
        assert_eq!(record.classification.priority, Priority::Urgente);
    }

    #[tokio::test]
    async fn rerun_never_duplicates_records_or_alerts() {
        let mailbox = Arc::new(StickyMailbox(vec![email("m1", "Pago vencido")]));
        let notifier = Arc::new(RecordingNotifier::default());
        let mut runner = runner(mailbox, URGENT_REPLY, notifier.clone()).await;

        let first = runner.run_once().await.unwrap();
        let second = runner.run_once().await.unwrap();

        assert_eq!(first.processed, 1);
        assert_eq!(second.processed, 0);
        assert_eq!(second.skipped, 1);
        assert_eq!(notifier.alerts.lock().unwrap().len(), 1);
        assert_eq!(runner.db().count_since(Utc::now() - chrono::Duration::hours(1)).await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn all_providers_failing_leaves_email_unread() {
        let mailbox = FakeMailbox::new(vec![email("m1", "Pago")]);
        let notifier = Arc::new(RecordingNotifier::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let mut runner = TriageRunner::new(
            mailbox.clone(),
            classifier(vec![
                ScriptedProvider::failing("groq", &log),
                ScriptedProvider::failing("gemini", &log),
            ]),
            db,
            notifier.clone(),
        );

        let stats = runner.run_once().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.processed, 0);
        assert!(mailbox.read.lock().unwrap().is_empty());
        assert!(!runner.db().is_processed("m1").await.unwrap());
        assert_eq!(*log.lock().unwrap(), vec!["groq", "gemini"]);
    }

    #[tokio::test]
    async fn failed_alert_still_marks_read() {
        let mailbox = FakeMailbox::new(vec![email("m1", "Pago vencido")]);
        let notifier = Arc::new(RecordingNotifier {
            fail: true,
            ..Default::default()
        });
        let mut runner = runner(mailbox.clone(), URGENT_REPLY, notifier).await;

        let stats = runner.run_once().await.unwrap();
        assert_eq!(stats.alerts_failed, 1);
        assert_eq!(*mailbox.read.lock().unwrap(), vec!["m1"]);
        assert!(runner.db().is_processed("m1").await.unwrap());
    }

    #[tokio::test]
    async fn non_urgent_waits_for_digest_and_is_digested_once() {
        let mailbox = FakeMailbox::new(vec![email("m1", "SPEI"), email("m2", "SPEI 2")]);
        let notifier = Arc::new(RecordingNotifier::default());
        let mut runner = runner(mailbox, NORMAL_REPLY, notifier.clone()).await;

        runner.run_once().await.unwrap();
        assert!(notifier.alerts.lock().unwrap().is_empty());

        let first = runner.send_digest().await.unwrap();
        assert_eq!(first.delivered, 2);
        let second = runner.send_digest().await.unwrap();
        assert_eq!(second.delivered, 0);

        let digests = notifier.digests.lock().unwrap();
        assert_eq!(digests.len(), 1);
        assert_eq!(digests[0].normal.len(), 2);
        assert_eq!(digests[0].urgent_today, 0);
    }

    #[tokio::test]
    async fn failed_digest_is_retried() {
        let mailbox = FakeMailbox::new(vec![email("m1", "SPEI")]);
        let failing = Arc::new(RecordingNotifier {
            fail: true,
            ..Default::default()
        });
        let mut runner = runner(mailbox, NORMAL_REPLY, failing).await;
        runner.run_once().await.unwrap();

        assert!(runner.send_digest().await.is_err());
        assert_eq!(runner.db().undigested_records().await.unwrap().len(), 1);
    }

    #[test]
    fn midnight_is_not_in_the_future() {
        assert!(start_of_today() <= Utc::now());
    }
}
