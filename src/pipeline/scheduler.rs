//! Long-running mode: poll on an interval, deliver the digest on a cron
//! schedule, stop when the shutdown future resolves.
//!
//! Both timers share one task. A poll and a digest never overlap, which
//! keeps the store single-writer.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::config::ScheduleConfig;
use crate::pipeline::orchestrator::TriageRunner;

/// Time left until `at`. Zero when it has already passed.
pub fn delay_until(at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}

/// Next digest instant once the one due at `fired` has been handled.
///
/// Occurrences that passed while the digest (or a poll) was running are
/// coalesced into the one already delivered.
pub fn following_fire(
    schedule: &cron::Schedule,
    fired: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    schedule.after(&fired.max(now)).next()
}

/// Run until `shutdown` completes. The first poll happens immediately.
///
/// The next digest instant is kept across loop passes, so a cron time that
/// passes during a poll is delivered as soon as the poll returns.
pub async fn serve<F>(runner: &mut TriageRunner, schedule: &ScheduleConfig, shutdown: F)
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    let mut poll = tokio::time::interval(schedule.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut next_digest = schedule.digest_schedule.after(&Utc::now()).next();
    info!(
        poll_secs = schedule.poll_interval.as_secs(),
        next_digest = ?next_digest,
        "Scheduler started"
    );

    loop {
        let digest_delay = next_digest.map(|at| delay_until(at, Utc::now()));
        let digest_due = async {
            match digest_delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = &mut shutdown => {
                info!("Scheduler shutting down");
                return;
            }
            _ = poll.tick() => {
                match runner.run_once().await {
                    Ok(_) => {}
                    Err(e) if e.is_auth() => error!(error = %e, "Poll failed: credentials rejected"),
                    Err(e) => warn!(error = %e, "Poll failed, retrying next interval"),
                }
            }
            _ = digest_due => {
                if let Err(e) = runner.send_digest().await {
                    error!(error = %e, "Digest delivery failed, records kept for the next one");
                }
                next_digest = next_digest
                    .and_then(|fired| following_fire(&schedule.digest_schedule, fired, Utc::now()));
            }
        }
    }
}
