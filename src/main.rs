use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::Utc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use mail_triage::classifier::{Classifier, ClassificationRules};
use mail_triage::config::{self, AppConfig, DatabaseConfig, Env};
use mail_triage::llm::{CompletionRequest, build_providers, build_selector};
use mail_triage::mail::{GmailSource, MailSource};
use mail_triage::notify::{Notifier, TelegramNotifier};
use mail_triage::pipeline::{TriageRunner, serve};
use mail_triage::store::{Database, LibSqlBackend};

const USAGE: &str = "\
Usage: mail-triage <command>

Commands:
  run            Process unread mail once (default)
  digest         Send the digest of pending non-urgent mail
  serve          Poll on an interval and send digests on schedule
  check          Verify mailbox, notifier and provider credentials
  prune <days>   Delete records older than <days> days
";

#[derive(Debug)]
enum Command {
    Run,
    Digest,
    Serve,
    Check,
    Prune { days: u32 },
}

fn parse_args(args: &[String]) -> anyhow::Result<Command> {
    match args.first().map(String::as_str) {
        None | Some("run") => Ok(Command::Run),
        Some("digest") => Ok(Command::Digest),
        Some("serve") => Ok(Command::Serve),
        Some("check") => Ok(Command::Check),
        Some("prune") => {
            let raw = args.get(1).context("prune needs a number of days")?;
            let days = raw
                .parse::<u32>()
                .with_context(|| format!("invalid number of days: '{raw}'"))?;
            Ok(Command::Prune { days })
        }
        Some(other) => bail!("unknown command '{other}'\n\n{USAGE}"),
    }
}

/// Stdout logging, plus a daily-rolling file when a log directory is set.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout = fmt::layer().with_target(false);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mail-triage.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stdout).init();
            None
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if matches!(args.first().map(String::as_str), Some("-h" | "--help" | "help")) {
        print!("{USAGE}");
        return ExitCode::SUCCESS;
    }

    let env = Env::process();
    let _log_guard = init_tracing(config::log_dir(&env).as_deref());

    let result = match parse_args(&args) {
        Ok(command) => dispatch(command, &env).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// `prune` only touches the database, so it loads nothing else. Every
/// other command needs the full configuration.
async fn dispatch(command: Command, env: &Env<'_>) -> anyhow::Result<ExitCode> {
    match command {
        Command::Prune { days } => prune(&DatabaseConfig::from_env(env), days).await,
        Command::Check => check(&AppConfig::load(env)?).await,
        Command::Run => {
            let config = AppConfig::load(env)?;
            let mut runner = build_runner(&config).await?;
            let stats = runner.run_once().await?;
            eprintln!(
                "Fetched {}, processed {}, urgent {}, skipped {}, failed {}",
                stats.fetched, stats.processed, stats.urgent, stats.skipped, stats.failed
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Digest => {
            let config = AppConfig::load(env)?;
            let runner = build_runner(&config).await?;
            let outcome = runner.send_digest().await?;
            eprintln!("Digest: {} records delivered", outcome.delivered);
            Ok(ExitCode::SUCCESS)
        }
        Command::Serve => {
            let config = AppConfig::load(env)?;
            let mut runner = build_runner(&config).await?;
            eprintln!("📬 mail-triage v{}", env!("CARGO_PKG_VERSION"));
            let selector = runner.classifier().selector();
            eprintln!(
                "   Providers: {} ({})",
                selector.provider_names().join(", "),
                selector.mode()
            );
            eprintln!("   Poll: every {}s", config.schedule.poll_interval.as_secs());
            eprintln!("   Database: {}\n", config.database.path.display());

            serve(&mut runner, &config.schedule, async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "Failed to listen for ctrl-c");
                    std::future::pending::<()>().await;
                }
            })
            .await;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn open_database(config: &DatabaseConfig) -> anyhow::Result<Arc<dyn Database>> {
    let backend = LibSqlBackend::new_local(&config.path)
        .await
        .with_context(|| format!("opening database {}", config.path.display()))?;
    Ok(Arc::new(backend))
}

async fn prune(config: &DatabaseConfig, days: u32) -> anyhow::Result<ExitCode> {
    let db = open_database(config).await?;
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
    let removed = db.prune_records(cutoff).await?;
    tracing::info!(removed, days, "Pruned old records");
    Ok(ExitCode::SUCCESS)
}

async fn build_runner(config: &AppConfig) -> anyhow::Result<TriageRunner> {
    let db = open_database(&config.database).await?;
    let rules = ClassificationRules::load(config.rules_path.as_deref())?.compile()?;
    let classifier = Classifier::new(build_selector(&config.llm)?, rules);
    let source: Arc<dyn MailSource> = Arc::new(GmailSource::new(config.gmail.clone()));
    let notifier: Arc<dyn Notifier> = Arc::new(TelegramNotifier::new(config.telegram.clone()));
    Ok(TriageRunner::new(source, classifier, db, notifier))
}

/// Exercise every external dependency once. Non-zero exit if any fails.
async fn check(config: &AppConfig) -> anyhow::Result<ExitCode> {
    let mut failures = 0;

    let gmail = GmailSource::new(config.gmail.clone());
    match gmail.test_connection().await {
        Ok(()) => eprintln!("✅ Gmail"),
        Err(e) => {
            eprintln!("❌ Gmail: {e}");
            failures += 1;
        }
    }

    let telegram = TelegramNotifier::new(config.telegram.clone());
    match telegram.test_connection().await {
        Ok(()) => eprintln!("✅ Telegram"),
        Err(e) => {
            eprintln!("❌ Telegram: {e}");
            failures += 1;
        }
    }

    let probe = CompletionRequest::new("Responde únicamente con la palabra: ok").with_json_mode(false);
    for provider in build_providers(&config.llm)? {
        match provider.complete(&probe).await {
            Ok(_) => eprintln!("✅ {} ({})", provider.name(), provider.model_name()),
            Err(e) => {
                eprintln!("❌ {} ({}): {e}", provider.name(), provider.model_name());
                failures += 1;
            }
        }
    }

    if failures > 0 {
        tracing::error!(failures, "Connectivity check failed");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
