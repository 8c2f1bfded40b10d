//! Configuration types.
//!
//! Everything is read from environment variables. Each concern owns a
//! `from_env` constructor taking an [`Env`], so tests can feed a map instead
//! of mutating the process environment.

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::llm::LlmConfig;
use crate::mail::gmail::GmailConfig;
use crate::notify::telegram::TelegramConfig;

/// Default digest time: every day at 20:00 (sec min hour dom mon dow).
pub const DEFAULT_DIGEST_SCHEDULE: &str = "0 0 20 * * *";

/// Variable lookup over the process environment or a test map.
pub struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl<'a> Env<'a> {
    pub fn new(lookup: &'a dyn Fn(&str) -> Option<String>) -> Self {
        Self { lookup }
    }

    /// Lookup over the process environment.
    pub fn process() -> Env<'static> {
        Env { lookup: &process_env }
    }

    /// Trimmed value, treating empty strings as unset.
    pub fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    pub fn require(&self, key: &str, hint: &str) -> Result<String, ConfigError> {
        self.get(key).ok_or_else(|| ConfigError::MissingRequired {
            key: key.to_string(),
            hint: hint.to_string(),
        })
    }

    pub fn parse_opt<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.get(key)
            .map(|raw| {
                raw.parse::<T>().map_err(|e| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("'{raw}': {e}"),
                })
            })
            .transpose()
    }

    pub fn parse_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        Ok(self.parse_opt(key)?.unwrap_or(default))
    }
}

fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Local database settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl DatabaseConfig {
    pub fn from_env(env: &Env<'_>) -> Self {
        Self {
            path: env
                .get("DATABASE_PATH")
                .unwrap_or_else(|| "./emails.db".to_string())
                .into(),
        }
    }
}

/// Timing for the long-running `serve` mode.
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub poll_interval: Duration,
    pub digest_schedule: cron::Schedule,
}

impl ScheduleConfig {
    pub fn from_env(env: &Env<'_>) -> Result<Self, ConfigError> {
        let secs: u64 = env.parse_or("POLL_INTERVAL_SECS", 300)?;
        if secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "POLL_INTERVAL_SECS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        let expr = env
            .get("DIGEST_SCHEDULE")
            .unwrap_or_else(|| DEFAULT_DIGEST_SCHEDULE.to_string());
        let digest_schedule =
            cron::Schedule::from_str(&expr).map_err(|e| ConfigError::InvalidValue {
                key: "DIGEST_SCHEDULE".to_string(),
                message: format!("invalid cron '{expr}': {e}"),
            })?;
        Ok(Self {
            poll_interval: Duration::from_secs(secs),
            digest_schedule,
        })
    }
}

/// Full application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub telegram: TelegramConfig,
    pub gmail: GmailConfig,
    pub database: DatabaseConfig,
    pub schedule: ScheduleConfig,
    /// JSON file overriding the built-in classification rules.
    pub rules_path: Option<PathBuf>,
    /// Directory for daily-rolling log files. Stdout only when unset.
    pub log_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Self::load(&Env::new(lookup))
    }

    pub fn load(env: &Env<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            llm: LlmConfig::from_env(env)?,
            telegram: TelegramConfig::from_env(env)?,
            gmail: GmailConfig::from_env(env)?,
            database: DatabaseConfig::from_env(env),
            schedule: ScheduleConfig::from_env(env)?,
            rules_path: env.get("CLASSIFIER_RULES_PATH").map(PathBuf::from),
            log_dir: log_dir(env),
        })
    }
}

/// Directory for log files, read on its own so logging can start before
/// the rest of the configuration is validated.
pub fn log_dir(env: &Env<'_>) -> Option<PathBuf> {
    env.get("LOG_DIR").map(PathBuf::from)
}
