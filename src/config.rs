//! Runtime configuration.
//!
//! Everything comes from the environment (a `.env` file is honored via
//! dotenvy in `main`). Secrets are wrapped in [`SecretString`] so they
//! never land in debug output. Policy knobs all have defaults; only the
//! three credentials and the chat id are required.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::FixedOffset;
use cron::Schedule;
use secrecy::SecretString;

use crate::error::ConfigError;
use crate::model::FieldCatalog;

const DEFAULT_CLASSIFIER_MODEL: &str = "claude-sonnet-4-5";
const DEFAULT_CLASSIFIER_URL: &str = "https://api.anthropic.com";
const DEFAULT_STORE_URL: &str = "https://api.notion.com";
const DEFAULT_TELEGRAM_URL: &str = "https://api.telegram.org";

/// Daily review: 09:00 in the home timezone.
const DEFAULT_DAILY_CRON: &str = "0 0 9 * * *";
/// Hourly nudge window: on the hour, 10:00 through 23:00.
const DEFAULT_HOURLY_CRON: &str = "0 0 10-23 * * *";

#[derive(Debug, Clone)]
pub struct Config {
    pub store: StoreConfig,
    pub classifier: ClassifierConfig,
    pub telegram: TelegramConfig,
    pub policy: PolicyConfig,
    pub schedule: ScheduleConfig,
    /// Directory for the state file and the interaction journal.
    pub state_dir: PathBuf,
    /// Fixed home-timezone offset; day boundaries and the prompt's date
    /// context use this, not the host clock's zone.
    pub home_offset: FixedOffset,
    pub catalog: FieldCatalog,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub api_key: SecretString,
    pub database_id: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub api_key: SecretString,
    pub model: String,
    pub base_url: String,
    pub max_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub token: SecretString,
    /// The single chat this assistant serves. Messages from anywhere
    /// else are ignored.
    pub chat_id: i64,
    pub base_url: String,
}

/// Tunable policy for the scan and cleanup subsystems.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub confirm_wait: Duration,
    pub due_soon_days: u32,
    pub stale_days: u32,
    pub overload_threshold: usize,
    pub severe_overdue_floor: usize,
    pub cleanup_age_days: u32,
    pub cleanup_batch: usize,
    /// Opt-in scheduled agent check-in on top of the deterministic
    /// summary.
    pub checkin_enabled: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        PolicyConfig {
            confirm_wait: Duration::from_secs(90),
            due_soon_days: 3,
            stale_days: 14,
            overload_threshold: 25,
            severe_overdue_floor: 5,
            cleanup_age_days: 180,
            cleanup_batch: 3,
            checkin_enabled: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub daily: Schedule,
    pub hourly: Schedule,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let store = StoreConfig {
            api_key: required("NOTION_API_KEY")?.into(),
            database_id: required("NOTION_DATABASE_ID")?,
            base_url: var_or("TASKHERD_STORE_URL", DEFAULT_STORE_URL),
        };

        let classifier = ClassifierConfig {
            api_key: required("ANTHROPIC_API_KEY")?.into(),
            model: var_or("TASKHERD_MODEL", DEFAULT_CLASSIFIER_MODEL),
            base_url: var_or("TASKHERD_CLASSIFIER_URL", DEFAULT_CLASSIFIER_URL),
            max_tokens: parse_or("TASKHERD_MAX_TOKENS", 1024)?,
        };

        let telegram = TelegramConfig {
            token: required("TELEGRAM_BOT_TOKEN")?.into(),
            chat_id: parse_required("TELEGRAM_CHAT_ID")?,
            base_url: var_or("TASKHERD_TELEGRAM_URL", DEFAULT_TELEGRAM_URL),
        };

        let defaults = PolicyConfig::default();
        let policy = PolicyConfig {
            confirm_wait: Duration::from_secs(parse_or(
                "TASKHERD_CONFIRM_WAIT_SECS",
                defaults.confirm_wait.as_secs(),
            )?),
            due_soon_days: parse_or("TASKHERD_DUE_SOON_DAYS", defaults.due_soon_days)?,
            stale_days: parse_or("TASKHERD_STALE_DAYS", defaults.stale_days)?,
            overload_threshold: parse_or("TASKHERD_OVERLOAD_THRESHOLD", defaults.overload_threshold)?,
            severe_overdue_floor: parse_or("TASKHERD_SEVERE_OVERDUE_FLOOR", defaults.severe_overdue_floor)?,
            cleanup_age_days: parse_or("TASKHERD_CLEANUP_AGE_DAYS", defaults.cleanup_age_days)?,
            cleanup_batch: parse_or("TASKHERD_CLEANUP_BATCH", defaults.cleanup_batch)?.clamp(1, 5),
            checkin_enabled: parse_or("TASKHERD_CHECKIN_ENABLED", false)?,
        };

        let schedule = ScheduleConfig {
            daily: parse_cron("TASKHERD_DAILY_CRON", DEFAULT_DAILY_CRON)?,
            hourly: parse_cron("TASKHERD_HOURLY_CRON", DEFAULT_HOURLY_CRON)?,
        };

        let state_dir = match std::env::var("TASKHERD_STATE_DIR") {
            Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => default_state_dir(),
        };

        let offset_hours: i32 = parse_or("TASKHERD_UTC_OFFSET_HOURS", 9)?;
        let home_offset =
            FixedOffset::east_opt(offset_hours * 3600).ok_or_else(|| ConfigError::InvalidVar {
                name: "TASKHERD_UTC_OFFSET_HOURS",
                reason: format!("{offset_hours} is outside -23..=23"),
            })?;

        let catalog = FieldCatalog::new(parse_tag_list(
            &std::env::var("TASKHERD_TAGS").unwrap_or_default(),
        ));

        Ok(Config {
            store,
            classifier,
            telegram,
            policy,
            schedule,
            state_dir,
            home_offset,
            catalog,
        })
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join("state.json")
    }

    pub fn journal_path(&self) -> PathBuf {
        self.state_dir.join("logs").join("interactions.jsonl")
    }
}

fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".taskherd")
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::MissingVar { name }),
    }
}

fn var_or(name: &str, default: &str) -> String {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => v,
        _ => default.to_string(),
    }
}

fn parse_required<T: FromStr>(name: &'static str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    let raw = required(name)?;
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidVar {
        name,
        reason: e.to_string(),
    })
}

fn parse_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidVar {
                name,
                reason: e.to_string(),
            })
        }
        _ => Ok(default),
    }
}

fn parse_cron(name: &'static str, default: &str) -> Result<Schedule, ConfigError> {
    let raw = var_or(name, default);
    Schedule::from_str(raw.trim()).map_err(|e| ConfigError::InvalidVar {
        name,
        reason: e.to_string(),
    })
}

/// Comma-separated, whitespace-tolerant, empty entries dropped.
fn parse_tag_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}
