//! # cohort-configs
//!
//! Layered settings: compiled defaults, then an optional `cohort.toml`,
//! then `COHORT__*` environment variables (`__` separates sections, e.g.
//! `COHORT__SCHEDULE__OPEN_HOUR=8`). A `.env` file is loaded first when
//! present. Values are checked at load time so a bad setting stops the
//! process before anything touches the store.

use std::path::Path;
use std::time::Duration;

use chrono::Weekday;
use chrono_tz::Tz;
use cohort_core::{CycleSchedule, EligibilityRules};
use config::builder::DefaultState;
use config::{ConfigBuilder, Environment, File, FileFormat};
use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
    /// An `EnvFilter` directive, e.g. `info,cohort_engine=debug`.
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleSettings {
    pub timezone: Tz,
    pub open_weekday: Weekday,
    pub open_hour: u32,
    pub close_weekday: Weekday,
    pub close_hour: u32,
    pub sweep_hour: u32,
    pub tick_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EligibilitySettings {
    pub streak_threshold: u32,
    pub invitation_cap: u32,
    pub invitation_expiry_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionSettings {
    pub keep_cycles: usize,
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub database_url: SecretString,
    pub log: LogSettings,
    pub schedule: ScheduleSettings,
    pub eligibility: EligibilitySettings,
    pub retention: RetentionSettings,
}

fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Ok(config::Config::builder()
        .set_default("database_url", "sqlite://cohort.db")?
        .set_default("log.level", "info")?
        .set_default("log.format", "pretty")?
        .set_default("schedule.timezone", "UTC")?
        .set_default("schedule.open_weekday", "mon")?
        .set_default("schedule.open_hour", 9)?
        .set_default("schedule.close_weekday", "thu")?
        .set_default("schedule.close_hour", 17)?
        .set_default("schedule.sweep_hour", 3)?
        .set_default("schedule.tick_seconds", 60)?
        .set_default("eligibility.streak_threshold", 4)?
        .set_default("eligibility.invitation_cap", 5)?
        .set_default("eligibility.invitation_expiry_days", 7)?
        .set_default("retention.keep_cycles", 12)?)
}

impl Settings {
    /// Loads `.env`, then `path` (or `./cohort.toml` if it exists), then the
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Ok(env_file) = dotenvy::dotenv() {
            debug!(path = %env_file.display(), "loaded .env");
        }
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name("cohort").required(false),
        };
        let builder = defaults()?.add_source(file).add_source(
            Environment::with_prefix("COHORT")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );
        Self::build(builder)
    }

    /// Defaults overlaid with an inline TOML document.
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        Self::build(defaults()?.add_source(File::from_str(toml, FileFormat::Toml)))
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key, reason: &str| {
            Err(ConfigError::Invalid { key, reason: reason.to_string() })
        };
        let s = &self.schedule;
        for (key, hour) in [
            ("schedule.open_hour", s.open_hour),
            ("schedule.close_hour", s.close_hour),
            ("schedule.sweep_hour", s.sweep_hour),
        ] {
            if hour > 23 {
                return invalid(key, "must be between 0 and 23");
            }
        }
        if s.tick_seconds == 0 {
            return invalid("schedule.tick_seconds", "must be positive");
        }
        if s.open_weekday == s.close_weekday && s.open_hour == s.close_hour {
            return invalid("schedule.close_hour", "window would be empty");
        }
        if self.eligibility.streak_threshold == 0 {
            return invalid("eligibility.streak_threshold", "must be at least 1");
        }
        if self.eligibility.invitation_expiry_days < 1 {
            return invalid("eligibility.invitation_expiry_days", "must be at least 1");
        }
        if self.retention.keep_cycles == 0 {
            return invalid("retention.keep_cycles", "must be at least 1");
        }
        Ok(())
    }

    pub fn cycle_schedule(&self) -> CycleSchedule {
        CycleSchedule {
            timezone: self.schedule.timezone,
            opens_on: self.schedule.open_weekday,
            open_hour: self.schedule.open_hour,
            closes_on: self.schedule.close_weekday,
            close_hour: self.schedule.close_hour,
        }
    }

    pub fn eligibility_rules(&self) -> EligibilityRules {
        EligibilityRules {
            streak_threshold: self.eligibility.streak_threshold,
            invitation_cap: self.eligibility.invitation_cap,
            invitation_expiry_days: self.eligibility.invitation_expiry_days,
        }
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.schedule.tick_seconds)
    }
}
