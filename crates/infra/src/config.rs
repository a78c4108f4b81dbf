//! Worker configuration loaded from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use lendkiosk_ai::BlendConfig;

use crate::external::ComparatorConfig;
use crate::jobs::DispatcherConfig;

pub const DATABASE_URL: &str = "DATABASE_URL";
pub const AI_ENABLED: &str = "LENDKIOSK_AI_ENABLED";
pub const AI_PROGRAM: &str = "LENDKIOSK_AI_PROGRAM";
pub const AI_SCRIPT: &str = "LENDKIOSK_AI_SCRIPT";
pub const AI_TIMEOUT_SECS: &str = "LENDKIOSK_AI_TIMEOUT_SECS";
pub const BATCH_SIZE: &str = "LENDKIOSK_BATCH_SIZE";
pub const MIN_CONFIDENCE: &str = "LENDKIOSK_MIN_CONFIDENCE";
pub const MISMATCH_THRESHOLD: &str = "LENDKIOSK_MISMATCH_THRESHOLD";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Everything one batch run needs.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub comparator: ComparatorConfig,
    pub dispatcher: DispatcherConfig,
    pub blend: BlendConfig,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup. Unset or blank variables take defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let database_url = get(DATABASE_URL).ok_or(ConfigError::Missing(DATABASE_URL))?;

        let mut comparator = ComparatorConfig::default();
        if let Some(raw) = get(AI_ENABLED) {
            comparator.enabled = parse_flag(AI_ENABLED, &raw)?;
        }
        if let Some(program) = get(AI_PROGRAM) {
            comparator.program = program;
        }
        if let Some(script) = get(AI_SCRIPT) {
            comparator.script = PathBuf::from(script);
        }

        let mut dispatcher = DispatcherConfig::default();
        if let Some(raw) = get(AI_TIMEOUT_SECS) {
            let secs: u64 = parse(AI_TIMEOUT_SECS, &raw)?;
            if secs == 0 {
                return Err(invalid(AI_TIMEOUT_SECS, &raw, "must be positive"));
            }
            dispatcher.comparator_timeout = Duration::from_secs(secs);
        }
        if let Some(raw) = get(BATCH_SIZE) {
            let size: usize = parse(BATCH_SIZE, &raw)?;
            if size == 0 {
                return Err(invalid(BATCH_SIZE, &raw, "must be positive"));
            }
            dispatcher.batch_size = size;
        }

        let mut blend = BlendConfig::default();
        if let Some(raw) = get(MIN_CONFIDENCE) {
            let value: f64 = parse(MIN_CONFIDENCE, &raw)?;
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(MIN_CONFIDENCE, &raw, "must be within [0, 1]"));
            }
            blend = blend.with_min_confidence(value);
        }
        if let Some(raw) = get(MISMATCH_THRESHOLD) {
            let value: f64 = parse(MISMATCH_THRESHOLD, &raw)?;
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(MISMATCH_THRESHOLD, &raw, "must be a non-negative number"));
            }
            blend = blend.with_mismatch_threshold(value);
        }

        Ok(Self {
            database_url,
            comparator,
            dispatcher,
            blend,
        })
    }
}

fn parse<T>(name: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| invalid(name, raw, &e.to_string()))
}

fn parse_flag(name: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(name, raw, "expected true or false")),
    }
}

fn invalid(name: &'static str, raw: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: raw.to_string(),
        reason: reason.to_string(),
    }
}
