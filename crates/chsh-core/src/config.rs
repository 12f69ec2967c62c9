//! Harness configuration.
//!
//! Every field has a default, so a JSON file only needs the values it
//! overrides:
//!
//! ```json
//! { "interval_ms": 15000, "stale_results": "last_write_wins" }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::MeasurementSettings;
use crate::error::ConfigError;

/// Default cadence between periodic batches.
pub const DEFAULT_INTERVAL_MS: u64 = 30_000;
/// Intervals below this are clamped up to it.
pub const MIN_INTERVAL_MS: u64 = 10_000;
/// Trials per periodic batch on the isolated executor.
pub const DEFAULT_ISOLATED_TRIALS: u64 = 50_000;
/// Trials per batch when running degraded in the control context.
pub const DEFAULT_DEGRADED_TRIALS: u64 = 10_000;
/// Trials per half of an on-demand supremacy comparison.
pub const DEFAULT_SUPREMACY_TRIALS: u64 = 100_000;
/// Outcomes kept in the in-memory recent window.
pub const DEFAULT_HISTORY_LEN: usize = 32;

/// What to do with a periodic result that is not the most recently issued one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleResultPolicy {
    /// Apply only the result whose sequence matches the latest request.
    #[default]
    Discard,
    /// Apply every result in arrival order.
    LastWriteWins,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub interval_ms: u64,
    pub isolated_trials: u64,
    pub degraded_trials: u64,
    pub supremacy_trials: u64,
    pub history_len: usize,
    pub stale_results: StaleResultPolicy,
    pub settings: MeasurementSettings,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_INTERVAL_MS,
            isolated_trials: DEFAULT_ISOLATED_TRIALS,
            degraded_trials: DEFAULT_DEGRADED_TRIALS,
            supremacy_trials: DEFAULT_SUPREMACY_TRIALS,
            history_len: DEFAULT_HISTORY_LEN,
            stale_results: StaleResultPolicy::default(),
            settings: MeasurementSettings::standard(),
        }
    }
}

impl HarnessConfig {
    /// Load from a JSON file. The result is not yet validated.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Reject unusable values and clamp the interval to its floor.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        for (name, value) in [
            ("isolated_trials", self.isolated_trials),
            ("degraded_trials", self.degraded_trials),
            ("supremacy_trials", self.supremacy_trials),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        if self.history_len == 0 {
            return Err(ConfigError::Invalid("history_len must be positive".into()));
        }
        if !self.settings.is_finite() {
            return Err(ConfigError::Invalid(
                "measurement angles must be finite".into(),
            ));
        }
        self.interval_ms = clamp_interval(self.interval_ms);
        Ok(self)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Clamp an interval to [`MIN_INTERVAL_MS`], logging when it had to move.
pub fn clamp_interval(interval_ms: u64) -> u64 {
    if interval_ms < MIN_INTERVAL_MS {
        log::warn!(
            "interval {interval_ms} ms is below the {MIN_INTERVAL_MS} ms floor; using {MIN_INTERVAL_MS} ms"
        );
        MIN_INTERVAL_MS
    } else {
        interval_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = HarnessConfig::default();
        assert_eq!(config.interval_ms, 30_000);
        assert_eq!(config.isolated_trials, 50_000);
        assert_eq!(config.degraded_trials, 10_000);
        assert_eq!(config.supremacy_trials, 100_000);
        assert_eq!(config.stale_results, StaleResultPolicy::Discard);
    }

    #[test]
    fn test_interval_is_clamped_not_rejected() {
        let config = HarnessConfig {
            interval_ms: 2_500,
            ..Default::default()
        };
        let config = config.validate().unwrap();
        assert_eq!(config.interval_ms, MIN_INTERVAL_MS);
        assert_eq!(clamp_interval(45_000), 45_000);
    }

    #[test]
    fn test_zero_trials_rejected() {
        let config = HarnessConfig {
            degraded_trials: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("degraded_trials"));
    }

    #[test]
    fn test_partial_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"interval_ms": 15000, "stale_results": "last_write_wins"}}"#
        )
        .unwrap();
        let config = HarnessConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.interval_ms, 15_000);
        assert_eq!(config.stale_results, StaleResultPolicy::LastWriteWins);
        assert_eq!(config.isolated_trials, DEFAULT_ISOLATED_TRIALS);
        assert_eq!(config.settings, MeasurementSettings::standard());
    }

    #[test]
    fn test_bad_json_is_parse_error() {
        let err = HarnessConfig::from_json_str("{ interval_ms: ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
