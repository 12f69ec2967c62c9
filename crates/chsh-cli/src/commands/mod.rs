pub mod batch;
pub mod calibrate;
pub mod compare;
pub mod run;

use std::time::Duration;

use chsh_core::{EventBus, Harness, HarnessConfig, NoIsolation, TrialBatchResult};
use serde::Serialize;

/// Load the harness config, or defaults when no path is given.
/// Exits on a bad file.
pub fn load_config(path: Option<&str>) -> HarnessConfig {
    let Some(path) = path else {
        return HarnessConfig::default();
    };
    match HarnessConfig::from_json_file(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading {path}: {e}");
            std::process::exit(1);
        }
    }
}

/// Build a stopped harness. `no_isolation` pins it to degraded mode.
pub fn build_harness<B: EventBus>(config: HarnessConfig, bus: B, no_isolation: bool) -> Harness {
    let harness = if no_isolation {
        Harness::with_launcher(config, bus, NoIsolation)
    } else {
        Harness::new(config, bus)
    };
    harness.unwrap_or_else(|e| {
        eprintln!("Error starting harness: {e}");
        std::process::exit(1);
    })
}

pub fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => {
            eprintln!("Error encoding JSON: {e}");
            std::process::exit(1);
        }
    }
}

/// One-line human summary of a batch.
pub fn describe(result: &TrialBatchResult) -> String {
    let verdict = if !result.within_physical_limit {
        "BEYOND PHYSICAL LIMIT"
    } else if result.violates_bound {
        "violates classical bound"
    } else {
        "within classical bound"
    };
    format!(
        "S = {:.4}  ({}, {} trials, {:.1}σ) {verdict}",
        result.display_statistic(),
        result.mode,
        result.trial_count,
        result.confidence_sigma
    )
}

/// Parse a duration string like "5m", "30s", "1h", "100ms".
/// A bare number is seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    let (numeric, multiplier) = if let Some(rest) = s.strip_suffix("ms") {
        (rest, 1u64)
    } else if let Some(rest) = s.strip_suffix('s') {
        (rest, 1000)
    } else if let Some(rest) = s.strip_suffix('m') {
        (rest, 60_000)
    } else if let Some(rest) = s.strip_suffix('h') {
        (rest, 3_600_000)
    } else {
        (s, 1000)
    };

    let value: u64 = numeric
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration: {s}"))?;
    value
        .checked_mul(multiplier)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("duration too large: {s}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // parse_duration
    // -----------------------------------------------------------------------

    #[test]
    fn test_parse_duration_suffixes() {
        assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration(" 45 ").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("").is_err());
        assert!(parse_duration("-5s").is_err());
    }

    // -----------------------------------------------------------------------
    // config and formatting
    // -----------------------------------------------------------------------

    #[test]
    fn test_default_config_without_path() {
        assert_eq!(load_config(None), HarnessConfig::default());
    }

    #[test]
    fn test_describe_clamps_display_value() {
        let mut result = chsh_core::run_batch(
            &chsh_core::MeasurementSettings::standard(),
            1_000,
            chsh_core::TrialMode::Quantum,
        );
        result.statistic = 3.4;
        result.within_physical_limit = false;
        let line = describe(&result);
        assert!(line.starts_with("S = 2.8284"), "{line}");
        assert!(line.contains("BEYOND PHYSICAL LIMIT"));
    }
}
