//! Statistics for repeated CHSH batches.
//!
//! A single batch says little; these helpers judge a series of them. They take
//! plain numbers so they work equally on harness output, CLI calibration runs
//! and test fixtures.

use statrs::distribution::{ContinuousCDF, Normal, StudentsT};

/// Local-realist ceiling on `S`.
pub const CLASSICAL_BOUND: f64 = 2.0;

/// A classical series passes calibration when its mean stays at or below this.
pub const CLASSICAL_MEAN_CEILING: f64 = 2.05;

const CONFIDENCE: f64 = 0.95;

// ═══════════════════════════════════════════════════════════════════════════════
// Summary of a series
// ═══════════════════════════════════════════════════════════════════════════════

/// Location and spread of a series of statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    pub count: usize,
    pub mean: f64,
    /// Sample variance (n − 1 denominator). Zero for fewer than two values.
    pub variance: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    /// Two-sided 95 % Student-t interval for the mean.
    pub ci_low: f64,
    pub ci_high: f64,
}

/// Summarize a series. `None` when it is empty.
pub fn summarize(values: &[f64]) -> Option<RunSummary> {
    if values.is_empty() {
        return None;
    }
    let count = values.len();
    let n = count as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = if count > 1 {
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)
    } else {
        0.0
    };
    let std_dev = variance.sqrt();
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let half_width = if count > 1 {
        t_critical(n - 1.0) * std_dev / n.sqrt()
    } else {
        0.0
    };

    Some(RunSummary {
        count,
        mean,
        variance,
        std_dev,
        min,
        max,
        ci_low: mean - half_width,
        ci_high: mean + half_width,
    })
}

fn t_critical(df: f64) -> f64 {
    let p = 1.0 - (1.0 - CONFIDENCE) / 2.0;
    match StudentsT::new(0.0, 1.0, df) {
        Ok(t) => t.inverse_cdf(p),
        Err(_) => Normal::standard().inverse_cdf(p),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Single-batch significance
// ═══════════════════════════════════════════════════════════════════════════════

/// Standard error of `S` from its four bucket means.
///
/// Each product is ±1, so a bucket with mean `E` over `n` trials has variance
/// `(1 − E²) / n`. Buckets are independent. Infinite when a bucket is empty.
pub fn chsh_standard_error(expectations: &[f64; 4], counts: &[u64; 4]) -> f64 {
    let mut variance = 0.0;
    for (e, &n) in expectations.iter().zip(counts) {
        if n == 0 {
            return f64::INFINITY;
        }
        variance += (1.0 - e * e).max(0.0) / n as f64;
    }
    variance.sqrt()
}

/// One-sided p-value for `S > 2` under a normal approximation.
///
/// A zero standard error collapses to 0 or 1 depending on which side of the
/// bound `statistic` falls.
pub fn violation_p_value(statistic: f64, standard_error: f64) -> f64 {
    if !statistic.is_finite() || standard_error.is_nan() {
        return 1.0;
    }
    if standard_error <= 0.0 {
        return if statistic > CLASSICAL_BOUND { 0.0 } else { 1.0 };
    }
    let z = (statistic - CLASSICAL_BOUND) / standard_error;
    Normal::standard().sf(z)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Series properties
// ═══════════════════════════════════════════════════════════════════════════════

/// True when sample variance does not grow with trial count.
///
/// `series` holds `(trial_count, statistics)` pairs. They are sorted by trial
/// count before comparison. Each variance may exceed its predecessor by at
/// most a relative `slack`, which absorbs the sampling noise of the variance
/// estimate itself.
pub fn variance_is_non_increasing(series: &[(u64, Vec<f64>)], slack: f64) -> bool {
    let mut ordered: Vec<(u64, f64)> = series
        .iter()
        .filter_map(|(n, values)| summarize(values).map(|s| (*n, s.variance)))
        .collect();
    ordered.sort_by_key(|(n, _)| *n);
    ordered
        .windows(2)
        .all(|pair| pair[1].1 <= pair[0].1 * (1.0 + slack))
}

/// Outcome of a classical-versus-quantum calibration.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationReport {
    pub classical: RunSummary,
    pub quantum: RunSummary,
    /// Classical mean ≤ [`CLASSICAL_MEAN_CEILING`].
    pub classical_within_bound: bool,
    /// Lower end of the quantum CI is above the classical bound.
    pub quantum_violates: bool,
}

impl CalibrationReport {
    pub fn passed(&self) -> bool {
        self.classical_within_bound && self.quantum_violates
    }
}

/// Judge paired classical and quantum series. `None` if either is empty.
pub fn calibration_verdict(classical: &[f64], quantum: &[f64]) -> Option<CalibrationReport> {
    let classical = summarize(classical)?;
    let quantum = summarize(quantum)?;
    Some(CalibrationReport {
        classical_within_bound: classical.mean <= CLASSICAL_MEAN_CEILING,
        quantum_violates: quantum.ci_low > CLASSICAL_BOUND,
        classical,
        quantum,
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
