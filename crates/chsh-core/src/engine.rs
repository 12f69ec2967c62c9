//! CHSH trial engine.
//!
//! Pure computation: given [`MeasurementSettings`], a trial count and a
//! [`TrialMode`], run independent randomized trials and reduce them to a
//! [`TrialBatchResult`]. The engine does no I/O and knows nothing about
//! threads, so the same code runs inside the isolated executor and in the
//! harness's degraded path.
//!
//! # Buckets and combination rule
//!
//! Each side flips a fair coin to pick one of its two settings (heads = index
//! 0, tails = index 1). Trials land in one of four buckets `HH, HT, TH, TT`
//! (Alice's coin first) and the statistic is
//!
//! ```text
//! S = E_HH + E_HT + E_TH − E_TT
//! ```
//!
//! The order and the sign are fixed. Swapping either changes which runs are
//! classified as violations.
//!
//! # Modes
//!
//! - **Quantum**: outcomes are coupled through shared randomness so that the
//!   pair is equal with probability `(1 + E) / 2`, where
//!   `E = cos(2 · (a − b))` is the polarization correlation between the two
//!   chosen angles. The sign of the pair comes from an independent fair coin.
//! - **Classical**: a local hidden-variable model. One latent angle `λ` is drawn
//!   per trial and every outcome is `sign(cos(λ − θ))`. All four products are
//!   evaluated per trial, so a single trial contributes exactly ±2 to `S` and
//!   the average can never exceed the classical bound.

use std::f64::consts::{FRAC_PI_4, FRAC_PI_8, PI, SQRT_2};
use std::ops::ControlFlow;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Largest `S` any local hidden-variable model can reach.
pub const CLASSICAL_BOUND: f64 = 2.0;

/// Tsirelson's bound, the quantum-mechanical ceiling for `S` (2√2).
pub const TSIRELSON_BOUND: f64 = 2.0 * SQRT_2;

/// Trials per sub-batch between progress callbacks.
pub const PROGRESS_INTERVAL: u64 = 10_000;

const SIGMA_SCALE: f64 = 0.01;
const SIGMA_REFERENCE_TRIALS: f64 = 10_000.0;
const NOISE_TOLERANCE_SCALE: f64 = 10.0;

// ---------------------------------------------------------------------------
// Settings and modes
// ---------------------------------------------------------------------------

/// Which model a batch samples from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrialMode {
    /// Entangled-pair correlations (can violate the classical bound).
    Quantum,
    /// Local hidden-variable baseline used for calibration.
    Classical,
}

impl std::fmt::Display for TrialMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Quantum => write!(f, "quantum"),
            Self::Classical => write!(f, "classical"),
        }
    }
}

impl std::str::FromStr for TrialMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "quantum" | "q" => Ok(Self::Quantum),
            "classical" | "c" => Ok(Self::Classical),
            other => Err(format!("unknown trial mode '{other}' (expected quantum|classical)")),
        }
    }
}

/// The four measurement angles (radians), indexed by coin outcome.
///
/// `alice[0]` / `bob[0]` are the heads settings, `alice[1]` / `bob[1]` the
/// tails settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSettings {
    pub alice: [f64; 2],
    pub bob: [f64; 2],
}

impl MeasurementSettings {
    /// The fixed experiment: `A = 0`, `A' = π/4`, `B = π/8`, `B' = 3π/8`.
    ///
    /// Alice's heads setting is `A'` and her tails setting is `A`, so the
    /// tails/tails bucket holds the `A`–`B'` pair, the only one separated by
    /// 3π/8 and therefore the only anti-correlated bucket. With this layout
    /// the ideal statistic is exactly 2√2.
    pub fn standard() -> Self {
        Self {
            alice: [FRAC_PI_4, 0.0],
            bob: [FRAC_PI_8, 3.0 * FRAC_PI_8],
        }
    }

    /// Quantum correlation `E = cos(2 · (a − b))` for one settings pair.
    pub fn quantum_correlation(&self, alice: usize, bob: usize) -> f64 {
        (2.0 * (self.alice[alice] - self.bob[bob])).cos()
    }

    /// The noise-free quantum statistic for these angles.
    pub fn ideal_statistic(&self) -> f64 {
        combine(&[
            self.quantum_correlation(0, 0),
            self.quantum_correlation(0, 1),
            self.quantum_correlation(1, 0),
            self.quantum_correlation(1, 1),
        ])
    }

    /// True when all four angles are finite numbers.
    pub fn is_finite(&self) -> bool {
        self.alice.iter().chain(self.bob.iter()).all(|a| a.is_finite())
    }
}

impl Default for MeasurementSettings {
    fn default() -> Self {
        Self::standard()
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Summary of one batch. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialBatchResult {
    pub mode: TrialMode,
    /// Raw CHSH statistic. Never clamped.
    pub statistic: f64,
    /// Bucket expectation values in `HH, HT, TH, TT` order.
    pub expectation_values: [f64; 4],
    /// Trials that contributed to each bucket.
    pub bucket_counts: [u64; 4],
    pub violates_bound: bool,
    pub within_physical_limit: bool,
    pub confidence_sigma: f64,
    pub trial_count: u64,
    pub completed_at_unix_ms: u64,
}

impl TrialBatchResult {
    /// Statistic clamped to ±2√2, for display only.
    pub fn display_statistic(&self) -> f64 {
        self.statistic.clamp(-TSIRELSON_BOUND, TSIRELSON_BOUND)
    }
}

/// Intermediate state reported between sub-batches.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    pub completed: u64,
    pub total: u64,
    pub partial_statistic: f64,
}

/// `S = E_HH + E_HT + E_TH − E_TT`.
pub fn combine(expectations: &[f64; 4]) -> f64 {
    expectations[0] + expectations[1] + expectations[2] - expectations[3]
}

/// Heuristic noise-scaled distance from the classical bound:
/// `|S − 2| / (0.01 · sqrt(n / 10000))`.
///
/// Not a p-value. A zero-trial batch reports 0.
pub fn confidence_sigma(statistic: f64, trial_count: u64) -> f64 {
    if trial_count == 0 {
        return 0.0;
    }
    let scale = SIGMA_SCALE * (trial_count as f64 / SIGMA_REFERENCE_TRIALS).sqrt();
    (statistic - CLASSICAL_BOUND).abs() / scale
}

/// Sampling-noise allowance above Tsirelson's bound: `10 / sqrt(n)`.
pub fn noise_tolerance(trial_count: u64) -> f64 {
    NOISE_TOLERANCE_SCALE / (trial_count as f64).sqrt()
}

#[derive(Debug, Default)]
struct Tally {
    sums: [f64; 4],
    counts: [u64; 4],
    trials: u64,
}

impl Tally {
    fn record(&mut self, bucket: usize, product: f64) {
        self.sums[bucket] += product;
        self.counts[bucket] += 1;
    }

    fn expectations(&self) -> [f64; 4] {
        let mut out = [0.0; 4];
        for (i, e) in out.iter_mut().enumerate() {
            if self.counts[i] > 0 {
                *e = self.sums[i] / self.counts[i] as f64;
            }
        }
        out
    }

    fn statistic(&self) -> f64 {
        combine(&self.expectations())
    }

    fn finish(&self, mode: TrialMode) -> TrialBatchResult {
        let expectation_values = self.expectations();
        let statistic = combine(&expectation_values);
        TrialBatchResult {
            mode,
            statistic,
            expectation_values,
            bucket_counts: self.counts,
            violates_bound: statistic > CLASSICAL_BOUND,
            within_physical_limit: statistic.abs()
                <= TSIRELSON_BOUND + noise_tolerance(self.trials),
            confidence_sigma: confidence_sigma(statistic, self.trials),
            trial_count: self.trials,
            completed_at_unix_ms: unix_ms_now(),
        }
    }
}

fn unix_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn sign(x: f64) -> f64 {
    if x >= 0.0 { 1.0 } else { -1.0 }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Runs trial batches against fixed settings with an owned random source.
pub struct TrialEngine<R = StdRng> {
    settings: MeasurementSettings,
    rng: R,
}

impl TrialEngine<StdRng> {
    /// Engine seeded from OS entropy.
    pub fn new(settings: MeasurementSettings) -> Self {
        Self::with_rng(settings, StdRng::from_os_rng())
    }

    /// Reproducible engine.
    pub fn seeded(settings: MeasurementSettings, seed: u64) -> Self {
        Self::with_rng(settings, StdRng::seed_from_u64(seed))
    }
}

impl<R: Rng> TrialEngine<R> {
    pub fn with_rng(settings: MeasurementSettings, rng: R) -> Self {
        Self { settings, rng }
    }

    pub fn settings(&self) -> &MeasurementSettings {
        &self.settings
    }

    /// Run `trial_count` trials and summarize them.
    pub fn run_batch(&mut self, trial_count: u64, mode: TrialMode) -> TrialBatchResult {
        let mut tally = Tally::default();
        self.run_trials(trial_count, mode, &mut tally);
        tally.finish(mode)
    }

    /// Like [`run_batch`](Self::run_batch) but in sub-batches of
    /// [`PROGRESS_INTERVAL`] trials, calling `on_progress` between them.
    ///
    /// Returning `ControlFlow::Break` from the callback abandons the batch and
    /// yields `None`. No callback fires after the final sub-batch.
    pub fn run_batch_with<F>(
        &mut self,
        trial_count: u64,
        mode: TrialMode,
        mut on_progress: F,
    ) -> Option<TrialBatchResult>
    where
        F: FnMut(BatchProgress) -> ControlFlow<()>,
    {
        let mut tally = Tally::default();
        let mut remaining = trial_count;
        while remaining > 0 {
            let chunk = remaining.min(PROGRESS_INTERVAL);
            self.run_trials(chunk, mode, &mut tally);
            remaining -= chunk;
            if remaining > 0 {
                let progress = BatchProgress {
                    completed: tally.trials,
                    total: trial_count,
                    partial_statistic: tally.statistic(),
                };
                if on_progress(progress).is_break() {
                    return None;
                }
            }
        }
        Some(tally.finish(mode))
    }

    fn run_trials(&mut self, n: u64, mode: TrialMode, tally: &mut Tally) {
        for _ in 0..n {
            match mode {
                TrialMode::Quantum => self.quantum_trial(tally),
                TrialMode::Classical => self.classical_trial(tally),
            }
        }
        tally.trials += n;
    }

    fn quantum_trial(&mut self, tally: &mut Tally) {
        let a = usize::from(self.rng.random_bool(0.5));
        let b = usize::from(self.rng.random_bool(0.5));
        let correlation = self.settings.quantum_correlation(a, b);

        let alice = if self.rng.random_bool(0.5) { 1.0 } else { -1.0 };
        let equal = self.rng.random::<f64>() < (1.0 + correlation) / 2.0;
        let bob = if equal { alice } else { -alice };

        tally.record(a * 2 + b, alice * bob);
    }

    fn classical_trial(&mut self, tally: &mut Tally) {
        let latent = self.rng.random_range(0.0..2.0 * PI);
        let alice = self.settings.alice.map(|angle| sign((latent - angle).cos()));
        let bob = self.settings.bob.map(|angle| sign((latent - angle).cos()));
        for (i, a) in alice.iter().enumerate() {
            for (j, b) in bob.iter().enumerate() {
                tally.record(i * 2 + j, a * b);
            }
        }
    }
}

/// One-shot batch with a fresh OS-seeded engine.
pub fn run_batch(
    settings: &MeasurementSettings,
    trial_count: u64,
    mode: TrialMode,
) -> TrialBatchResult {
    TrialEngine::new(*settings).run_batch(trial_count, mode)
}
