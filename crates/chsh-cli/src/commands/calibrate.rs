//! `chsh calibrate`: repeated batches judged by the statistics battery.

use chsh_core::{MeasurementSettings, TrialEngine, TrialMode};
use chsh_stats::{CalibrationReport, RunSummary, calibration_verdict};

use super::print_json;

pub fn run(runs: usize, trials: u64, seed: Option<u64>, json: bool) {
    if runs == 0 || trials == 0 {
        eprintln!("Error: --runs and --trials must be positive");
        std::process::exit(1);
    }

    let settings = MeasurementSettings::standard();
    let mut engine = match seed {
        Some(seed) => TrialEngine::seeded(settings, seed),
        None => TrialEngine::new(settings),
    };

    let mut series = |mode: TrialMode| -> Vec<f64> {
        (0..runs)
            .map(|i| {
                log::debug!("{mode} batch {}/{runs}", i + 1);
                engine.run_batch(trials, mode).statistic
            })
            .collect()
    };
    let classical = series(TrialMode::Classical);
    let quantum = series(TrialMode::Quantum);

    let Some(report) = calibration_verdict(&classical, &quantum) else {
        eprintln!("Error: no batches to judge");
        std::process::exit(1);
    };

    if json {
        print_json(&serde_json::json!({
            "runs": runs,
            "trials": trials,
            "classical": summary_json(&report.classical),
            "quantum": summary_json(&report.quantum),
            "classicalWithinBound": report.classical_within_bound,
            "quantumViolates": report.quantum_violates,
            "passed": report.passed(),
        }));
    } else {
        print_report(runs, trials, &report);
    }

    if !report.passed() {
        std::process::exit(1);
    }
}

fn summary_json(s: &RunSummary) -> serde_json::Value {
    serde_json::json!({
        "mean": s.mean,
        "stdDev": s.std_dev,
        "min": s.min,
        "max": s.max,
        "ciLow": s.ci_low,
        "ciHigh": s.ci_high,
    })
}

fn print_report(runs: usize, trials: u64, report: &CalibrationReport) {
    println!("Calibration: {runs} batches × {trials} trials per mode");
    println!();
    for (name, s) in [("classical", &report.classical), ("quantum", &report.quantum)] {
        println!(
            "  {name:<10} mean {:.4}  sd {:.4}  95% CI {:.4}..{:.4}",
            s.mean, s.std_dev, s.ci_low, s.ci_high
        );
    }
    println!();
    let mark = |ok: bool| if ok { "PASS" } else { "FAIL" };
    println!(
        "  [{}] classical mean ≤ {}",
        mark(report.classical_within_bound),
        chsh_stats::CLASSICAL_MEAN_CEILING
    );
    println!(
        "  [{}] quantum CI above {}",
        mark(report.quantum_violates),
        chsh_stats::CLASSICAL_BOUND
    );
}
