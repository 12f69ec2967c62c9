//! `chsh batch`: one engine batch, no harness.

use chsh_core::{MeasurementSettings, TrialEngine, TrialMode};
use chsh_stats::{chsh_standard_error, violation_p_value};

use super::{describe, print_json};

const BUCKETS: [&str; 4] = ["HH", "HT", "TH", "TT"];

pub fn run(mode: &str, trials: u64, seed: Option<u64>, json: bool) {
    let mode: TrialMode = mode.parse().unwrap_or_else(|e: String| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });
    if trials == 0 {
        eprintln!("Error: --trials must be positive");
        std::process::exit(1);
    }

    let settings = MeasurementSettings::standard();
    let result = match seed {
        Some(seed) => TrialEngine::seeded(settings, seed).run_batch(trials, mode),
        None => TrialEngine::new(settings).run_batch(trials, mode),
    };
    let standard_error = chsh_standard_error(&result.expectation_values, &result.bucket_counts);
    let p_value = violation_p_value(result.statistic, standard_error);

    if json {
        print_json(&serde_json::json!({
            "result": result,
            "standardError": standard_error,
            "pValue": p_value,
        }));
        return;
    }

    println!("{}", describe(&result));
    println!();
    println!("  {:<6} {:>10} {:>10}", "bucket", "E", "trials");
    for (i, name) in BUCKETS.iter().enumerate() {
        println!(
            "  {:<6} {:>10.4} {:>10}",
            name, result.expectation_values[i], result.bucket_counts[i]
        );
    }
    println!();
    println!("  standard error  {standard_error:.5}");
    println!("  p(S ≤ 2)        {p_value:.3e}");
}
