//! `chsh compare`: on-demand quantum versus classical comparison.

use chsh_core::MemoryBus;

use super::{build_harness, describe, load_config, print_json};

pub fn run(config_path: Option<&str>, no_isolation: bool, json: bool) {
    let config = load_config(config_path);
    let harness = build_harness(config, MemoryBus::new(), no_isolation);

    let report = match harness.run_supremacy_test() {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Error running comparison: {e}");
            std::process::exit(1);
        }
    };

    if json {
        print_json(&report);
        return;
    }

    println!("Supremacy comparison ({})", report.quantum.origin);
    println!("  quantum:   {}", describe(&report.quantum.result));
    println!("  classical: {}", describe(&report.classical.result));
    println!("  advantage: {:+.4}", report.advantage);
}
