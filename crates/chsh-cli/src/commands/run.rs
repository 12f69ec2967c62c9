//! `chsh run`: drive the periodic harness from the terminal.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

use chsh_core::{MemoryBus, TOPIC_STATISTIC};

use super::{build_harness, describe, load_config, parse_duration, print_json};

pub struct RunCommandConfig<'a> {
    pub config_path: Option<&'a str>,
    pub interval_ms: Option<u64>,
    pub duration: Option<&'a str>,
    pub no_isolation: bool,
    pub json: bool,
}

pub fn run(cfg: RunCommandConfig<'_>) {
    let mut config = load_config(cfg.config_path);
    if let Some(ms) = cfg.interval_ms {
        config.interval_ms = ms;
    }
    let max_duration = cfg.duration.map(|d| {
        parse_duration(d).unwrap_or_else(|e| {
            eprintln!("Error: {e}");
            std::process::exit(1);
        })
    });

    let bus = MemoryBus::new();
    let events = bus.subscribe(TOPIC_STATISTIC);
    let harness = build_harness(config, bus, cfg.no_isolation);

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    }) {
        eprintln!("Error setting Ctrl+C handler: {e}");
        std::process::exit(1);
    }

    if let Err(e) = harness.start() {
        eprintln!("Error starting harness: {e}");
        std::process::exit(1);
    }
    let interval = harness
        .state()
        .map(|s| s.current_interval_ms)
        .unwrap_or_default();

    if !cfg.json {
        println!("CHSH harness running");
        println!("  Interval:  {interval} ms");
        match max_duration {
            Some(d) => println!("  Duration:  {}s", d.as_secs()),
            None => println!("  Duration:  until Ctrl+C"),
        }
        println!(
            "  Isolation: {}",
            if cfg.no_isolation { "disabled" } else { "worker thread" }
        );
        println!();
    }

    let start = Instant::now();
    while running.load(Ordering::SeqCst) {
        if let Some(max) = max_duration
            && start.elapsed() >= max
        {
            break;
        }
        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(event) if cfg.json => print_json(&event),
            Ok(event) => {
                let origin = event.origin.map(|o| o.to_string()).unwrap_or_default();
                let sequence = event.sequence.unwrap_or_default();
                println!(
                    "  #{sequence:<4} S = {:.4}  [{origin}]  t+{:.1}s",
                    event.value,
                    start.elapsed().as_secs_f64()
                );
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if let Err(e) = harness.stop() {
        log::warn!("stop failed: {e}");
    }

    let recent = harness.recent_results().unwrap_or_default();
    let values: Vec<f64> = recent.iter().map(|o| o.result.statistic).collect();
    let Some(summary) = chsh_stats::summarize(&values) else {
        if !cfg.json {
            println!("\nNo batches completed.");
        }
        return;
    };

    if cfg.json {
        print_json(&serde_json::json!({
            "batches": summary.count,
            "mean": summary.mean,
            "stdDev": summary.std_dev,
            "ciLow": summary.ci_low,
            "ciHigh": summary.ci_high,
        }));
    } else {
        println!();
        println!("Recent window: {} batches", summary.count);
        println!(
            "  mean S = {:.4} ± {:.4}  (95% CI {:.4}..{:.4})",
            summary.mean, summary.std_dev, summary.ci_low, summary.ci_high
        );
        if let Some(last) = recent.last() {
            println!("  last:  {}", describe(&last.result));
        }
    }
}
