//! Integration tests for chsh-core.
//!
//! Harness lifecycle, fallback behavior and the statistical scenarios:
//! engine → executor → harness → bus.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chsh_core::executor::{Deliver, IsolatedExecutor};
use chsh_core::protocol::{BatchReply, WorkerRequest, WorkerResponse};
use chsh_core::{
    ExecutorError, Harness, HarnessConfig, HarnessError, MeasurementSettings, MemoryBus,
    NoIsolation, ResultOrigin, TOPIC_STATISTIC, TSIRELSON_BOUND, TrialEngine, TrialMode,
};
use chsh_stats::{
    calibration_verdict, chsh_standard_error, summarize, variance_is_non_increasing,
    violation_p_value,
};

const WAIT: Duration = Duration::from_secs(30);

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[test]
fn start_publishes_isolated_result_and_stop_tears_down() {
    let bus = MemoryBus::new();
    let values = bus.subscribe(TOPIC_STATISTIC);
    let harness = Harness::new(HarnessConfig::default(), bus.clone()).unwrap();

    harness.start().unwrap();
    let event = values.recv_timeout(WAIT).expect("no statistic published");
    assert_eq!(event.origin, Some(ResultOrigin::Isolated));
    assert_eq!(event.sequence, Some(1));
    assert_eq!(event.within_physical_limit, Some(true));
    assert!(event.value > 2.0, "S = {}", event.value);

    let state = harness.state().unwrap();
    assert!(state.is_running);
    assert!(state.timer_armed);
    assert!(state.executor_available);
    assert_eq!(state.batches_completed, 1);
    let last = state.last_result.unwrap();
    assert_eq!(last.result.trial_count, 50_000);
    assert_eq!(harness.current_statistic().unwrap(), Some(event.value));

    harness.stop().unwrap();
    let state = harness.state().unwrap();
    assert!(!state.is_running);
    assert!(!state.timer_armed);
    assert!(!state.executor_available);
    assert!(!state.executor_live);

    // Idempotent.
    harness.stop().unwrap();
    harness.start().unwrap();
    harness.start().unwrap();
    assert_eq!(harness.state().unwrap().batches_issued, 2);
}

#[test]
fn start_then_immediate_stop_leaves_nothing_live() {
    let bus = MemoryBus::new();
    let config = HarnessConfig {
        isolated_trials: 5_000_000,
        ..Default::default()
    };
    let harness = Harness::new(config, bus.clone()).unwrap();
    harness.start().unwrap();
    harness.stop().unwrap();

    let state = harness.state().unwrap();
    assert!(!state.timer_armed);
    assert!(!state.executor_available);
    thread::sleep(Duration::from_millis(300));
    assert!(bus.events().is_empty());
    assert!(harness.state().unwrap().last_result.is_none());
}

#[test]
fn set_interval_clamps_without_extra_batch() {
    let harness =
        Harness::with_launcher(HarnessConfig::default(), MemoryBus::new(), NoIsolation).unwrap();
    assert_eq!(harness.set_interval(5_000).unwrap(), 10_000);
    assert!(!harness.state().unwrap().timer_armed);

    harness.start().unwrap();
    assert_eq!(harness.set_interval(5_000).unwrap(), 10_000);
    assert_eq!(harness.set_interval(45_000).unwrap(), 45_000);

    let state = harness.state().unwrap();
    assert_eq!(state.current_interval_ms, 45_000);
    assert_eq!(state.batches_issued, 1);
    assert!(state.timer_armed);
}

#[test]
fn timer_fires_at_the_configured_interval() {
    let bus = MemoryBus::new();
    let values = bus.subscribe(TOPIC_STATISTIC);
    let config = HarnessConfig {
        interval_ms: 10_000,
        degraded_trials: 1_000,
        ..Default::default()
    };
    let harness = Harness::with_launcher(config, bus, NoIsolation).unwrap();
    harness.start().unwrap();
    let started = Instant::now();

    let first = values.recv_timeout(WAIT).unwrap();
    let second = values.recv_timeout(WAIT).unwrap();
    assert_eq!(first.sequence, Some(1));
    assert_eq!(second.sequence, Some(2));
    assert!(started.elapsed() >= Duration::from_millis(9_900));
}

// ---------------------------------------------------------------------------
// Degraded mode
// ---------------------------------------------------------------------------

#[test]
fn unavailable_isolation_runs_degraded_batches() {
    let bus = MemoryBus::new();
    let harness = Harness::with_launcher(HarnessConfig::default(), bus.clone(), NoIsolation).unwrap();
    harness.start().unwrap();

    let events = bus.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].origin, Some(ResultOrigin::Degraded));

    let state = harness.state().unwrap();
    let last = state.last_result.unwrap();
    assert_eq!(last.origin, ResultOrigin::Degraded);
    assert_eq!(last.result.trial_count, 10_000);
    assert_eq!(state.degraded_batches, 1);
    assert!(!state.executor_available);
}

fn panicking_launcher(
    id: u64,
    _settings: &MeasurementSettings,
    deliver: Deliver,
) -> Result<IsolatedExecutor, ExecutorError> {
    IsolatedExecutor::spawn_worker(id, deliver, |mailbox, outbox| {
        outbox.send(&WorkerResponse::Ready);
        let _ = mailbox.next();
        panic!("executor fault injected by test");
    })
}

#[test]
fn executor_failure_reruns_batch_degraded() {
    let bus = MemoryBus::new();
    let values = bus.subscribe(TOPIC_STATISTIC);
    let harness =
        Harness::with_launcher(HarnessConfig::default(), bus.clone(), panicking_launcher).unwrap();
    harness.start().unwrap();

    let event = values.recv_timeout(WAIT).expect("no fallback result");
    assert_eq!(event.origin, Some(ResultOrigin::Degraded));
    assert_eq!(event.sequence, Some(1));

    let state = harness.state().unwrap();
    assert!(state.is_running);
    assert!(!state.executor_available);
    assert_eq!(state.degraded_batches, 1);
    assert_eq!(state.last_result.unwrap().result.trial_count, 10_000);
}

#[test]
fn executor_is_relaunched_on_the_tick_after_a_failure() {
    let launches = Arc::new(AtomicUsize::new(0));
    let counter = launches.clone();
    let launcher = move |id: u64, settings: &MeasurementSettings, deliver: Deliver| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            panicking_launcher(id, settings, deliver)
        } else {
            IsolatedExecutor::start(id, *settings, deliver)
        }
    };

    let bus = MemoryBus::new();
    let values = bus.subscribe(TOPIC_STATISTIC);
    let config = HarnessConfig {
        interval_ms: 10_000,
        ..Default::default()
    };
    let harness = Harness::with_launcher(config, bus, launcher).unwrap();
    harness.start().unwrap();

    let first = values.recv_timeout(WAIT).expect("no fallback result");
    let second = values.recv_timeout(WAIT).expect("no result after relaunch");
    assert_eq!(first.origin, Some(ResultOrigin::Degraded));
    assert_eq!(first.sequence, Some(1));
    assert_eq!(second.origin, Some(ResultOrigin::Isolated));
    assert_eq!(second.sequence, Some(2));
    assert_eq!(launches.load(Ordering::SeqCst), 2);

    let state = harness.state().unwrap();
    assert!(state.executor_available);
    assert_eq!(state.degraded_batches, 1);
    assert_eq!(state.last_result.unwrap().result.trial_count, 50_000);
}

fn slow_launcher(
    id: u64,
    settings: &MeasurementSettings,
    deliver: Deliver,
) -> Result<IsolatedExecutor, ExecutorError> {
    let settings = *settings;
    IsolatedExecutor::spawn_worker(id, deliver, move |mailbox, outbox| {
        outbox.send(&WorkerResponse::Ready);
        if let Some(Ok(WorkerRequest::RunQuantum(batch))) = mailbox.next() {
            thread::sleep(Duration::from_millis(300));
            let result = chsh_core::run_batch(&settings, 1_000, TrialMode::Quantum);
            outbox.send(&WorkerResponse::ChshResult(BatchReply {
                sequence: batch.sequence,
                result,
            }));
        }
    })
}

#[test]
fn results_arriving_after_stop_are_ignored() {
    let bus = MemoryBus::new();
    let harness =
        Harness::with_launcher(HarnessConfig::default(), bus.clone(), slow_launcher).unwrap();
    harness.start().unwrap();
    harness.stop().unwrap();
    thread::sleep(Duration::from_millis(500));

    assert!(bus.events().is_empty());
    let state = harness.state().unwrap();
    assert!(state.last_result.is_none());
    assert_eq!(state.batches_completed, 0);
}

// ---------------------------------------------------------------------------
// Supremacy comparison
// ---------------------------------------------------------------------------

#[test]
fn supremacy_comparison_is_returned_not_published() {
    let bus = MemoryBus::new();
    let config = HarnessConfig {
        supremacy_trials: 20_000,
        ..Default::default()
    };
    let harness = Harness::new(config, bus.clone()).unwrap();
    let report = harness.run_supremacy_test().unwrap();

    assert_eq!(report.quantum.origin, ResultOrigin::Isolated);
    assert_eq!(report.quantum.result.mode, TrialMode::Quantum);
    assert_eq!(report.classical.result.mode, TrialMode::Classical);
    assert_eq!(report.quantum.result.trial_count, 20_000);
    assert!(report.classical.result.statistic <= 2.0 + 1e-9);
    assert!(report.advantage > 0.5, "advantage {}", report.advantage);
    assert!(
        (report.advantage - (report.quantum.result.statistic - report.classical.result.statistic))
            .abs()
            < 1e-12
    );

    assert!(bus.events().is_empty());
    let state = harness.state().unwrap();
    assert!(state.last_result.is_none());
    assert!(!state.executor_available);
    assert_eq!(state.pending_comparisons, 0);
}

#[test]
fn supremacy_comparison_runs_degraded_without_isolation() {
    let bus = MemoryBus::new();
    let harness = Harness::with_launcher(HarnessConfig::default(), bus.clone(), NoIsolation).unwrap();
    let report = harness.run_supremacy_test().unwrap();
    assert_eq!(report.quantum.origin, ResultOrigin::Degraded);
    assert_eq!(report.classical.origin, ResultOrigin::Degraded);
    assert_eq!(report.quantum.result.trial_count, 10_000);
    assert!(bus.events().is_empty());
}

#[test]
fn stop_cancels_pending_comparison() {
    let config = HarnessConfig {
        supremacy_trials: 50_000_000,
        ..Default::default()
    };
    let harness = Harness::new(config, MemoryBus::new()).unwrap();

    thread::scope(|scope| {
        let pending = scope.spawn(|| harness.run_supremacy_test());
        assert!(wait_until(|| harness.state().unwrap().pending_comparisons == 1));
        harness.stop().unwrap();
        let outcome = pending.join().unwrap();
        assert!(matches!(outcome, Err(HarnessError::Cancelled)));
    });
    assert!(!harness.state().unwrap().executor_available);
}

// ---------------------------------------------------------------------------
// Statistical scenarios
// ---------------------------------------------------------------------------

#[test]
fn quantum_batches_average_near_tsirelson() {
    let mut engine = TrialEngine::seeded(MeasurementSettings::standard(), 7);
    let values: Vec<f64> = (0..100)
        .map(|_| engine.run_batch(50_000, TrialMode::Quantum).statistic)
        .collect();
    let summary = summarize(&values).unwrap();
    assert!(
        (2.5..=TSIRELSON_BOUND + 0.01).contains(&summary.mean),
        "mean S = {}",
        summary.mean
    );
    assert!(summary.ci_low > 2.0);
}

#[test]
fn classical_batches_never_beat_the_bound() {
    let mut engine = TrialEngine::seeded(MeasurementSettings::standard(), 11);
    let values: Vec<f64> = (0..100)
        .map(|_| engine.run_batch(25_000, TrialMode::Classical).statistic)
        .collect();
    let summary = summarize(&values).unwrap();
    assert!(summary.mean <= 2.05, "mean S = {}", summary.mean);
    assert!(summary.max <= 2.0 + 1e-9);
}

#[test]
fn calibration_passes_for_standard_settings() {
    let settings = MeasurementSettings::standard();
    let mut engine = TrialEngine::seeded(settings, 3);
    let classical: Vec<f64> = (0..20)
        .map(|_| engine.run_batch(10_000, TrialMode::Classical).statistic)
        .collect();
    let quantum: Vec<f64> = (0..20)
        .map(|_| engine.run_batch(10_000, TrialMode::Quantum).statistic)
        .collect();
    let report = calibration_verdict(&classical, &quantum).unwrap();
    assert!(report.passed(), "{report:?}");
}

#[test]
fn single_quantum_batch_is_significant() {
    let result = TrialEngine::seeded(MeasurementSettings::standard(), 5)
        .run_batch(50_000, TrialMode::Quantum);
    let se = chsh_standard_error(&result.expectation_values, &result.bucket_counts);
    assert!(se > 0.0 && se < 0.05, "se = {se}");
    assert!(violation_p_value(result.statistic, se) < 1e-6);
    assert!(result.confidence_sigma > 10.0);
}

#[test]
fn variance_shrinks_with_trial_count() {
    let mut engine = TrialEngine::seeded(MeasurementSettings::standard(), 19);
    let series: Vec<(u64, Vec<f64>)> = [1_000u64, 4_000, 16_000]
        .into_iter()
        .map(|n| {
            let values = (0..40)
                .map(|_| engine.run_batch(n, TrialMode::Quantum).statistic)
                .collect();
            (n, values)
        })
        .collect();
    assert!(variance_is_non_increasing(&series, 0.25));
}

#[test]
fn classical_variance_never_grows_with_trial_count() {
    let mut engine = TrialEngine::seeded(MeasurementSettings::standard(), 23);
    let series: Vec<(u64, Vec<f64>)> = [1_000u64, 5_000, 25_000]
        .into_iter()
        .map(|n| {
            let values = (0..20)
                .map(|_| engine.run_batch(n, TrialMode::Classical).statistic)
                .collect();
            (n, values)
        })
        .collect();
    assert!(variance_is_non_increasing(&series, 0.0));

    // Every trial contributes exactly +2 at the standard angles.
    for (n, values) in &series {
        let summary = summarize(values).unwrap();
        assert!(summary.variance < 1e-20, "n = {n}: variance {}", summary.variance);
        assert!((summary.mean - 2.0).abs() < 1e-9, "n = {n}: mean {}", summary.mean);
    }
}
