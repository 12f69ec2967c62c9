//! # chsh-core
//!
//! **A continuous CHSH Bell-test running in the background.**
//!
//! `chsh-core` runs randomized CHSH trial batches on a fixed cadence, off the
//! caller's thread, and publishes each batch's statistic `S` to an event bus.
//! Quantum batches should land near 2√2 ≈ 2.828; a local hidden-variable model
//! can never beat 2.
//!
//! ## Quick Start
//!
//! ```no_run
//! use chsh_core::{Harness, HarnessConfig, MemoryBus, TOPIC_STATISTIC};
//!
//! let bus = MemoryBus::new();
//! let values = bus.subscribe(TOPIC_STATISTIC);
//! let harness = Harness::new(HarnessConfig::default(), bus).unwrap();
//!
//! harness.start().unwrap();
//! let first = values.recv().unwrap();
//! println!("S = {:.4} ({:?})", first.value, first.origin);
//! harness.stop().unwrap();
//! ```
//!
//! ## Architecture
//!
//! Timer → Harness (control thread) → Isolated executor → Trial engine → Bus
//!
//! - [`engine`] is pure computation and is shared by both execution paths.
//! - [`executor`] hosts an engine on its own thread behind a JSON frame
//!   boundary ([`protocol`]).
//! - [`harness`] owns the state machine and falls back to a smaller in-place
//!   batch whenever isolation is unavailable or fails.

pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod harness;
pub mod protocol;

pub use bus::{BusEvent, EventBus, MemoryBus, TOPIC_STATISTIC};
pub use config::{HarnessConfig, MIN_INTERVAL_MS, StaleResultPolicy};
pub use engine::{
    BatchProgress, CLASSICAL_BOUND, MeasurementSettings, TSIRELSON_BOUND, TrialBatchResult,
    TrialEngine, TrialMode, run_batch,
};
pub use error::{ConfigError, ExecutorError, HarnessError};
pub use executor::{IsolatedExecutor, Launcher, NoIsolation, ThreadLauncher};
pub use harness::{BatchOutcome, Harness, HarnessState, ResultOrigin, SupremacyReport};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
