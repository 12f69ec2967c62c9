//! CLI for the CHSH harness: run continuous Bell tests from the terminal.

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "chsh")]
#[command(about = "chsh: continuous CHSH Bell-test harness")]
#[command(version = chsh_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the periodic harness, printing every published statistic.
    /// Stops on Ctrl+C or when --duration elapses.
    Run {
        /// Harness config file (JSON). Missing fields use defaults.
        #[arg(long)]
        config: Option<String>,

        /// Override the batch interval in milliseconds (floor 10000)
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Stop after this long (e.g. "90s", "5m", "1h")
        #[arg(long)]
        duration: Option<String>,

        /// Run every batch in-process at the reduced trial count
        #[arg(long)]
        no_isolation: bool,

        /// Print one JSON object per event
        #[arg(long)]
        json: bool,
    },

    /// Run a single batch and print its result
    Batch {
        #[arg(long, default_value = "quantum", value_parser = ["quantum", "classical"])]
        mode: String,

        #[arg(long, default_value = "50000")]
        trials: u64,

        /// Seed for a reproducible batch
        #[arg(long)]
        seed: Option<u64>,

        #[arg(long)]
        json: bool,
    },

    /// Quantum versus classical supremacy comparison
    Compare {
        #[arg(long)]
        config: Option<String>,

        #[arg(long)]
        no_isolation: bool,

        #[arg(long)]
        json: bool,
    },

    /// Repeat classical and quantum batches and check both against the bound
    Calibrate {
        /// Batches per mode
        #[arg(long, default_value = "20")]
        runs: usize,

        /// Trials per batch
        #[arg(long, default_value = "25000")]
        trials: u64,

        #[arg(long)]
        seed: Option<u64>,

        #[arg(long)]
        json: bool,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            interval_ms,
            duration,
            no_isolation,
            json,
        } => commands::run::run(commands::run::RunCommandConfig {
            config_path: config.as_deref(),
            interval_ms,
            duration: duration.as_deref(),
            no_isolation,
            json,
        }),
        Commands::Batch {
            mode,
            trials,
            seed,
            json,
        } => commands::batch::run(&mode, trials, seed, json),
        Commands::Compare {
            config,
            no_isolation,
            json,
        } => commands::compare::run(config.as_deref(), no_isolation, json),
        Commands::Calibrate {
            runs,
            trials,
            seed,
            json,
        } => commands::calibrate::run(runs, trials, seed, json),
    }
}
