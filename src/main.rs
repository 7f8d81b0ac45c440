//! worldtune CLI - automated realism tuning for the world-history simulator
//!
//! This is the command-line entry point for worldtune. It orchestrates the
//! full tuning pipeline:
//!
//! 1. Startup: load schema + definitions, freeze the scenario, pin the window
//! 2. Baseline: score the incumbent config on every horizon and seed set
//! 3. Iterate: propose, scout, race, gate, promote, accept or reject
//! 4. Stop: convergence, target, structural plateau, safety, or budget
//! 5. Report: final_report.json plus the full per-iteration audit trail
//!
//! Design philosophy:
//! - The simulator is an opaque CLI; everything flows through its artifacts
//! - Every decision the loop makes is written down in JSON
//! - Reject cheaply (short horizons, few seeds) before spending compute
//! - Never promote a config whose telemetry is missing or nondeterministic

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use worldtune::cancel::CancelToken;
use worldtune::runner::CliInvoker;
use worldtune::schema::TuningSchema;
use worldtune::tune::{Tuner, TunerOptions};

/// Automated realism tuning for the world-history simulator
///
/// worldtune closes the loop around `worldsim_cli`: it runs the simulator
/// over fixed seed sets, scores the emitted telemetry against the realism
/// envelope, and walks the configuration one bounded parameter step at a
/// time toward a higher objective, with determinism and holdout gates
/// guarding every acceptance.
///
/// Examples:
///   worldtune                                  # Tune with the default layout
///   worldtune --max-iterations 20              # Short session
///   worldtune --force-rebaseline               # Ignore cached baseline
///   worldtune --stop-flag out/fine_tuning/STOP # Touch the file to stop
#[derive(Parser, Debug)]
#[command(name = "worldtune")]
#[command(version)]
#[command(about, long_about = None)]
pub struct Cli {
    /// Simulator configuration to tune
    ///
    /// The live TOML config. On a normal finish the best configuration found
    /// is copied back over this file (see --no-write-live-config).
    #[arg(long, default_value = "data/sim_config.toml")]
    pub config: PathBuf,

    /// Tuning schema (tunable parameters, seeds, policy, accelerators)
    #[arg(long, default_value = "data/sim_config_schema.json")]
    pub schema: PathBuf,

    /// Realism definitions (thresholds, violation classes, tolerances)
    #[arg(long, default_value = "data/realism_definitions.json")]
    pub definitions: PathBuf,

    /// Directory containing the worldsim_cli binary
    #[arg(long, default_value = "out/cmake/release/bin")]
    pub exe_dir: PathBuf,

    /// Root directory for all tuning artifacts
    ///
    /// Holds the baseline, the per-iteration records, the run cache, the
    /// persisted state, and the final report.
    #[arg(long, default_value = "out/fine_tuning")]
    pub out_dir: PathBuf,

    /// Iteration budget for this session
    #[arg(long, default_value = "80")]
    pub max_iterations: u32,

    /// Seed-parallel simulator invocations
    ///
    /// Clamped to the machine's cores minus the schema's reserved margin
    /// when the schema enables automatic sizing.
    #[arg(long, default_value = "4")]
    pub seed_jobs: usize,

    /// Recompute the baseline even when a cached one exists
    #[arg(long)]
    pub force_rebaseline: bool,

    /// Stop-flag file checked at iteration boundaries
    ///
    /// Creating the file requests a graceful stop after the current
    /// iteration; the session still writes its final report.
    #[arg(long)]
    pub stop_flag: Option<PathBuf>,

    /// Do not copy the best configuration back over --config
    #[arg(long)]
    pub no_write_live_config: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // The child environment comes from the schema, so load it first.
    let schema = TuningSchema::load(&cli.schema)?;
    let env = schema
        .optimization_accelerators
        .runtime_hygiene
        .child_env();
    let invoker = CliInvoker::new(cli.exe_dir.clone(), env);
    let cancel = CancelToken::new(cli.stop_flag.clone());

    let opts = TunerOptions {
        config_path: cli.config,
        schema_path: cli.schema,
        definitions_path: cli.definitions,
        out_root: cli.out_dir,
        max_iterations: cli.max_iterations,
        seed_jobs: cli.seed_jobs,
        force_rebaseline: cli.force_rebaseline,
        write_live_config: !cli.no_write_live_config,
    };
    let mut tuner = Tuner::new(opts, Box::new(invoker), cancel)?;
    tuner.run()?;
    Ok(())
}
