//! worldtune - automated realism tuning for the world-history simulator
//!
//! Closes the loop around an opaque simulator CLI: run fixed seed sets,
//! score the emitted telemetry against a realism envelope, and walk the
//! configuration one bounded parameter step at a time toward a higher
//! objective.
//!
//! # Architecture
//!
//! ```text
//! Propose → Scout → Race → Gate → Promote → Accept/Reject → Stop?
//!    ↓        ↓       ↓      ↓        ↓           ↓           ↓
//!  UCB +   stage 0  seed   canary/  medium/    state +     tickets
//!  random   seeds  subsets parity  long/hold   records    + report
//! ```
//!
//! # Cost Strategies
//!
//! - Common random numbers: identical seed sets for every candidate
//! - Adaptive racing: reject on small seed subsets before the full set
//! - Run cache keyed by (config hash, seed, window, backend)
//! - Horizon curriculum: short windows first, long windows for promotion
//! - Seed-parallel simulator invocations via rayon

pub mod cancel;
pub mod config;
pub mod curriculum;
pub mod definitions;
pub mod eval;
pub mod gates;
pub mod objective;
pub mod progress;
pub mod propose;
pub mod racing;
pub mod runner;
pub mod schema;
pub mod state;
pub mod stats;
pub mod stop;
pub mod telemetry;
pub mod tune;
pub mod types;

// Re-export core types
pub use types::{Backend, Horizon, ObjectiveAggregate, ParamStats, SeedEval, Violation};

// Re-export the loop surface
pub use runner::{CliInvoker, RunCachePolicy, Runner, SimulatorInvoker};
pub use stop::StopReason;
pub use tune::{Tuner, TunerOptions};
