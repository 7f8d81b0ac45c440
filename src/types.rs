//! Core domain types shared across the tuning pipeline.
//!
//! The vocabulary here mirrors the artifacts the simulator produces and the
//! decisions the loop records:
//!
//! - [`Violation`]: one detected departure from the realism envelope
//! - [`SeedEval`]: the full scoring result for a single simulator run
//! - [`ObjectiveAggregate`]: a seed set reduced to one scalar objective
//! - [`ParamStats`]: per-parameter bandit statistics for the exploit lane
//! - [`Backend`] / [`Horizon`]: the two axes a run is keyed by besides
//!   seed and configuration

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Compute backend the simulator runs on. Parity checks compare one run
/// per backend for the same seed and configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Cpu,
    Gpu,
}

impl Backend {
    /// Stable token used in cache keys and run metadata.
    pub fn token(self) -> &'static str {
        match self {
            Backend::Cpu => "cpu",
            Backend::Gpu => "gpu",
        }
    }

    /// Value for the simulator's `--useGPU` flag.
    pub fn gpu_flag(self) -> &'static str {
        match self {
            Backend::Cpu => "0",
            Backend::Gpu => "1",
        }
    }

    pub fn from_use_gpu(use_gpu: bool) -> Self {
        if use_gpu {
            Backend::Gpu
        } else {
            Backend::Cpu
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Evaluation horizon. The curriculum stages evaluation cost by running
/// short windows first and reserving long windows for promising candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Horizon {
    Inner,
    Medium,
    Long,
}

impl fmt::Display for Horizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Horizon::Inner => f.write_str("inner"),
            Horizon::Medium => f.write_str("medium"),
            Horizon::Long => f.write_str("long"),
        }
    }
}

/// A detected departure from the realism envelope.
///
/// Severity is 0-100. `hardfail` marks violations that unconditionally block
/// promotion regardless of the composite score. `details` carries free-form
/// diagnostic context for the iteration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub id: String,
    pub severity: f64,
    pub hardfail: bool,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl Violation {
    pub fn new(id: &str, severity: f64, hardfail: bool, details: serde_json::Value) -> Self {
        Self {
            id: id.to_string(),
            severity,
            hardfail,
            details,
        }
    }

    /// Synthetic hard fail used whenever required telemetry is absent.
    /// Missing data must never score better than bad data.
    pub fn missing_metric(details: serde_json::Value) -> Self {
        Self::new("MISSING_METRIC", 100.0, true, details)
    }
}

/// Scoring result for one (seed, configuration, horizon, backend) run.
///
/// Immutable once constructed. `key_series` retains the named metric series
/// the determinism/parity gate compares; `summary` is the exact document
/// written back to `run_summary.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedEval {
    pub seed: u64,
    /// Mean of per-checkpoint composite scores, in [0, 1].
    pub base_score: f64,
    /// Total penalty points subtracted from the scaled base score.
    pub penalties: f64,
    /// `100 * base_score - penalties`.
    pub total_score: f64,
    /// Sorted, deduplicated ids of hard-fail violations.
    pub hardfails: Vec<String>,
    pub violations: Vec<Violation>,
    pub checkpoint_scores: Vec<f64>,
    pub key_series: BTreeMap<String, Vec<f64>>,
    /// Highest-severity violations first, capped for reporting.
    pub top_violations: Vec<Violation>,
    pub summary: serde_json::Value,
}

impl SeedEval {
    pub fn has_hardfail(&self) -> bool {
        !self.hardfails.is_empty()
    }
}

/// A seed set reduced to a single scalar objective with its audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectiveAggregate {
    pub score_median: f64,
    pub stddev: f64,
    pub hardfail_rate: f64,
    pub variance_penalty: f64,
    pub hardfail_penalty: f64,
    pub objective: f64,
}

/// Running statistics for one tunable parameter, feeding the exploit lane's
/// upper-confidence scoring. Updated after every iteration whether or not
/// the candidate was accepted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParamStats {
    pub attempts: u64,
    pub accepts: u64,
    pub sum_inner_delta: f64,
    pub sum_long_delta: f64,
    /// Cumulative inner delta observed when stepping the parameter up.
    pub gain_up: f64,
    /// Cumulative inner delta observed when stepping the parameter down.
    pub gain_down: f64,
    pub last_direction: i32,
}

impl ParamStats {
    pub fn mean_inner_delta(&self) -> f64 {
        self.sum_inner_delta / (self.attempts.max(1) as f64)
    }

    pub fn record(&mut self, direction: i32, inner_delta: f64, long_delta: f64, accepted: bool) {
        self.attempts += 1;
        self.sum_inner_delta += inner_delta;
        self.sum_long_delta += long_delta;
        self.last_direction = direction;
        if direction > 0 {
            self.gain_up += inner_delta;
        } else {
            self.gain_down += inner_delta;
        }
        if accepted {
            self.accepts += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_tokens() {
        assert_eq!(Backend::Cpu.token(), "cpu");
        assert_eq!(Backend::Gpu.token(), "gpu");
        assert_eq!(Backend::Cpu.gpu_flag(), "0");
        assert_eq!(Backend::Gpu.gpu_flag(), "1");
        assert_eq!(Backend::from_use_gpu(true), Backend::Gpu);
    }

    #[test]
    fn test_missing_metric_is_hard_fail_at_max_severity() {
        let v = Violation::missing_metric(serde_json::json!({"empty_timeseries": true}));
        assert_eq!(v.id, "MISSING_METRIC");
        assert!(v.hardfail);
        assert!((v.severity - 100.0).abs() < 1e-12);
    }

    #[test]
    fn test_param_stats_direction_gains() {
        let mut st = ParamStats::default();
        st.record(1, 0.5, 0.0, false);
        st.record(1, 0.25, 0.1, true);
        st.record(-1, -0.4, 0.0, false);

        assert_eq!(st.attempts, 3);
        assert_eq!(st.accepts, 1);
        assert!((st.gain_up - 0.75).abs() < 1e-12);
        assert!((st.gain_down + 0.4).abs() < 1e-12);
        assert_eq!(st.last_direction, -1);
        assert!((st.mean_inner_delta() - 0.35 / 3.0).abs() < 1e-12);
    }
}
