//! Session state and per-iteration records.
//!
//! [`TuningState`] is the single mutable aggregate of the loop: the best
//! configuration's identity, per-horizon best objectives, the bandit
//! statistics, and the stop counters. It is persisted atomically (write to a
//! temp file, then rename) after every iteration so a crashed session can be
//! inspected and resumed from its artifacts.
//!
//! [`IterationRecord`] is the append-only audit trail: one JSON document per
//! iteration holding everything the decision depended on.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::curriculum::HorizonPlan;
use crate::gates::MetricCheck;
use crate::propose::Lane;
use crate::racing::{EarlyRejectReason, StageRecord};
use crate::stats::PairedStats;
use crate::stop::StopReason;
use crate::types::{ObjectiveAggregate, ParamStats};

/// Best-so-far objectives for one horizon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HorizonBest {
    pub objective: f64,
    pub holdout_objective: f64,
    pub top3: Vec<String>,
    pub end_year: i64,
}

/// The loop's whole mutable state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TuningState {
    pub iteration: u32,
    pub best_config_hash16: String,
    pub inner: HorizonBest,
    pub medium: HorizonBest,
    pub long: HorizonBest,
    /// Long-horizon violation signature of the best configuration.
    pub best_top3: Vec<String>,
    pub accepted_iters: u32,
    pub accepted_since_improve: u32,
    pub plateau_same_top3: u32,
    pub consecutive_gate_fail: u32,
    pub total_param_attempts: u64,
    pub param_stats: BTreeMap<String, ParamStats>,
    /// Inner-horizon signature of the previous iteration, for plateau
    /// detection.
    pub prev_top3_inner: Vec<String>,
    /// Signature feeding the next iteration's direction heuristic.
    pub proposal_top3: Vec<String>,
    pub stop_reason: Option<StopReason>,
}

impl TuningState {
    /// Persist atomically: the state file is either the old version or the
    /// new one, never a torn write.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp = path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(self).context("failed to serialize state")?;
        std::fs::write(&tmp, text).with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to replace {}", path.display()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
    }
}

/// One lane's scouting outcome.
#[derive(Debug, Clone, Serialize)]
pub struct LaneScout {
    pub lane: Lane,
    pub group: String,
    pub path: String,
    pub old: toml::Value,
    pub new: toml::Value,
    pub scout_objective: f64,
    pub scout_delta_vs_incumbent: f64,
    pub scout_paired: PairedStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParameterEdit {
    pub path: String,
    pub old: toml::Value,
    pub new: toml::Value,
    pub recommended_step: f64,
    pub direction: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RacingReport {
    pub enabled: bool,
    pub stages: Vec<StageRecord>,
    pub early_reject: bool,
    pub early_reject_reason: Option<EarlyRejectReason>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PairedReport {
    pub inner: PairedStats,
    pub long: PairedStats,
    pub holdout: PairedStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct GateReport {
    pub metric_availability: bool,
    pub canary_pass: bool,
    pub backend_parity_pass: bool,
    pub medium_required: bool,
    pub medium_pass: bool,
    pub long_ran: bool,
    pub holdout_pass: bool,
    pub tuning_hardfails: Vec<String>,
    pub medium_hardfails: Vec<String>,
    pub medium_holdout_hardfails: Vec<String>,
    pub long_hardfails: Vec<String>,
    pub holdout_hardfails: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BestSnapshot {
    pub objective: f64,
    pub holdout_objective: f64,
    pub config_path: String,
    pub config_hash16: String,
}

/// The complete audit record of one iteration.
#[derive(Debug, Clone, Serialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub subsystem_group: String,
    pub selected_lane: Lane,
    pub lane_scout: Vec<LaneScout>,
    pub parameter_edits: Vec<ParameterEdit>,
    pub top_violations_before: Vec<String>,
    pub top_violations_after: Vec<String>,
    pub top_violations_after_long: Option<Vec<String>>,
    pub objective_tuning: f64,
    pub objective_tuning_inner: f64,
    pub objective_tuning_medium: Option<f64>,
    pub objective_tuning_long: Option<f64>,
    pub score_delta: f64,
    pub score_delta_inner: f64,
    pub score_delta_medium: Option<f64>,
    pub racing: RacingReport,
    pub paired_stats: PairedReport,
    pub gates: GateReport,
    pub holdout_objective: Option<f64>,
    pub accepted: bool,
    pub best_so_far: BestSnapshot,
    pub canary_detail: Vec<MetricCheck>,
    pub parity_detail: Vec<MetricCheck>,
    pub curriculum: HorizonPlan,
}

/// Aggregates for one horizon of the baseline document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineHorizon {
    pub end_year: i64,
    pub tuning: ObjectiveAggregate,
    pub holdout: ObjectiveAggregate,
    pub top3: Vec<String>,
}

/// `baseline_objective.json`: the incumbent's objectives per horizon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineObjective {
    pub inner: BaselineHorizon,
    pub medium: BaselineHorizon,
    pub long: BaselineHorizon,
}

/// `baseline_gates.json`: the incumbent's determinism/parity outcome.
#[derive(Debug, Clone, Serialize)]
pub struct BaselineGates {
    pub horizon_end_year: i64,
    pub canary_pass: bool,
    pub canary: Vec<MetricCheck>,
    pub parity_pass: bool,
    pub parity: Vec<MetricCheck>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trips_atomically() {
        let path = std::env::temp_dir().join(format!(
            "worldtune_state_{}/tuning_state.json",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());

        let mut state = TuningState {
            iteration: 12,
            best_config_hash16: "feedbeeffeedbeef".into(),
            accepted_iters: 3,
            best_top3: vec!["TRANSPORT_CHEAT".into()],
            ..Default::default()
        };
        state.long.objective = 71.5;
        state
            .param_stats
            .entry("food.baseFarming".into())
            .or_default()
            .record(1, 0.4, 0.2, true);

        state.save(&path).unwrap();
        // The temp file never survives a successful save.
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = TuningState::load(&path).unwrap();
        assert_eq!(loaded.iteration, 12);
        assert_eq!(loaded.accepted_iters, 3);
        assert!((loaded.long.objective - 71.5).abs() < 1e-12);
        assert_eq!(loaded.param_stats["food.baseFarming"].accepts, 1);

        // A second save replaces, not appends.
        state.iteration = 13;
        state.save(&path).unwrap();
        assert_eq!(TuningState::load(&path).unwrap().iteration, 13);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
