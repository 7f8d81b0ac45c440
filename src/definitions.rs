//! Realism definitions document: the scoring thresholds, violation classes,
//! required telemetry, and gate tolerances.
//!
//! This file is the contract between the evaluator and the people curating
//! the realism envelope. The code treats every threshold as an opaque number;
//! changing the envelope means editing the JSON document, never the code.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Scoring thresholds. Field names follow the JSON document verbatim where
/// it uses camel case or short math-style names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thresholds {
    /// Checkpoint component weights.
    #[serde(rename = "wG")]
    pub w_geography: f64,
    #[serde(rename = "wC")]
    pub w_constraint: f64,
    #[serde(rename = "wK")]
    pub w_coupling: f64,
    #[serde(rename = "wR")]
    pub w_regime: f64,

    /// Capability level below which low-capability regime rules apply.
    #[serde(rename = "capability_T1")]
    pub capability_t1: f64,

    // Geography targets.
    pub settlement_target_share: f64,
    pub access_target_sum: f64,
    pub lat_entropy_target: f64,

    // Constraint targets.
    pub use_sigmoid_adequacy: bool,
    pub sigmoid_k: f64,
    pub shock_min_rate: f64,
    pub lowcap_growth_target: f64,
    pub lowcap_growth_tol: f64,
    pub rate_pop_base: f64,

    // Coupling.
    #[serde(rename = "coupling_lag_L")]
    pub coupling_lag_l: i64,
    pub response_ratio_target: f64,
    pub response_ratio_tol: f64,

    // Regime consistency.
    #[serde(rename = "corr_window_W")]
    pub corr_window_w: i64,
    pub lowcap_disease_corr_target: f64,
    pub lowcap_disease_corr_tol: f64,
    pub health_threshold: f64,
    pub disease_low_target: f64,
    pub disease_low_tol: f64,

    // Structural failure detection.
    pub extinction_pop_floor: f64,
    pub extinction_grace_years: f64,

    // Anti-loophole heuristics.
    #[serde(rename = "adequacy_var_window_N")]
    pub adequacy_var_window_n: i64,
    #[serde(rename = "VarMin")]
    pub var_min: f64,
    #[serde(rename = "storage_S1")]
    pub storage_s1: f64,
    #[serde(rename = "loss_L1")]
    pub loss_l1: f64,
    pub long_trade_share_max: f64,
    #[serde(rename = "logistics_R1")]
    pub logistics_r1: f64,
    #[serde(rename = "transport_C1")]
    pub transport_c1: f64,
    #[serde(rename = "depletion_monotonic_window_M")]
    pub depletion_monotonic_window_m: i64,

    // Penalty caps per violation class.
    #[serde(rename = "Pmax_major")]
    pub pmax_major: f64,
    #[serde(rename = "Pmax_medium")]
    pub pmax_medium: f64,
    #[serde(rename = "Pmax_minor")]
    pub pmax_minor: f64,

    // Objective shaping.
    #[serde(rename = "lambdaVar")]
    pub lambda_var: f64,
    #[serde(rename = "lambdaFail")]
    pub lambda_fail: f64,
    #[serde(rename = "targetStd")]
    pub target_std: f64,

    // Acceptance deltas.
    pub min_delta: f64,
    pub holdout_objective_min_delta: f64,
    pub holdout_hardfail_max: i64,
}

/// Composite-rate shock weights for the constraint component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShockRateWeights {
    pub a_famine: f64,
    pub b_epidemic: f64,
    pub c_war: f64,
}

fn default_version() -> String {
    "v7".to_string()
}

fn default_goals_version() -> String {
    "realism-envelope-v7".to_string()
}

/// The whole definitions document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealismDefs {
    pub thresholds: Thresholds,
    /// Violation ids that unconditionally block promotion.
    pub hard_fails: BTreeSet<String>,
    /// Violation ids of the score-gaming heuristics (medium penalty class).
    pub anti_loophole_ids: BTreeSet<String>,
    pub shock_rate_weights: ShockRateWeights,

    pub required_timeseries_columns: Vec<String>,
    pub required_run_meta_keys: Vec<String>,
    pub required_run_summary_keys: Vec<String>,

    /// Per-metric tolerance texts for the same-backend determinism check.
    pub canary_eps: BTreeMap<String, String>,
    /// Per-metric tolerance texts for the cpu/gpu parity check.
    pub parity_eps: BTreeMap<String, String>,

    #[serde(default = "default_goals_version")]
    pub goals_version: String,
    #[serde(default = "default_version")]
    pub evaluator_version: String,
    #[serde(default = "default_version")]
    pub definitions_version: String,
    #[serde(default = "default_version")]
    pub scoring_version: String,

    /// Raw thresholds table, echoed verbatim into each run's metadata so a
    /// stored run is traceable to the envelope it was scored under.
    #[serde(skip)]
    pub thresholds_raw: serde_json::Value,
}

impl RealismDefs {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read definitions: {}", path.display()))?;
        Self::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn from_str(text: &str) -> Result<Self> {
        let doc: serde_json::Value =
            serde_json::from_str(text).context("definitions are not valid JSON")?;
        let mut defs: Self =
            serde_json::from_value(doc.clone()).context("definitions document incomplete")?;
        defs.thresholds_raw = doc
            .get("thresholds")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        Ok(defs)
    }

    /// Penalty cap for a violation id: major for hard fails, medium for
    /// anti-loophole heuristics, minor otherwise.
    pub fn pmax_for(&self, id: &str) -> f64 {
        if self.hard_fails.contains(id) {
            self.thresholds.pmax_major
        } else if self.anti_loophole_ids.contains(id) {
            self.thresholds.pmax_medium
        } else {
            self.thresholds.pmax_minor
        }
    }
}

#[cfg(test)]
pub(crate) fn test_defs() -> RealismDefs {
    RealismDefs::from_str(TEST_DEFS_JSON).unwrap()
}

#[cfg(test)]
pub(crate) const TEST_DEFS_JSON: &str = r#"{
  "thresholds": {
    "wG": 0.25, "wC": 0.30, "wK": 0.25, "wR": 0.20,
    "capability_T1": 0.35,
    "settlement_target_share": 0.6,
    "access_target_sum": 0.7,
    "lat_entropy_target": 0.8,
    "use_sigmoid_adequacy": false,
    "sigmoid_k": 6.0,
    "shock_min_rate": 0.5,
    "lowcap_growth_target": 0.001,
    "lowcap_growth_tol": 0.004,
    "rate_pop_base": 1000000000.0,
    "coupling_lag_L": 1,
    "response_ratio_target": 1.0,
    "response_ratio_tol": 1.0,
    "corr_window_W": 4,
    "lowcap_disease_corr_target": 0.35,
    "lowcap_disease_corr_tol": 0.45,
    "health_threshold": 0.6,
    "disease_low_target": 0.004,
    "disease_low_tol": 0.004,
    "extinction_pop_floor": 1000.0,
    "extinction_grace_years": 100.0,
    "adequacy_var_window_N": 4,
    "VarMin": 0.0005,
    "storage_S1": 0.5,
    "loss_L1": 0.05,
    "long_trade_share_max": 0.25,
    "logistics_R1": 0.5,
    "transport_C1": 0.3,
    "depletion_monotonic_window_M": 4,
    "Pmax_major": 40.0,
    "Pmax_medium": 20.0,
    "Pmax_minor": 8.0,
    "lambdaVar": 0.5,
    "lambdaFail": 50.0,
    "targetStd": 6.0,
    "min_delta": 0.25,
    "holdout_objective_min_delta": -0.5,
    "holdout_hardfail_max": 0
  },
  "hard_fails": ["MISSING_METRIC", "BROKEN_ACCOUNTING", "EXTINCTION_PERSISTENT"],
  "anti_loophole_ids": ["STORAGE_SMOOTHING_CHEAT", "TRANSPORT_CHEAT", "DEPLETION_IGNORED"],
  "shock_rate_weights": {"a_famine": 0.4, "b_epidemic": 0.35, "c_war": 0.25},
  "required_timeseries_columns": [
    "year", "world_pop_total", "world_food_adequacy_index",
    "world_pop_growth_rate_annual", "world_trade_intensity",
    "world_urban_share_proxy", "world_tech_capability_index_median",
    "world_disease_death_rate", "famine_exposure_share_t", "migration_rate_t",
    "market_access_median", "habitable_cell_share_pop_gt_small",
    "pop_share_coastal_vs_inland", "pop_share_river_proximal",
    "pop_share_by_lat_band", "health_capability_index",
    "storage_capability_index", "logistics_capability_index",
    "transport_cost_index", "long_distance_trade_proxy", "spoilage_kcal",
    "storage_loss_kcal", "available_kcal_before_losses", "extraction_index",
    "famine_wave_count", "epidemic_wave_count", "major_war_count",
    "mass_migration_count"
  ],
  "required_run_meta_keys": ["seed", "config_hash", "start_year", "end_year", "backend"],
  "required_run_summary_keys": ["invariants"],
  "canary_eps": {
    "world_pop_total": "0 absolute",
    "event_rates_per_century_per_billion": "0 absolute"
  },
  "parity_eps": {
    "world_pop_total": "0.5% relative",
    "world_food_adequacy_index": "1e-6 absolute",
    "event_rates_per_century_per_billion": "2% relative"
  }
}"#;
