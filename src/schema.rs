//! Tuning schema document: the declarative description of what may be tuned
//! and how the loop is allowed to spend compute.
//!
//! The schema is a JSON file maintained alongside the simulator config. It
//! declares:
//!
//! | Section | Meaning |
//! |---|---|
//! | `parameters` | tunable knobs with bounds, step and subsystem group |
//! | `tuning_seeds` / `holdout_seeds` | the two disjoint seed sets |
//! | `tuning_year_window` | the year window every run must live inside |
//! | `frozen_scenario` | config paths pinned before any run |
//! | `tuning_curriculum` | inner/medium/long horizon end years and cadence |
//! | `optimization_accelerators` | racing, paired stats, cache, search, I/O |
//! | stop thresholds | convergence / target / plateau scalars |
//!
//! Everything optional carries the loop's default so a minimal schema with
//! just parameters and seeds is valid.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Value kind of a tunable parameter. Integer parameters step and clamp in
/// integer space so they never pick up a fractional part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Int,
    Float,
}

/// One tunable knob declared by the schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterDefinition {
    /// Dotted path into the simulator config, e.g. `food.baseFarming`.
    pub path: String,
    /// Subsystem group, e.g. `food`, `economy`, `disease`.
    pub group: String,
    #[serde(rename = "type")]
    pub kind: ParamKind,
    pub min: f64,
    pub max: f64,
    pub recommended_step: f64,
    /// Only parameters marked safe participate in automatic tuning.
    #[serde(default)]
    pub safe_to_auto_tune: bool,
}

/// Year window every tuning horizon must live inside.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowPolicy {
    pub start_year: i64,
    pub max_end_year: i64,
    pub enforce_start_year: bool,
    pub allow_shorter_end_year: bool,
}

impl Default for WindowPolicy {
    fn default() -> Self {
        Self {
            start_year: -5000,
            max_end_year: 2025,
            enforce_start_year: true,
            allow_shorter_end_year: true,
        }
    }
}

impl WindowPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.max_end_year < self.start_year {
            bail!(
                "invalid tuning_year_window: max_end_year ({}) < start_year ({})",
                self.max_end_year,
                self.start_year
            );
        }
        Ok(())
    }
}

/// Config paths pinned to fixed values before any baseline or candidate run,
/// so runs stay comparable across iterations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FrozenScenario {
    pub enabled: bool,
    pub required_paths: BTreeMap<String, serde_json::Value>,
}

impl FrozenScenario {
    /// Overrides to apply, in stable path order; empty when disabled.
    pub fn overrides(&self) -> Vec<(String, serde_json::Value)> {
        if !self.enabled {
            return Vec::new();
        }
        self.required_paths
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Horizon curriculum: cheap inner windows every iteration, medium checks on
/// a cadence, long windows only for promotion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CurriculumSpec {
    pub enabled: bool,
    pub inner_end_year: Option<i64>,
    pub medium_end_year: Option<i64>,
    pub long_end_year: Option<i64>,
    pub medium_check_every_iterations: u32,
    pub medium_check_every_accepted: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrnConfig {
    pub enabled: bool,
}

impl Default for CrnConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RacingConfig {
    pub enabled: bool,
    pub stage_seed_counts: Vec<usize>,
    pub early_reject_margin: f64,
}

impl Default for RacingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stage_seed_counts: vec![2],
            early_reject_margin: 0.75,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PairedConfig {
    pub enabled: bool,
    pub confidence_z: f64,
    pub min_inner_lcb_delta: f64,
    pub min_long_lcb_delta: f64,
    pub min_holdout_lcb_delta: f64,
}

impl Default for PairedConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_z: 1.96,
            min_inner_lcb_delta: 0.0,
            min_long_lcb_delta: 0.0,
            min_holdout_lcb_delta: -1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunCacheConfig {
    pub enabled: bool,
    pub cache_subdir: String,
    pub reuse_existing_seed_dirs: bool,
    pub materialize_from_cache: bool,
}

impl Default for RunCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_subdir: "run_cache".to_string(),
            reuse_existing_seed_dirs: true,
            materialize_from_cache: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IoConfig {
    pub write_eval_artifacts_for_inner: bool,
    pub write_eval_artifacts_for_holdout: bool,
    pub prune_rejected_iterations: bool,
    pub keep_candidate_if_rejected: bool,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            write_eval_artifacts_for_inner: false,
            write_eval_artifacts_for_holdout: true,
            prune_rejected_iterations: true,
            keep_candidate_if_rejected: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub two_lane_enabled: bool,
    pub ucb_explore_coeff: f64,
    pub random_seed: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            two_lane_enabled: true,
            ucb_explore_coeff: 0.75,
            random_seed: 1337,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeHygiene {
    pub auto_seed_jobs_from_cpu: bool,
    pub reserve_cpu_cores: usize,
    pub pin_single_thread_env: bool,
}

impl Default for RuntimeHygiene {
    fn default() -> Self {
        Self {
            auto_seed_jobs_from_cpu: true,
            reserve_cpu_cores: 1,
            pin_single_thread_env: true,
        }
    }
}

impl RuntimeHygiene {
    /// Environment pinning child math libraries to one thread each; the
    /// parallelism budget belongs to the seed pool, not the children.
    pub fn child_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if self.pin_single_thread_env {
            for key in [
                "OMP_NUM_THREADS",
                "OPENBLAS_NUM_THREADS",
                "MKL_NUM_THREADS",
                "NUMEXPR_NUM_THREADS",
            ] {
                env.insert(key.to_string(), "1".to_string());
            }
        }
        env
    }

    /// Effective seed-parallel job count: the requested count clamped to the
    /// machine's cores minus the reserved margin.
    pub fn effective_jobs(&self, requested: usize) -> usize {
        let requested = requested.max(1);
        if !self.auto_seed_jobs_from_cpu {
            return requested;
        }
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        requested.min(cores.saturating_sub(self.reserve_cpu_cores).max(1))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Accelerators {
    pub common_random_numbers: CrnConfig,
    pub adaptive_racing: RacingConfig,
    pub paired_acceptance: PairedConfig,
    pub run_cache: RunCacheConfig,
    pub io: IoConfig,
    pub search: SearchConfig,
    pub runtime_hygiene: RuntimeHygiene,
}

/// The whole schema document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningSchema {
    pub parameters: Vec<ParameterDefinition>,
    pub tuning_seeds: Vec<u64>,
    pub holdout_seeds: Vec<u64>,
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every_years: i64,
    #[serde(default)]
    pub tuning_year_window: WindowPolicy,
    #[serde(default)]
    pub frozen_scenario: FrozenScenario,
    #[serde(default)]
    pub tuning_curriculum: CurriculumSpec,
    #[serde(default)]
    pub optimization_accelerators: Accelerators,
    #[serde(default = "default_convergence_iterations")]
    pub convergence_iterations: u32,
    #[serde(default = "default_major_violation_threshold")]
    pub major_violation_threshold: f64,
    #[serde(default = "default_target_objective")]
    pub target_objective: f64,
    #[serde(default = "default_plateau_iterations")]
    pub plateau_iterations_structural: u32,
}

fn default_checkpoint_every() -> i64 {
    50
}

fn default_convergence_iterations() -> u32 {
    50
}

fn default_major_violation_threshold() -> f64 {
    50.0
}

fn default_target_objective() -> f64 {
    90.0
}

fn default_plateau_iterations() -> u32 {
    8
}

impl TuningSchema {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read schema: {}", path.display()))?;
        let schema: Self = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse schema: {}", path.display()))?;
        if schema.tuning_seeds.is_empty() {
            bail!("schema declares no tuning_seeds");
        }
        if schema.holdout_seeds.is_empty() {
            bail!("schema declares no holdout_seeds");
        }
        schema.tuning_year_window.validate()?;
        Ok(schema)
    }

    /// Parameters eligible for automatic tuning, in declaration order.
    pub fn tunable_params(&self) -> Vec<ParameterDefinition> {
        self.parameters
            .iter()
            .filter(|p| p.safe_to_auto_tune)
            .cloned()
            .collect()
    }

    /// Distinct subsystem groups of the tunable parameters, first-seen order.
    pub fn tunable_groups(&self) -> Vec<String> {
        let mut groups = Vec::new();
        for p in self.parameters.iter().filter(|p| p.safe_to_auto_tune) {
            if !groups.contains(&p.group) {
                groups.push(p.group.clone());
            }
        }
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_schema() -> TuningSchema {
        serde_json::from_value(serde_json::json!({
            "parameters": [
                {"path": "food.baseFarming", "group": "food", "type": "float",
                 "min": 0.5, "max": 3.0, "recommended_step": 0.1,
                 "safe_to_auto_tune": true},
                {"path": "world.gridSize", "group": "world", "type": "int",
                 "min": 64, "max": 512, "recommended_step": 32}
            ],
            "tuning_seeds": [11, 7, 23],
            "holdout_seeds": [101, 103]
        }))
        .unwrap()
    }

    #[test]
    fn test_defaults_fill_optional_sections() {
        let s = minimal_schema();
        assert_eq!(s.checkpoint_every_years, 50);
        assert_eq!(s.tuning_year_window.start_year, -5000);
        assert_eq!(s.tuning_year_window.max_end_year, 2025);
        assert!(s.optimization_accelerators.adaptive_racing.enabled);
        assert!((s.optimization_accelerators.paired_acceptance.confidence_z - 1.96).abs() < 1e-12);
        assert!(
            (s.optimization_accelerators.paired_acceptance.min_holdout_lcb_delta + 1.0).abs()
                < 1e-12
        );
        assert_eq!(s.optimization_accelerators.search.random_seed, 1337);
        assert!((s.target_objective - 90.0).abs() < 1e-12);
    }

    #[test]
    fn test_only_safe_parameters_are_tunable() {
        let s = minimal_schema();
        let tunable = s.tunable_params();
        assert_eq!(tunable.len(), 1);
        assert_eq!(tunable[0].path, "food.baseFarming");
        assert_eq!(tunable[0].kind, ParamKind::Float);
        assert_eq!(s.tunable_groups(), vec!["food".to_string()]);
    }

    #[test]
    fn test_window_policy_rejects_inverted_window() {
        let policy = WindowPolicy {
            start_year: 100,
            max_end_year: -100,
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_frozen_scenario_overrides_only_when_enabled() {
        let mut frozen = FrozenScenario::default();
        frozen
            .required_paths
            .insert("world.spawnMode".into(), serde_json::json!("fixed"));
        assert!(frozen.overrides().is_empty());
        frozen.enabled = true;
        assert_eq!(frozen.overrides().len(), 1);
    }

    #[test]
    fn test_effective_jobs_clamps_to_cores() {
        let rt = RuntimeHygiene {
            auto_seed_jobs_from_cpu: true,
            reserve_cpu_cores: 0,
            pin_single_thread_env: true,
        };
        // Never exceeds the request, never drops to zero.
        assert!(rt.effective_jobs(1) == 1);
        assert!(rt.effective_jobs(4) <= 4);
        assert!(rt.effective_jobs(10_000) >= 1);

        let manual = RuntimeHygiene {
            auto_seed_jobs_from_cpu: false,
            ..rt
        };
        assert_eq!(manual.effective_jobs(10_000), 10_000);
    }

    #[test]
    fn test_child_env_pins_math_libraries() {
        let env = RuntimeHygiene::default().child_env();
        assert_eq!(env.get("OMP_NUM_THREADS").map(String::as_str), Some("1"));
        assert_eq!(env.len(), 4);
    }
}
