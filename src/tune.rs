//! The tuning loop: baseline, iterate, stop, report.
//!
//! Each iteration walks one fixed pipeline:
//!
//! 1. propose one candidate per search lane and scout both on the first
//!    racing stage's seeds,
//! 2. race the winning lane through growing seed subsets with early reject,
//! 3. gate on hard fails, minimum improvement, canary and parity,
//! 4. climb the curriculum: medium checkpoint when due, long-horizon
//!    promotion, holdout validation,
//! 5. accept or reject, update bandit statistics, persist state and the
//!    iteration record, then consult the stop monitor.
//!
//! Acceptance is deliberately conservative: a candidate must clear every
//! gate in the same iteration. The incumbent configuration and its per-seed
//! evaluations are the comparison baseline for the next iteration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;

use crate::cancel::CancelToken;
use crate::config::SimConfig;
use crate::curriculum::HorizonPlan;
use crate::definitions::RealismDefs;
use crate::gates::{compare_metric_series, MetricCheck};
use crate::objective::{aggregate_objective, eval_map_by_seed, violation_signature};
use crate::progress;
use crate::propose::{propose_exploit, propose_explore, Candidate};
use crate::racing::{
    normalized_stage_counts, paired_delta_stats, should_reject_early, StageRecord,
};
use crate::runner::{RunCachePolicy, Runner, SimulatorInvoker};
use crate::schema::TuningSchema;
use crate::state::{
    BaselineGates, BaselineHorizon, BaselineObjective, BestSnapshot, GateReport, IterationRecord,
    LaneScout, PairedReport, ParameterEdit, RacingReport, TuningState,
};
use crate::stats::PairedStats;
use crate::stop::{StopInputs, StopMonitor, StopReason};
use crate::telemetry::{load_json, write_json};
use crate::types::{Backend, SeedEval};

/// Session-level options from the command line.
#[derive(Debug, Clone)]
pub struct TunerOptions {
    pub config_path: PathBuf,
    pub schema_path: PathBuf,
    pub definitions_path: PathBuf,
    pub out_root: PathBuf,
    pub max_iterations: u32,
    pub seed_jobs: usize,
    pub force_rebaseline: bool,
    pub write_live_config: bool,
}

/// One fully-initialized tuning session.
pub struct Tuner {
    opts: TunerOptions,
    schema: TuningSchema,
    defs: RealismDefs,
    plan: HorizonPlan,
    invoker: Box<dyn SimulatorInvoker>,
    cancel: CancelToken,
    tuning_seeds: Vec<u64>,
    holdout_seeds: Vec<u64>,
    stage_counts: Vec<usize>,
    cache: RunCachePolicy,
    jobs: usize,
    backend: Backend,
    rng: StdRng,
    monitor: StopMonitor,
    it_root: PathBuf,
    best_cfg_path: PathBuf,
    /// Incumbent configuration; replaced only on acceptance.
    best_cfg: SimConfig,
}

/// The mutable per-session evaluation context beside [`TuningState`]: the
/// incumbent's per-seed evaluations per horizon.
struct Incumbent {
    inner_by_seed: BTreeMap<u64, SeedEval>,
    long_by_seed: BTreeMap<u64, SeedEval>,
    holdout_by_seed: BTreeMap<u64, SeedEval>,
}

/// Minimum-improvement gate shared by the inner and long horizons.
fn improvement_ok(
    delta: f64,
    pair: Option<&PairedStats>,
    min_delta: f64,
    min_lcb_delta: f64,
) -> bool {
    delta >= min_delta && pair.map(|p| p.lcb >= min_lcb_delta).unwrap_or(true)
}

impl Tuner {
    pub fn new(
        opts: TunerOptions,
        invoker: Box<dyn SimulatorInvoker>,
        cancel: CancelToken,
    ) -> Result<Self> {
        let schema = TuningSchema::load(&opts.schema_path)?;
        let defs = RealismDefs::load(&opts.definitions_path)?;
        let mut cfg = SimConfig::load(&opts.config_path)?;

        let frozen = schema.frozen_scenario.overrides();
        let applied = cfg.apply_overrides(&frozen)?;
        if !applied.is_empty() {
            progress::headline(
                "startup",
                &format!("applied {} frozen scenario override(s) from schema", applied.len()),
            );
        }

        let cfg_start = cfg.get_i64("world.startYear").unwrap_or(-5000);
        let cfg_end = cfg.get_i64("world.endYear").unwrap_or(2025);
        let plan = HorizonPlan::resolve(
            &schema.tuning_year_window,
            &schema.tuning_curriculum,
            cfg_start,
            cfg_end,
        )?;
        // Pin the candidate configs to the active window so the simulator
        // never warms up from eras outside policy bounds.
        cfg.set("world.startYear", toml::Value::Integer(plan.start_year))?;
        cfg.set(
            "world.endYear",
            toml::Value::Integer(plan.policy_max_end_year),
        )?;

        let accel = &schema.optimization_accelerators;
        let mut tuning_seeds = schema.tuning_seeds.clone();
        let mut holdout_seeds = schema.holdout_seeds.clone();
        if accel.common_random_numbers.enabled {
            tuning_seeds.sort_unstable();
            holdout_seeds.sort_unstable();
        }
        let stage_counts =
            normalized_stage_counts(&accel.adaptive_racing.stage_seed_counts, tuning_seeds.len());

        let cache = RunCachePolicy {
            enabled: accel.run_cache.enabled,
            cache_root: opts.out_root.join(&accel.run_cache.cache_subdir),
            reuse_existing_seed_dirs: accel.run_cache.reuse_existing_seed_dirs,
            materialize_from_cache: accel.run_cache.materialize_from_cache,
        };
        let jobs = accel.runtime_hygiene.effective_jobs(opts.seed_jobs);
        let backend = Backend::from_use_gpu(cfg.get_bool("economy.useGPU").unwrap_or(false));
        let rng = StdRng::seed_from_u64(accel.search.random_seed);
        let monitor = StopMonitor {
            convergence_iterations: schema.convergence_iterations,
            target_objective: schema.target_objective,
            major_violation_threshold: schema.major_violation_threshold,
            plateau_iterations_structural: schema.plateau_iterations_structural,
        };

        let it_root = opts.out_root.join("iterations");
        std::fs::create_dir_all(&it_root)
            .with_context(|| format!("failed to create {}", it_root.display()))?;
        let best_cfg_path = opts.out_root.join("best_sim_config.toml");
        cfg.write(&best_cfg_path)?;

        progress::headline("startup", &format!("output_dir={}", opts.out_root.display()));
        progress::stage(
            "startup",
            &format!(
                "tuning_seeds={tuning_seeds:?} holdout_seeds={holdout_seeds:?} seed_jobs={jobs}"
            ),
        );
        progress::stage(
            "startup",
            &format!(
                "tuning_window policy=[{}, {}] effective=[{}, {}]",
                plan.policy_start_year, plan.policy_max_end_year, plan.start_year, plan.end_year
            ),
        );
        progress::stage(
            "startup",
            &format!(
                "horizons inner={} medium={} long={}",
                plan.inner_end_year,
                if plan.medium_enabled {
                    plan.medium_end_year.to_string()
                } else {
                    "disabled".to_string()
                },
                plan.long_end_year
            ),
        );

        write_json(
            &opts.out_root.join("tuning_policy.json"),
            &json!({
                "tuning_year_window": {
                    "policy_start_year": plan.policy_start_year,
                    "policy_max_end_year": plan.policy_max_end_year,
                    "effective_start_year": plan.start_year,
                    "effective_end_year": plan.end_year,
                },
                "frozen_scenario": {
                    "enabled": schema.frozen_scenario.enabled,
                    "required_paths": schema.frozen_scenario.required_paths,
                    "applied_overrides": applied,
                },
                "accelerators": {
                    "common_random_numbers": accel.common_random_numbers,
                    "adaptive_racing": {
                        "enabled": accel.adaptive_racing.enabled,
                        "stage_seed_counts": stage_counts,
                        "early_reject_margin": accel.adaptive_racing.early_reject_margin,
                    },
                    "paired_acceptance": accel.paired_acceptance,
                    "run_cache": accel.run_cache,
                    "io": accel.io,
                    "search": accel.search,
                    "runtime_hygiene": {
                        "reserve_cpu_cores": accel.runtime_hygiene.reserve_cpu_cores,
                        "pin_single_thread_env": accel.runtime_hygiene.pin_single_thread_env,
                        "seed_jobs": jobs,
                    },
                },
            }),
        )?;

        Ok(Self {
            opts,
            schema,
            defs,
            plan,
            invoker,
            cancel,
            tuning_seeds,
            holdout_seeds,
            stage_counts,
            cache,
            jobs,
            backend,
            rng,
            monitor,
            it_root,
            best_cfg_path,
            best_cfg: cfg,
        })
    }

    fn runner(&self) -> Runner<'_> {
        Runner {
            invoker: self.invoker.as_ref(),
            defs: &self.defs,
            cache: self.cache.clone(),
            jobs: self.jobs,
            checkpoint_every: self.schema.checkpoint_every_years,
        }
    }

    fn write_eval_inner(&self) -> bool {
        self.schema
            .optimization_accelerators
            .io
            .write_eval_artifacts_for_inner
    }

    fn write_eval_holdout(&self) -> bool {
        self.schema
            .optimization_accelerators
            .io
            .write_eval_artifacts_for_holdout
    }

    /// Run the whole session; returns the stop condition.
    pub fn run(&mut self) -> Result<StopReason> {
        let (baseline, baseline_gates, mut incumbent) = self.baseline()?;

        let mut state = TuningState {
            best_config_hash16: self.best_cfg.hash16(),
            inner: crate::state::HorizonBest {
                objective: baseline.inner.tuning.objective,
                holdout_objective: baseline.inner.holdout.objective,
                top3: baseline.inner.top3.clone(),
                end_year: self.plan.inner_end_year,
            },
            medium: crate::state::HorizonBest {
                objective: baseline.medium.tuning.objective,
                holdout_objective: baseline.medium.holdout.objective,
                top3: baseline.medium.top3.clone(),
                end_year: self.plan.medium_end_year,
            },
            long: crate::state::HorizonBest {
                objective: baseline.long.tuning.objective,
                holdout_objective: baseline.long.holdout.objective,
                top3: baseline.long.top3.clone(),
                end_year: self.plan.long_end_year,
            },
            best_top3: baseline.long.top3.clone(),
            prev_top3_inner: baseline.inner.top3.clone(),
            proposal_top3: if baseline.long.top3.is_empty() {
                baseline.inner.top3.clone()
            } else {
                baseline.long.top3.clone()
            },
            ..Default::default()
        };
        for p in self.schema.tunable_params() {
            state.param_stats.entry(p.path).or_default();
        }
        progress::headline(
            "baseline",
            &format!(
                "complete inner_obj={:.6} long_obj={:.6} long_holdout={:.6} top3={:?} canary={} parity={}",
                state.inner.objective,
                state.long.objective,
                state.long.holdout_objective,
                state.best_top3,
                baseline_gates.0,
                baseline_gates.1,
            ),
        );

        let state_path = self.opts.out_root.join("tuning_state.json");
        state.save(&state_path)?;
        let mut stop_reason = None;
        for it in 1..=self.opts.max_iterations {
            if self.cancel.is_cancelled() {
                stop_reason = Some(StopReason::ManualStop);
                break;
            }
            state.iteration = it;
            let reason = self.iterate(it, &mut state, &mut incumbent)?;
            state.save(&state_path)?;
            if reason.is_some() {
                stop_reason = reason;
                break;
            }
        }

        let stop_reason = stop_reason.unwrap_or(StopReason::MaxIterations);
        state.stop_reason = Some(stop_reason);
        state.save(&state_path)?;
        self.finish(&state, stop_reason)?;
        Ok(stop_reason)
    }

    /// Evaluate one seed set for the incumbent or a candidate config.
    #[allow(clippy::too_many_arguments)]
    fn run_set(
        &self,
        seeds: &[u64],
        config: &SimConfig,
        config_path: &Path,
        out_dir: &Path,
        end_year: i64,
        backend: Backend,
        label: &str,
        write_eval: bool,
    ) -> Result<Vec<SeedEval>> {
        self.runner().run_seed_set(
            seeds,
            config,
            config_path,
            out_dir,
            self.plan.start_year,
            end_year,
            backend,
            label,
            write_eval,
        )
    }

    /// Same-backend determinism and cross-backend parity checks for one
    /// config, on the inner horizon with the first tuning seed.
    fn canary_parity(
        &self,
        config: &SimConfig,
        config_path: &Path,
        dir: &Path,
        label: &str,
        write_eval: bool,
    ) -> Result<(bool, Vec<MetricCheck>, bool, Vec<MetricCheck>)> {
        let probe = [self.tuning_seeds[0]];
        let end = self.plan.inner_end_year;
        let a = self.run_set(
            &probe,
            config,
            config_path,
            &dir.join("canary").join("a"),
            end,
            self.backend,
            &format!("{label}:canary:a"),
            write_eval,
        )?;
        let b = self.run_set(
            &probe,
            config,
            config_path,
            &dir.join("canary").join("b"),
            end,
            self.backend,
            &format!("{label}:canary:b"),
            write_eval,
        )?;
        let (canary_ok, canary_detail) =
            compare_metric_series(&a[0], &b[0], &self.defs.canary_eps)?;

        let gpu = self.run_set(
            &probe,
            config,
            config_path,
            &dir.join("parity").join("gpu"),
            end,
            Backend::Gpu,
            &format!("{label}:parity:gpu"),
            write_eval,
        )?;
        let cpu = self.run_set(
            &probe,
            config,
            config_path,
            &dir.join("parity").join("cpu"),
            end,
            Backend::Cpu,
            &format!("{label}:parity:cpu"),
            write_eval,
        )?;
        let (parity_ok, parity_detail) =
            compare_metric_series(&gpu[0], &cpu[0], &self.defs.parity_eps)?;
        Ok((canary_ok, canary_detail, parity_ok, parity_detail))
    }

    /// Establish (or reuse) the incumbent's objectives, gates, and per-seed
    /// evaluations. Returns the baseline document, the (canary, parity)
    /// flags, and the incumbent evaluation maps.
    fn baseline(&self) -> Result<(BaselineObjective, (bool, bool), Incumbent)> {
        let out_root = self.opts.out_root.clone();
        let baseline_dir = out_root.join("baseline");
        let obj_path = out_root.join("baseline_objective.json");
        let gates_path = out_root.join("baseline_gates.json");

        if !self.opts.force_rebaseline && obj_path.exists() && gates_path.exists() {
            if let Some(reused) = self.try_reuse_baseline(&baseline_dir, &obj_path, &gates_path)? {
                progress::stage(
                    "baseline",
                    "reusing cached baseline_objective.json and baseline_gates.json",
                );
                return Ok(reused);
            }
            progress::warn(
                "baseline",
                "cached objective exists but seed artifacts are incomplete; recomputing baseline",
            );
        }

        let horizon =
            |label: &str, end_year: i64| -> Result<(BaselineHorizon, Vec<SeedEval>, Vec<SeedEval>)> {
                progress::stage("baseline", &format!("running baseline {label} horizon (end={end_year})"));
                let tune = self.run_set(
                    &self.tuning_seeds.clone(),
                    &self.best_cfg,
                    &self.best_cfg_path,
                    &baseline_dir.join(label).join("tuning"),
                    end_year,
                    self.backend,
                    &format!("baseline:{label}:tuning"),
                    true,
                )?;
                let hold = self.run_set(
                    &self.holdout_seeds.clone(),
                    &self.best_cfg,
                    &self.best_cfg_path,
                    &baseline_dir.join(label).join("holdout"),
                    end_year,
                    self.backend,
                    &format!("baseline:{label}:holdout"),
                    true,
                )?;
                let summary = BaselineHorizon {
                    end_year,
                    tuning: aggregate_objective(&tune, &self.defs.thresholds),
                    holdout: aggregate_objective(&hold, &self.defs.thresholds),
                    top3: violation_signature(&tune),
                };
                progress::stage(
                    "baseline",
                    &format!(
                        "{label} objective={:.6} holdout={:.6} top3={:?}",
                        summary.tuning.objective, summary.holdout.objective, summary.top3
                    ),
                );
                Ok((summary, tune, hold))
            };

        let (inner, inner_tune, _inner_hold) = horizon("inner", self.plan.inner_end_year)?;
        let medium = if self.plan.medium_enabled {
            horizon("medium", self.plan.medium_end_year)?.0
        } else {
            // With the medium stage disabled its baseline aliases inner.
            inner.clone()
        };
        let (long, long_tune, long_hold) = horizon("long", self.plan.long_end_year)?;

        let baseline = BaselineObjective {
            inner,
            medium,
            long,
        };
        write_json(&obj_path, &baseline)?;

        progress::stage("baseline", "running canary/parity checks (inner horizon)");
        let (canary_ok, canary_detail, parity_ok, parity_detail) = self.canary_parity(
            &self.best_cfg,
            &self.best_cfg_path,
            &baseline_dir,
            "baseline",
            true,
        )?;
        write_json(
            &gates_path,
            &BaselineGates {
                horizon_end_year: self.plan.inner_end_year,
                canary_pass: canary_ok,
                canary: canary_detail,
                parity_pass: parity_ok,
                parity: parity_detail,
            },
        )?;

        let incumbent = Incumbent {
            inner_by_seed: eval_map_by_seed(&inner_tune),
            long_by_seed: eval_map_by_seed(&long_tune),
            holdout_by_seed: eval_map_by_seed(&long_hold),
        };
        Ok((baseline, (canary_ok, parity_ok), incumbent))
    }

    /// Reload a cached baseline; `None` when the document or any seed
    /// artifact set is unusable.
    fn try_reuse_baseline(
        &self,
        baseline_dir: &Path,
        obj_path: &Path,
        gates_path: &Path,
    ) -> Result<Option<(BaselineObjective, (bool, bool), Incumbent)>> {
        let Ok(text) = std::fs::read_to_string(obj_path) else {
            return Ok(None);
        };
        let Ok(baseline) = serde_json::from_str::<BaselineObjective>(&text) else {
            return Ok(None);
        };
        let gates = load_json(gates_path).unwrap_or(serde_json::Value::Null);
        let canary = gates
            .get("canary_pass")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let parity = gates
            .get("parity_pass")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let runner = self.runner();
        let inner = runner.load_seed_set_from_existing(
            &self.tuning_seeds,
            &baseline_dir.join("inner").join("tuning"),
        )?;
        let long = runner.load_seed_set_from_existing(
            &self.tuning_seeds,
            &baseline_dir.join("long").join("tuning"),
        )?;
        let hold = runner.load_seed_set_from_existing(
            &self.holdout_seeds,
            &baseline_dir.join("long").join("holdout"),
        )?;
        match (inner, long, hold) {
            (Some(inner), Some(long), Some(hold)) => Ok(Some((
                baseline,
                (canary, parity),
                Incumbent {
                    inner_by_seed: eval_map_by_seed(&inner),
                    long_by_seed: eval_map_by_seed(&long),
                    holdout_by_seed: eval_map_by_seed(&hold),
                },
            ))),
            _ => Ok(None),
        }
    }

    /// One full iteration. Returns the stop reason when the monitor fires.
    fn iterate(
        &mut self,
        it: u32,
        state: &mut TuningState,
        incumbent: &mut Incumbent,
    ) -> Result<Option<StopReason>> {
        let accel = self.schema.optimization_accelerators.clone();
        let paired = &accel.paired_acceptance;
        let racing = &accel.adaptive_racing;
        let min_delta = self.defs.thresholds.min_delta;
        let holdout_delta_req = self.defs.thresholds.holdout_objective_min_delta;
        let label = format!("iter {it:03}");
        let it_dir = self.it_root.join(format!("iter_{it:03}"));
        std::fs::create_dir_all(&it_dir)
            .with_context(|| format!("failed to create {}", it_dir.display()))?;

        let top3_before = state.proposal_top3.clone();
        let pdefs = self.schema.tunable_params();

        // Lane proposals.
        let mut lanes: Vec<Candidate> = Vec::new();
        let exploit = propose_exploit(
            &self.best_cfg,
            &pdefs,
            &state.param_stats,
            state.total_param_attempts,
            &state.proposal_top3,
            it,
            accel.search.ucb_explore_coeff,
        )?;
        let exploit_path = exploit.pdef.path.clone();
        lanes.push(exploit);
        if accel.search.two_lane_enabled && pdefs.len() > 1 {
            lanes.push(propose_explore(
                &self.best_cfg,
                &pdefs,
                &state.proposal_top3,
                it,
                &mut self.rng,
                Some(&exploit_path),
            )?);
        }

        // Scout every lane on the first stage's seeds and keep the best.
        let scout_seeds: Vec<u64> = self.tuning_seeds[..self.stage_counts[0]].to_vec();
        let mut lane_scout_rows: Vec<LaneScout> = Vec::new();
        let mut selected: Option<(Candidate, SimConfig, PathBuf, BTreeMap<u64, SeedEval>)> = None;
        let mut best_scout_delta = f64::NEG_INFINITY;
        for lane in lanes {
            let mut lane_cfg = self.best_cfg.clone();
            lane_cfg.set(&lane.pdef.path, lane.new.clone())?;
            let lane_cfg_path = it_dir.join(format!("candidate_{}.toml", lane.lane));
            lane_cfg.write(&lane_cfg_path)?;
            let scout = self.run_set(
                &scout_seeds,
                &lane_cfg,
                &lane_cfg_path,
                &it_dir.join("lanes").join(lane.lane.to_string()).join("scout"),
                self.plan.inner_end_year,
                self.backend,
                &format!("{label}:{}:scout", lane.lane),
                self.write_eval_inner(),
            )?;
            let scout_agg = aggregate_objective(&scout, &self.defs.thresholds);
            let inc_scout: Vec<SeedEval> = scout_seeds
                .iter()
                .filter_map(|s| incumbent.inner_by_seed.get(s).cloned())
                .collect();
            let inc_agg = aggregate_objective(&inc_scout, &self.defs.thresholds);
            let scout_delta = scout_agg.objective - inc_agg.objective;
            let scout_map = eval_map_by_seed(&scout);
            let scout_pair = if paired.enabled {
                paired_delta_stats(
                    &scout_map,
                    &incumbent.inner_by_seed,
                    &scout_seeds,
                    paired.confidence_z,
                )
            } else {
                PairedStats::default()
            };
            progress::stage(
                &label,
                &format!(
                    "lane={} scout group={} param={} old={} new={} delta={scout_delta:.6}",
                    lane.lane, lane.pdef.group, lane.pdef.path, lane.old, lane.new
                ),
            );
            lane_scout_rows.push(LaneScout {
                lane: lane.lane,
                group: lane.pdef.group.clone(),
                path: lane.pdef.path.clone(),
                old: lane.old.clone(),
                new: lane.new.clone(),
                scout_objective: scout_agg.objective,
                scout_delta_vs_incumbent: scout_delta,
                scout_paired: scout_pair,
            });
            if scout_delta > best_scout_delta {
                best_scout_delta = scout_delta;
                selected = Some((lane, lane_cfg, lane_cfg_path, scout_map));
            }
        }
        let (cand, cand_cfg, _lane_path, mut cand_inner_by_seed) =
            selected.context("no lane produced a candidate")?;
        let cand_cfg_path = it_dir.join("candidate_sim_config.toml");
        cand_cfg.write(&cand_cfg_path)?;
        progress::stage(
            &label,
            &format!(
                "selected lane={} group={} param={} old={} new={}",
                cand.lane, cand.pdef.group, cand.pdef.path, cand.old, cand.new
            ),
        );

        // Racing through growing seed subsets.
        let mut stage_records: Vec<StageRecord> = Vec::new();
        let mut early_reject = None;
        for &stage_n in &self.stage_counts {
            let subset = &self.tuning_seeds[..stage_n];
            let need: Vec<u64> = subset
                .iter()
                .copied()
                .filter(|s| !cand_inner_by_seed.contains_key(s))
                .collect();
            if !need.is_empty() {
                let evals = self.run_set(
                    &need,
                    &cand_cfg,
                    &cand_cfg_path,
                    &it_dir.join("inner").join(format!("tuning_stage_{stage_n}")),
                    self.plan.inner_end_year,
                    self.backend,
                    &format!("{label}:inner:stage{stage_n}"),
                    self.write_eval_inner(),
                )?;
                for e in evals {
                    cand_inner_by_seed.insert(e.seed, e);
                }
            }
            let cand_stage: Vec<SeedEval> = subset
                .iter()
                .filter_map(|s| cand_inner_by_seed.get(s).cloned())
                .collect();
            let inc_stage: Vec<SeedEval> = subset
                .iter()
                .filter_map(|s| incumbent.inner_by_seed.get(s).cloned())
                .collect();
            let cand_agg = aggregate_objective(&cand_stage, &self.defs.thresholds);
            let inc_agg = aggregate_objective(&inc_stage, &self.defs.thresholds);
            let stage_delta = cand_agg.objective - inc_agg.objective;
            let pair = if paired.enabled {
                paired_delta_stats(
                    &cand_inner_by_seed,
                    &incumbent.inner_by_seed,
                    subset,
                    paired.confidence_z,
                )
            } else {
                PairedStats::default()
            };
            stage_records.push(StageRecord {
                stage_seed_count: stage_n,
                candidate_objective: cand_agg.objective,
                incumbent_objective: inc_agg.objective,
                objective_delta: stage_delta,
                paired: pair.clone(),
            });
            if racing.enabled && stage_n < self.tuning_seeds.len() {
                let reason = should_reject_early(
                    stage_delta,
                    paired.enabled.then_some(&pair),
                    min_delta,
                    paired.min_inner_lcb_delta,
                    racing.early_reject_margin,
                );
                if let Some(reason) = reason {
                    progress::warn(
                        &label,
                        &format!("early reject at stage={stage_n} reason={reason:?}"),
                    );
                    early_reject = Some(reason);
                    break;
                }
            }
        }

        // Inner-horizon verdict over whatever subset racing evaluated.
        let evaluated_seeds: Vec<u64> = self
            .tuning_seeds
            .iter()
            .copied()
            .filter(|s| cand_inner_by_seed.contains_key(s))
            .collect();
        let cand_inner: Vec<SeedEval> = evaluated_seeds
            .iter()
            .filter_map(|s| cand_inner_by_seed.get(s).cloned())
            .collect();
        let cand_inner_agg = aggregate_objective(&cand_inner, &self.defs.thresholds);
        let cand_inner_top3 = violation_signature(&cand_inner);
        let mut tune_hardfails: Vec<String> = cand_inner
            .iter()
            .flat_map(|s| s.hardfails.iter().cloned())
            .collect();
        tune_hardfails.sort();
        tune_hardfails.dedup();
        let inner_incumbent: Vec<SeedEval> = evaluated_seeds
            .iter()
            .filter_map(|s| incumbent.inner_by_seed.get(s).cloned())
            .collect();
        let inner_incumbent_agg = aggregate_objective(&inner_incumbent, &self.defs.thresholds);
        let inner_delta = cand_inner_agg.objective - inner_incumbent_agg.objective;
        let inner_pair = if paired.enabled {
            paired_delta_stats(
                &cand_inner_by_seed,
                &incumbent.inner_by_seed,
                &evaluated_seeds,
                paired.confidence_z,
            )
        } else {
            PairedStats::default()
        };

        let no_hardfail_tuning = tune_hardfails.is_empty();
        let improve_ok = improvement_ok(
            inner_delta,
            paired.enabled.then_some(&inner_pair),
            min_delta,
            paired.min_inner_lcb_delta,
        );
        let checks_executed = no_hardfail_tuning && improve_ok && early_reject.is_none();

        // Determinism/parity gates for surviving candidates only.
        let (mut canary_pass, mut parity_pass) = (false, false);
        let mut canary_detail = Vec::new();
        let mut parity_detail = Vec::new();
        if checks_executed {
            progress::stage(&label, "running canary/parity checks");
            let (c_ok, c_det, p_ok, p_det) = self.canary_parity(
                &cand_cfg,
                &cand_cfg_path,
                &it_dir,
                &label,
                self.write_eval_inner(),
            )?;
            canary_pass = c_ok;
            canary_detail = c_det;
            parity_pass = p_ok;
            parity_detail = p_det;
            progress::stage(
                &label,
                &format!("canary_pass={canary_pass} parity_pass={parity_pass}"),
            );
        } else {
            progress::warn(
                &label,
                &format!(
                    "skipping canary/parity (hardfails={} improve={improve_ok} early_reject={})",
                    tune_hardfails.len(),
                    early_reject.is_some()
                ),
            );
        }

        // Curriculum climb: medium when due, then long, then holdout.
        let medium_required = self.plan.medium_required(it, state.accepted_iters);
        let mut medium_pass = true;
        let mut medium_ran = false;
        let mut medium_hardfails: Vec<String> = Vec::new();
        let mut medium_holdout_hardfails: Vec<String> = Vec::new();
        let mut medium_agg = None;
        let mut medium_holdout_agg = None;
        let mut medium_delta = 0.0;

        let mut long_ran = false;
        let mut long_hardfails: Vec<String> = Vec::new();
        let mut cand_long: Vec<SeedEval> = Vec::new();
        let mut cand_long_agg = cand_inner_agg.clone();
        let mut cand_top3 = cand_inner_top3.clone();
        let mut objective_delta = inner_delta;
        let mut long_pair = PairedStats::default();

        let mut holdout_ok = false;
        let mut holdout_agg = None;
        let mut holdout_hardfails: Vec<String> = Vec::new();
        let mut cand_hold: Vec<SeedEval> = Vec::new();
        let mut holdout_pair = PairedStats::default();

        if no_hardfail_tuning
            && improve_ok
            && canary_pass
            && parity_pass
            && early_reject.is_none()
        {
            if medium_required {
                medium_ran = true;
                progress::stage(
                    &label,
                    &format!(
                        "running medium horizon checks (end={})",
                        self.plan.medium_end_year
                    ),
                );
                let cand_medium = self.run_set(
                    &self.tuning_seeds.clone(),
                    &cand_cfg,
                    &cand_cfg_path,
                    &it_dir.join("medium").join("tuning"),
                    self.plan.medium_end_year,
                    self.backend,
                    &format!("{label}:medium:tuning"),
                    self.write_eval_inner(),
                )?;
                let agg = aggregate_objective(&cand_medium, &self.defs.thresholds);
                medium_hardfails = sorted_hardfails(&cand_medium);
                medium_delta = agg.objective - state.medium.objective;
                let cand_medium_hold = self.run_set(
                    &self.holdout_seeds.clone(),
                    &cand_cfg,
                    &cand_cfg_path,
                    &it_dir.join("medium").join("holdout"),
                    self.plan.medium_end_year,
                    self.backend,
                    &format!("{label}:medium:holdout"),
                    self.write_eval_holdout(),
                )?;
                let hold_agg = aggregate_objective(&cand_medium_hold, &self.defs.thresholds);
                medium_holdout_hardfails = sorted_hardfails(&cand_medium_hold);
                medium_pass = medium_hardfails.is_empty()
                    && medium_holdout_hardfails.len()
                        <= self.defs.thresholds.holdout_hardfail_max as usize
                    && hold_agg.objective >= state.medium.holdout_objective + holdout_delta_req;
                progress::stage(
                    &label,
                    &format!(
                        "medium_obj={:.6} medium_delta={medium_delta:.6} medium_holdout={:.6} medium_pass={medium_pass}",
                        agg.objective, hold_agg.objective
                    ),
                );
                medium_agg = Some(agg);
                medium_holdout_agg = Some(hold_agg);
            }
            if medium_pass {
                long_ran = true;
                progress::stage(
                    &label,
                    &format!(
                        "running long horizon promotion check (end={})",
                        self.plan.long_end_year
                    ),
                );
                cand_long = self.run_set(
                    &self.tuning_seeds.clone(),
                    &cand_cfg,
                    &cand_cfg_path,
                    &it_dir.join("long").join("tuning"),
                    self.plan.long_end_year,
                    self.backend,
                    &format!("{label}:long:tuning"),
                    self.write_eval_holdout(),
                )?;
                cand_long_agg = aggregate_objective(&cand_long, &self.defs.thresholds);
                cand_top3 = violation_signature(&cand_long);
                long_hardfails = sorted_hardfails(&cand_long);
                objective_delta = cand_long_agg.objective - state.long.objective;
                long_pair = if paired.enabled {
                    paired_delta_stats(
                        &eval_map_by_seed(&cand_long),
                        &incumbent.long_by_seed,
                        &self.tuning_seeds,
                        paired.confidence_z,
                    )
                } else {
                    PairedStats::default()
                };
                let long_improve_ok = improvement_ok(
                    objective_delta,
                    paired.enabled.then_some(&long_pair),
                    min_delta,
                    paired.min_long_lcb_delta,
                );
                if long_hardfails.is_empty() && long_improve_ok {
                    progress::stage(&label, "running long holdout validation");
                    cand_hold = self.run_set(
                        &self.holdout_seeds.clone(),
                        &cand_cfg,
                        &cand_cfg_path,
                        &it_dir.join("long").join("holdout"),
                        self.plan.long_end_year,
                        self.backend,
                        &format!("{label}:long:holdout"),
                        self.write_eval_holdout(),
                    )?;
                    let agg = aggregate_objective(&cand_hold, &self.defs.thresholds);
                    holdout_hardfails = sorted_hardfails(&cand_hold);
                    holdout_pair = if paired.enabled {
                        paired_delta_stats(
                            &eval_map_by_seed(&cand_hold),
                            &incumbent.holdout_by_seed,
                            &self.holdout_seeds,
                            paired.confidence_z,
                        )
                    } else {
                        PairedStats::default()
                    };
                    holdout_ok = holdout_hardfails.len()
                        <= self.defs.thresholds.holdout_hardfail_max as usize
                        && agg.objective >= state.long.holdout_objective + holdout_delta_req
                        && (!paired.enabled || holdout_pair.lcb >= paired.min_holdout_lcb_delta);
                    progress::stage(
                        &label,
                        &format!(
                            "long_obj={:.6} long_delta={objective_delta:.6} holdout_obj={:.6} holdout_ok={holdout_ok}",
                            cand_long_agg.objective, agg.objective
                        ),
                    );
                    holdout_agg = Some(agg);
                } else {
                    progress::warn(
                        &label,
                        &format!(
                            "skipping long holdout (long_hardfails={} long_delta={objective_delta:.6})",
                            long_hardfails.len()
                        ),
                    );
                }
            } else {
                progress::warn(&label, "medium gate failed, skipping long promotion check");
            }
        } else {
            progress::warn(
                &label,
                &format!(
                    "promotion checks skipped (no_hardfail={no_hardfail_tuning} improve_ok={improve_ok} canary={canary_pass} parity={parity_pass} early_reject={})",
                    early_reject.is_some()
                ),
            );
        }

        let accepted = no_hardfail_tuning
            && improve_ok
            && canary_pass
            && parity_pass
            && medium_pass
            && long_ran
            && holdout_ok;

        // Bandit bookkeeping happens whether or not the candidate made it.
        let long_delta_for_stats = if long_ran { objective_delta } else { 0.0 };
        state
            .param_stats
            .entry(cand.pdef.path.clone())
            .or_default()
            .record(cand.direction, inner_delta, long_delta_for_stats, accepted);
        state.total_param_attempts += 1;

        if accepted {
            self.best_cfg = cand_cfg;
            self.best_cfg.write(&self.best_cfg_path)?;
            state.best_config_hash16 = self.best_cfg.hash16();
            state.inner.objective = cand_inner_agg.objective;
            state.inner.top3 = cand_inner_top3.clone();
            incumbent.inner_by_seed = cand_inner_by_seed.clone();
            if medium_ran {
                if let (Some(m), Some(mh)) = (&medium_agg, &medium_holdout_agg) {
                    state.medium.objective = m.objective;
                    state.medium.holdout_objective = mh.objective;
                }
            }
            state.long.objective = cand_long_agg.objective;
            if let Some(h) = &holdout_agg {
                state.long.holdout_objective = h.objective;
            }
            state.long.top3 = cand_top3.clone();
            state.best_top3 = cand_top3.clone();
            incumbent.long_by_seed = eval_map_by_seed(&cand_long);
            incumbent.holdout_by_seed = eval_map_by_seed(&cand_hold);
            state.accepted_iters += 1;
            state.accepted_since_improve = 0;
        } else {
            state.accepted_since_improve += 1;
        }

        // Hard-gate failure streak feeding the safety stop.
        let gate_failed = tune_hardfails.iter().any(|h| h == "MISSING_METRIC")
            || (checks_executed && (!canary_pass || !parity_pass));
        state.consecutive_gate_fail = if gate_failed {
            state.consecutive_gate_fail + 1
        } else {
            0
        };

        // Plateau: same inner signature with sub-threshold improvement.
        if cand_inner_top3 == state.prev_top3_inner && inner_delta < min_delta {
            state.plateau_same_top3 += 1;
        } else {
            state.plateau_same_top3 = 0;
        }
        state.prev_top3_inner = cand_inner_top3.clone();
        if long_ran && !cand_top3.is_empty() {
            state.proposal_top3 = cand_top3.clone();
        } else if !cand_inner_top3.is_empty() {
            state.proposal_top3 = cand_inner_top3.clone();
        }

        let record = IterationRecord {
            iteration: it,
            subsystem_group: cand.pdef.group.clone(),
            selected_lane: cand.lane,
            lane_scout: lane_scout_rows,
            parameter_edits: vec![ParameterEdit {
                path: cand.pdef.path.clone(),
                old: cand.old.clone(),
                new: cand.new.clone(),
                recommended_step: cand.pdef.recommended_step,
                direction: cand.direction,
            }],
            top_violations_before: top3_before,
            top_violations_after: cand_inner_top3.clone(),
            top_violations_after_long: long_ran.then(|| cand_top3.clone()),
            objective_tuning: cand_long_agg.objective,
            objective_tuning_inner: cand_inner_agg.objective,
            objective_tuning_medium: medium_agg.as_ref().map(|a| a.objective),
            objective_tuning_long: long_ran.then_some(cand_long_agg.objective),
            score_delta: objective_delta,
            score_delta_inner: inner_delta,
            score_delta_medium: medium_ran.then_some(medium_delta),
            racing: RacingReport {
                enabled: racing.enabled,
                stages: stage_records,
                early_reject: early_reject.is_some(),
                early_reject_reason: early_reject,
            },
            paired_stats: PairedReport {
                inner: inner_pair,
                long: long_pair,
                holdout: holdout_pair,
            },
            gates: GateReport {
                metric_availability: !tune_hardfails.iter().any(|h| h == "MISSING_METRIC"),
                canary_pass,
                backend_parity_pass: parity_pass,
                medium_required,
                medium_pass,
                long_ran,
                holdout_pass: holdout_ok,
                tuning_hardfails: tune_hardfails,
                medium_hardfails,
                medium_holdout_hardfails,
                long_hardfails,
                holdout_hardfails,
            },
            holdout_objective: holdout_agg.as_ref().map(|a| a.objective),
            accepted,
            best_so_far: BestSnapshot {
                objective: state.long.objective,
                holdout_objective: state.long.holdout_objective,
                config_path: self.best_cfg_path.display().to_string(),
                config_hash16: state.best_config_hash16.clone(),
            },
            canary_detail,
            parity_detail,
            curriculum: self.plan.clone(),
        };
        write_json(&it_dir.join("iteration.json"), &record)?;
        progress::headline(
            &label,
            &format!(
                "group={} param={} old={} new={} inner_obj={:.6} inner_delta={inner_delta:.6} promoted_obj={:.6} promoted_delta={objective_delta:.6} accepted={accepted}",
                cand.pdef.group, cand.pdef.path, cand.old, cand.new,
                cand_inner_agg.objective, cand_long_agg.objective
            ),
        );

        // Rejected iterations only keep their decision record.
        let io = &accel.io;
        if !accepted && io.prune_rejected_iterations {
            for child in ["inner", "medium", "long", "canary", "parity", "lanes"] {
                let dir = it_dir.join(child);
                if dir.exists() {
                    let _ = std::fs::remove_dir_all(&dir);
                }
            }
            if !io.keep_candidate_if_rejected {
                for entry in ["candidate_sim_config.toml", "candidate_exploit.toml", "candidate_explore.toml"]
                {
                    let _ = std::fs::remove_file(it_dir.join(entry));
                }
            }
        }

        let violation_sources: Vec<&[SeedEval]> = {
            let mut sources: Vec<&[SeedEval]> = Vec::new();
            if long_ran {
                sources.push(&cand_long);
            } else {
                sources.push(&cand_inner);
            }
            if holdout_ok {
                sources.push(&cand_hold);
            }
            sources
        };
        let stop = self.monitor.check(&StopInputs {
            cancelled: self.cancel.is_cancelled(),
            accepted_iters: state.accepted_iters,
            accepted_since_improve: state.accepted_since_improve,
            signature_unchanged: state.best_top3 == cand_top3,
            best_objective: state.long.objective,
            violation_sources,
            plateau_same_top3: state.plateau_same_top3,
            consecutive_gate_fail: state.consecutive_gate_fail,
        });
        Ok(stop)
    }

    /// Final report, tickets, and live-config writeback.
    fn finish(&self, state: &TuningState, stop_reason: StopReason) -> Result<()> {
        let iterations_completed = std::fs::read_dir(&self.it_root)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_name().to_string_lossy().starts_with("iter_"))
                    .count()
            })
            .unwrap_or(0);
        write_json(
            &self.opts.out_root.join("final_report.json"),
            &json!({
                "stop_condition": stop_reason,
                "best_objective": state.long.objective,
                "best_objective_inner": state.inner.objective,
                "best_objective_medium": state.medium.objective,
                "best_holdout_objective": state.long.holdout_objective,
                "best_top3_violations": state.best_top3,
                "best_config": self.best_cfg_path.display().to_string(),
                "best_config_hash16": state.best_config_hash16,
                "curriculum": self.plan,
                "iterations_completed": iterations_completed,
            }),
        )?;

        if self.opts.write_live_config {
            std::fs::copy(&self.best_cfg_path, &self.opts.config_path).with_context(|| {
                format!("failed to update {}", self.opts.config_path.display())
            })?;
        }

        match stop_reason {
            StopReason::StructuralChangeSignal => self.monitor.write_mechanism_gap_ticket(
                &self.opts.out_root,
                &state.best_top3,
                &self.schema.tunable_groups(),
            )?,
            StopReason::Safety => self.monitor.write_safety_ticket(&self.opts.out_root)?,
            _ => {}
        }
        progress::headline("done", &format!("stop_condition={stop_reason}"));
        Ok(())
    }
}

fn sorted_hardfails(evals: &[SeedEval]) -> Vec<String> {
    let mut out: Vec<String> = evals
        .iter()
        .flat_map(|s| s.hardfails.iter().cloned())
        .collect();
    out.sort();
    out.dedup();
    out
}
