//! Stop-condition monitor: decides, once per iteration, whether the loop is
//! done and why.
//!
//! Conditions are checked in priority order; the first match wins:
//! manual stop, convergence, target reached, structural plateau, safety,
//! and finally the iteration budget. The structural and safety stops leave
//! an actionable ticket artifact behind.

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::telemetry::write_json;
use crate::types::SeedEval;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopReason {
    ManualStop,
    Convergence,
    TargetRealism,
    StructuralChangeSignal,
    Safety,
    MaxIterations,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::ManualStop => "MANUAL_STOP",
            StopReason::Convergence => "CONVERGENCE",
            StopReason::TargetRealism => "TARGET_REALISM",
            StopReason::StructuralChangeSignal => "STRUCTURAL_CHANGE_SIGNAL",
            StopReason::Safety => "SAFETY",
            StopReason::MaxIterations => "MAX_ITERATIONS",
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consecutive hard-gate failures tolerated before the safety stop.
pub const SAFETY_GATE_FAIL_LIMIT: u32 = 5;

/// Stop thresholds from the schema.
#[derive(Debug, Clone)]
pub struct StopMonitor {
    pub convergence_iterations: u32,
    pub target_objective: f64,
    pub major_violation_threshold: f64,
    pub plateau_iterations_structural: u32,
}

/// Per-iteration inputs to the stop decision.
pub struct StopInputs<'a> {
    pub cancelled: bool,
    pub accepted_iters: u32,
    pub accepted_since_improve: u32,
    /// Signatures match between the best config and this iteration.
    pub signature_unchanged: bool,
    pub best_objective: f64,
    /// Evaluations to scan for remaining major-severity violations.
    pub violation_sources: Vec<&'a [SeedEval]>,
    pub plateau_same_top3: u32,
    pub consecutive_gate_fail: u32,
}

impl StopMonitor {
    /// First matching stop condition, if any. `MAX_ITERATIONS` is decided by
    /// the caller's loop bound, not here.
    pub fn check(&self, inputs: &StopInputs<'_>) -> Option<StopReason> {
        if inputs.cancelled {
            return Some(StopReason::ManualStop);
        }
        if inputs.accepted_iters >= self.convergence_iterations
            && inputs.accepted_since_improve >= self.convergence_iterations
            && inputs.signature_unchanged
        {
            return Some(StopReason::Convergence);
        }
        let major_left = inputs.violation_sources.iter().any(|evals| {
            evals.iter().any(|eval| {
                eval.violations
                    .iter()
                    .any(|v| v.severity >= self.major_violation_threshold)
            })
        });
        if inputs.best_objective >= self.target_objective && !major_left {
            return Some(StopReason::TargetRealism);
        }
        if inputs.plateau_same_top3 >= self.plateau_iterations_structural {
            return Some(StopReason::StructuralChangeSignal);
        }
        if inputs.consecutive_gate_fail >= SAFETY_GATE_FAIL_LIMIT {
            return Some(StopReason::Safety);
        }
        None
    }

    /// Ticket left behind by a structural stop: the violations no tunable
    /// parameter could move, plus the subsystem groups to look at.
    pub fn write_mechanism_gap_ticket(
        &self,
        out_root: &Path,
        top_violations: &[String],
        subsystem_groups: &[String],
    ) -> Result<()> {
        write_json(
            &out_root.join("mechanism_gap_ticket.json"),
            &json!({
                "ticket_type": "mechanism-gap",
                "top_violations": top_violations,
                "evidence": {
                    "objective_plateau": true,
                    "plateau_iterations": self.plateau_iterations_structural,
                },
                "likely_missing_mechanism":
                    "Observed violations persist under one-group parameter perturbations.",
                "subsystem_groups_hint": subsystem_groups,
            }),
        )
    }

    /// Ticket left behind by a safety stop.
    pub fn write_safety_ticket(&self, out_root: &Path) -> Result<()> {
        write_json(
            &out_root.join("safety_stop_minimal_fix.json"),
            &json!({
                "stop_condition": StopReason::Safety,
                "reason": format!(
                    "Hard-gate failures persisted for {SAFETY_GATE_FAIL_LIMIT} consecutive iterations."
                ),
                "minimal_fix_required": [
                    "Stabilize determinism/reproducibility for canary and parity, or fix missing metric emissions if present.",
                    "Re-run baseline gate checks before resuming tuning.",
                ],
            }),
        )
    }
}
