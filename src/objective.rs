//! Objective aggregation: a seed set reduced to one comparable scalar.
//!
//! The objective is the median total score minus a variance penalty (paid
//! only above the tolerated spread) and a hard-fail penalty proportional to
//! the fraction of failing seeds. Pure and total: an empty seed set yields
//! the sentinel objective instead of an error.

use std::collections::BTreeMap;

use crate::definitions::Thresholds;
use crate::stats::{median, pstdev};
use crate::types::{ObjectiveAggregate, SeedEval};

/// Objective reported for an empty seed set; loses against anything real.
pub const EMPTY_OBJECTIVE: f64 = -1e9;

pub fn aggregate_objective(seed_evals: &[SeedEval], t: &Thresholds) -> ObjectiveAggregate {
    let scores: Vec<f64> = seed_evals.iter().map(|s| s.total_score).collect();
    let score_median = if scores.is_empty() {
        EMPTY_OBJECTIVE
    } else {
        median(&scores)
    };
    let stddev = pstdev(&scores);
    let hardfail_rate = seed_evals.iter().filter(|s| s.has_hardfail()).count() as f64
        / (seed_evals.len().max(1) as f64);
    let variance_penalty = t.lambda_var * (stddev - t.target_std).max(0.0);
    let hardfail_penalty = t.lambda_fail * hardfail_rate;
    ObjectiveAggregate {
        score_median,
        stddev,
        hardfail_rate,
        variance_penalty,
        hardfail_penalty,
        objective: score_median - variance_penalty - hardfail_penalty,
    }
}

/// Violation signature: the top three violation ids by severity summed over
/// the seed set. Drives the proposer heuristic and plateau detection.
pub fn violation_signature(seed_evals: &[SeedEval]) -> Vec<String> {
    let mut totals: BTreeMap<String, f64> = BTreeMap::new();
    for eval in seed_evals {
        for v in &eval.violations {
            *totals.entry(v.id.clone()).or_insert(0.0) += v.severity;
        }
    }
    let mut ranked: Vec<(String, f64)> = totals.into_iter().collect();
    // BTreeMap iteration gives a stable id order, so ties break alphabetically.
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    ranked.into_iter().take(3).map(|(id, _)| id).collect()
}

pub fn eval_map_by_seed(seed_evals: &[SeedEval]) -> BTreeMap<u64, SeedEval> {
    seed_evals.iter().map(|s| (s.seed, s.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::test_defs;
    use crate::types::Violation;

    fn eval_with(seed: u64, total: f64, hardfail: bool) -> SeedEval {
        SeedEval {
            seed,
            base_score: total / 100.0,
            penalties: 0.0,
            total_score: total,
            hardfails: if hardfail {
                vec!["MISSING_METRIC".to_string()]
            } else {
                Vec::new()
            },
            violations: Vec::new(),
            checkpoint_scores: Vec::new(),
            key_series: Default::default(),
            top_violations: Vec::new(),
            summary: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_empty_set_yields_sentinel() {
        let defs = test_defs();
        let agg = aggregate_objective(&[], &defs.thresholds);
        assert!((agg.score_median - EMPTY_OBJECTIVE).abs() < 1e-3);
        assert_eq!(agg.hardfail_rate, 0.0);
    }

    #[test]
    fn test_objective_is_permutation_invariant() {
        let defs = test_defs();
        let evals = vec![
            eval_with(1, 60.0, false),
            eval_with(2, 72.0, true),
            eval_with(3, 55.0, false),
            eval_with(4, 90.0, false),
        ];
        let a = aggregate_objective(&evals, &defs.thresholds);
        let mut reversed = evals.clone();
        reversed.reverse();
        let b = aggregate_objective(&reversed, &defs.thresholds);
        assert!((a.objective - b.objective).abs() < 1e-12);
        assert!((a.stddev - b.stddev).abs() < 1e-12);
        assert!((a.hardfail_rate - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_variance_penalty_only_above_target() {
        let defs = test_defs();
        // Two tight seeds: stddev 1.0 is under targetStd 6.0.
        let tight = vec![eval_with(1, 70.0, false), eval_with(2, 72.0, false)];
        let agg = aggregate_objective(&tight, &defs.thresholds);
        assert_eq!(agg.variance_penalty, 0.0);

        // Spread seeds: stddev 20 pays (20 - 6) * lambdaVar.
        let spread = vec![eval_with(1, 50.0, false), eval_with(2, 90.0, false)];
        let agg = aggregate_objective(&spread, &defs.thresholds);
        assert!((agg.variance_penalty - 0.5 * 14.0).abs() < 1e-9);
        assert!((agg.objective - (70.0 - 7.0)).abs() < 1e-9);
    }

    #[test]
    fn test_signature_ranks_by_summed_severity() {
        let mut a = eval_with(1, 50.0, false);
        a.violations = vec![
            Violation::new("TRANSPORT_CHEAT", 30.0, false, serde_json::Value::Null),
            Violation::new("DEPLETION_IGNORED", 10.0, false, serde_json::Value::Null),
        ];
        let mut b = eval_with(2, 50.0, false);
        b.violations = vec![
            Violation::new("TRANSPORT_CHEAT", 40.0, false, serde_json::Value::Null),
            Violation::new("STORAGE_SMOOTHING_CHEAT", 55.0, false, serde_json::Value::Null),
            Violation::new("EXTINCTION_PERSISTENT", 100.0, true, serde_json::Value::Null),
        ];
        let sig = violation_signature(&[a, b]);
        assert_eq!(
            sig,
            vec![
                "EXTINCTION_PERSISTENT".to_string(),
                "TRANSPORT_CHEAT".to_string(),
                "STORAGE_SMOOTHING_CHEAT".to_string(),
            ]
        );
    }
}
