//! Adaptive racing: evaluate a candidate on growing seed subsets and reject
//! hopeless ones before paying for the full set.
//!
//! Stage seed counts are normalized to a strictly increasing ladder that
//! always ends at the full tuning set. At each stage only the seeds not yet
//! evaluated this iteration run; the candidate is compared against the
//! incumbent over the same subset, both as an objective delta and as a
//! paired per-seed confidence interval. Before the final stage a candidate
//! is dropped when either signal sits more than the safety margin below its
//! acceptance threshold.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::stats::PairedStats;
use crate::types::SeedEval;

/// Clamp, deduplicate, and terminate a stage ladder: each count in
/// `[1, total]`, strictly increasing, final stage always `total`.
pub fn normalized_stage_counts(stage_counts: &[usize], total_seeds: usize) -> Vec<usize> {
    let mut out: Vec<usize> = Vec::new();
    for &n in stage_counts {
        if n == 0 {
            continue;
        }
        let v = n.clamp(1, total_seeds);
        if out.last() != Some(&v) {
            out.push(v);
        }
    }
    if out.is_empty() {
        out.push(total_seeds);
    }
    if out.last() != Some(&total_seeds) {
        out.push(total_seeds);
    }
    out
}

/// Paired per-seed score differences (candidate minus incumbent) over the
/// seeds present in both maps.
pub fn paired_delta_stats(
    candidate: &BTreeMap<u64, SeedEval>,
    incumbent: &BTreeMap<u64, SeedEval>,
    seeds: &[u64],
    z: f64,
) -> PairedStats {
    let diffs: Vec<f64> = seeds
        .iter()
        .filter_map(|seed| {
            let c = candidate.get(seed)?;
            let i = incumbent.get(seed)?;
            Some(c.total_score - i.total_score)
        })
        .collect();
    PairedStats::from_diffs(&diffs, z)
}

/// Why a candidate was dropped before the final stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EarlyRejectReason {
    ObjectiveMargin,
    PairedLcbMargin,
}

/// Early-reject decision for one non-final stage. `pair` is `None` when
/// paired acceptance is disabled; the confidence signal needs at least two
/// paired seeds before it may reject.
pub fn should_reject_early(
    stage_delta: f64,
    pair: Option<&PairedStats>,
    min_delta: f64,
    min_lcb_delta: f64,
    margin: f64,
) -> Option<EarlyRejectReason> {
    if stage_delta < min_delta - margin {
        return Some(EarlyRejectReason::ObjectiveMargin);
    }
    if let Some(pair) = pair {
        if pair.n >= 2 && pair.lcb < min_lcb_delta - margin {
            return Some(EarlyRejectReason::PairedLcbMargin);
        }
    }
    None
}

/// Ledger entry for one completed racing stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub stage_seed_count: usize,
    pub candidate_objective: f64,
    pub incumbent_objective: f64,
    pub objective_delta: f64,
    pub paired: PairedStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(seed: u64, total: f64) -> SeedEval {
        SeedEval {
            seed,
            base_score: total / 100.0,
            penalties: 0.0,
            total_score: total,
            hardfails: Vec::new(),
            violations: Vec::new(),
            checkpoint_scores: Vec::new(),
            key_series: Default::default(),
            top_violations: Vec::new(),
            summary: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_stage_counts_monotone_and_terminal() {
        assert_eq!(normalized_stage_counts(&[2, 4, 8], 8), vec![2, 4, 8]);
        // Clamped duplicates collapse, full set appended.
        assert_eq!(normalized_stage_counts(&[2, 2, 50], 8), vec![2, 8]);
        assert_eq!(normalized_stage_counts(&[3], 8), vec![3, 8]);
        assert_eq!(normalized_stage_counts(&[], 8), vec![8]);
        assert_eq!(normalized_stage_counts(&[0, 0], 8), vec![8]);
        assert_eq!(normalized_stage_counts(&[8], 8), vec![8]);
    }

    #[test]
    fn test_paired_stats_only_over_common_seeds() {
        let cand: BTreeMap<u64, SeedEval> =
            [(1, eval(1, 60.0)), (2, eval(2, 62.0)), (3, eval(3, 99.0))].into();
        let inc: BTreeMap<u64, SeedEval> = [(1, eval(1, 58.0)), (2, eval(2, 61.0))].into();
        let pair = paired_delta_stats(&cand, &inc, &[1, 2, 3], 1.96);
        // Seed 3 has no incumbent counterpart and is excluded.
        assert_eq!(pair.n, 2);
        assert!((pair.mean_diff - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_early_reject_boundary() {
        let min_delta = 0.25;
        let margin = 0.75;
        // Exactly at min_delta - margin survives; below it rejects.
        assert_eq!(
            should_reject_early(-0.5, None, min_delta, 0.0, margin),
            None
        );
        assert_eq!(
            should_reject_early(-0.500001, None, min_delta, 0.0, margin),
            Some(EarlyRejectReason::ObjectiveMargin)
        );
    }

    #[test]
    fn test_paired_reject_needs_two_seeds() {
        let single = PairedStats::from_diffs(&[-10.0], 1.96);
        assert_eq!(
            should_reject_early(0.5, Some(&single), 0.0, 0.0, 0.75),
            None
        );
        let double = PairedStats::from_diffs(&[-10.0, -12.0], 1.96);
        assert_eq!(
            should_reject_early(0.5, Some(&double), 0.0, 0.0, 0.75),
            Some(EarlyRejectReason::PairedLcbMargin)
        );
    }
}
