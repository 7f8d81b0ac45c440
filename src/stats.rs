//! Scalar statistics shared by the evaluator, aggregator, and gates.
//!
//! All helpers are total: empty or degenerate inputs return a neutral value
//! (0.0) instead of erroring, because missing telemetry is handled one level
//! up as a `MISSING_METRIC` violation, never as a panic here.

use serde::{Deserialize, Serialize};

/// Guard against division by zero in ratio computations.
pub const TINY: f64 = 1e-12;

pub fn clamp01(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

pub fn relu(x: f64) -> f64 {
    x.max(0.0)
}

/// 1.0 at the target, falling off linearly to 0.0 at `tol` away from it.
pub fn closeness(x: f64, target: f64, tol: f64) -> f64 {
    clamp01(1.0 - (x - target).abs() / tol.max(TINY))
}

pub fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Population standard deviation; 0.0 for fewer than two samples.
pub fn pstdev(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let m = mean(xs);
    let var = xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / xs.len() as f64;
    var.sqrt()
}

/// Population variance; 0.0 for fewer than two samples.
pub fn pvariance(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let m = mean(xs);
    xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / xs.len() as f64
}

pub fn median(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    let mut ys = xs.to_vec();
    ys.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = ys.len();
    if n % 2 == 1 {
        ys[n / 2]
    } else {
        0.5 * (ys[n / 2 - 1] + ys[n / 2])
    }
}

/// Linear-interpolated percentile, `p` in [0, 1].
pub fn percentile(xs: &[f64], p: f64) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    let mut ys = xs.to_vec();
    ys.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let p = p.clamp(0.0, 1.0);
    let pos = p * (ys.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let t = pos - lo as f64;
    ys[lo] * (1.0 - t) + ys[hi] * t
}

/// Pearson correlation over the common prefix of `x` and `y`; 0.0 when
/// fewer than three paired samples exist.
pub fn corr(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len().min(y.len());
    if n < 3 {
        return 0.0;
    }
    let mx = mean(&x[..n]);
    let my = mean(&y[..n]);
    let mut num = 0.0;
    let mut dx2 = 0.0;
    let mut dy2 = 0.0;
    for i in 0..n {
        let dx = x[i] - mx;
        let dy = y[i] - my;
        num += dx * dy;
        dx2 += dx * dx;
        dy2 += dy * dy;
    }
    let den = (dx2 * dy2).max(TINY).sqrt();
    (num / den).clamp(-1.0, 1.0)
}

/// Confidence interval on paired per-seed score differences.
///
/// `stderr` is `sigma / sqrt(n)` with the population stddev, 0.0 when n <= 1.
/// The acceptance gate requires `lcb` to clear a per-horizon minimum delta.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PairedStats {
    pub n: usize,
    pub mean_diff: f64,
    pub std_diff: f64,
    pub stderr: f64,
    pub z: f64,
    pub lcb: f64,
    pub ucb: f64,
}

impl PairedStats {
    /// Build the interval from raw per-seed differences.
    pub fn from_diffs(diffs: &[f64], z: f64) -> Self {
        let n = diffs.len();
        let mean_diff = mean(diffs);
        let std_diff = pstdev(diffs);
        let stderr = if n > 1 {
            std_diff / (n as f64).sqrt()
        } else {
            0.0
        };
        Self {
            n,
            mean_diff,
            std_diff,
            stderr,
            z,
            lcb: mean_diff - z * stderr,
            ucb: mean_diff + z * stderr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closeness() {
        assert!((closeness(1.0, 1.0, 0.5) - 1.0).abs() < 1e-12);
        assert!((closeness(1.5, 1.0, 0.5) - 0.0).abs() < 1e-12);
        assert!((closeness(1.25, 1.0, 0.5) - 0.5).abs() < 1e-12);
        // Zero tolerance degrades gracefully instead of dividing by zero.
        assert_eq!(closeness(2.0, 1.0, 0.0), 0.0);
    }

    #[test]
    fn test_median_odd_even() {
        assert!((median(&[3.0, 1.0, 2.0]) - 2.0).abs() < 1e-12);
        assert!((median(&[4.0, 1.0, 2.0, 3.0]) - 2.5).abs() < 1e-12);
        assert_eq!(median(&[]), 0.0);
    }

    #[test]
    fn test_percentile_interpolates() {
        let xs = [0.0, 10.0];
        assert!((percentile(&xs, 0.75) - 7.5).abs() < 1e-12);
        assert!((percentile(&xs, 0.0) - 0.0).abs() < 1e-12);
        assert!((percentile(&xs, 1.0) - 10.0).abs() < 1e-12);
    }

    #[test]
    fn test_corr_perfect_and_short() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = [2.0, 4.0, 6.0, 8.0];
        assert!((corr(&x, &y) - 1.0).abs() < 1e-9);
        let neg: Vec<f64> = y.iter().map(|v| -v).collect();
        assert!((corr(&x, &neg) + 1.0).abs() < 1e-9);
        // Fewer than three samples is defined as no evidence.
        assert_eq!(corr(&[1.0, 2.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_pstdev() {
        // 0, 10 -> mean 5, population stddev 5
        assert!((pstdev(&[0.0, 10.0]) - 5.0).abs() < 1e-12);
        assert_eq!(pstdev(&[1.0]), 0.0);
    }

    #[test]
    fn test_paired_stats_singleton_has_zero_stderr() {
        let p = PairedStats::from_diffs(&[0.7], 1.96);
        assert_eq!(p.n, 1);
        assert_eq!(p.stderr, 0.0);
        assert!((p.lcb - 0.7).abs() < 1e-12);
        assert!((p.ucb - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_paired_interval_width_shrinks_with_n() {
        // Same variance, growing sample count: the interval must tighten.
        let base = [1.0, -1.0];
        let mut widths = Vec::new();
        for reps in [1usize, 4, 16] {
            let diffs: Vec<f64> = base
                .iter()
                .cycle()
                .take(base.len() * reps)
                .copied()
                .collect();
            let p = PairedStats::from_diffs(&diffs, 1.96);
            widths.push(p.ucb - p.lcb);
        }
        assert!(widths[0] > widths[1]);
        assert!(widths[1] > widths[2]);
    }
}
