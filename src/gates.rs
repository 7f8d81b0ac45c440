//! Determinism and parity gates: compare two runs' key metric series under
//! per-metric tolerances.
//!
//! The canary gate reruns the same seed on the same backend and expects
//! near-identical series; the parity gate compares the gpu and cpu backends.
//! Tolerances come from the definitions document as human-readable texts
//! (`"0.5% relative"`, `"1e-6 absolute"`). One special composite key,
//! `event_rates_per_century_per_billion`, covers the war, famine, and
//! epidemic rate series jointly.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use serde::Serialize;

use crate::stats::TINY;
use crate::types::SeedEval;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EpsMode {
    Relative,
    Absolute,
}

/// Parse a tolerance text: `"0.5% relative"` or `"1e-6 absolute"`; a bare
/// number reads as absolute.
pub fn parse_eps_text(text: &str) -> Result<(EpsMode, f64)> {
    let t = text.trim().to_lowercase();
    if t.contains("% relative") {
        let pct = t.split('%').next().unwrap_or("");
        let value: f64 = pct
            .trim()
            .parse()
            .with_context(|| format!("bad relative tolerance: {text:?}"))?;
        return Ok((EpsMode::Relative, value / 100.0));
    }
    if let Some(num) = t.strip_suffix("absolute") {
        let value: f64 = num
            .split_whitespace()
            .last()
            .unwrap_or("")
            .parse()
            .with_context(|| format!("bad absolute tolerance: {text:?}"))?;
        return Ok((EpsMode::Absolute, value));
    }
    match t.parse::<f64>() {
        Ok(value) => Ok((EpsMode::Absolute, value)),
        Err(_) => bail!("unrecognized tolerance spec: {text:?}"),
    }
}

/// Maximum elementwise error over the common prefix; infinite for empty
/// inputs so an absent series always fails its tolerance.
pub fn metric_max_error(a: &[f64], b: &[f64], mode: EpsMode) -> f64 {
    let n = a.len().min(b.len());
    if n == 0 {
        return f64::INFINITY;
    }
    (0..n)
        .map(|i| match mode {
            EpsMode::Relative => (a[i] - b[i]).abs() / a[i].abs().max(TINY),
            EpsMode::Absolute => (a[i] - b[i]).abs(),
        })
        .fold(0.0_f64, f64::max)
}

/// Per-metric outcome of a gate comparison.
#[derive(Debug, Clone, Serialize)]
pub struct MetricCheck {
    pub metric: String,
    pub mode: EpsMode,
    pub eps: f64,
    pub max_error: f64,
    pub pass: bool,
}

/// Keys folded into the composite event-rate tolerance.
const EVENT_RATE_KEYS: [&str; 3] = ["major_war_rate", "famine_wave_rate", "epidemic_wave_rate"];

/// Compare two evaluations' key series under the given tolerance map. The
/// gate passes only when every metric passes.
pub fn compare_metric_series(
    a: &SeedEval,
    b: &SeedEval,
    eps_map: &BTreeMap<String, String>,
) -> Result<(bool, Vec<MetricCheck>)> {
    let mut ok = true;
    let mut details = Vec::with_capacity(eps_map.len());
    for (metric, eps_text) in eps_map {
        let (mode, eps) = parse_eps_text(eps_text)
            .with_context(|| format!("tolerance for metric {metric}"))?;
        let max_error = if metric == "event_rates_per_century_per_billion" {
            EVENT_RATE_KEYS
                .iter()
                .map(|key| {
                    let sa = a.key_series.get(*key).map(Vec::as_slice).unwrap_or(&[]);
                    let sb = b.key_series.get(*key).map(Vec::as_slice).unwrap_or(&[]);
                    metric_max_error(sa, sb, mode)
                })
                .fold(f64::NEG_INFINITY, f64::max)
        } else {
            let sa = a.key_series.get(metric).map(Vec::as_slice).unwrap_or(&[]);
            let sb = b.key_series.get(metric).map(Vec::as_slice).unwrap_or(&[]);
            metric_max_error(sa, sb, mode)
        };
        let pass = max_error <= eps + 1e-12;
        ok &= pass;
        details.push(MetricCheck {
            metric: metric.clone(),
            mode,
            eps,
            max_error,
            pass,
        });
    }
    Ok((ok, details))
}
