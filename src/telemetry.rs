//! Run-directory telemetry: the simulator's output artifacts and the audit
//! that decides whether a run is scoreable at all.
//!
//! A completed run directory holds exactly four artifacts:
//!
//! | Artifact | Contents |
//! |---|---|
//! | `timeseries.csv` | per-checkpoint metric series |
//! | `run_summary.json` | invariants, checkpoints, scalar metrics |
//! | `violations.json` | evaluator output (rewritten on re-evaluation) |
//! | `run_meta.json` | seed, config hash, window, backend |
//!
//! Reading is deliberately tolerant: malformed numeric cells coerce to 0.0
//! and are then caught by scoring, while structurally absent artifacts or
//! columns surface as a `MISSING_METRIC` hard fail so that missing data can
//! never outscore bad data.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::definitions::RealismDefs;
use crate::stats::TINY;
use crate::types::Violation;

/// Artifacts a run directory must contain to be scoreable.
pub const REQUIRED_RUN_ARTIFACTS: [&str; 4] = [
    "run_meta.json",
    "run_summary.json",
    "timeseries.csv",
    "violations.json",
];

/// True when every required artifact exists and is non-empty.
pub fn has_required_artifacts(run_dir: &Path) -> bool {
    REQUIRED_RUN_ARTIFACTS.iter().all(|name| {
        let p = run_dir.join(name);
        p.metadata().map(|m| m.len() > 0).unwrap_or(false)
    })
}

pub fn load_json(path: &Path) -> Result<serde_json::Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let text = serde_json::to_string_pretty(value).context("failed to serialize JSON")?;
    std::fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))
}

/// Column-oriented view of `timeseries.csv`.
///
/// Every numeric column is a dense `Vec<f64>` of row length; the latitude
/// band column is parsed separately into per-row normalized vectors.
#[derive(Debug, Clone, Default)]
pub struct Timeseries {
    len: usize,
    headers: Vec<String>,
    columns: BTreeMap<String, Vec<f64>>,
    lat_bands: Vec<Vec<f64>>,
}

/// Column carrying `|`-separated latitude band population shares.
pub const LAT_BAND_COLUMN: &str = "pop_share_by_lat_band";

impl Timeseries {
    pub fn read(path: &Path) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let headers: Vec<String> = reader
            .headers()
            .with_context(|| format!("failed to read header of {}", path.display()))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        let mut columns: BTreeMap<String, Vec<f64>> = headers
            .iter()
            .filter(|h| h.as_str() != LAT_BAND_COLUMN)
            .map(|h| (h.clone(), Vec::new()))
            .collect();
        let mut lat_bands = Vec::new();
        let mut len = 0usize;

        for record in reader.records() {
            let record =
                record.with_context(|| format!("failed to read row of {}", path.display()))?;
            for (header, cell) in headers.iter().zip(record.iter()) {
                if header == LAT_BAND_COLUMN {
                    lat_bands.push(parse_lat_bands(cell));
                } else if let Some(col) = columns.get_mut(header) {
                    col.push(cell.trim().parse::<f64>().unwrap_or(0.0));
                }
            }
            if !headers.iter().any(|h| h == LAT_BAND_COLUMN) {
                lat_bands.push(Vec::new());
            }
            len += 1;
        }

        Ok(Self {
            len,
            headers,
            columns,
            lat_bands,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.headers.iter().any(|h| h == name)
    }

    /// Dense column values; absent columns read as all zeros so scoring can
    /// proceed and the availability audit reports the gap.
    pub fn column(&self, name: &str) -> Vec<f64> {
        self.columns
            .get(name)
            .cloned()
            .unwrap_or_else(|| vec![0.0; self.len])
    }

    pub fn lat_bands(&self, row: usize) -> &[f64] {
        self.lat_bands.get(row).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Parse a `|`-separated latitude band vector, normalizing to sum 1 when the
/// mass is positive. Malformed tokens coerce to 0.0.
pub fn parse_lat_bands(value: &str) -> Vec<f64> {
    let out: Vec<f64> = value
        .split('|')
        .map(str::trim)
        .filter(|tok| !tok.is_empty())
        .map(|tok| tok.parse::<f64>().unwrap_or(0.0))
        .collect();
    let sum: f64 = out.iter().map(|v| v.max(0.0)).sum();
    if sum > TINY {
        out.iter().map(|v| v.max(0.0) / sum).collect()
    } else {
        out
    }
}

/// Exactly which required inputs a run directory is missing.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MissingReport {
    pub missing_artifacts: Vec<String>,
    pub missing_timeseries_columns: Vec<String>,
    pub missing_run_meta_keys: Vec<String>,
    pub missing_run_summary_keys: Vec<String>,
}

impl MissingReport {
    pub fn is_complete(&self) -> bool {
        self.missing_artifacts.is_empty()
            && self.missing_timeseries_columns.is_empty()
            && self.missing_run_meta_keys.is_empty()
            && self.missing_run_summary_keys.is_empty()
    }
}

/// Audit a run directory against the definitions' required artifact set.
///
/// Returns the availability flag, the itemized gaps, and the synthesized
/// `MISSING_METRIC` violation when anything is absent.
pub fn check_artifacts(
    run_dir: &Path,
    defs: &RealismDefs,
) -> (bool, MissingReport, Vec<Violation>) {
    let mut missing = MissingReport::default();

    for name in REQUIRED_RUN_ARTIFACTS {
        if !run_dir.join(name).exists() {
            missing.missing_artifacts.push(name.to_string());
        }
    }

    let ts_path = run_dir.join("timeseries.csv");
    if ts_path.exists() {
        match Timeseries::read(&ts_path) {
            Ok(ts) if !ts.is_empty() => {
                for col in &defs.required_timeseries_columns {
                    if !ts.has_column(col) {
                        missing.missing_timeseries_columns.push(col.clone());
                    }
                }
            }
            _ => {
                missing.missing_timeseries_columns = defs.required_timeseries_columns.clone();
            }
        }
    } else {
        missing.missing_timeseries_columns = defs.required_timeseries_columns.clone();
    }

    let meta_path = run_dir.join("run_meta.json");
    if meta_path.exists() {
        let meta = load_json(&meta_path).unwrap_or(serde_json::Value::Null);
        for key in &defs.required_run_meta_keys {
            if meta.get(key).is_none() {
                missing.missing_run_meta_keys.push(key.clone());
            }
        }
    } else {
        missing.missing_run_meta_keys = defs.required_run_meta_keys.clone();
    }

    let summary_path = run_dir.join("run_summary.json");
    if summary_path.exists() {
        let summary = load_json(&summary_path).unwrap_or(serde_json::Value::Null);
        for key in &defs.required_run_summary_keys {
            if summary.get(key).is_none() {
                missing.missing_run_summary_keys.push(key.clone());
            }
        }
    } else {
        missing.missing_run_summary_keys = defs.required_run_summary_keys.clone();
    }

    let ok = missing.is_complete();
    let mut violations = Vec::new();
    if !ok {
        let details = serde_json::to_value(&missing).unwrap_or(serde_json::Value::Null);
        violations.push(Violation::missing_metric(details));
    }
    (ok, missing, violations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::test_defs;

    fn scratch_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "worldtune_telemetry_{tag}_{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_parse_lat_bands_normalizes() {
        let bands = parse_lat_bands("1|1|2");
        assert_eq!(bands.len(), 3);
        assert!((bands.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!((bands[2] - 0.5).abs() < 1e-12);

        // Malformed tokens coerce instead of failing the whole row.
        let bands = parse_lat_bands("0.5|oops|0.5");
        assert!((bands[1] - 0.0).abs() < 1e-12);

        assert!(parse_lat_bands("").is_empty());
    }

    #[test]
    fn test_timeseries_tolerant_read() {
        let dir = scratch_dir("ts");
        let path = dir.join("timeseries.csv");
        std::fs::write(
            &path,
            "year,world_pop_total,pop_share_by_lat_band\n\
             -5000,1000,0.2|0.8\n\
             -4950,bogus,0.5|0.5\n",
        )
        .unwrap();

        let ts = Timeseries::read(&path).unwrap();
        assert_eq!(ts.len(), 2);
        assert_eq!(ts.column("world_pop_total"), vec![1000.0, 0.0]);
        assert_eq!(ts.column("nonexistent"), vec![0.0, 0.0]);
        assert!((ts.lat_bands(0)[1] - 0.8).abs() < 1e-12);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_check_artifacts_empty_dir_is_hard_fail() {
        let dir = scratch_dir("audit");
        let defs = test_defs();
        let (ok, missing, violations) = check_artifacts(&dir, &defs);
        assert!(!ok);
        assert_eq!(missing.missing_artifacts.len(), 4);
        assert!(!missing.missing_timeseries_columns.is_empty());
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].id, "MISSING_METRIC");
        assert!(violations[0].hardfail);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_has_required_artifacts_rejects_empty_files() {
        let dir = scratch_dir("arts");
        for name in REQUIRED_RUN_ARTIFACTS {
            std::fs::write(dir.join(name), "").unwrap();
        }
        assert!(!has_required_artifacts(&dir));
        for name in REQUIRED_RUN_ARTIFACTS {
            std::fs::write(dir.join(name), "x").unwrap();
        }
        assert!(has_required_artifacts(&dir));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
