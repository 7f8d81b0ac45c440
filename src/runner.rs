//! Run executor: invokes the simulator per seed, caches completed runs, and
//! evaluates results in parallel.
//!
//! Run identity is `(config hash, seed, window, checkpoint interval,
//! backend)`. Reuse order for each requested seed:
//!
//! 1. the working seed directory itself, when its artifacts and metadata
//!    match the request,
//! 2. the shared cache store (optionally materialized back by copy),
//! 3. a fresh simulator invocation, which then populates the cache.
//!
//! The simulator is behind the [`SimulatorInvoker`] trait so tests can
//! substitute a fake that writes synthetic artifacts; production uses
//! [`CliInvoker`] over `std::process::Command`. A non-zero exit status is
//! fatal for that seed request, with no retry.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use rayon::prelude::*;

use crate::config::SimConfig;
use crate::definitions::RealismDefs;
use crate::eval::evaluate_seed_run;
use crate::telemetry::{has_required_artifacts, load_json, REQUIRED_RUN_ARTIFACTS};
use crate::types::{Backend, SeedEval};

/// One simulator run to produce or reuse.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub seed: u64,
    pub config_hash16: String,
    pub start_year: i64,
    pub end_year: i64,
    pub checkpoint_every: i64,
    pub backend: Backend,
}

impl RunRequest {
    /// Directory name under the cache root identifying this run.
    pub fn cache_key(&self) -> String {
        format!(
            "{}_{}_{}_{}_{}_{}",
            self.config_hash16,
            self.seed,
            self.start_year,
            self.end_year,
            self.checkpoint_every,
            self.backend.token()
        )
    }
}

/// Abstraction over the external simulator binary.
pub trait SimulatorInvoker: Sync {
    /// Produce a complete run directory at `out_dir` for `req`, reading the
    /// configuration at `config_path`.
    fn invoke(&self, req: &RunRequest, config_path: &Path, out_dir: &Path) -> Result<()>;
}

/// Production invoker: `worldsim_cli` as a child process with the runtime
/// hygiene environment applied.
pub struct CliInvoker {
    exe_dir: PathBuf,
    env: BTreeMap<String, String>,
}

impl CliInvoker {
    pub fn new(exe_dir: PathBuf, env: BTreeMap<String, String>) -> Self {
        Self { exe_dir, env }
    }
}

impl SimulatorInvoker for CliInvoker {
    fn invoke(&self, req: &RunRequest, config_path: &Path, out_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create {}", out_dir.display()))?;
        let exe = self.exe_dir.join("worldsim_cli");
        let status = Command::new(&exe)
            .arg("--seed")
            .arg(req.seed.to_string())
            .arg("--config")
            .arg(config_path)
            .arg("--startYear")
            .arg(req.start_year.to_string())
            .arg("--endYear")
            .arg(req.end_year.to_string())
            .arg("--checkpointEveryYears")
            .arg(req.checkpoint_every.to_string())
            .arg("--outDir")
            .arg(out_dir)
            .arg("--useGPU")
            .arg(req.backend.gpu_flag())
            .envs(&self.env)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .with_context(|| format!("failed to spawn {}", exe.display()))?;
        if !status.success() {
            bail!(
                "worldsim_cli failed seed={} rc={}",
                req.seed,
                status.code().unwrap_or(-1)
            );
        }
        Ok(())
    }
}

/// Resolved cache behavior for a tuning session.
#[derive(Debug, Clone)]
pub struct RunCachePolicy {
    pub enabled: bool,
    pub cache_root: PathBuf,
    pub reuse_existing_seed_dirs: bool,
    pub materialize_from_cache: bool,
}

impl RunCachePolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            cache_root: PathBuf::new(),
            reuse_existing_seed_dirs: true,
            materialize_from_cache: false,
        }
    }
}

/// True when the run metadata in `run_dir` identifies exactly `req`.
pub fn run_meta_matches(run_dir: &Path, req: &RunRequest) -> bool {
    let meta_path = run_dir.join("run_meta.json");
    let Ok(meta) = load_json(&meta_path) else {
        return false;
    };
    let backend = meta
        .get("backend")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_lowercase();
    meta.get("seed").and_then(|v| v.as_u64()) == Some(req.seed)
        && meta.get("config_hash").and_then(|v| v.as_str()) == Some(req.config_hash16.as_str())
        && meta.get("start_year").and_then(|v| v.as_i64()) == Some(req.start_year)
        && meta.get("end_year").and_then(|v| v.as_i64()) == Some(req.end_year)
        && backend == req.backend.token()
}

/// Copy the four run artifacts from one run directory to another.
pub fn copy_run_artifacts(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst).with_context(|| format!("failed to create {}", dst.display()))?;
    for name in REQUIRED_RUN_ARTIFACTS {
        std::fs::copy(src.join(name), dst.join(name)).with_context(|| {
            format!("failed to copy {name} from {} to {}", src.display(), dst.display())
        })?;
    }
    Ok(())
}

/// Executes seed sets for one tuning session.
pub struct Runner<'a> {
    pub invoker: &'a dyn SimulatorInvoker,
    pub defs: &'a RealismDefs,
    pub cache: RunCachePolicy,
    pub jobs: usize,
    pub checkpoint_every: i64,
}

impl<'a> Runner<'a> {
    /// Run (or reuse) and evaluate one seed set against `config`, writing
    /// per-seed run directories under `out_dir/seed_{seed}`.
    #[allow(clippy::too_many_arguments)]
    pub fn run_seed_set(
        &self,
        seeds: &[u64],
        config: &SimConfig,
        config_path: &Path,
        out_dir: &Path,
        start_year: i64,
        end_year: i64,
        backend: Backend,
        label: &str,
        write_eval_artifacts: bool,
    ) -> Result<Vec<SeedEval>> {
        std::fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create {}", out_dir.display()))?;
        if self.cache.enabled {
            std::fs::create_dir_all(&self.cache.cache_root)
                .with_context(|| format!("failed to create {}", self.cache.cache_root.display()))?;
        }
        let hash16 = config.hash16();
        let jobs = self.jobs.clamp(1, seeds.len().max(1));
        crate::progress::stage(
            label,
            &format!(
                "starting {} seed(s), jobs={jobs}, backend={backend}, years={start_year}->{end_year}",
                seeds.len()
            ),
        );

        let run_one = |&seed: &u64| -> Result<SeedEval> {
            let req = RunRequest {
                seed,
                config_hash16: hash16.clone(),
                start_year,
                end_year,
                checkpoint_every: self.checkpoint_every,
                backend,
            };
            let seed_dir = out_dir.join(format!("seed_{seed}"));
            let eval_dir = self.resolve_run_dir(&req, config_path, &seed_dir)?;
            let eval = evaluate_seed_run(seed, &eval_dir, self.defs, write_eval_artifacts)?;
            crate::progress::stage(label, &format!("seed {seed} done"));
            Ok(eval)
        };

        if jobs == 1 {
            seeds.iter().map(run_one).collect()
        } else {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(jobs)
                .build()
                .context("failed to build seed pool")?;
            pool.install(|| seeds.par_iter().map(run_one).collect())
        }
    }

    /// Decide which directory holds valid artifacts for `req`, invoking the
    /// simulator only when neither the working directory nor the cache has
    /// them. Returns the directory to evaluate from.
    fn resolve_run_dir(
        &self,
        req: &RunRequest,
        config_path: &Path,
        seed_dir: &Path,
    ) -> Result<PathBuf> {
        if self.cache.reuse_existing_seed_dirs
            && has_required_artifacts(seed_dir)
            && run_meta_matches(seed_dir, req)
        {
            return Ok(seed_dir.to_path_buf());
        }

        if self.cache.enabled {
            let cache_dir = self.cache.cache_root.join(req.cache_key());
            if has_required_artifacts(&cache_dir) && run_meta_matches(&cache_dir, req) {
                return if self.cache.materialize_from_cache {
                    copy_run_artifacts(&cache_dir, seed_dir)?;
                    Ok(seed_dir.to_path_buf())
                } else {
                    Ok(cache_dir)
                };
            }
        }

        self.invoker.invoke(req, config_path, seed_dir)?;
        if self.cache.enabled {
            let cache_dir = self.cache.cache_root.join(req.cache_key());
            // Cache population is best-effort; a partial copy is caught by
            // the artifact check on the next lookup.
            let _ = copy_run_artifacts(seed_dir, &cache_dir);
        }
        Ok(seed_dir.to_path_buf())
    }

    /// Re-evaluate an already-produced seed set without touching the
    /// simulator; `None` when any seed directory is incomplete.
    pub fn load_seed_set_from_existing(
        &self,
        seeds: &[u64],
        seed_root: &Path,
    ) -> Result<Option<Vec<SeedEval>>> {
        let mut out = Vec::with_capacity(seeds.len());
        for &seed in seeds {
            let dir = seed_root.join(format!("seed_{seed}"));
            if !has_required_artifacts(&dir) {
                return Ok(None);
            }
            out.push(evaluate_seed_run(seed, &dir, self.defs, false)?);
        }
        Ok(Some(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::test_defs;
    use crate::eval::fixtures::write_run;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fake simulator that writes a healthy fixture run and counts calls.
    struct FakeInvoker {
        calls: AtomicUsize,
    }

    impl FakeInvoker {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl SimulatorInvoker for FakeInvoker {
        fn invoke(&self, req: &RunRequest, _config_path: &Path, out_dir: &Path) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            write_run(out_dir, req.seed, &[1e6, 1.1e6, 1.2e6, 1.3e6]);
            // Metadata must identify the request or reuse will refuse it.
            crate::telemetry::write_json(
                &out_dir.join("run_meta.json"),
                &serde_json::json!({
                    "seed": req.seed,
                    "config_hash": req.config_hash16,
                    "start_year": req.start_year,
                    "end_year": req.end_year,
                    "backend": req.backend.token(),
                }),
            )
        }
    }

    fn scratch(tag: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("worldtune_runner_{tag}_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn config() -> SimConfig {
        SimConfig::from_value(toml::from_str("[world]\nstartYear = -5000\n").unwrap())
    }

    #[test]
    fn test_cache_key_distinguishes_every_axis() {
        let base = RunRequest {
            seed: 7,
            config_hash16: "aaaa".into(),
            start_year: -5000,
            end_year: 2025,
            checkpoint_every: 50,
            backend: Backend::Cpu,
        };
        assert_eq!(base.cache_key(), "aaaa_7_-5000_2025_50_cpu");
        let gpu = RunRequest {
            backend: Backend::Gpu,
            ..base.clone()
        };
        assert_ne!(base.cache_key(), gpu.cache_key());
    }

    #[test]
    fn test_simulator_invoked_once_per_cache_key() {
        let root = scratch("cache_once");
        let invoker = FakeInvoker::new();
        let defs = test_defs();
        let runner = Runner {
            invoker: &invoker,
            defs: &defs,
            cache: RunCachePolicy {
                enabled: true,
                cache_root: root.join("cache"),
                reuse_existing_seed_dirs: true,
                materialize_from_cache: false,
            },
            jobs: 1,
            checkpoint_every: 50,
        };
        let cfg = config();
        let cfg_path = root.join("sim_config.toml");
        cfg.write(&cfg_path).unwrap();

        let seeds = [7u64, 11];
        let first = runner
            .run_seed_set(
                &seeds,
                &cfg,
                &cfg_path,
                &root.join("a"),
                -5000,
                2025,
                Backend::Cpu,
                "test:a",
                false,
            )
            .unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 2);

        // Same identity into a fresh working directory: served from cache.
        let second = runner
            .run_seed_set(
                &seeds,
                &cfg,
                &cfg_path,
                &root.join("b"),
                -5000,
                2025,
                Backend::Cpu,
                "test:b",
                false,
            )
            .unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 2);

        // A different window is a different key and must re-run.
        runner
            .run_seed_set(
                &[7u64],
                &cfg,
                &cfg_path,
                &root.join("c"),
                -5000,
                1500,
                Backend::Cpu,
                "test:c",
                false,
            )
            .unwrap();
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 3);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn test_meta_mismatch_forces_rerun() {
        let root = scratch("meta");
        let invoker = FakeInvoker::new();
        let defs = test_defs();
        let runner = Runner {
            invoker: &invoker,
            defs: &defs,
            cache: RunCachePolicy::disabled(),
            jobs: 1,
            checkpoint_every: 50,
        };
        let cfg = config();
        let cfg_path = root.join("sim_config.toml");
        cfg.write(&cfg_path).unwrap();

        runner
            .run_seed_set(
                &[7u64],
                &cfg,
                &cfg_path,
                &root.join("work"),
                -5000,
                2025,
                Backend::Cpu,
                "test",
                false,
            )
            .unwrap();
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 1);

        // Same directory, same request: the working dir is reused.
        runner
            .run_seed_set(
                &[7u64],
                &cfg,
                &cfg_path,
                &root.join("work"),
                -5000,
                2025,
                Backend::Cpu,
                "test",
                false,
            )
            .unwrap();
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 1);

        // Different backend: the stale directory must not satisfy it.
        runner
            .run_seed_set(
                &[7u64],
                &cfg,
                &cfg_path,
                &root.join("work"),
                -5000,
                2025,
                Backend::Gpu,
                "test",
                false,
            )
            .unwrap();
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 2);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn test_load_from_existing_requires_complete_set() {
        let root = scratch("existing");
        let defs = test_defs();
        let invoker = FakeInvoker::new();
        let runner = Runner {
            invoker: &invoker,
            defs: &defs,
            cache: RunCachePolicy::disabled(),
            jobs: 1,
            checkpoint_every: 50,
        };
        write_run(&root.join("seed_1"), 1, &[1e6, 1.1e6]);
        assert!(runner
            .load_seed_set_from_existing(&[1, 2], &root)
            .unwrap()
            .is_none());
        write_run(&root.join("seed_2"), 2, &[1e6, 1.1e6]);
        let loaded = runner
            .load_seed_set_from_existing(&[1, 2], &root)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.len(), 2);
        let _ = std::fs::remove_dir_all(&root);
    }
}
