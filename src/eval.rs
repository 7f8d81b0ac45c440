//! Seed evaluator: scores one completed run directory against the realism
//! envelope.
//!
//! The score has two halves. The base score is the mean over checkpoints of
//! four weighted components, each in [0, 1]:
//!
//! | Component | Measures |
//! |---|---|
//! | geography | settlement share, coastal/river access, latitude spread |
//! | constraint | food adequacy, shock rates, low-capability growth |
//! | coupling | lagged migration/conflict/market responses to food shocks |
//! | regime | urban-disease correlation and low disease under health capability |
//!
//! The penalty half subtracts `Pmax(class) * (severity/100)^2` per detected
//! violation. Structural hard fails (missing metrics, broken accounting,
//! persistent extinction) block promotion outright; anti-loophole heuristics
//! (storage smoothing, transport gaming, ignored depletion) only cost points.
//!
//! Evaluation is idempotent: it rewrites `run_summary.json` and
//! `violations.json` in place (preserving the invariants block) and stamps
//! `run_meta.json` with the envelope versions it scored under.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use serde_json::json;

use crate::definitions::RealismDefs;
use crate::stats::{clamp01, closeness, corr, mean, pvariance, relu, TINY};
use crate::telemetry::{check_artifacts, load_json, write_json, Timeseries};
use crate::types::{SeedEval, Violation};

/// Score the run directory for `seed`. When `write_eval_artifacts` is set the
/// evaluation is written back into the directory; reading never fails on
/// missing telemetry, which instead surfaces as a `MISSING_METRIC` hard fail.
pub fn evaluate_seed_run(
    seed: u64,
    run_dir: &Path,
    defs: &RealismDefs,
    write_eval_artifacts: bool,
) -> Result<SeedEval> {
    let t = &defs.thresholds;
    let (metric_ok, _missing, mut violations) = check_artifacts(run_dir, defs);

    let ts_path = run_dir.join("timeseries.csv");
    let ts = if ts_path.exists() {
        Timeseries::read(&ts_path).unwrap_or_default()
    } else {
        Timeseries::default()
    };
    let summary_path = run_dir.join("run_summary.json");
    let rs_raw = if summary_path.exists() {
        load_json(&summary_path).unwrap_or(serde_json::Value::Null)
    } else {
        serde_json::Value::Null
    };

    if ts.is_empty() {
        violations.push(Violation::missing_metric(json!({
            "empty_timeseries": true
        })));
    }

    let years: Vec<f64> = ts.column("year");
    let pop = ts.column("world_pop_total");
    let food = ts.column("world_food_adequacy_index");
    let pop_growth = ts.column("world_pop_growth_rate_annual");
    let trade = ts.column("world_trade_intensity");
    let urban = ts.column("world_urban_share_proxy");
    let tech = ts.column("world_tech_capability_index_median");
    let disease_rate = ts.column("world_disease_death_rate");
    let fam_exp = ts.column("famine_exposure_share_t");
    let migration = ts.column("migration_rate_t");
    let market = ts.column("market_access_median");
    let hab_small = ts.column("habitable_cell_share_pop_gt_small");
    let coastal = ts.column("pop_share_coastal_vs_inland");
    let river = ts.column("pop_share_river_proximal");
    let health_cap = ts.column("health_capability_index");
    let storage_cap = ts.column("storage_capability_index");
    let logistics_cap = ts.column("logistics_capability_index");
    let transport_cost = ts.column("transport_cost_index");
    let long_trade_proxy = ts.column("long_distance_trade_proxy");
    let spoilage = ts.column("spoilage_kcal");
    let storage_loss = ts.column("storage_loss_kcal");
    let avail_before = ts.column("available_kcal_before_losses");
    let extraction = ts.column("extraction_index");
    let fam_count = ts.column("famine_wave_count");
    let epi_count = ts.column("epidemic_wave_count");
    let war_count = ts.column("major_war_count");
    let mig_count = ts.column("mass_migration_count");

    // Width of the event-count window ending at row i, in years. The first
    // row has no predecessor and assumes the depletion window at the default
    // checkpoint cadence.
    let window_years = |i: usize| -> f64 {
        if i == 0 {
            (t.depletion_monotonic_window_m as f64 * 25.0).max(1.0)
        } else {
            (years[i] - years[i - 1]).max(1.0)
        }
    };

    // Structural: the simulator's own accounting invariants.
    if let Some(inv) = rs_raw.get("invariants").and_then(|v| v.as_object()) {
        if !inv.get("ok").and_then(|v| v.as_bool()).unwrap_or(true) {
            violations.push(Violation::new(
                "BROKEN_ACCOUNTING",
                100.0,
                true,
                json!({"message": inv.get("message").cloned().unwrap_or(json!(""))}),
            ));
        }
    }

    // Structural: population persistently under the extinction floor. At
    // most one violation per run, detected at the first crossing of the
    // grace period.
    let mut first_below: Option<usize> = None;
    for (i, &p) in pop.iter().enumerate() {
        if p < t.extinction_pop_floor {
            let start = *first_below.get_or_insert(i);
            let years_below = years[i] - years[start];
            if years_below > t.extinction_grace_years {
                violations.push(Violation::new(
                    "EXTINCTION_PERSISTENT",
                    100.0,
                    true,
                    json!({"years_below": years_below}),
                ));
                break;
            }
        } else {
            first_below = None;
        }
    }

    // Per-checkpoint component scores.
    let lag = t.coupling_lag_l.max(0) as usize;
    let corr_w = t.corr_window_w.max(0) as usize;
    let rates_w = &defs.shock_rate_weights;
    let mut ck_scores: Vec<f64> = Vec::with_capacity(ts.len());
    let mut major_war_rate: Vec<f64> = Vec::with_capacity(ts.len());
    let mut famine_wave_rate: Vec<f64> = Vec::with_capacity(ts.len());
    let mut epidemic_wave_rate: Vec<f64> = Vec::with_capacity(ts.len());
    let mut migration_wave_rate: Vec<f64> = Vec::with_capacity(ts.len());
    let mut adequacy_score: Vec<f64> = Vec::with_capacity(ts.len());

    for i in 0..ts.len() {
        let wy = window_years(i);
        let wc = wy / 100.0;
        let pop_avg = if i == 0 {
            pop[i]
        } else {
            0.5 * (pop[i] + pop[i - 1])
        };
        let scale = (pop_avg / t.rate_pop_base).max(TINY);
        let war_r = (war_count[i] / wc.max(TINY)) / scale;
        let fam_r = (fam_count[i] / wc.max(TINY)) / scale;
        let epi_r = (epi_count[i] / wc.max(TINY)) / scale;
        let mig_r = (mig_count[i] / wc.max(TINY)) / scale;
        major_war_rate.push(war_r);
        famine_wave_rate.push(fam_r);
        epidemic_wave_rate.push(epi_r);
        migration_wave_rate.push(mig_r);

        let adequacy = if t.use_sigmoid_adequacy {
            1.0 / (1.0 + (-t.sigmoid_k * (food[i] - 1.0)).exp())
        } else {
            clamp01(food[i])
        };
        adequacy_score.push(adequacy);

        // Geography: settlement spread, water access, latitude entropy.
        let g_settle = clamp01(hab_small[i] / t.settlement_target_share);
        let g_access = clamp01((coastal[i] + river[i]) / t.access_target_sum);
        let bands = ts.lat_bands(i);
        let mut entropy = 0.0;
        for &share in bands {
            let share = share.max(0.0);
            if share > TINY {
                entropy -= share * share.ln();
            }
        }
        if bands.len() >= 2 {
            entropy /= (bands.len() as f64).ln();
        }
        let g_lat = clamp01(entropy / t.lat_entropy_target);
        let geography = 0.45 * g_settle + 0.35 * g_access + 0.20 * g_lat;

        // Constraint: adequacy, shock pressure, low-capability growth.
        let shock_rate =
            rates_w.a_famine * fam_r + rates_w.b_epidemic * epi_r + rates_w.c_war * war_r;
        let c_shocks = clamp01(shock_rate / t.shock_min_rate);
        let c_growth = if tech[i] < t.capability_t1 {
            closeness(pop_growth[i], t.lowcap_growth_target, t.lowcap_growth_tol)
        } else {
            1.0
        };
        let constraint = 0.45 * adequacy + 0.25 * c_shocks + 0.30 * c_growth;

        // Coupling: lagged responses to adequacy shocks. Neutral 0.5 until
        // the lag window has warmed up.
        let coupling = if i >= lag {
            let d_adequacy = adequacy_score[i] - adequacy_score[i - lag];
            let d_migration = migration[i] - migration[i - lag];
            let d_conflict = major_war_rate[i] - major_war_rate[i - lag];
            let d_market = market[i] - market[i - lag];
            let d_fam_exp = fam_exp[i] - fam_exp[i - lag];
            let shock = relu(-d_adequacy);
            let (k_migration, k_war) = if shock > 0.0 {
                let rr_m = relu(d_migration) / shock.max(TINY);
                let rr_w = relu(d_conflict) / shock.max(TINY);
                (
                    closeness(rr_m, t.response_ratio_target, t.response_ratio_tol),
                    closeness(rr_w, t.response_ratio_target, t.response_ratio_tol),
                )
            } else {
                (1.0, 1.0)
            };
            let k_buffer = if d_market > 0.0 && d_fam_exp > 0.0 {
                0.0
            } else if d_market > 0.0 {
                let rr_b = relu(-d_fam_exp) / relu(d_market).max(TINY);
                closeness(rr_b, t.response_ratio_target, t.response_ratio_tol)
            } else {
                0.5
            };
            0.40 * k_migration + 0.35 * k_war + 0.25 * k_buffer
        } else {
            0.5
        };

        // Regime consistency: 0.5 wherever a regime does not apply.
        let r_score = if tech[i] < t.capability_t1 && i + 1 >= corr_w && corr_w > 0 {
            let x = &urban[i + 1 - corr_w..=i];
            let y = &disease_rate[i + 1 - corr_w..=i];
            closeness(
                corr(x, y),
                t.lowcap_disease_corr_target,
                t.lowcap_disease_corr_tol,
            )
        } else {
            0.5
        };
        let h_score = if health_cap[i] >= t.health_threshold {
            closeness(disease_rate[i], t.disease_low_target, t.disease_low_tol)
        } else {
            0.5
        };
        let regime = 0.60 * r_score + 0.40 * h_score;

        ck_scores.push(
            t.w_geography * geography
                + t.w_constraint * constraint
                + t.w_coupling * coupling
                + t.w_regime * regime,
        );
    }

    // Anti-loophole: implausibly flat food adequacy without real storage
    // capability and losses.
    let n_var = t.adequacy_var_window_n.max(0) as usize;
    if n_var > 0 && food.len() >= n_var {
        let window = &food[food.len() - n_var..];
        let var = pvariance(window);
        let loss_share = (spoilage.last().unwrap_or(&0.0) + storage_loss.last().unwrap_or(&0.0))
            / avail_before.last().unwrap_or(&0.0).max(TINY);
        let last_tech = *tech.last().unwrap_or(&0.0);
        let last_storage = *storage_cap.last().unwrap_or(&0.0);
        if last_tech < t.capability_t1
            && var < t.var_min
            && !(last_storage >= t.storage_s1 && loss_share >= t.loss_l1)
        {
            let severity = clamp01((t.var_min - var) / t.var_min.max(TINY)) * 100.0;
            violations.push(Violation::new(
                "STORAGE_SMOOTHING_CHEAT",
                severity,
                false,
                json!({"adequacy_var": var, "loss_share": loss_share}),
            ));
        }
    }

    // Anti-loophole: long-distance trade share beyond era plausibility
    // without the logistics capability and transport cost to back it.
    if !ts.is_empty() {
        let last_tech = *tech.last().unwrap_or(&0.0);
        let last_long_trade = *long_trade_proxy.last().unwrap_or(&0.0);
        if last_tech < t.capability_t1
            && last_long_trade > t.long_trade_share_max
            && !(*logistics_cap.last().unwrap_or(&0.0) >= t.logistics_r1
                && *transport_cost.last().unwrap_or(&0.0) >= t.transport_c1)
        {
            let excess = (last_long_trade - t.long_trade_share_max).max(0.0);
            let severity = clamp01(excess / t.long_trade_share_max.max(TINY)) * 100.0;
            violations.push(Violation::new(
                "TRANSPORT_CHEAT",
                severity,
                false,
                json!({"long_distance_trade_proxy": last_long_trade}),
            ));
        }
    }

    // Anti-loophole: extraction rising monotonically while capability stalls.
    let m_win = t.depletion_monotonic_window_m.max(0) as usize;
    if m_win > 0 && extraction.len() >= m_win && tech.len() >= m_win {
        let ex_win = &extraction[extraction.len() - m_win..];
        let tech_win = &tech[tech.len() - m_win..];
        let monotonic = ex_win.windows(2).all(|w| w[0] <= w[1] + 1e-9);
        let tech_growth = tech_win[tech_win.len() - 1] - tech_win[0];
        if monotonic && tech_growth <= 1e-6 {
            let slope = (ex_win[ex_win.len() - 1] - ex_win[0]) / ((m_win as f64 - 1.0).max(1.0));
            let severity = clamp01(slope / (ex_win[ex_win.len() - 1] + 1.0).max(1.0)) * 100.0;
            violations.push(Violation::new(
                "DEPLETION_IGNORED",
                severity,
                false,
                json!({"slope": slope, "window": m_win}),
            ));
        }
    }

    // Quadratic penalties keep small infractions cheap and gross ones near
    // their class cap.
    let penalties: f64 = violations
        .iter()
        .map(|v| {
            let sev = clamp01(v.severity / 100.0);
            defs.pmax_for(&v.id) * sev * sev
        })
        .sum();

    let base_score = mean(&ck_scores);
    let total_score = 100.0 * base_score - penalties;
    let mut hardfails: Vec<String> = violations
        .iter()
        .filter(|v| v.hardfail)
        .map(|v| v.id.clone())
        .collect();
    hardfails.sort();
    hardfails.dedup();
    let mut top_violations = violations.clone();
    top_violations.sort_by(|a, b| {
        b.severity
            .partial_cmp(&a.severity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    top_violations.truncate(10);

    let summary = json!({
        "seed": seed,
        "base_score_seed": base_score,
        "total_score": total_score,
        "penalty_points": penalties,
        "gates": {
            "metric_availability": metric_ok,
            "hardfails": hardfails,
            "hardfail_count": hardfails.len(),
        },
        "top_violations": top_violations,
        "scalar_metrics": {
            "world_pop_total_final": pop.last().copied().unwrap_or(0.0),
            "world_food_adequacy_index_final": food.last().copied().unwrap_or(0.0),
            "world_trade_intensity_final": trade.last().copied().unwrap_or(0.0),
            "world_urban_share_proxy_final": urban.last().copied().unwrap_or(0.0),
            "major_war_rate_final": major_war_rate.last().copied().unwrap_or(0.0),
            "famine_wave_rate_final": famine_wave_rate.last().copied().unwrap_or(0.0),
            "epidemic_wave_rate_final": epidemic_wave_rate.last().copied().unwrap_or(0.0),
        },
        "checkpoint_scores": ck_scores,
        "checkpoints": rs_raw.get("checkpoints").cloned().unwrap_or(json!([])),
        // Preserved so re-evaluating the same directory sees the same
        // accounting state.
        "invariants": rs_raw.get("invariants").cloned().unwrap_or(json!({"ok": true})),
    });

    if write_eval_artifacts {
        write_json(
            &run_dir.join("violations.json"),
            &json!({"violations": violations}),
        )?;
        write_json(&summary_path, &summary)?;
        let meta_path = run_dir.join("run_meta.json");
        let mut meta = if meta_path.exists() {
            load_json(&meta_path).unwrap_or(json!({}))
        } else {
            json!({})
        };
        if let Some(obj) = meta.as_object_mut() {
            obj.insert("goals_version".into(), json!(defs.goals_version));
            obj.insert("evaluator_version".into(), json!(defs.evaluator_version));
            obj.insert(
                "definitions_version".into(),
                json!(defs.definitions_version),
            );
            obj.insert("scoring_version".into(), json!(defs.scoring_version));
            obj.insert("definitions_values".into(), defs.thresholds_raw.clone());
        }
        write_json(&meta_path, &meta)?;
    }

    let mut key_series = BTreeMap::new();
    key_series.insert("world_pop_total".to_string(), pop);
    key_series.insert("world_food_adequacy_index".to_string(), food);
    key_series.insert(
        "habitable_cell_share_pop_gt_small".to_string(),
        hab_small,
    );
    key_series.insert("world_trade_intensity".to_string(), trade);
    key_series.insert("world_urban_share_proxy".to_string(), urban);
    key_series.insert("major_war_rate".to_string(), major_war_rate);
    key_series.insert("famine_wave_rate".to_string(), famine_wave_rate);
    key_series.insert("epidemic_wave_rate".to_string(), epidemic_wave_rate);

    Ok(SeedEval {
        seed,
        base_score,
        penalties,
        total_score,
        hardfails,
        violations,
        checkpoint_scores: ck_scores,
        key_series,
        top_violations,
        summary,
    })
}


#[cfg(test)]
mod tests {
    use super::fixtures::{scratch_dir, write_run, write_run_with};
    use super::*;
    use crate::definitions::test_defs;

    #[test]
    fn test_missing_run_dir_is_hard_fail_not_error() {
        let dir = scratch_dir("missing");
        let defs = test_defs();
        let eval = evaluate_seed_run(7, &dir, &defs, false).unwrap();
        assert!(eval.hardfails.contains(&"MISSING_METRIC".to_string()));
        assert!(eval.base_score.abs() < 1e-12);
        assert!(eval.total_score < 0.0);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_healthy_run_has_no_hardfails() {
        let dir = scratch_dir("healthy");
        let defs = test_defs();
        write_run(&dir, 11, &[1e6, 1.1e6, 1.2e6, 1.3e6, 1.4e6, 1.5e6]);
        let eval = evaluate_seed_run(11, &dir, &defs, false).unwrap();
        assert!(eval.hardfails.is_empty(), "hardfails: {:?}", eval.hardfails);
        assert!(eval.base_score > 0.0 && eval.base_score <= 1.0);
        assert!(
            (eval.total_score - (100.0 * eval.base_score - eval.penalties)).abs() < 1e-9
        );
        assert_eq!(eval.checkpoint_scores.len(), 6);
        assert_eq!(eval.key_series["world_pop_total"].len(), 6);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_evaluation_is_idempotent_after_writeback() {
        let dir = scratch_dir("idem");
        let defs = test_defs();
        write_run(&dir, 11, &[1e6, 1.1e6, 1.2e6, 1.3e6]);
        let first = evaluate_seed_run(11, &dir, &defs, true).unwrap();
        let second = evaluate_seed_run(11, &dir, &defs, true).unwrap();
        assert!((first.total_score - second.total_score).abs() < 1e-12);
        assert_eq!(first.hardfails, second.hardfails);
        assert_eq!(first.violations.len(), second.violations.len());

        // Version stamps landed in run metadata.
        let meta = load_json(&dir.join("run_meta.json")).unwrap();
        assert_eq!(meta["evaluator_version"], "v7");
        assert!(meta["definitions_values"].get("wG").is_some());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_persistent_extinction_is_exactly_one_violation() {
        let dir = scratch_dir("extinct");
        let defs = test_defs();
        // Below the 1000 floor for 250 years, far past the 100-year grace.
        write_run(&dir, 3, &[500.0, 400.0, 300.0, 200.0, 100.0, 50.0]);
        let eval = evaluate_seed_run(3, &dir, &defs, false).unwrap();
        let extinctions: Vec<_> = eval
            .violations
            .iter()
            .filter(|v| v.id == "EXTINCTION_PERSISTENT")
            .collect();
        assert_eq!(extinctions.len(), 1);
        assert!(extinctions[0].hardfail);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_dip_within_grace_is_not_extinction() {
        let dir = scratch_dir("dip");
        let defs = test_defs();
        // One 50-year dip under the floor, then recovery.
        write_run(&dir, 3, &[1e6, 500.0, 1e6, 1.1e6, 1.2e6]);
        let eval = evaluate_seed_run(3, &dir, &defs, false).unwrap();
        assert!(!eval
            .violations
            .iter()
            .any(|v| v.id == "EXTINCTION_PERSISTENT"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_broken_accounting_costs_score() {
        let defs = test_defs();
        let pop = [1e6, 1.1e6, 1.2e6, 1.3e6];

        let ok_dir = scratch_dir("acct_ok");
        write_run_with(&ok_dir, 5, &pop, true, |_, _| None);
        let ok_eval = evaluate_seed_run(5, &ok_dir, &defs, false).unwrap();

        let bad_dir = scratch_dir("acct_bad");
        write_run_with(&bad_dir, 5, &pop, false, |_, _| None);
        let bad_eval = evaluate_seed_run(5, &bad_dir, &defs, false).unwrap();

        assert!(bad_eval
            .hardfails
            .contains(&"BROKEN_ACCOUNTING".to_string()));
        assert!(bad_eval.total_score < ok_eval.total_score);
        // Same telemetry, so the gap is exactly the major penalty cap.
        assert!((ok_eval.total_score - bad_eval.total_score - defs.thresholds.pmax_major).abs() < 1e-9);
        let _ = std::fs::remove_dir_all(&ok_dir);
        let _ = std::fs::remove_dir_all(&bad_dir);
    }

    #[test]
    fn test_transport_cheat_severity_grows_with_excess() {
        let defs = test_defs();
        let pop = [1e6, 1.1e6, 1.2e6, 1.3e6];
        let mut severities = Vec::new();
        for (tag, proxy) in [("tc_low", "0.30"), ("tc_high", "0.60")] {
            let dir = scratch_dir(tag);
            // Low capability with rich long-distance trade and weak logistics.
            write_run_with(&dir, 9, &pop, true, |_, col| match col {
                "world_tech_capability_index_median" => Some("0.2".into()),
                "long_distance_trade_proxy" => Some(proxy.into()),
                "logistics_capability_index" => Some("0.1".into()),
                // Keep food variance honest so only the transport check fires.
                "world_food_adequacy_index" => None,
                "storage_capability_index" => Some("0.9".into()),
                "storage_loss_kcal" => Some("100.0".into()),
                _ => None,
            });
            let eval = evaluate_seed_run(9, &dir, &defs, false).unwrap();
            let v = eval
                .violations
                .iter()
                .find(|v| v.id == "TRANSPORT_CHEAT")
                .expect("transport cheat detected");
            assert!(!v.hardfail);
            severities.push(v.severity);
            let _ = std::fs::remove_dir_all(&dir);
        }
        assert!(severities[1] > severities[0]);
    }
}
