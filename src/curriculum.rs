//! Horizon curriculum: which year window each evaluation stage runs over,
//! and when the medium checkpoint is due.
//!
//! Every horizon is clamped into the effective tuning window, which itself
//! is the schema's window policy intersected with the config's world bounds.
//! The ordering invariant `start <= inner <= medium <= long <= end` holds by
//! construction.

use anyhow::{bail, Result};
use serde::Serialize;

use crate::schema::{CurriculumSpec, WindowPolicy};
use crate::types::Horizon;

/// Resolved year windows for the whole tuning session.
#[derive(Debug, Clone, Serialize)]
pub struct HorizonPlan {
    pub policy_start_year: i64,
    pub policy_max_end_year: i64,
    /// Effective window after intersecting policy with config world bounds.
    pub start_year: i64,
    pub end_year: i64,
    pub inner_end_year: i64,
    pub medium_end_year: i64,
    pub long_end_year: i64,
    pub curriculum_enabled: bool,
    pub medium_enabled: bool,
    pub medium_check_every_iterations: u32,
    pub medium_check_every_accepted: u32,
}

impl HorizonPlan {
    /// Resolve the plan from policy, curriculum, and the config's declared
    /// world bounds. Fails when the clamped window is empty or the policy
    /// demands a full-length window the config cannot provide.
    pub fn resolve(
        policy: &WindowPolicy,
        curriculum: &CurriculumSpec,
        cfg_start_year: i64,
        cfg_end_year: i64,
    ) -> Result<Self> {
        policy.validate()?;
        let start_year = if policy.enforce_start_year {
            policy.start_year
        } else {
            cfg_start_year.max(policy.start_year)
        };
        let end_year = cfg_end_year.min(policy.max_end_year);
        if end_year < start_year {
            bail!(
                "tuning window invalid after policy clamp: start={start_year}, end={end_year} \
                 (config [{cfg_start_year}, {cfg_end_year}], policy [{}, {}])",
                policy.start_year,
                policy.max_end_year
            );
        }
        if !policy.allow_shorter_end_year && end_year != policy.max_end_year {
            bail!(
                "tuning policy requires end_year={}, but effective end_year is {end_year}",
                policy.max_end_year
            );
        }

        let enabled = curriculum.enabled;
        let long_end_year = curriculum.long_end_year.unwrap_or(end_year);
        let inner_end_year = if enabled {
            curriculum.inner_end_year.unwrap_or(end_year)
        } else {
            end_year
        };
        let medium_end_year = if enabled {
            curriculum.medium_end_year.unwrap_or(long_end_year)
        } else {
            long_end_year
        };
        let long_end_year = long_end_year.clamp(start_year, end_year);
        let inner_end_year = inner_end_year.clamp(start_year, long_end_year);
        let medium_end_year = medium_end_year.clamp(inner_end_year, long_end_year);
        let medium_check_every_iterations = if enabled {
            curriculum.medium_check_every_iterations
        } else {
            0
        };
        let medium_check_every_accepted = if enabled {
            curriculum.medium_check_every_accepted
        } else {
            0
        };
        let medium_enabled = enabled
            && medium_end_year > inner_end_year
            && (medium_check_every_iterations > 0 || medium_check_every_accepted > 0);

        Ok(Self {
            policy_start_year: policy.start_year,
            policy_max_end_year: policy.max_end_year,
            start_year,
            end_year,
            inner_end_year,
            medium_end_year,
            long_end_year,
            curriculum_enabled: enabled,
            medium_enabled,
            medium_check_every_iterations,
            medium_check_every_accepted,
        })
    }

    pub fn end_year_for(&self, horizon: Horizon) -> i64 {
        match horizon {
            Horizon::Inner => self.inner_end_year,
            Horizon::Medium => self.medium_end_year,
            Horizon::Long => self.long_end_year,
        }
    }

    /// Whether the medium checkpoint is due this iteration: every K
    /// iterations, or on every K-th would-be-accepted iteration.
    pub fn medium_required(&self, iteration: u32, accepted_iters: u32) -> bool {
        self.medium_enabled
            && ((self.medium_check_every_iterations > 0
                && iteration % self.medium_check_every_iterations == 0)
                || (self.medium_check_every_accepted > 0
                    && (accepted_iters + 1) % self.medium_check_every_accepted == 0))
    }
}
