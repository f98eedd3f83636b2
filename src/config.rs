//! Experiment configuration.
//!
//! Every field has a default, so a JSON file only needs to name what it
//! changes:
//!
//! ```json
//! { "sample_sizes": [20, 200], "prior_slope_sds": [null, 1.0], "seed": 7 }
//! ```
//!
//! A `null` or `0` entry in `prior_slope_sds` is the flat prior.

use serde::{Deserialize, Serialize};

use crate::data::TrueParams;
use crate::error::{Error, Result};
use crate::model::{PriorSpec, SlopePrior};
use crate::sampler::{SamplerConfig, Trajectory};
use crate::stats::Diagnostics;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExperimentConfig {
    pub true_intercept: f64,
    pub true_slope: f64,
    pub true_noise_sd: f64,
    pub sample_sizes: Vec<usize>,
    pub prior_slope_sds: Vec<Option<f64>>,
    pub intercept_prior_sd: f64,
    pub noise_prior_sd: f64,
    pub n_chains: usize,
    pub n_warmup: usize,
    pub n_sampling: usize,
    pub target_accept: f64,
    pub max_tree_depth: usize,
    pub seed: u64,
    /// Experiment cells (and their chains) run on a pool of this many threads.
    pub n_parallel_workers: usize,
    pub density_grid_points: usize,
    pub max_rhat: f64,
    pub min_ess_fraction: f64,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            true_intercept: 1.0,
            true_slope: 2.0,
            true_noise_sd: 0.5,
            sample_sizes: vec![10, 100, 1000],
            prior_slope_sds: vec![None, Some(10.0), Some(1.0), Some(0.1)],
            intercept_prior_sd: 10.0,
            noise_prior_sd: 5.0,
            n_chains: 4,
            n_warmup: 1000,
            n_sampling: 1000,
            target_accept: 0.8,
            max_tree_depth: 10,
            seed: 123,
            n_parallel_workers: 3,
            density_grid_points: 512,
            max_rhat: 1.1,
            min_ess_fraction: 0.1,
        }
    }
}

fn positive(name: &'static str, value: usize) -> Result<()> {
    if value == 0 {
        Err(Error::invalid(name, "must be a positive integer"))
    } else {
        Ok(())
    }
}

impl ExperimentConfig {
    /// Checks every field. Runs before any data is generated.
    pub fn validate(&self) -> Result<()> {
        if !(self.true_intercept.is_finite() && self.true_slope.is_finite()) {
            return Err(Error::invalid(
                "true_params",
                "intercept and slope must be finite",
            ));
        }
        if !(self.true_noise_sd.is_finite() && self.true_noise_sd > 0.0) {
            return Err(Error::invalid("true_noise_sd", "must be positive"));
        }
        if self.sample_sizes.is_empty() {
            return Err(Error::invalid("sample_sizes", "must not be empty"));
        }
        if let Some(n) = self.sample_sizes.iter().find(|&&n| n < 2) {
            return Err(Error::invalid(
                "sample_sizes",
                format!("every size must be at least 2, got {n}"),
            ));
        }
        if self.prior_slope_sds.is_empty() {
            return Err(Error::invalid("prior_slope_sds", "must not be empty"));
        }
        positive("n_chains", self.n_chains)?;
        positive("n_warmup", self.n_warmup)?;
        positive("n_sampling", self.n_sampling)?;
        positive("n_parallel_workers", self.n_parallel_workers)?;
        if self.density_grid_points < 2 {
            return Err(Error::invalid("density_grid_points", "must be at least 2"));
        }
        if !(self.max_rhat.is_finite() && self.max_rhat > 1.0) {
            return Err(Error::invalid("max_rhat", "must be greater than 1"));
        }
        if !(self.min_ess_fraction > 0.0 && self.min_ess_fraction <= 1.0) {
            return Err(Error::invalid("min_ess_fraction", "must lie in (0, 1]"));
        }
        self.sampler_config().validate()?;
        self.priors().map(|_| ())
    }

    pub fn true_params(&self) -> TrueParams {
        TrueParams {
            intercept: self.true_intercept,
            slope: self.true_slope,
            noise_sd: self.true_noise_sd,
        }
    }

    /// The priors in configured order, named after their slope component.
    pub fn priors(&self) -> Result<Vec<PriorSpec>> {
        self.prior_slope_sds
            .iter()
            .map(|&sd| {
                PriorSpec::new(
                    self.intercept_prior_sd,
                    SlopePrior::from_sd(sd)?,
                    self.noise_prior_sd,
                )
            })
            .collect()
    }

    pub fn sampler_config(&self) -> SamplerConfig {
        SamplerConfig {
            n_warmup: self.n_warmup,
            n_sampling: self.n_sampling,
            target_accept: self.target_accept,
            trajectory: Trajectory::NoUTurn {
                max_depth: self.max_tree_depth,
            },
            ..SamplerConfig::default()
        }
    }

    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            max_rhat: self.max_rhat,
            min_ess_fraction: self.min_ess_fraction,
            target_accept: self.target_accept,
            ..Diagnostics::default()
        }
    }
}
