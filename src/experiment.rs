//! The prior × sample-size grid.
//!
//! One dataset is generated per sample size and shared by every prior at
//! that size. Each size re-draws from the same seed, so datasets of
//! different sizes are separate draws rather than nested subsets. Chain
//! seeds depend on the size only, so all priors at a given size see the
//! same random numbers and differ only in the posterior they target.
//!
//! Cells run concurrently on a dedicated rayon pool. A failing cell is
//! recorded as a [`CellFailure`] and the remaining cells still run.

use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::ExperimentConfig;
use crate::core::{draws, ChainRunner};
use crate::data::{DataGenerator, Dataset, TrueParams};
use crate::dev_tools::Timer;
use crate::error::{Error, Result};
use crate::model::{LinearRegression, PriorSpec, SLOPE};
use crate::sampler::{ChainStats, PosteriorSample, SamplerConfig};
use crate::stats::{Diagnostics, DiagnosticsReport};

use indicatif::MultiProgress;

/// Distance between the seed blocks of consecutive sample sizes.
const SIZE_SEED_STRIDE: u64 = 1_000_003;

/// Why a cell produced no posterior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellFailure {
    pub sample_size: usize,
    pub prior: String,
    pub reason: String,
}

/// Posterior draws and diagnostics of a successful cell.
#[derive(Debug, Clone)]
pub struct CellFit {
    /// One draw sequence per chain.
    pub chains: Vec<Vec<PosteriorSample>>,
    pub chain_stats: Vec<ChainStats>,
    pub diagnostics: DiagnosticsReport,
}

impl CellFit {
    /// Slope draws of every chain, concatenated in chain order.
    pub fn slope_draws(&self) -> Vec<f64> {
        self.chains
            .iter()
            .flatten()
            .map(|s| s.params.as_array()[SLOPE])
            .collect()
    }

    pub fn n_draws(&self) -> usize {
        self.chains.iter().map(Vec::len).sum()
    }
}

/// One (prior, sample size) cell of the grid.
#[derive(Debug, Clone)]
pub struct CellResult {
    pub prior: PriorSpec,
    pub sample_size: usize,
    pub outcome: std::result::Result<CellFit, CellFailure>,
    pub elapsed_secs: f64,
}

impl CellResult {
    pub fn fit(&self) -> Option<&CellFit> {
        self.outcome.as_ref().ok()
    }

    pub fn failure(&self) -> Option<&CellFailure> {
        self.outcome.as_ref().err()
    }
}

/// Everything the grid produced, in size-major order.
#[derive(Debug, Clone)]
pub struct ExperimentResult {
    pub truth: TrueParams,
    pub sample_sizes: Vec<usize>,
    pub priors: Vec<PriorSpec>,
    /// The dataset used at each entry of `sample_sizes`.
    pub datasets: Vec<Dataset>,
    pub cells: Vec<CellResult>,
}

impl ExperimentResult {
    pub fn get(&self, prior: &str, sample_size: usize) -> Option<&CellResult> {
        self.cells
            .iter()
            .find(|c| c.prior.name == prior && c.sample_size == sample_size)
    }

    pub fn dataset(&self, sample_size: usize) -> Option<&Dataset> {
        self.sample_sizes
            .iter()
            .position(|&n| n == sample_size)
            .map(|i| &self.datasets[i])
    }

    pub fn failures(&self) -> impl Iterator<Item = &CellFailure> {
        self.cells.iter().filter_map(CellResult::failure)
    }
}

/// Drives data generation, sampling and diagnostics across the grid.
#[derive(Debug, Clone)]
pub struct ExperimentOrchestrator {
    sample_sizes: Vec<usize>,
    priors: Vec<PriorSpec>,
    truth: TrueParams,
    seed: u64,
    n_chains: usize,
    sampler: SamplerConfig,
    diagnostics: Diagnostics,
    n_workers: usize,
    progress: bool,
}

impl ExperimentOrchestrator {
    /// Validates the grid. Sampler settings start from their defaults.
    pub fn new(
        sample_sizes: Vec<usize>,
        priors: Vec<PriorSpec>,
        truth: TrueParams,
        seed: u64,
    ) -> Result<Self> {
        DataGenerator::new(truth)?;
        if sample_sizes.is_empty() {
            return Err(Error::invalid("sample_sizes", "must not be empty"));
        }
        for (i, &n) in sample_sizes.iter().enumerate() {
            if n < 2 {
                return Err(Error::invalid(
                    "sample_sizes",
                    format!("every size must be at least 2, got {n}"),
                ));
            }
            if sample_sizes[..i].contains(&n) {
                return Err(Error::invalid(
                    "sample_sizes",
                    format!("size {n} appears twice"),
                ));
            }
        }
        if priors.is_empty() {
            return Err(Error::invalid("priors", "must not be empty"));
        }
        for (i, prior) in priors.iter().enumerate() {
            if priors[..i].iter().any(|p| p.name == prior.name) {
                return Err(Error::invalid(
                    "priors",
                    format!("prior name `{}` appears twice", prior.name),
                ));
            }
        }
        Ok(Self {
            sample_sizes,
            priors,
            truth,
            seed,
            n_chains: 4,
            sampler: SamplerConfig::default(),
            diagnostics: Diagnostics::default(),
            n_workers: 3,
            progress: false,
        })
    }

    pub fn from_config(config: &ExperimentConfig) -> Result<Self> {
        config.validate()?;
        Self::new(
            config.sample_sizes.clone(),
            config.priors()?,
            config.true_params(),
            config.seed,
        )?
        .with_chains(config.n_chains)?
        .with_sampler(config.sampler_config())?
        .with_workers(config.n_parallel_workers)
        .map(|o| o.with_diagnostics(config.diagnostics()))
    }

    pub fn with_chains(mut self, n_chains: usize) -> Result<Self> {
        if n_chains == 0 {
            return Err(Error::invalid("n_chains", "must be at least 1"));
        }
        self.n_chains = n_chains;
        Ok(self)
    }

    pub fn with_sampler(mut self, sampler: SamplerConfig) -> Result<Self> {
        sampler.validate()?;
        self.sampler = sampler;
        Ok(self)
    }

    pub fn with_diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn with_workers(mut self, n_workers: usize) -> Result<Self> {
        if n_workers == 0 {
            return Err(Error::invalid("n_parallel_workers", "must be at least 1"));
        }
        self.n_workers = n_workers;
        Ok(self)
    }

    /// Shows one progress bar per chain of every running cell.
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// Runs every cell of the grid.
    ///
    /// # Errors
    ///
    /// Only setup can fail (data generation or the worker pool). Sampling
    /// failures are recorded per cell.
    pub fn run(&self) -> Result<ExperimentResult> {
        let generator = DataGenerator::new(self.truth)?;
        let datasets = self
            .sample_sizes
            .iter()
            .map(|&n| generator.generate(n, self.seed))
            .collect::<Result<Vec<_>>>()?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.n_workers)
            .build()?;
        let multi = self.progress.then(MultiProgress::new);
        let grid: Vec<(usize, usize)> = (0..self.sample_sizes.len())
            .flat_map(|s| (0..self.priors.len()).map(move |p| (s, p)))
            .collect();

        info!(
            "running {} cells ({} sizes x {} priors) on {} workers",
            grid.len(),
            self.sample_sizes.len(),
            self.priors.len(),
            self.n_workers
        );
        let cells: Vec<CellResult> = pool.install(|| {
            grid.par_iter()
                .map(|&(s, p)| self.run_cell(s, &self.priors[p], &datasets[s], multi.as_ref()))
                .collect()
        });

        Ok(ExperimentResult {
            truth: self.truth,
            sample_sizes: self.sample_sizes.clone(),
            priors: self.priors.clone(),
            datasets,
            cells,
        })
    }

    fn run_cell(
        &self,
        size_index: usize,
        prior: &PriorSpec,
        dataset: &Dataset,
        multi: Option<&MultiProgress>,
    ) -> CellResult {
        let sample_size = self.sample_sizes[size_index];
        let label = format!("n={sample_size} {}", prior.name);
        let mut timer = Timer::new();
        info!("{label}: sampling");

        let model = LinearRegression::new(dataset, prior.clone());
        let seed = self
            .seed
            .wrapping_add((size_index as u64 + 1).wrapping_mul(SIZE_SEED_STRIDE));
        let outcome = ChainRunner::new(self.n_chains, self.sampler)
            .map(|runner| {
                let runner = runner.set_seed(seed).with_label(label.clone());
                match multi {
                    Some(multi) => runner.with_progress(multi.clone()),
                    None => runner,
                }
            })
            .and_then(|runner| runner.run(&model));

        let diagnostics = Diagnostics {
            target_accept: self.sampler.target_accept,
            ..self.diagnostics
        };
        let outcome = match outcome {
            Ok(outputs) => {
                let report = diagnostics.evaluate_runs(&outputs);
                for warning in &report.warnings {
                    warn!("{label}: {warning}");
                }
                info!(
                    "{label}: done, rhat={:.3} ess={:.0} ok={}",
                    report.rhat, report.ess, report.ok
                );
                Ok(CellFit {
                    chains: draws(&outputs),
                    chain_stats: outputs.into_iter().map(|o| o.stats).collect(),
                    diagnostics: report,
                })
            }
            Err(err) => {
                warn!("{label}: cell failed: {err}");
                Err(CellFailure {
                    sample_size,
                    prior: prior.name.clone(),
                    reason: err.to_string(),
                })
            }
        };

        CellResult {
            prior: prior.clone(),
            sample_size,
            outcome,
            elapsed_secs: timer.log(&label).as_secs_f64(),
        }
    }
}

/// Runs the grid with default sampler settings.
pub fn run_experiment(
    sample_sizes: &[usize],
    priors: &[PriorSpec],
    truth: TrueParams,
    seed: u64,
) -> Result<ExperimentResult> {
    ExperimentOrchestrator::new(sample_sizes.to_vec(), priors.to_vec(), truth, seed)?.run()
}
