//! # prior-sensitivity
//!
//! How much does the prior on a regression slope matter, and how quickly
//! does the data overrule it? This crate answers the question by simulation:
//! it draws datasets of several sizes from a known line, fits a Bayesian
//! linear regression under priors ranging from flat to strongly shrinking,
//! and compares the resulting posterior densities of the slope.
//!
//! The pieces, bottom-up:
//!
//! - [`data`]: synthetic data from known parameters.
//! - [`model`]: the log-posterior and its gradient for each prior.
//! - [`hmc`], [`nuts`], [`adapt`], [`sampler`]: a No-U-Turn sampler with
//!   step-size and diagonal-metric adaptation.
//! - [`core`]: several chains in parallel.
//! - [`stats`]: split R-hat, effective sample size and warnings.
//! - [`experiment`]: the prior × sample-size grid.
//! - [`summary`]: kernel density curves on shared grids.
//!
//! ## Example
//!
//! ```no_run
//! use prior_sensitivity::{ExperimentConfig, ExperimentOrchestrator, SummaryReporter};
//!
//! let config = ExperimentConfig::default();
//! let result = ExperimentOrchestrator::from_config(&config)?.run()?;
//! let artifact = SummaryReporter::new(config.density_grid_points).report(&result);
//! println!("{}", artifact.to_json()?);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod adapt;
pub mod config;
pub mod core;
pub mod data;
mod dev_tools;
pub mod error;
pub mod experiment;
pub mod hmc;
pub mod io;
pub mod model;
pub mod nuts;
pub mod sampler;
pub mod stats;
pub mod summary;

pub use config::ExperimentConfig;
pub use core::ChainRunner;
pub use data::{DataGenerator, Dataset, TrueParams};
pub use error::{Error, Result};
pub use experiment::{run_experiment, ExperimentOrchestrator, ExperimentResult};
pub use model::{GradientTarget, LinearRegression, ModelParameters, PriorSpec, SlopePrior};
pub use sampler::{Sampler, SamplerConfig, Trajectory};
pub use stats::{Diagnostics, DiagnosticsReport};
pub use summary::{summarize, SummaryArtifact, SummaryReporter};
