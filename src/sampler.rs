//! A single Markov chain: warmup with adaptation, then retained sampling.
//!
//! The [`Sampler`] owns its [`ChainState`] and random number generator. It
//! moves through two phases:
//!
//! * [`Phase::Warmup`] tunes the step size by dual averaging and the diagonal
//!   inverse mass from windowed variance estimates. Warmup draws are dropped.
//! * [`Phase::Sampling`] freezes step size and metric; every iteration is
//!   retained as a [`PosteriorSample`].
//!
//! The chain only ever moves to points where the log-density and gradient
//! are finite, so every retained sample is finite.

use indicatif::ProgressBar;
use log::debug;
use rand::prelude::*;
use serde::{Deserialize, Serialize};

use crate::adapt::{find_reasonable_step_size, WindowedAdaptation};
use crate::error::{Error, Result};
use crate::hmc::{static_transition, Metric, PhasePoint, Transition};
use crate::model::{GradientTarget, ModelParameters, DIM};
use crate::nuts::nuts_transition;
use crate::stats::ChainTracker;

/// How far each transition integrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trajectory {
    /// No-U-turn doubling, capped at `max_depth` doublings.
    NoUTurn { max_depth: usize },
    /// A fixed number of leapfrog steps with a Metropolis correction.
    Static { n_leapfrog: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    pub n_warmup: usize,
    pub n_sampling: usize,
    pub target_accept: f64,
    pub trajectory: Trajectory,
    /// Starting point of the initial step-size search.
    pub initial_step_size: f64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            n_warmup: 1000,
            n_sampling: 1000,
            target_accept: 0.8,
            trajectory: Trajectory::NoUTurn { max_depth: 10 },
            initial_step_size: 1.0,
        }
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n_sampling == 0 {
            return Err(Error::invalid("n_sampling", "must be at least 1"));
        }
        if !(self.target_accept > 0.0 && self.target_accept < 1.0) {
            return Err(Error::invalid(
                "target_accept",
                format!("must lie in (0, 1), got {}", self.target_accept),
            ));
        }
        match self.trajectory {
            Trajectory::NoUTurn { max_depth } if !(1..=15).contains(&max_depth) => {
                return Err(Error::invalid(
                    "max_tree_depth",
                    format!("must lie in 1..=15, got {max_depth}"),
                ))
            }
            Trajectory::Static { n_leapfrog: 0 } => {
                return Err(Error::invalid("n_leapfrog", "must be at least 1"))
            }
            _ => {}
        }
        if !(self.initial_step_size.is_finite() && self.initial_step_size > 0.0) {
            return Err(Error::invalid(
                "initial_step_size",
                "must be positive and finite",
            ));
        }
        Ok(())
    }

    pub fn total_iterations(&self) -> usize {
        self.n_warmup + self.n_sampling
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Warmup,
    Sampling,
}

/// Everything one chain carries between iterations.
#[derive(Debug, Clone)]
pub struct ChainState {
    pub point: PhasePoint,
    /// Step size used once sampling starts.
    pub step_size: f64,
    pub metric: Metric,
    /// Iterations completed, warmup included.
    pub iteration: usize,
}

impl ChainState {
    pub fn parameters(&self) -> ModelParameters {
        ModelParameters::new(self.point.q[0], self.point.q[1], self.point.q[2])
    }
}

/// One retained draw.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PosteriorSample {
    pub params: ModelParameters,
    pub logp: f64,
    pub chain: usize,
    /// Index within the sampling phase.
    pub iteration: usize,
}

/// Per-chain sampler statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainStats {
    pub chain: usize,
    pub step_size: f64,
    pub inv_mass: Vec<f64>,
    /// Mean acceptance statistic over warmup, `None` without warmup.
    pub warmup_accept_mean: Option<f64>,
    /// Mean acceptance statistic over the sampling phase.
    pub accept_mean: f64,
    /// Divergent transitions during sampling.
    pub n_divergent: usize,
    /// Degenerate transitions over the whole run.
    pub n_degenerate: usize,
    /// Sampling transitions that stopped at the depth cap.
    pub n_max_depth: usize,
    pub mean_tree_depth: f64,
    pub n_leapfrog: usize,
}

/// Draws and statistics of one finished chain.
#[derive(Debug, Clone)]
pub struct ChainOutput {
    pub samples: Vec<PosteriorSample>,
    pub stats: ChainStats,
}

#[derive(Debug, Clone, Default)]
struct Accumulator {
    warmup_accept: f64,
    accept: f64,
    n_divergent: usize,
    n_degenerate: usize,
    n_max_depth: usize,
    depth_sum: usize,
    n_leapfrog: usize,
}

/// A single-chain NUTS/HMC sampler.
pub struct Sampler<'a, T: ?Sized> {
    target: &'a T,
    config: SamplerConfig,
    chain: usize,
    rng: SmallRng,
    state: ChainState,
    adaptation: WindowedAdaptation,
    acc: Accumulator,
    initialized: bool,
}

impl<'a, T> Sampler<'a, T>
where
    T: GradientTarget + ?Sized,
{
    /// Creates a chain starting at `initial`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a bad `config` or a target that is not
    /// three-dimensional, `Initialization` when the target is not finite at
    /// `initial`.
    pub fn new(
        target: &'a T,
        config: SamplerConfig,
        chain: usize,
        initial: ModelParameters,
    ) -> Result<Self> {
        config.validate()?;
        if target.dim() != DIM {
            return Err(Error::invalid(
                "target",
                format!("expected {DIM} parameters, got {}", target.dim()),
            ));
        }
        let point = PhasePoint::new(target, initial.to_array())
            .map_err(|_| Error::Initialization { chain, attempts: 1 })?;
        Ok(Self {
            target,
            chain,
            rng: SmallRng::seed_from_u64(thread_rng().gen::<u64>()),
            state: ChainState {
                point,
                step_size: config.initial_step_size,
                metric: Metric::unit(DIM),
                iteration: 0,
            },
            adaptation: WindowedAdaptation::new(
                DIM,
                config.n_warmup,
                config.target_accept,
                config.initial_step_size,
            ),
            config,
            acc: Accumulator::default(),
            initialized: false,
        })
    }

    /// Sets a new random seed.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    pub fn state(&self) -> &ChainState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        if self.state.iteration < self.config.n_warmup {
            Phase::Warmup
        } else {
            Phase::Sampling
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.iteration >= self.config.total_iterations()
    }

    /// Step size the next transition will use.
    pub fn current_step_size(&self) -> f64 {
        match self.phase() {
            Phase::Warmup if self.initialized => self.adaptation.step_size(),
            _ => self.state.step_size,
        }
    }

    fn initialize(&mut self) {
        let eps = find_reasonable_step_size(
            self.target,
            &self.state.metric,
            &self.state.point,
            self.config.initial_step_size,
            &mut self.rng,
        );
        self.adaptation.restart(eps);
        self.state.step_size = eps;
        self.initialized = true;
        debug!("chain {}: initial step size {eps:.4}", self.chain);
    }

    /// Performs one transition and advances the iteration counter.
    pub fn step(&mut self) -> Transition {
        if !self.initialized {
            self.initialize();
        }
        let phase = self.phase();
        let step_size = self.current_step_size();
        let transition = match self.config.trajectory {
            Trajectory::NoUTurn { max_depth } => nuts_transition(
                self.target,
                &self.state.metric,
                &self.state.point,
                step_size,
                max_depth,
                &mut self.rng,
            ),
            Trajectory::Static { n_leapfrog } => static_transition(
                self.target,
                &self.state.metric,
                &self.state.point,
                step_size,
                n_leapfrog,
                &mut self.rng,
            ),
        };
        self.state.point.clone_from(&transition.point);
        self.record(phase, &transition);

        if phase == Phase::Warmup {
            self.adapt(&transition);
        }
        self.state.iteration += 1;
        transition
    }

    fn record(&mut self, phase: Phase, t: &Transition) {
        self.acc.n_leapfrog += t.n_leapfrog;
        if t.degenerate {
            self.acc.n_degenerate += 1;
        }
        match phase {
            Phase::Warmup => self.acc.warmup_accept += t.accept_stat,
            Phase::Sampling => {
                self.acc.accept += t.accept_stat;
                self.acc.depth_sum += t.tree_depth;
                if t.divergent {
                    self.acc.n_divergent += 1;
                }
                if let Trajectory::NoUTurn { max_depth } = self.config.trajectory {
                    if t.tree_depth >= max_depth && !t.divergent && !t.degenerate {
                        self.acc.n_max_depth += 1;
                    }
                }
            }
        }
    }

    fn adapt(&mut self, t: &Transition) {
        let iteration = self.state.iteration;
        if let Some(inv_mass) = self.adaptation.update(iteration, &t.point.q, t.accept_stat) {
            match Metric::from_inv_mass(inv_mass) {
                Ok(metric) => {
                    self.state.metric = metric;
                    let eps = find_reasonable_step_size(
                        self.target,
                        &self.state.metric,
                        &self.state.point,
                        self.adaptation.step_size(),
                        &mut self.rng,
                    );
                    self.adaptation.restart(eps);
                    debug!(
                        "chain {}: metric updated at iteration {}, inv_mass={}, step size {eps:.4}",
                        self.chain,
                        iteration + 1,
                        self.state.metric.inv_mass()
                    );
                }
                Err(err) => debug!("chain {}: kept previous metric: {err}", self.chain),
            }
        }
        if iteration + 1 == self.config.n_warmup {
            self.state.step_size = self.adaptation.adapted_step_size();
            debug!(
                "chain {}: warmup finished, step size {:.4}",
                self.chain, self.state.step_size
            );
        }
    }

    /// Runs the remaining iterations and returns the retained draws.
    ///
    /// # Errors
    ///
    /// `ChainFailure` when every transition of the chain was degenerate.
    pub fn run(mut self, progress: Option<&ProgressBar>) -> Result<ChainOutput> {
        let mut samples = Vec::with_capacity(self.config.n_sampling);
        let mut tracker = ChainTracker::new(100);
        if let Some(pb) = progress {
            pb.set_length(self.config.total_iterations() as u64);
        }

        while !self.is_finished() {
            let phase = self.phase();
            let t = self.step();
            tracker.push(t.accept_stat);
            if phase == Phase::Sampling {
                samples.push(PosteriorSample {
                    params: self.state.parameters(),
                    logp: self.state.point.logp,
                    chain: self.chain,
                    iteration: samples.len(),
                });
            }
            if let Some(pb) = progress {
                pb.inc(1);
                pb.set_message(format!(
                    "{phase:?} p(accept)≈{:.2} eps≈{:.3}",
                    tracker.mean(),
                    self.current_step_size()
                ));
            }
        }

        let total = self.config.total_iterations();
        if self.acc.n_degenerate == total {
            return Err(Error::ChainFailure {
                chain: self.chain,
                iterations: total,
            });
        }
        Ok(ChainOutput {
            samples,
            stats: self.stats(),
        })
    }

    pub fn stats(&self) -> ChainStats {
        let n_warmup = self.config.n_warmup.min(self.state.iteration);
        let n_sampling = self.state.iteration - n_warmup;
        let mean = |sum: f64, n: usize| if n > 0 { sum / n as f64 } else { 0.0 };
        ChainStats {
            chain: self.chain,
            step_size: self.state.step_size,
            inv_mass: self.state.metric.inv_mass().to_vec(),
            warmup_accept_mean: (n_warmup > 0).then(|| mean(self.acc.warmup_accept, n_warmup)),
            accept_mean: mean(self.acc.accept, n_sampling),
            n_divergent: self.acc.n_divergent,
            n_degenerate: self.acc.n_degenerate,
            n_max_depth: self.acc.n_max_depth,
            mean_tree_depth: mean(self.acc.depth_sum as f64, n_sampling),
            n_leapfrog: self.acc.n_leapfrog,
        }
    }
}
