//! Running several independent chains in parallel.
//!
//! Each chain gets its own random stream derived from the runner seed
//! (`seed + chain`) and starts from a jittered point, so chains are
//! dispersed enough for R-hat to be meaningful. Chains share only the
//! read-only target and run on rayon's pool without synchronization.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::debug;
use rand::prelude::*;
use rand_distr::Uniform;
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::model::{GradientTarget, ModelParameters};
use crate::sampler::{ChainOutput, PosteriorSample, Sampler, SamplerConfig};

/// Half-width of the uniform jitter applied to the starting point.
const INIT_JITTER: f64 = 2.0;
/// Starting points tried per chain before giving up.
const MAX_INIT_ATTEMPTS: usize = 100;

/// Runs `n_chains` copies of a [`Sampler`] against the same target.
#[derive(Debug, Clone)]
pub struct ChainRunner {
    n_chains: usize,
    config: SamplerConfig,
    seed: u64,
    label: String,
    progress: Option<MultiProgress>,
}

impl ChainRunner {
    pub fn new(n_chains: usize, config: SamplerConfig) -> Result<Self> {
        if n_chains == 0 {
            return Err(Error::invalid("n_chains", "must be at least 1"));
        }
        config.validate()?;
        Ok(Self {
            n_chains,
            config,
            seed: thread_rng().gen::<u64>(),
            label: String::new(),
            progress: None,
        })
    }

    /// Sets a new random seed.
    ///
    /// Chain `i` draws its starting point and transitions from a stream
    /// seeded with `seed + i`.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Prefix for progress bars, e.g. the experiment cell.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Draws one progress bar per chain into `multi`.
    pub fn with_progress(mut self, multi: MultiProgress) -> Self {
        self.progress = Some(multi);
        self
    }

    pub fn n_chains(&self) -> usize {
        self.n_chains
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Runs every chain to completion, in parallel.
    ///
    /// Returns the chains in index order. Fails if any chain fails; the
    /// others still run to completion first.
    pub fn run<T>(&self, target: &T) -> Result<Vec<ChainOutput>>
    where
        T: GradientTarget + ?Sized,
    {
        let style = ProgressStyle::with_template(
            "{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-");

        let results: Vec<Result<ChainOutput>> = (0..self.n_chains)
            .into_par_iter()
            .map(|chain| {
                let pb = self.progress.as_ref().map(|multi| {
                    let pb = multi.add(ProgressBar::new(self.config.total_iterations() as u64));
                    pb.set_style(style.clone());
                    pb.set_prefix(format!("{}chain {chain}", self.prefix()));
                    pb
                });
                let out = self.run_chain(target, chain, pb.as_ref());
                if let Some(pb) = pb {
                    pb.finish_with_message("Done!");
                }
                out
            })
            .collect();
        results.into_iter().collect()
    }

    /// [`Self::run`] with a fresh set of progress bars.
    pub fn run_progress<T>(&self, target: &T) -> Result<Vec<ChainOutput>>
    where
        T: GradientTarget + ?Sized,
    {
        self.clone().with_progress(MultiProgress::new()).run(target)
    }

    fn prefix(&self) -> String {
        if self.label.is_empty() {
            String::new()
        } else {
            format!("{} ", self.label)
        }
    }

    fn run_chain<T>(&self, target: &T, chain: usize, pb: Option<&ProgressBar>) -> Result<ChainOutput>
    where
        T: GradientTarget + ?Sized,
    {
        let mut rng = SmallRng::seed_from_u64(self.seed.wrapping_add(chain as u64));
        let sampler = self.initialize(target, chain, &mut rng)?;
        let out = sampler.set_seed(rng.gen::<u64>()).run(pb)?;
        debug!(
            "{}chain {chain}: step size {:.4}, accept {:.3}, {} divergent, {} leapfrog steps",
            self.prefix(),
            out.stats.step_size,
            out.stats.accept_mean,
            out.stats.n_divergent,
            out.stats.n_leapfrog
        );
        Ok(out)
    }

    /// Jitters the default start until the target is finite there.
    fn initialize<'a, T>(
        &self,
        target: &'a T,
        chain: usize,
        rng: &mut SmallRng,
    ) -> Result<Sampler<'a, T>>
    where
        T: GradientTarget + ?Sized,
    {
        let jitter = Uniform::new(-INIT_JITTER, INIT_JITTER);
        for _ in 0..MAX_INIT_ATTEMPTS {
            let start = ModelParameters::new(rng.sample(jitter), rng.sample(jitter), rng.sample(jitter));
            match Sampler::new(target, self.config, chain, start) {
                Ok(sampler) => return Ok(sampler),
                Err(Error::Initialization { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(Error::Initialization {
            chain,
            attempts: MAX_INIT_ATTEMPTS,
        })
    }
}

/// Strips the sampler statistics, keeping one draw sequence per chain.
pub fn draws(outputs: &[ChainOutput]) -> Vec<Vec<PosteriorSample>> {
    outputs.iter().map(|o| o.samples.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hmc::testing::Gaussian;
    use ndarray::Array1;

    const SEED: u64 = 42;

    fn runner(n_chains: usize) -> ChainRunner {
        let config = SamplerConfig {
            n_warmup: 200,
            n_sampling: 100,
            ..SamplerConfig::default()
        };
        ChainRunner::new(n_chains, config).unwrap().set_seed(SEED)
    }

    #[test]
    fn test_runs_every_chain() {
        let target = Gaussian::standard(3);
        let outputs = runner(4).run(&target).unwrap();
        assert_eq!(outputs.len(), 4);
        for (i, out) in outputs.iter().enumerate() {
            assert_eq!(out.samples.len(), 100);
            assert_eq!(out.stats.chain, i);
            assert!(out.samples.iter().all(|s| s.chain == i));
        }
    }

    #[test]
    fn test_seeded_runs_are_reproducible() {
        let target = Gaussian::standard(3);
        let a = draws(&runner(3).run(&target).unwrap());
        let b = draws(&runner(3).run(&target).unwrap());
        assert_eq!(a, b);
    }

    #[test]
    fn test_chains_are_distinct() {
        let target = Gaussian::standard(3);
        let d = draws(&runner(2).run(&target).unwrap());
        assert_ne!(d[0], d[1]);
    }

    #[test]
    fn test_progress_run_matches_plain_run() {
        let target = Gaussian::standard(3);
        let r = runner(2);
        let plain = draws(&r.run(&target).unwrap());
        let multi = MultiProgress::with_draw_target(indicatif::ProgressDrawTarget::hidden());
        let shown = draws(&r.clone().with_label("test").with_progress(multi).run(&target).unwrap());
        assert_eq!(plain, shown);
    }

    #[test]
    fn test_rejects_zero_chains() {
        assert!(matches!(
            ChainRunner::new(0, SamplerConfig::default()),
            Err(Error::InvalidArgument { name: "n_chains", .. })
        ));
    }

    #[test]
    fn test_retries_until_finite_start() {
        // Finite only where the first coordinate is positive.
        struct HalfSpace;
        impl GradientTarget for HalfSpace {
            fn dim(&self) -> usize {
                3
            }
            fn logp_and_grad(&self, q: &Array1<f64>, grad: &mut Array1<f64>) -> f64 {
                if q[0] <= 0.0 {
                    grad.fill(0.0);
                    return f64::NEG_INFINITY;
                }
                grad.assign(&q.mapv(|v| -v));
                grad[0] += 1.0 / q[0];
                q[0].ln() - 0.5 * q.dot(q)
            }
        }
        let outputs = runner(4).run(&HalfSpace).unwrap();
        assert!(outputs
            .iter()
            .flat_map(|o| &o.samples)
            .all(|s| s.params.intercept > 0.0));
    }

    #[test]
    fn test_unreachable_target_fails_initialization() {
        struct Nowhere;
        impl GradientTarget for Nowhere {
            fn dim(&self) -> usize {
                3
            }
            fn logp_and_grad(&self, _q: &Array1<f64>, _grad: &mut Array1<f64>) -> f64 {
                f64::NAN
            }
        }
        assert!(matches!(
            runner(2).run(&Nowhere),
            Err(Error::Initialization {
                attempts: MAX_INIT_ATTEMPTS,
                ..
            })
        ));
    }
}
