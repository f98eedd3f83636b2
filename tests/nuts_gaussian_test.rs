//! Checks that NUTS draws from an anisotropic 3-d Gaussian are
//! indistinguishable from exact draws under a two-sample KS test, and that
//! the same test rejects a shifted distribution.

use kolmogorov_smirnov as ks;
use ndarray::Array1;
use prior_sensitivity::core::draws;
use prior_sensitivity::{ChainRunner, GradientTarget, SamplerConfig};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

const SCALES: [f64; 3] = [1.0, 3.0, 0.2];
const SEED: u64 = 42;
const THIN: usize = 10;

struct DiagonalGaussian;

impl GradientTarget for DiagonalGaussian {
    fn dim(&self) -> usize {
        3
    }

    fn logp_and_grad(&self, q: &Array1<f64>, grad: &mut Array1<f64>) -> f64 {
        let mut logp = 0.0;
        for (j, s) in SCALES.iter().enumerate() {
            grad[j] = -q[j] / (s * s);
            logp -= 0.5 * (q[j] / s).powi(2);
        }
        logp
    }
}

/// Thinned per-coordinate NUTS draws, pooled over chains.
fn nuts_marginals() -> Vec<Vec<f64>> {
    let config = SamplerConfig {
        n_warmup: 1000,
        n_sampling: 2500,
        ..SamplerConfig::default()
    };
    let outputs = ChainRunner::new(4, config)
        .unwrap()
        .set_seed(SEED)
        .run(&DiagonalGaussian)
        .unwrap();
    let chains = draws(&outputs);
    (0..3)
        .map(|j| {
            chains
                .iter()
                .flat_map(|c| c.iter().step_by(THIN).map(move |s| s.params.as_array()[j]))
                .collect()
        })
        .collect()
}

fn exact_marginal(j: usize, n: usize, shift: f64) -> Vec<f64> {
    let mut rng = SmallRng::seed_from_u64(SEED + j as u64);
    (0..n)
        .map(|_| shift + SCALES[j] * rng.sample::<f64, _>(StandardNormal))
        .collect()
}

#[test]
fn nuts_matches_exact_draws() {
    for (j, sampled) in nuts_marginals().iter().enumerate() {
        let exact = exact_marginal(j, sampled.len(), 0.0);
        let result = ks::test_f64(sampled, &exact, 0.99);
        assert!(
            !result.is_rejected,
            "coordinate {j}: KS statistic {} above critical value {}",
            result.statistic, result.critical_value
        );
    }
}

#[test]
fn ks_rejects_shifted_target() {
    for (j, sampled) in nuts_marginals().iter().enumerate() {
        let wrong = exact_marginal(j, sampled.len(), SCALES[j]);
        let result = ks::test_f64(sampled, &wrong, 0.95);
        assert!(result.is_rejected, "coordinate {j} not rejected");
    }
}
