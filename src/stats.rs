//! Convergence diagnostics for multi-chain output.
//!
//! R-hat is the split potential scale reduction factor: every chain is cut
//! in half and the halves are compared as separate chains. The effective
//! sample size uses FFT autocovariances combined across split chains with
//! Geyer's initial monotone sequence, following the Stan reference manual.
//!
//! Problems are reported as [`ConvergenceWarning`]s and never as errors.

use std::collections::VecDeque;
use std::fmt;

use ndarray::prelude::*;
use ndarray_stats::QuantileExt;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};

use crate::model::{DIM, PARAMETER_NAMES};
use crate::sampler::{ChainOutput, ChainStats, PosteriorSample};

/// Sliding-window mean of acceptance statistics, used for progress display.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainTracker {
    capacity: usize,
    window: VecDeque<f64>,
    sum: f64,
}

impl ChainTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            window: VecDeque::with_capacity(capacity),
            sum: 0.0,
        }
    }

    pub fn push(&mut self, accept_stat: f64) {
        self.window.push_back(accept_stat);
        self.sum += accept_stat;
        if self.window.len() > self.capacity {
            if let Some(old) = self.window.pop_front() {
                self.sum -= old;
            }
        }
    }

    pub fn mean(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.sum / self.window.len() as f64
        }
    }
}

/// A non-fatal statistical problem with a fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConvergenceWarning {
    HighRhat {
        parameter: String,
        rhat: f64,
        threshold: f64,
    },
    LowEss {
        parameter: String,
        ess: f64,
        minimum: f64,
    },
    /// Post-warmup acceptance ended up far from the adaptation target.
    AcceptanceOutOfBand {
        chain: usize,
        accept_mean: f64,
        target: f64,
    },
    Divergences {
        chain: usize,
        count: usize,
    },
    MaxTreeDepth {
        chain: usize,
        count: usize,
    },
}

impl fmt::Display for ConvergenceWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvergenceWarning::HighRhat {
                parameter,
                rhat,
                threshold,
            } => write!(f, "rhat({parameter}) = {rhat:.3} exceeds {threshold}"),
            ConvergenceWarning::LowEss {
                parameter,
                ess,
                minimum,
            } => write!(f, "ess({parameter}) = {ess:.1} below {minimum:.1}"),
            ConvergenceWarning::AcceptanceOutOfBand {
                chain,
                accept_mean,
                target,
            } => write!(
                f,
                "chain {chain}: mean acceptance {accept_mean:.3} far from target {target}"
            ),
            ConvergenceWarning::Divergences { chain, count } => {
                write!(f, "chain {chain}: {count} divergent transitions")
            }
            ConvergenceWarning::MaxTreeDepth { chain, count } => {
                write!(f, "chain {chain}: {count} transitions hit the max tree depth")
            }
        }
    }
}

/// R-hat and ESS of one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDiagnostics {
    pub name: String,
    pub rhat: f64,
    pub ess: f64,
}

/// Outcome of [`Diagnostics::evaluate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsReport {
    /// Worst (largest) R-hat across parameters. NaN if any is undefined.
    pub rhat: f64,
    /// Worst (smallest) ESS across parameters. NaN if any is undefined.
    pub ess: f64,
    pub ok: bool,
    pub parameters: Vec<ParameterDiagnostics>,
    pub warnings: Vec<ConvergenceWarning>,
}

/// Thresholds for flagging a fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub max_rhat: f64,
    /// Minimum ESS as a fraction of the total number of draws.
    pub min_ess_fraction: f64,
    pub target_accept: f64,
    /// Allowed distance of the post-warmup acceptance from `target_accept`.
    pub accept_band: f64,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            max_rhat: 1.1,
            min_ess_fraction: 0.1,
            target_accept: 0.8,
            accept_band: 0.15,
        }
    }
}

impl Diagnostics {
    /// Computes R-hat and ESS for every parameter.
    ///
    /// `ok` is false when the worst R-hat exceeds `max_rhat`, the worst ESS
    /// falls below `min_ess_fraction` of all draws, or either is undefined.
    pub fn evaluate(&self, chains: &[Vec<PosteriorSample>]) -> DiagnosticsReport {
        let total: usize = chains.iter().map(Vec::len).sum();
        let min_ess = self.min_ess_fraction * total as f64;
        let mut parameters = Vec::with_capacity(DIM);
        let mut warnings = Vec::new();

        for (j, name) in PARAMETER_NAMES.iter().enumerate() {
            let draws: Vec<Array1<f64>> = chains
                .iter()
                .map(|c| c.iter().map(|s| s.params.as_array()[j]).collect())
                .collect();
            let param_rhat = split_rhat(&draws);
            let param_ess = ess(&draws);
            if !(param_rhat <= self.max_rhat) {
                warnings.push(ConvergenceWarning::HighRhat {
                    parameter: name.to_string(),
                    rhat: param_rhat,
                    threshold: self.max_rhat,
                });
            }
            if !(param_ess >= min_ess) {
                warnings.push(ConvergenceWarning::LowEss {
                    parameter: name.to_string(),
                    ess: param_ess,
                    minimum: min_ess,
                });
            }
            parameters.push(ParameterDiagnostics {
                name: name.to_string(),
                rhat: param_rhat,
                ess: param_ess,
            });
        }

        let rhat = worst(parameters.iter().map(|p| p.rhat), |a| a.max().ok().copied());
        let ess = worst(parameters.iter().map(|p| p.ess), |a| a.min().ok().copied());
        let ok = rhat.is_finite() && rhat <= self.max_rhat && ess.is_finite() && ess >= min_ess;
        DiagnosticsReport {
            rhat,
            ess,
            ok,
            parameters,
            warnings,
        }
    }

    /// Like [`Self::evaluate`], plus warnings from the per-chain sampler
    /// statistics. These warnings do not change `ok`.
    pub fn evaluate_runs(&self, runs: &[ChainOutput]) -> DiagnosticsReport {
        let chains: Vec<Vec<PosteriorSample>> = runs.iter().map(|r| r.samples.clone()).collect();
        let mut report = self.evaluate(&chains);
        for run in runs {
            report.warnings.extend(self.sampler_warnings(&run.stats));
        }
        report
    }

    fn sampler_warnings(&self, stats: &ChainStats) -> Vec<ConvergenceWarning> {
        let mut warnings = Vec::new();
        if (stats.accept_mean - self.target_accept).abs() > self.accept_band {
            warnings.push(ConvergenceWarning::AcceptanceOutOfBand {
                chain: stats.chain,
                accept_mean: stats.accept_mean,
                target: self.target_accept,
            });
        }
        if stats.n_divergent > 0 {
            warnings.push(ConvergenceWarning::Divergences {
                chain: stats.chain,
                count: stats.n_divergent,
            });
        }
        if stats.n_max_depth > 0 {
            warnings.push(ConvergenceWarning::MaxTreeDepth {
                chain: stats.chain,
                count: stats.n_max_depth,
            });
        }
        warnings
    }
}

/// Reduces per-parameter values, letting NaN win over any number.
fn worst(values: impl Iterator<Item = f64>, pick: impl Fn(&Array1<f64>) -> Option<f64>) -> f64 {
    let values: Array1<f64> = values.collect();
    if values.iter().any(|v| v.is_nan()) {
        return f64::NAN;
    }
    pick(&values).unwrap_or(f64::NAN)
}

/// Cuts every chain into two halves of equal length.
///
/// Chains are first truncated to the shortest one. With an odd length the
/// middle draw is dropped.
fn split_chains(chains: &[Array1<f64>]) -> Vec<ArrayView1<'_, f64>> {
    let n = chains.iter().map(Array1::len).min().unwrap_or(0);
    let half = n / 2;
    chains
        .iter()
        .flat_map(|c| [c.slice(s![..half]), c.slice(s![n - half..n])])
        .collect()
}

fn mean_and_var(x: &ArrayView1<f64>) -> (f64, f64) {
    let n = x.len() as f64;
    let mean = x.sum() / n;
    let var = x.fold(0.0, |acc, v| acc + (v - mean).powi(2)) / (n - 1.0);
    (mean, var)
}

/// Split R-hat over `chains`.
///
/// Returns NaN when fewer than two draws remain per half-chain or every draw
/// is identical, and infinity when each half-chain is constant but the
/// halves disagree.
pub fn split_rhat(chains: &[Array1<f64>]) -> f64 {
    let split = split_chains(chains);
    let n = split.first().map_or(0, |c| c.len());
    if split.len() < 2 || n < 2 {
        return f64::NAN;
    }
    let (means, vars): (Vec<f64>, Vec<f64>) = split.iter().map(mean_and_var).unzip();
    let means = Array1::from(means);
    let w = Array1::from(vars).mean().unwrap_or(f64::NAN);
    let b = n as f64 * means.var(1.0);
    if w == 0.0 {
        return if b == 0.0 { f64::NAN } else { f64::INFINITY };
    }
    let var_plus = (n as f64 - 1.0) / n as f64 * w + b / n as f64;
    (var_plus / w).sqrt()
}

/// Autocovariance at every lag, normalised by `n`.
fn autocovariance(x: &ArrayView1<f64>) -> Vec<f64> {
    let n = x.len();
    let mean = x.sum() / n as f64;
    let size = (2 * n).next_power_of_two();
    let mut planner = FftPlanner::<f64>::new();
    let forward = planner.plan_fft_forward(size);
    let inverse = planner.plan_fft_inverse(size);

    let mut buf: Vec<Complex<f64>> = x
        .iter()
        .map(|v| Complex::new(v - mean, 0.0))
        .chain(std::iter::repeat(Complex::new(0.0, 0.0)))
        .take(size)
        .collect();
    forward.process(&mut buf);
    for c in buf.iter_mut() {
        *c = Complex::new(c.norm_sqr(), 0.0);
    }
    inverse.process(&mut buf);
    let scale = (size * n) as f64;
    buf[..n].iter().map(|c| c.re / scale).collect()
}

/// Effective sample size over `chains`.
///
/// Returns NaN when there are too few draws or the pooled variance is zero.
pub fn ess(chains: &[Array1<f64>]) -> f64 {
    let split = split_chains(chains);
    let m = split.len();
    let n = split.first().map_or(0, |c| c.len());
    if m == 0 || n < 4 {
        return f64::NAN;
    }
    let nf = n as f64;

    let acov: Vec<Vec<f64>> = split.iter().map(autocovariance).collect();
    let means = Array1::from_iter(split.iter().map(|c| c.sum() / nf));
    let mean_var = acov.iter().map(|a| a[0] * nf / (nf - 1.0)).sum::<f64>() / m as f64;
    let mut var_plus = mean_var * (nf - 1.0) / nf;
    if m > 1 {
        var_plus += means.var(1.0);
    }
    if !(var_plus > 0.0) {
        return f64::NAN;
    }

    let mean_acov = |t: usize| acov.iter().map(|a| a[t]).sum::<f64>() / m as f64;
    let rho_at = |t: usize| 1.0 - (mean_var - mean_acov(t)) / var_plus;

    let mut rho = vec![0.0; n];
    rho[0] = 1.0;
    let mut rho_even = 1.0;
    let mut rho_odd = rho_at(1);
    rho[1] = rho_odd;

    // Geyer's initial positive sequence over pairs of lags.
    let mut t = 1;
    while t + 5 < n && rho_even + rho_odd > 0.0 {
        rho_even = rho_at(t + 1);
        rho_odd = rho_at(t + 2);
        if rho_even + rho_odd >= 0.0 {
            rho[t + 1] = rho_even;
            rho[t + 2] = rho_odd;
        }
        t += 2;
    }
    let max_t = t;
    if rho_even > 0.0 {
        rho[max_t + 1] = rho_even;
    }

    // Initial monotone sequence.
    let mut t = 1;
    while t + 2 <= max_t {
        let prev = rho[t - 1] + rho[t];
        if rho[t + 1] + rho[t + 2] > prev {
            rho[t + 1] = prev / 2.0;
            rho[t + 2] = rho[t + 1];
        }
        t += 2;
    }

    let draws = (m * n) as f64;
    let tau = -1.0 + 2.0 * rho[..=max_t].iter().sum::<f64>() + rho[max_t + 1];
    let tau = tau.max(1.0 / draws.log10());
    draws / tau
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelParameters;
    use approx::assert_abs_diff_eq;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    const SEED: u64 = 42;

    fn iid_chains(m: usize, n: usize, rng: &mut SmallRng) -> Vec<Array1<f64>> {
        (0..m)
            .map(|_| (0..n).map(|_| rng.sample::<f64, _>(StandardNormal)).collect())
            .collect()
    }

    fn ar1(n: usize, phi: f64, rng: &mut SmallRng) -> Array1<f64> {
        let mut x = 0.0;
        (0..n)
            .map(|_| {
                x = phi * x + rng.sample::<f64, _>(StandardNormal);
                x
            })
            .collect()
    }

    fn samples(draws: &[f64], chain: usize) -> Vec<PosteriorSample> {
        draws
            .iter()
            .enumerate()
            .map(|(i, &v)| PosteriorSample {
                params: ModelParameters::new(v, v, v),
                logp: 0.0,
                chain,
                iteration: i,
            })
            .collect()
    }

    #[test]
    fn test_autocovariance_matches_direct_sum() {
        let x = arr1(&[1.0, 3.0, -2.0, 0.5, 4.0, 1.5, -1.0]);
        let n = x.len();
        let mean = x.sum() / n as f64;
        let fft = autocovariance(&x.view());
        for t in 0..n {
            let direct: f64 = (0..n - t)
                .map(|i| (x[i] - mean) * (x[i + t] - mean))
                .sum::<f64>()
                / n as f64;
            assert_abs_diff_eq!(fft[t], direct, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_rhat_near_one_for_iid_chains() {
        let mut rng = SmallRng::seed_from_u64(SEED);
        let rhat = split_rhat(&iid_chains(4, 1000, &mut rng));
        assert!((0.99..1.01).contains(&rhat), "rhat = {rhat}");
    }

    #[test]
    fn test_rhat_detects_shifted_chain() {
        let mut rng = SmallRng::seed_from_u64(SEED);
        let mut chains = iid_chains(4, 500, &mut rng);
        chains[3] += 3.0;
        assert!(split_rhat(&chains) > 1.1);
    }

    #[test]
    fn test_rhat_detects_drift_within_chain() {
        // A trend is only visible once chains are split.
        let chain: Array1<f64> = Array1::linspace(0.0, 10.0, 400);
        assert!(split_rhat(&[chain.clone(), chain]) > 1.1);
    }

    #[test]
    fn test_rhat_degenerate_cases() {
        let a = Array1::from_elem(100, 0.0);
        let b = Array1::from_elem(100, 10.0);
        assert_eq!(split_rhat(&[a.clone(), b]), f64::INFINITY);
        assert!(split_rhat(&[a.clone(), a.clone()]).is_nan());
        assert!(split_rhat(&[arr1(&[1.0, 2.0, 3.0])]).is_nan());
    }

    #[test]
    fn test_ess_of_iid_draws_is_close_to_total() {
        let mut rng = SmallRng::seed_from_u64(SEED);
        let e = ess(&iid_chains(4, 1000, &mut rng));
        assert!((3200.0..4800.0).contains(&e), "ess = {e}");
    }

    #[test]
    fn test_ess_of_autocorrelated_draws() {
        let mut rng = SmallRng::seed_from_u64(SEED);
        let phi = 0.9;
        let chains: Vec<Array1<f64>> = (0..4).map(|_| ar1(5000, phi, &mut rng)).collect();
        let expected = 20_000.0 * (1.0 - phi) / (1.0 + phi);
        let e = ess(&chains);
        assert!(
            (0.7 * expected..1.3 * expected).contains(&e),
            "ess = {e}, expected about {expected}"
        );
    }

    #[test]
    fn test_ess_undefined_for_constant_draws() {
        let a = Array1::from_elem(100, 2.0);
        assert!(ess(&[a.clone(), a]).is_nan());
    }

    #[test]
    fn test_diagnostics_flags_non_mixing_chains() {
        let chains = vec![samples(&[0.0; 200], 0), samples(&[10.0; 200], 1)];
        let report = Diagnostics::default().evaluate(&chains);
        assert!(!report.ok);
        assert_eq!(report.rhat, f64::INFINITY);
        assert!(report
            .warnings
            .iter()
            .any(|w| matches!(w, ConvergenceWarning::HighRhat { .. })));
    }

    #[test]
    fn test_diagnostics_accepts_well_mixed_chains() {
        let mut rng = SmallRng::seed_from_u64(SEED);
        let chains: Vec<Vec<PosteriorSample>> = iid_chains(4, 500, &mut rng)
            .iter()
            .enumerate()
            .map(|(c, d)| samples(d.as_slice().unwrap(), c))
            .collect();
        let report = Diagnostics::default().evaluate(&chains);
        assert!(report.ok, "{report:?}");
        assert!(report.warnings.is_empty());
        assert_eq!(report.parameters.len(), DIM);
        assert_eq!(report.parameters[1].name, "slope");
    }

    #[test]
    fn test_diagnostics_flags_low_ess() {
        let mut rng = SmallRng::seed_from_u64(SEED);
        let chains: Vec<Vec<PosteriorSample>> = (0..4)
            .map(|c| samples(ar1(1000, 0.995, &mut rng).as_slice().unwrap(), c))
            .collect();
        let report = Diagnostics::default().evaluate(&chains);
        assert!(!report.ok);
        assert!(report
            .warnings
            .iter()
            .any(|w| matches!(w, ConvergenceWarning::LowEss { .. })));
    }

    #[test]
    fn test_chain_tracker_window() {
        let mut tracker = ChainTracker::new(3);
        assert_eq!(tracker.mean(), 0.0);
        for a in [1.0, 1.0, 1.0, 0.0, 0.0] {
            tracker.push(a);
        }
        assert_abs_diff_eq!(tracker.mean(), 1.0 / 3.0, epsilon = 1e-12);
    }
}
