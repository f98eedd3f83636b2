//! Warmup adaptation of the step size and the diagonal mass matrix.
//!
//! The schedule follows Stan: a fast initial buffer that only tunes the step
//! size, a run of doubling slow windows that also estimate the posterior
//! variance, and a fast terminal buffer. Dual averaging restarts at every
//! window boundary.
//!
//! ```text
//! n_warmup = 1000:
//!   [0, 75)      fast
//!   [75, 100)    slow   -> metric update
//!   [100, 150)   slow   -> metric update
//!   [150, 250)   slow   -> metric update
//!   [250, 450)   slow   -> metric update
//!   [450, 950)   slow   -> metric update
//!   [950, 1000)  fast
//! ```

use ndarray::Array1;
use rand::Rng;
use std::f64::consts::LN_2;

use crate::hmc::{leapfrog, Metric, PhasePoint};
use crate::model::GradientTarget;

/// Nesterov dual averaging on `log(step_size)`.
#[derive(Debug, Clone)]
pub struct DualAveraging {
    target_accept: f64,
    mu: f64,
    log_eps: f64,
    log_eps_bar: f64,
    h_bar: f64,
    count: usize,
}

impl DualAveraging {
    const GAMMA: f64 = 0.05;
    const T0: f64 = 10.0;
    const KAPPA: f64 = 0.75;

    pub fn new(target_accept: f64, step_size: f64) -> Self {
        let log_eps = step_size.ln();
        Self {
            target_accept,
            mu: (10.0 * step_size).ln(),
            log_eps,
            log_eps_bar: log_eps,
            h_bar: 0.0,
            count: 0,
        }
    }

    /// Feeds one acceptance statistic.
    pub fn update(&mut self, accept_stat: f64) {
        self.count += 1;
        let m = self.count as f64;
        let w = 1.0 / (m + Self::T0);
        self.h_bar = (1.0 - w) * self.h_bar + w * (self.target_accept - accept_stat);
        self.log_eps = self.mu - m.sqrt() / Self::GAMMA * self.h_bar;
        let eta = m.powf(-Self::KAPPA);
        self.log_eps_bar = eta * self.log_eps + (1.0 - eta) * self.log_eps_bar;
    }

    /// Step size to use for the next warmup transition.
    pub fn step_size(&self) -> f64 {
        self.log_eps.exp()
    }

    /// Smoothed step size, used once warmup ends.
    pub fn adapted_step_size(&self) -> f64 {
        self.log_eps_bar.exp()
    }

    pub fn restart(&mut self, step_size: f64) {
        *self = Self::new(self.target_accept, step_size);
    }
}

/// Running per-coordinate variance (Welford's algorithm).
#[derive(Debug, Clone)]
pub struct WelfordVariance {
    mean: Array1<f64>,
    m2: Array1<f64>,
    count: usize,
}

impl WelfordVariance {
    pub fn new(dim: usize) -> Self {
        Self {
            mean: Array1::zeros(dim),
            m2: Array1::zeros(dim),
            count: 0,
        }
    }

    pub fn update(&mut self, x: &Array1<f64>) {
        self.count += 1;
        let n = self.count as f64;
        for i in 0..x.len() {
            let delta = x[i] - self.mean[i];
            self.mean[i] += delta / n;
            self.m2[i] += delta * (x[i] - self.mean[i]);
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Sample variance shrunk towards `1e-3`, as Stan regularizes it.
    ///
    /// Returns `None` with fewer than three draws.
    pub fn regularized_variance(&self) -> Option<Array1<f64>> {
        if self.count < 3 {
            return None;
        }
        let n = self.count as f64;
        let shrink = n / (n + 5.0);
        Some(
            self.m2
                .mapv(|m2| shrink * m2 / (n - 1.0) + 1e-3 * (5.0 / (n + 5.0))),
        )
    }

    pub fn reset(&mut self) {
        self.mean.fill(0.0);
        self.m2.fill(0.0);
        self.count = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    /// Step size only.
    Fast,
    /// Step size plus variance estimation.
    Slow,
}

/// A half-open range of warmup iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptWindow {
    pub start: usize,
    pub end: usize,
    pub kind: WindowKind,
}

/// Lays out the warmup windows for `n_warmup` iterations.
///
/// Below 50 iterations the variance estimate is too noisy to help, so the
/// whole warmup is a single fast window.
pub fn compute_windows(n_warmup: usize) -> Vec<AdaptWindow> {
    let fast = |start, end| AdaptWindow {
        start,
        end,
        kind: WindowKind::Fast,
    };
    if n_warmup == 0 {
        return Vec::new();
    }
    if n_warmup < 50 {
        return vec![fast(0, n_warmup)];
    }

    let init_buffer = 75.min(n_warmup / 5);
    let term_buffer = 50.min(n_warmup / 5);
    let slow_end = n_warmup - term_buffer;

    let mut windows = vec![fast(0, init_buffer)];
    let mut start = init_buffer;
    let mut size = 25;
    while start < slow_end {
        let mut end = start + size;
        // Stretch this window if the next one would not fit.
        if end + 2 * size > slow_end {
            end = slow_end;
        }
        windows.push(AdaptWindow {
            start,
            end,
            kind: WindowKind::Slow,
        });
        start = end;
        size *= 2;
    }
    windows.push(fast(slow_end, n_warmup));
    windows
}

/// Drives dual averaging and variance estimation through the window schedule.
#[derive(Debug, Clone)]
pub struct WindowedAdaptation {
    dual_avg: DualAveraging,
    variance: WelfordVariance,
    windows: Vec<AdaptWindow>,
    current: usize,
}

impl WindowedAdaptation {
    pub fn new(dim: usize, n_warmup: usize, target_accept: f64, step_size: f64) -> Self {
        Self {
            dual_avg: DualAveraging::new(target_accept, step_size),
            variance: WelfordVariance::new(dim),
            windows: compute_windows(n_warmup),
            current: 0,
        }
    }

    pub fn windows(&self) -> &[AdaptWindow] {
        &self.windows
    }

    /// Records warmup iteration `iteration` (0-based) and its outcome.
    ///
    /// Returns a new inverse mass when a slow window closes. The caller is
    /// expected to refresh the step size and call [`Self::restart`].
    pub fn update(
        &mut self,
        iteration: usize,
        position: &Array1<f64>,
        accept_stat: f64,
    ) -> Option<Array1<f64>> {
        self.dual_avg.update(accept_stat);
        let window = *self.windows.get(self.current)?;

        if window.kind == WindowKind::Slow {
            self.variance.update(position);
        }
        if iteration + 1 < window.end {
            return None;
        }

        self.current += 1;
        let adapted = self.dual_avg.adapted_step_size();
        self.dual_avg.restart(adapted);
        if window.kind == WindowKind::Slow {
            // The inverse mass is the variance estimate itself.
            let var = self.variance.regularized_variance();
            self.variance.reset();
            return var;
        }
        None
    }

    pub fn restart(&mut self, step_size: f64) {
        self.dual_avg.restart(step_size);
    }

    pub fn step_size(&self) -> f64 {
        self.dual_avg.step_size()
    }

    pub fn adapted_step_size(&self) -> f64 {
        self.dual_avg.adapted_step_size()
    }
}

/// Heuristic initial step size (Hoffman and Gelman 2014, Algorithm 4).
///
/// Starting from `step_size`, doubles or halves until the one-step
/// acceptance probability crosses 0.5. Falls back to `step_size` when the
/// search does not settle.
pub fn find_reasonable_step_size<T, R>(
    target: &T,
    metric: &Metric,
    start: &PhasePoint,
    step_size: f64,
    rng: &mut R,
) -> f64
where
    T: GradientTarget + ?Sized,
    R: Rng + ?Sized,
{
    let mut point = start.clone();
    metric.sample_momentum(rng, &mut point.p);
    let h0 = point.hamiltonian(metric);
    if !h0.is_finite() {
        return step_size;
    }

    // log acceptance of a single step, with failures counting as rejection.
    let log_accept = |eps: f64| {
        let mut trial = point.clone();
        match leapfrog(target, metric, &mut trial, eps) {
            Ok(()) => {
                let delta = h0 - trial.hamiltonian(metric);
                if delta.is_nan() {
                    f64::NEG_INFINITY
                } else {
                    delta
                }
            }
            Err(_) => f64::NEG_INFINITY,
        }
    };

    let mut eps = step_size;
    let direction = if log_accept(eps) > -LN_2 { 1.0 } else { -1.0 };
    for _ in 0..100 {
        let next = eps * 2f64.powf(direction);
        if !(1e-10..=1e7).contains(&next) {
            break;
        }
        let crossed = if direction > 0.0 {
            log_accept(next) <= -LN_2
        } else {
            log_accept(next) > -LN_2
        };
        eps = next;
        if crossed {
            break;
        }
    }
    eps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hmc::testing::Gaussian;
    use approx::assert_abs_diff_eq;
    use ndarray::arr1;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn test_windows_for_default_warmup() {
        let spans: Vec<(usize, usize, WindowKind)> = compute_windows(1000)
            .iter()
            .map(|w| (w.start, w.end, w.kind))
            .collect();
        use WindowKind::*;
        assert_eq!(
            spans,
            vec![
                (0, 75, Fast),
                (75, 100, Slow),
                (100, 150, Slow),
                (150, 250, Slow),
                (250, 450, Slow),
                (450, 950, Slow),
                (950, 1000, Fast),
            ]
        );
    }

    #[test]
    fn test_windows_tile_warmup() {
        for n in [0, 1, 20, 49, 50, 100, 151, 333, 1000, 4000] {
            let windows = compute_windows(n);
            let mut next = 0;
            for w in &windows {
                assert_eq!(w.start, next, "gap before {w:?} for n={n}");
                assert!(w.end > w.start, "empty window {w:?} for n={n}");
                next = w.end;
            }
            assert_eq!(next, n, "windows for n={n} end at {next}");
        }
        assert_eq!(compute_windows(30).len(), 1);
    }

    #[test]
    fn test_dual_averaging_shrinks_step_on_low_acceptance() {
        let mut da = DualAveraging::new(0.8, 1.0);
        for _ in 0..50 {
            da.update(0.1);
        }
        assert!(da.step_size() < 1.0);
        let mut da = DualAveraging::new(0.8, 1.0);
        for _ in 0..50 {
            da.update(1.0);
        }
        assert!(da.step_size() > 1.0);
    }

    #[test]
    fn test_dual_averaging_converges_on_acceptance_curve() {
        // Synthetic acceptance exp(-eps): the fixed point for 0.8 is -ln(0.8).
        let mut da = DualAveraging::new(0.8, 1.0);
        for _ in 0..2000 {
            let eps = da.step_size();
            da.update((-eps).exp());
        }
        assert_abs_diff_eq!(da.adapted_step_size(), -(0.8f64).ln(), epsilon = 0.03);
    }

    #[test]
    fn test_welford_matches_two_pass_variance() {
        let xs = [1.0, 4.0, -2.0, 3.5, 0.0, 7.0, 2.5];
        let mut w = WelfordVariance::new(1);
        for x in xs {
            w.update(&arr1(&[x]));
        }
        let n = xs.len() as f64;
        let mean = xs.iter().sum::<f64>() / n;
        let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
        let expected = n / (n + 5.0) * var + 1e-3 * 5.0 / (n + 5.0);
        assert_abs_diff_eq!(w.regularized_variance().unwrap()[0], expected, epsilon = 1e-12);
        w.reset();
        assert!(w.regularized_variance().is_none());
    }

    #[test]
    fn test_windowed_adaptation_learns_scales() {
        let mut adapt = WindowedAdaptation::new(2, 200, 0.8, 0.5);
        let mut rng = SmallRng::seed_from_u64(9);
        let mut last = None;
        for i in 0..200 {
            // Feed exact draws with standard deviations 0.1 and 10.
            let z0: f64 = rng.sample(rand_distr::StandardNormal);
            let z1: f64 = rng.sample(rand_distr::StandardNormal);
            if let Some(inv_mass) = adapt.update(i, &arr1(&[0.1 * z0, 10.0 * z1]), 0.8) {
                last = Some(inv_mass);
            }
        }
        let inv_mass = last.expect("no slow window closed");
        assert!(inv_mass[0] < 0.1, "{inv_mass}");
        assert!(inv_mass[1] > 10.0, "{inv_mass}");
    }

    #[test]
    fn test_reasonable_step_size_scales_with_target() {
        let mut rng = SmallRng::seed_from_u64(1);
        let metric = Metric::unit(1);
        let wide = Gaussian {
            scales: vec![100.0],
        };
        let narrow = Gaussian {
            scales: vec![0.01],
        };
        let start_wide = PhasePoint::new(&wide, arr1(&[0.0])).unwrap();
        let start_narrow = PhasePoint::new(&narrow, arr1(&[0.0])).unwrap();
        let eps_wide = find_reasonable_step_size(&wide, &metric, &start_wide, 1.0, &mut rng);
        let eps_narrow =
            find_reasonable_step_size(&narrow, &metric, &start_narrow, 1.0, &mut rng);
        assert!(eps_wide > 1.0, "{eps_wide}");
        assert!(eps_narrow < 0.1, "{eps_narrow}");
    }
}
