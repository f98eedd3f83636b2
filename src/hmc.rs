//! Hamiltonian dynamics shared by the static and no-U-turn samplers.
//!
//! A [`PhasePoint`] carries a position, its momentum and the cached
//! log-density and gradient at that position. The [`leapfrog`] integrator
//! moves a point along the trajectory and reports [`Degenerate`] as soon as
//! the target returns a non-finite value. Callers then reject the whole
//! transition instead of guessing.
//!
//! Energies follow the usual convention
//! `H(q, p) = -log p(q) + 0.5 * sum_i p_i^2 * m_i^{-1}` with a diagonal
//! inverse mass `m^{-1}`.

use ndarray::{Array1, Zip};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::{Error, Result};
use crate::model::GradientTarget;

/// Energy error beyond which a trajectory is flagged as divergent.
pub const DIVERGENCE_THRESHOLD: f64 = 1000.0;

/// The target produced a non-finite log-density or gradient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Degenerate;

/// Diagonal Euclidean metric, stored as the inverse mass.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    inv_mass: Array1<f64>,
}

impl Metric {
    /// Identity metric.
    pub fn unit(dim: usize) -> Self {
        Self {
            inv_mass: Array1::ones(dim),
        }
    }

    pub fn from_inv_mass(inv_mass: Array1<f64>) -> Result<Self> {
        if inv_mass.iter().any(|v| !v.is_finite() || *v <= 0.0) {
            return Err(Error::invalid(
                "inv_mass",
                "every entry must be positive and finite",
            ));
        }
        Ok(Self { inv_mass })
    }

    pub fn inv_mass(&self) -> &Array1<f64> {
        &self.inv_mass
    }

    pub fn dim(&self) -> usize {
        self.inv_mass.len()
    }

    /// Draws `p ~ N(0, M)` into `p`.
    pub fn sample_momentum<R: Rng + ?Sized>(&self, rng: &mut R, p: &mut Array1<f64>) {
        Zip::from(p).and(&self.inv_mass).for_each(|p, &m_inv| {
            let z: f64 = rng.sample(StandardNormal);
            *p = z / m_inv.sqrt();
        });
    }

    pub fn kinetic_energy(&self, p: &Array1<f64>) -> f64 {
        0.5 * Zip::from(p)
            .and(&self.inv_mass)
            .fold(0.0, |acc, &p, &m_inv| acc + p * p * m_inv)
    }

    /// `M^{-1} p`, the rate of change of the position.
    pub fn velocity(&self, p: &Array1<f64>) -> Array1<f64> {
        p * &self.inv_mass
    }
}

/// A point in phase space with cached target evaluations.
#[derive(Debug, Clone, PartialEq)]
pub struct PhasePoint {
    pub q: Array1<f64>,
    pub p: Array1<f64>,
    pub grad: Array1<f64>,
    pub logp: f64,
}

impl PhasePoint {
    /// Evaluates `target` at `q`. The momentum starts at zero.
    pub fn new<T>(target: &T, q: Array1<f64>) -> std::result::Result<Self, Degenerate>
    where
        T: GradientTarget + ?Sized,
    {
        let mut grad = Array1::zeros(q.len());
        let logp = target.logp_and_grad(&q, &mut grad);
        if !is_finite(logp, &grad) {
            return Err(Degenerate);
        }
        Ok(Self {
            p: Array1::zeros(q.len()),
            q,
            grad,
            logp,
        })
    }

    pub fn hamiltonian(&self, metric: &Metric) -> f64 {
        -self.logp + metric.kinetic_energy(&self.p)
    }
}

fn is_finite(logp: f64, grad: &Array1<f64>) -> bool {
    logp.is_finite() && grad.iter().all(|g| g.is_finite())
}

/// One leapfrog step of signed size `step_size`, updating `point` in place.
///
/// On [`Degenerate`] the point is left half-updated and must be discarded.
pub fn leapfrog<T>(
    target: &T,
    metric: &Metric,
    point: &mut PhasePoint,
    step_size: f64,
) -> std::result::Result<(), Degenerate>
where
    T: GradientTarget + ?Sized,
{
    let half = 0.5 * step_size;
    point.p.scaled_add(half, &point.grad);
    Zip::from(&mut point.q)
        .and(&point.p)
        .and(metric.inv_mass())
        .for_each(|q, &p, &m_inv| *q += step_size * m_inv * p);
    point.logp = target.logp_and_grad(&point.q, &mut point.grad);
    if !is_finite(point.logp, &point.grad) {
        return Err(Degenerate);
    }
    point.p.scaled_add(half, &point.grad);
    if point.p.iter().any(|p| !p.is_finite()) {
        return Err(Degenerate);
    }
    Ok(())
}

/// Outcome of one sampler transition.
#[derive(Debug, Clone)]
pub struct Transition {
    /// The next state of the chain. Equal to the starting point when
    /// nothing was accepted.
    pub point: PhasePoint,
    /// Acceptance statistic in `[0, 1]`, fed to step-size adaptation.
    pub accept_stat: f64,
    pub n_leapfrog: usize,
    pub tree_depth: usize,
    pub divergent: bool,
    pub degenerate: bool,
    pub moved: bool,
}

impl Transition {
    /// A rejected transition caused by a non-finite evaluation.
    pub(crate) fn degenerate(current: &PhasePoint, n_leapfrog: usize, tree_depth: usize) -> Self {
        Self {
            point: current.clone(),
            accept_stat: 0.0,
            n_leapfrog,
            tree_depth,
            divergent: false,
            degenerate: true,
            moved: false,
        }
    }
}

/// Metropolis acceptance probability `min(1, exp(h0 - h1))`.
pub(crate) fn accept_probability(h0: f64, h1: f64) -> f64 {
    let p = (h0 - h1).exp().min(1.0);
    if p.is_nan() {
        0.0
    } else {
        p
    }
}

/// Classic HMC step with a fixed number of leapfrog steps.
pub fn static_transition<T, R>(
    target: &T,
    metric: &Metric,
    current: &PhasePoint,
    step_size: f64,
    n_leapfrog: usize,
    rng: &mut R,
) -> Transition
where
    T: GradientTarget + ?Sized,
    R: Rng + ?Sized,
{
    let mut point = current.clone();
    metric.sample_momentum(rng, &mut point.p);
    let h0 = point.hamiltonian(metric);
    if !h0.is_finite() {
        return Transition::degenerate(current, 0, 0);
    }

    for step in 0..n_leapfrog {
        if leapfrog(target, metric, &mut point, step_size).is_err() {
            return Transition::degenerate(current, step + 1, 0);
        }
    }
    let h1 = point.hamiltonian(metric);
    if !h1.is_finite() {
        return Transition::degenerate(current, n_leapfrog, 0);
    }

    let accept_stat = accept_probability(h0, h1);
    let divergent = h1 - h0 > DIVERGENCE_THRESHOLD;
    let moved = !divergent && rng.gen::<f64>() < accept_stat;
    Transition {
        point: if moved { point } else { current.clone() },
        accept_stat,
        n_leapfrog,
        tree_depth: 0,
        divergent,
        degenerate: false,
        moved,
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{Gaussian, Walled};
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr1;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn test_leapfrog_is_reversible() {
        let target = Gaussian {
            scales: vec![1.0, 3.0],
        };
        let metric = Metric::from_inv_mass(arr1(&[1.0, 4.0])).unwrap();
        let mut point = PhasePoint::new(&target, arr1(&[0.4, -1.2])).unwrap();
        point.p = arr1(&[0.7, 0.1]);
        let start = point.clone();

        for _ in 0..25 {
            leapfrog(&target, &metric, &mut point, 0.1).unwrap();
        }
        point.p.mapv_inplace(|p| -p);
        for _ in 0..25 {
            leapfrog(&target, &metric, &mut point, 0.1).unwrap();
        }
        point.p.mapv_inplace(|p| -p);

        for i in 0..2 {
            assert_abs_diff_eq!(point.q[i], start.q[i], epsilon = 1e-10);
            assert_abs_diff_eq!(point.p[i], start.p[i], epsilon = 1e-10);
        }
    }

    #[test]
    fn test_leapfrog_nearly_conserves_energy() {
        let target = Gaussian::standard(3);
        let metric = Metric::unit(3);
        let mut point = PhasePoint::new(&target, arr1(&[1.0, -0.5, 0.2])).unwrap();
        point.p = arr1(&[0.3, 0.9, -1.1]);
        let h0 = point.hamiltonian(&metric);
        for _ in 0..200 {
            leapfrog(&target, &metric, &mut point, 0.01).unwrap();
        }
        assert_abs_diff_eq!(point.hamiltonian(&metric), h0, epsilon = 1e-4);
    }

    #[test]
    fn test_leapfrog_reports_degenerate() {
        let target = Walled { bound: 1.0 };
        let metric = Metric::unit(1);
        let mut point = PhasePoint::new(&target, arr1(&[0.9])).unwrap();
        point.p = arr1(&[5.0]);
        assert_eq!(
            leapfrog(&target, &metric, &mut point, 0.5),
            Err(Degenerate)
        );
        assert!(PhasePoint::new(&target, arr1(&[2.0])).is_err());
    }

    #[test]
    fn test_sampled_momentum_matches_mass() {
        let metric = Metric::from_inv_mass(arr1(&[4.0, 0.25])).unwrap();
        let mut rng = SmallRng::seed_from_u64(3);
        let mut p = Array1::zeros(2);
        let n = 20_000;
        let mut sum_sq = [0.0; 2];
        for _ in 0..n {
            metric.sample_momentum(&mut rng, &mut p);
            sum_sq[0] += p[0] * p[0];
            sum_sq[1] += p[1] * p[1];
        }
        // Var(p_i) = m_i = 1 / inv_mass_i.
        assert_abs_diff_eq!(sum_sq[0] / n as f64, 0.25, epsilon = 0.01);
        assert_abs_diff_eq!(sum_sq[1] / n as f64, 4.0, epsilon = 0.15);
    }

    #[test]
    fn test_metric_rejects_bad_entries() {
        assert!(Metric::from_inv_mass(arr1(&[1.0, 0.0])).is_err());
        assert!(Metric::from_inv_mass(arr1(&[f64::NAN])).is_err());
    }

    #[test]
    fn test_static_transition_rejects_degenerate_trajectory() {
        let target = Walled { bound: 0.5 };
        let metric = Metric::unit(1);
        let current = PhasePoint::new(&target, arr1(&[0.45])).unwrap();
        let mut rng = SmallRng::seed_from_u64(11);
        let mut saw_degenerate = false;
        for _ in 0..50 {
            let t = static_transition(&target, &metric, &current, 0.8, 10, &mut rng);
            if t.degenerate {
                saw_degenerate = true;
                assert_eq!(t.point, current);
                assert_eq!(t.accept_stat, 0.0);
                assert!(!t.moved);
            }
        }
        assert!(saw_degenerate);
    }

    #[test]
    fn test_static_transition_targets_standard_normal() {
        let target = Gaussian::standard(1);
        let metric = Metric::unit(1);
        let mut rng = SmallRng::seed_from_u64(5);
        let mut point = PhasePoint::new(&target, arr1(&[3.0])).unwrap();
        let (mut sum, mut sum_sq, n) = (0.0, 0.0, 20_000);
        for _ in 0..n {
            point = static_transition(&target, &metric, &point, 0.3, 5, &mut rng).point;
            sum += point.q[0];
            sum_sq += point.q[0] * point.q[0];
        }
        let mean = sum / n as f64;
        assert_abs_diff_eq!(mean, 0.0, epsilon = 0.05);
        assert_abs_diff_eq!(sum_sq / n as f64 - mean * mean, 1.0, epsilon = 0.08);
    }

    #[test]
    fn test_accept_probability() {
        assert_eq!(accept_probability(1.0, 0.5), 1.0);
        assert_abs_diff_eq!(accept_probability(0.0, 1.0), (-1.0f64).exp());
        assert_eq!(accept_probability(0.0, f64::NAN), 0.0);
    }
}
