//! The No-U-Turn Sampler, multinomial variant.
//!
//! Each transition grows a trajectory by repeated doubling in a random
//! direction until the ends start moving towards each other, a leaf
//! diverges, or `max_depth` doublings have been made. The next state is
//! drawn from the trajectory with weights `exp(-H)`: uniformly inside each
//! new subtree and biased towards the newest subtree at the top level.
//!
//! Any non-finite log-density or gradient met while building rejects the
//! whole transition. The chain then stays where it was.

use ndarray::Array1;
use rand::Rng;

use crate::hmc::{
    accept_probability, leapfrog, Degenerate, Metric, PhasePoint, Transition,
    DIVERGENCE_THRESHOLD,
};
use crate::model::GradientTarget;

/// A balanced binary subtree of leapfrog states.
#[derive(Debug, Clone)]
struct Subtree {
    left: PhasePoint,
    right: PhasePoint,
    proposal: PhasePoint,
    /// `log(sum(exp(h0 - H)))` over the leaves.
    log_weight: f64,
    turning: bool,
    divergent: bool,
}

/// State shared by every recursive call of one transition.
struct TreeBuilder<'a, T: ?Sized, R: ?Sized> {
    target: &'a T,
    metric: &'a Metric,
    step_size: f64,
    h0: f64,
    rng: &'a mut R,
    n_leapfrog: usize,
    sum_accept: f64,
}

impl<T, R> TreeBuilder<'_, T, R>
where
    T: GradientTarget + ?Sized,
    R: Rng + ?Sized,
{
    fn leaf(&mut self, from: &PhasePoint, direction: f64) -> Result<Subtree, Degenerate> {
        let mut point = from.clone();
        self.n_leapfrog += 1;
        leapfrog(self.target, self.metric, &mut point, direction * self.step_size)?;
        let h = point.hamiltonian(self.metric);
        if !h.is_finite() {
            return Err(Degenerate);
        }
        self.sum_accept += accept_probability(self.h0, h);
        Ok(Subtree {
            left: point.clone(),
            right: point.clone(),
            proposal: point,
            log_weight: self.h0 - h,
            turning: false,
            divergent: h - self.h0 > DIVERGENCE_THRESHOLD,
        })
    }

    fn build(
        &mut self,
        from: &PhasePoint,
        direction: f64,
        depth: usize,
    ) -> Result<Subtree, Degenerate> {
        if depth == 0 {
            return self.leaf(from, direction);
        }

        let mut tree = self.build(from, direction, depth - 1)?;
        if tree.turning || tree.divergent {
            return Ok(tree);
        }

        let edge = if direction > 0.0 { &tree.right } else { &tree.left };
        let outer = self.build(edge, direction, depth - 1)?;
        if outer.turning || outer.divergent {
            tree.turning = outer.turning;
            tree.divergent = outer.divergent;
            return Ok(tree);
        }

        // Uniform progressive sampling within the subtree.
        let log_weight = log_add_exp(tree.log_weight, outer.log_weight);
        if self.rng.gen::<f64>() < (outer.log_weight - log_weight).exp() {
            tree.proposal = outer.proposal;
        }
        tree.log_weight = log_weight;
        if direction > 0.0 {
            tree.right = outer.right;
        } else {
            tree.left = outer.left;
        }
        tree.turning = is_turning(self.metric, &tree.left, &tree.right);
        Ok(tree)
    }
}

/// The trajectory ends are moving towards each other.
fn is_turning(metric: &Metric, left: &PhasePoint, right: &PhasePoint) -> bool {
    let dq: Array1<f64> = &right.q - &left.q;
    dq.dot(&metric.velocity(&left.p)) <= 0.0 || dq.dot(&metric.velocity(&right.p)) <= 0.0
}

fn log_add_exp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let m = a.max(b);
    m + ((a - m).exp() + (b - m).exp()).ln()
}

/// Runs one NUTS transition from `current`.
pub fn nuts_transition<T, R>(
    target: &T,
    metric: &Metric,
    current: &PhasePoint,
    step_size: f64,
    max_depth: usize,
    rng: &mut R,
) -> Transition
where
    T: GradientTarget + ?Sized,
    R: Rng + ?Sized,
{
    let mut start = current.clone();
    metric.sample_momentum(rng, &mut start.p);
    let h0 = start.hamiltonian(metric);
    if !h0.is_finite() {
        return Transition::degenerate(current, 0, 0);
    }

    let mut builder = TreeBuilder {
        target,
        metric,
        step_size,
        h0,
        rng,
        n_leapfrog: 0,
        sum_accept: 0.0,
    };
    let mut left = start.clone();
    let mut right = start;
    let mut proposal = current.clone();
    let mut log_weight = 0.0;
    let mut depth = 0;
    let mut divergent = false;
    let mut moved = false;

    while depth < max_depth {
        let direction = if builder.rng.gen::<bool>() { 1.0 } else { -1.0 };
        let edge = if direction > 0.0 { &right } else { &left };
        let subtree = match builder.build(edge, direction, depth) {
            Ok(subtree) => subtree,
            Err(Degenerate) => {
                return Transition::degenerate(current, builder.n_leapfrog, depth + 1)
            }
        };
        depth += 1;

        if subtree.divergent {
            divergent = true;
            break;
        }
        if subtree.turning {
            break;
        }

        // Biased progressive sampling towards the new subtree.
        if builder.rng.gen::<f64>() < (subtree.log_weight - log_weight).exp() {
            proposal = subtree.proposal;
            moved = true;
        }
        log_weight = log_add_exp(log_weight, subtree.log_weight);
        if direction > 0.0 {
            right = subtree.right;
        } else {
            left = subtree.left;
        }
        if is_turning(metric, &left, &right) {
            break;
        }
    }

    let accept_stat = if builder.n_leapfrog > 0 {
        builder.sum_accept / builder.n_leapfrog as f64
    } else {
        0.0
    };
    // The proposal carries the momentum of its trajectory; the next
    // transition resamples it.
    Transition {
        point: proposal,
        accept_stat,
        n_leapfrog: builder.n_leapfrog,
        tree_depth: depth,
        divergent,
        degenerate: false,
        moved,
    }
}
