/*!
The regression posterior: Gaussian likelihood, Gaussian priors on the
coefficients and a half-normal prior on the noise scale.

The sampler works on the unconstrained vector
`[intercept, slope, log_noise_scale]`. Sampling the noise scale in log space
adds the Jacobian term `log_noise_scale` to the log-density.

The data enter only through centred sufficient statistics, so evaluating the
log-density and its gradient costs the same for 10 or 10 000 observations.
*/

use std::f64::consts::LN_2;
use std::fmt;

use ndarray::{arr1, Array1};
use serde::{Deserialize, Serialize};

use crate::data::Dataset;
use crate::error::{Error, Result};

/// Number of unconstrained parameters.
pub const DIM: usize = 3;

/// Parameter names in position-vector order.
pub const PARAMETER_NAMES: [&str; DIM] = ["intercept", "slope", "log_noise_scale"];

/// Index of the slope coefficient in the position vector.
pub const SLOPE: usize = 1;

const HALF_LN_2PI: f64 = 0.918_938_533_204_672_8;

/// A target density the Hamiltonian samplers can evolve.
pub trait GradientTarget: Sync {
    /// Dimension of the position vector.
    fn dim(&self) -> usize;

    /// Returns the log-density at `position` and writes its gradient into
    /// `grad`.
    ///
    /// Non-finite results are allowed; callers treat them as a rejected point.
    fn logp_and_grad(&self, position: &Array1<f64>, grad: &mut Array1<f64>) -> f64;
}

/// Prior on the slope coefficient.
///
/// `Flat` is the improper uniform prior. It contributes nothing to the
/// log-density and nothing to the gradient.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SlopePrior {
    Flat,
    Normal { sd: f64 },
}

impl SlopePrior {
    /// Maps a configured standard deviation onto a prior.
    ///
    /// `None` and `Some(0.0)` both mean flat.
    pub fn from_sd(sd: Option<f64>) -> Result<Self> {
        match sd {
            None => Ok(SlopePrior::Flat),
            Some(sd) if sd == 0.0 => Ok(SlopePrior::Flat),
            Some(sd) if sd.is_finite() && sd > 0.0 => Ok(SlopePrior::Normal { sd }),
            Some(sd) => Err(Error::invalid(
                "slope_prior_sd",
                format!("must be positive, zero or absent, got {sd}"),
            )),
        }
    }

    pub fn sd(&self) -> Option<f64> {
        match self {
            SlopePrior::Flat => None,
            SlopePrior::Normal { sd } => Some(*sd),
        }
    }
}

impl fmt::Display for SlopePrior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlopePrior::Flat => write!(f, "flat"),
            SlopePrior::Normal { sd } => write!(f, "sd={sd}"),
        }
    }
}

/// A named prior configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorSpec {
    pub name: String,
    pub intercept_sd: f64,
    pub slope: SlopePrior,
    pub noise_sd: f64,
}

impl PriorSpec {
    /// Creates a prior named after its slope component (`flat`, `sd=10`, ...).
    pub fn new(intercept_sd: f64, slope: SlopePrior, noise_sd: f64) -> Result<Self> {
        Self::named(slope.to_string(), intercept_sd, slope, noise_sd)
    }

    pub fn named(
        name: impl Into<String>,
        intercept_sd: f64,
        slope: SlopePrior,
        noise_sd: f64,
    ) -> Result<Self> {
        check_positive("intercept_prior_sd", intercept_sd)?;
        check_positive("noise_prior_sd", noise_sd)?;
        if let SlopePrior::Normal { sd } = slope {
            check_positive("slope_prior_sd", sd)?;
        }
        Ok(Self {
            name: name.into(),
            intercept_sd,
            slope,
            noise_sd,
        })
    }
}

fn check_positive(name: &'static str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(Error::invalid(
            name,
            format!("must be positive and finite, got {value}"),
        ))
    }
}

/// The unconstrained state the sampler evolves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    pub intercept: f64,
    pub slope: f64,
    pub log_noise_scale: f64,
}

impl ModelParameters {
    pub fn new(intercept: f64, slope: f64, log_noise_scale: f64) -> Self {
        Self {
            intercept,
            slope,
            log_noise_scale,
        }
    }

    pub fn noise_scale(&self) -> f64 {
        self.log_noise_scale.exp()
    }

    pub fn as_array(&self) -> [f64; DIM] {
        [self.intercept, self.slope, self.log_noise_scale]
    }

    pub fn to_array(&self) -> Array1<f64> {
        arr1(&self.as_array())
    }

    /// Reads the first three entries of `values`.
    ///
    /// # Panics
    ///
    /// Panics if `values` holds fewer than three entries.
    pub fn from_slice(values: &[f64]) -> Self {
        Self::new(values[0], values[1], values[2])
    }

    pub fn is_finite(&self) -> bool {
        self.intercept.is_finite() && self.slope.is_finite() && self.log_noise_scale.is_finite()
    }
}

/// Log-posterior of the simple linear regression under a [`PriorSpec`].
#[derive(Debug, Clone)]
pub struct LinearRegression {
    prior: PriorSpec,
    n: f64,
    x_mean: f64,
    y_mean: f64,
    // Centred sums of squares and cross products.
    sxx: f64,
    sxy: f64,
    syy: f64,
}

impl LinearRegression {
    pub fn new(data: &Dataset, prior: PriorSpec) -> Self {
        let n = data.len() as f64;
        let x_mean = data.x().sum() / n;
        let y_mean = data.y().sum() / n;
        let (sxx, sxy, syy) = data.iter().fold((0.0, 0.0, 0.0), |(sxx, sxy, syy), (x, y)| {
            let (dx, dy) = (x - x_mean, y - y_mean);
            (sxx + dx * dx, sxy + dx * dy, syy + dy * dy)
        });
        Self {
            prior,
            n,
            x_mean,
            y_mean,
            sxx,
            sxy,
            syy,
        }
    }

    pub fn prior(&self) -> &PriorSpec {
        &self.prior
    }

    pub fn n_observations(&self) -> usize {
        self.n as usize
    }

    pub fn log_posterior(&self, params: &ModelParameters) -> f64 {
        self.evaluate(params, None)
    }

    pub fn gradient(&self, params: &ModelParameters) -> ModelParameters {
        let mut grad = [0.0; DIM];
        self.evaluate(params, Some(&mut grad));
        ModelParameters::from_slice(&grad)
    }

    fn evaluate(&self, params: &ModelParameters, grad: Option<&mut [f64; DIM]>) -> f64 {
        let ModelParameters {
            intercept: a,
            slope: b,
            log_noise_scale: ls,
        } = *params;
        let n = self.n;

        // Residual mean offset; SSR = syy - 2 b sxy + b^2 sxx + n c^2.
        let c = self.y_mean - a - b * self.x_mean;
        let ssr = (self.syy - 2.0 * b * self.sxy + b * b * self.sxx + n * c * c).max(0.0);
        let inv_var = (-2.0 * ls).exp();
        let var = (2.0 * ls).exp();

        let mut logp = -n * ls - n * HALF_LN_2PI - 0.5 * ssr * inv_var;

        let s_a = self.prior.intercept_sd;
        logp += -HALF_LN_2PI - s_a.ln() - 0.5 * (a / s_a).powi(2);

        if let SlopePrior::Normal { sd } = self.prior.slope {
            logp += -HALF_LN_2PI - sd.ln() - 0.5 * (b / sd).powi(2);
        }

        // Half-normal on exp(ls), plus the log-space Jacobian.
        let s_sigma = self.prior.noise_sd;
        logp += LN_2 - HALF_LN_2PI - s_sigma.ln() - 0.5 * var / (s_sigma * s_sigma) + ls;

        if let Some(g) = grad {
            g[0] = n * c * inv_var - a / (s_a * s_a);
            g[1] = (self.sxy - b * self.sxx + n * c * self.x_mean) * inv_var;
            if let SlopePrior::Normal { sd } = self.prior.slope {
                g[1] -= b / (sd * sd);
            }
            g[2] = -n + ssr * inv_var - var / (s_sigma * s_sigma) + 1.0;
        }
        logp
    }
}

impl GradientTarget for LinearRegression {
    fn dim(&self) -> usize {
        DIM
    }

    fn logp_and_grad(&self, position: &Array1<f64>, grad: &mut Array1<f64>) -> f64 {
        let params = ModelParameters::new(position[0], position[1], position[2]);
        let mut g = [0.0; DIM];
        let logp = self.evaluate(&params, Some(&mut g));
        grad.iter_mut().zip(g).for_each(|(out, v)| *out = v);
        logp
    }
}
