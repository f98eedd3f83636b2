//! Turning slope draws into comparable density curves.
//!
//! [`summarize`] is a pure function from draws to a Gaussian kernel density
//! estimate. The [`SummaryReporter`] evaluates every prior at a given sample
//! size on one shared grid so the curves can be overlaid directly, and
//! packages them with the true slope, posterior summaries and diagnostics
//! into a serialisable [`SummaryArtifact`].

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::data::TrueParams;
use crate::experiment::{CellFailure, CellResult, ExperimentResult};
use crate::stats::ConvergenceWarning;

/// Evenly spaced evaluation points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DensityGrid {
    pub points: Vec<f64>,
}

impl DensityGrid {
    /// `n_points` points from `lo` to `hi` inclusive.
    pub fn linspace(lo: f64, hi: f64, n_points: usize) -> Self {
        let n = n_points.max(2);
        let step = (hi - lo) / (n - 1) as f64;
        Self {
            points: (0..n).map(|i| lo + step * i as f64).collect(),
        }
    }

    /// A grid covering every sample set, padded by three bandwidths on each
    /// side. Returns `None` if there are no finite draws.
    pub fn spanning<'a>(
        samples: impl IntoIterator<Item = &'a [f64]>,
        n_points: usize,
    ) -> Option<Self> {
        let mut range: Option<(f64, f64)> = None;
        for draws in samples {
            let finite: Vec<f64> = draws.iter().copied().filter(|v| v.is_finite()).collect();
            if finite.is_empty() {
                continue;
            }
            let pad = 3.0 * bandwidth(&finite);
            let lo = finite.iter().copied().fold(f64::INFINITY, f64::min) - pad;
            let hi = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max) + pad;
            range = Some(match range {
                None => (lo, hi),
                Some((a, b)) => (a.min(lo), b.max(hi)),
            });
        }
        range.map(|(lo, hi)| Self::linspace(lo, hi, n_points))
    }
}

/// A kernel density estimate evaluated on a grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DensityEstimate {
    pub grid: Vec<f64>,
    pub density: Vec<f64>,
    pub bandwidth: f64,
}

/// Location and spread of a set of draws.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PosteriorSummary {
    pub n_draws: usize,
    pub mean: f64,
    pub sd: f64,
    pub q05: f64,
    pub median: f64,
    pub q95: f64,
}

impl PosteriorSummary {
    /// Returns `None` for fewer than two draws.
    pub fn from_draws(draws: &[f64]) -> Option<Self> {
        if draws.len() < 2 {
            return None;
        }
        let n = draws.len() as f64;
        let mean = draws.iter().sum::<f64>() / n;
        let var = draws.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
        let mut sorted = draws.to_vec();
        sorted.sort_by(f64::total_cmp);
        Some(Self {
            n_draws: draws.len(),
            mean,
            sd: var.sqrt(),
            q05: quantile_sorted(&sorted, 0.05),
            median: quantile_sorted(&sorted, 0.5),
            q95: quantile_sorted(&sorted, 0.95),
        })
    }
}

/// Linearly interpolated quantile of sorted data.
fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    let h = (sorted.len() - 1) as f64 * q;
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}

/// Rule-of-thumb bandwidth `0.9 * min(sd, IQR / 1.34) * n^(-1/5)`.
///
/// Falls back to the sd, then to a tenth of the first value's magnitude,
/// then to one when the spread is zero.
pub fn bandwidth(draws: &[f64]) -> f64 {
    let n = draws.len();
    if n < 2 {
        return 1.0;
    }
    let mut sorted = draws.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mean = sorted.iter().sum::<f64>() / n as f64;
    let sd = (sorted.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1) as f64).sqrt();
    let iqr = quantile_sorted(&sorted, 0.75) - quantile_sorted(&sorted, 0.25);
    let mut lo = sd.min(iqr / 1.34);
    if !(lo > 0.0) {
        lo = if sd > 0.0 {
            sd
        } else if sorted[0] != 0.0 {
            sorted[0].abs()
        } else {
            1.0
        };
    }
    0.9 * lo * (n as f64).powf(-0.2)
}

/// Gaussian KDE of `draws` on `grid`.
pub fn summarize_on(draws: &[f64], grid: &DensityGrid) -> DensityEstimate {
    let h = bandwidth(draws);
    let norm = 1.0 / (draws.len().max(1) as f64 * h * (2.0 * PI).sqrt());
    let density = grid
        .points
        .iter()
        .map(|&x| {
            norm * draws
                .iter()
                .map(|&d| (-0.5 * ((x - d) / h).powi(2)).exp())
                .sum::<f64>()
        })
        .collect();
    DensityEstimate {
        grid: grid.points.clone(),
        density,
        bandwidth: h,
    }
}

/// Gaussian KDE of `draws` on its own 512-point grid.
pub fn summarize(draws: &[f64]) -> DensityEstimate {
    let grid = DensityGrid::spanning([draws], 512)
        .unwrap_or_else(|| DensityGrid::linspace(-1.0, 1.0, 512));
    summarize_on(draws, &grid)
}

/// `{rhat, ess, ok}` of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticSummary {
    pub rhat: f64,
    pub ess: f64,
    pub ok: bool,
}

/// One prior's curve at one sample size. Failed cells keep their entry with
/// `failure` set and no density.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorCurve {
    pub prior: String,
    pub density: Option<Vec<f64>>,
    pub bandwidth: Option<f64>,
    pub summary: Option<PosteriorSummary>,
    pub diagnostics: Option<DiagnosticSummary>,
    pub warnings: Vec<ConvergenceWarning>,
    pub failure: Option<CellFailure>,
}

/// All curves of one sample size, on a common grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizePanel {
    pub sample_size: usize,
    /// Least-squares slope of this size's dataset.
    pub ols_slope: Option<f64>,
    pub grid: Vec<f64>,
    pub curves: Vec<PriorCurve>,
}

/// The comparison artifact handed to external plotting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryArtifact {
    pub truth: TrueParams,
    /// Where to draw the reference line.
    pub true_slope: f64,
    pub panels: Vec<SizePanel>,
}

impl SummaryArtifact {
    pub fn panel(&self, sample_size: usize) -> Option<&SizePanel> {
        self.panels.iter().find(|p| p.sample_size == sample_size)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl SizePanel {
    pub fn curve(&self, prior: &str) -> Option<&PriorCurve> {
        self.curves.iter().find(|c| c.prior == prior)
    }
}

/// Builds a [`SummaryArtifact`] from an experiment.
#[derive(Debug, Clone, Copy)]
pub struct SummaryReporter {
    grid_points: usize,
}

impl Default for SummaryReporter {
    fn default() -> Self {
        Self { grid_points: 512 }
    }
}

impl SummaryReporter {
    pub fn new(grid_points: usize) -> Self {
        Self {
            grid_points: grid_points.max(2),
        }
    }

    pub fn report(&self, result: &ExperimentResult) -> SummaryArtifact {
        let panels = result
            .sample_sizes
            .iter()
            .map(|&n| {
                let cells: Vec<&CellResult> =
                    result.cells.iter().filter(|c| c.sample_size == n).collect();
                self.panel(n, &cells, result)
            })
            .collect();
        SummaryArtifact {
            truth: result.truth,
            true_slope: result.truth.slope,
            panels,
        }
    }

    fn panel(&self, sample_size: usize, cells: &[&CellResult], result: &ExperimentResult) -> SizePanel {
        let draws: Vec<Option<Vec<f64>>> = cells
            .iter()
            .map(|c| c.fit().map(|fit| fit.slope_draws()))
            .collect();
        let grid = DensityGrid::spanning(draws.iter().flatten().map(Vec::as_slice), self.grid_points);

        let curves = cells
            .iter()
            .zip(&draws)
            .map(|(cell, draws)| {
                let estimate = match (draws, &grid) {
                    (Some(d), Some(g)) => Some(summarize_on(d, g)),
                    _ => None,
                };
                PriorCurve {
                    prior: cell.prior.name.clone(),
                    bandwidth: estimate.as_ref().map(|e| e.bandwidth),
                    density: estimate.map(|e| e.density),
                    summary: draws.as_deref().and_then(PosteriorSummary::from_draws),
                    diagnostics: cell.fit().map(|fit| DiagnosticSummary {
                        rhat: fit.diagnostics.rhat,
                        ess: fit.diagnostics.ess,
                        ok: fit.diagnostics.ok,
                    }),
                    warnings: cell
                        .fit()
                        .map(|fit| fit.diagnostics.warnings.clone())
                        .unwrap_or_default(),
                    failure: cell.failure().cloned(),
                }
            })
            .collect();

        SizePanel {
            sample_size,
            ols_slope: result
                .dataset(sample_size)
                .and_then(|d| d.ols())
                .map(|(_, slope)| slope),
            grid: grid.map(|g| g.points).unwrap_or_default(),
            curves,
        }
    }
}
