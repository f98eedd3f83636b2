//! Error taxonomy shared by the whole crate.
//!
//! Only failures that stop an operation live here. Numerical trouble inside a
//! single trajectory is handled locally by the integrator (see
//! [`crate::hmc::Degenerate`]) and convergence problems are reported as
//! [`crate::stats::ConvergenceWarning`]s, neither of which is an error.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// A configuration value or call argument is out of its valid range.
    ///
    /// Raised before any sampling starts.
    #[error("invalid argument `{name}`: {reason}")]
    InvalidArgument { name: &'static str, reason: String },

    /// No starting point with a finite log-density and gradient was found.
    #[error("chain {chain}: no finite starting point after {attempts} attempts")]
    Initialization { chain: usize, attempts: usize },

    /// Every transition of a chain hit a non-finite log-density or gradient.
    #[error("chain {chain}: all {iterations} transitions were numerically degenerate")]
    ChainFailure { chain: usize, iterations: usize },

    #[error("failed to build worker pool: {0}")]
    WorkerPool(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidArgument {
            name,
            reason: reason.into(),
        }
    }
}

impl From<rayon::ThreadPoolBuildError> for Error {
    fn from(err: rayon::ThreadPoolBuildError) -> Self {
        Error::WorkerPool(err.to_string())
    }
}
