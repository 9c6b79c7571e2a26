use std::fmt;

/// Stores the different kinds of errors raised by the assimilation schemes.
///
/// Configuration errors are raised at cycle entry and are fatal to the
/// configuration. Numerical errors are raised from the analysis kernels and
/// are fatal to the cycle: a kernel which cannot produce a transform is
/// unusable and the experiment must be re-run with adjusted parameters.
/// Hitting an iteration cap is _not_ an error; iterative kernels report
/// their iteration count alongside the transform instead.
#[derive(Debug, Clone, PartialEq)]
pub enum DaError {
    /// The analysis label could not be parsed into a known scheme.
    UnknownAnalysis(String),
    /// The ensemble must have at least two members.
    EnsembleTooSmall(usize),
    /// The observation dimension must be in 1..=state_dim.
    ObsDim { obs_dim: usize, state_dim: usize },
    /// With MDA enabled, the lag must be a positive multiple of the shift.
    LagShiftIncompatible { lag: usize, shift: usize },
    /// MDA weight vectors must have length `lag` with positive entries.
    MdaWeights(String),
    /// The observation error covariance is not positive definite.
    CovarianceNotPositiveDefinite,
    /// The driver was called with the wrong number of observation columns.
    ObsWindowMismatch { expected: usize, found: usize },
    /// The posterior ring buffer does not match the lag and shift.
    PosteriorLength { expected: usize, found: usize },
    /// The scheme is not supported by the driver it was handed to.
    SchemeDriverMismatch(String),
    /// The iterative SVD did not converge on this matrix.
    NumericalSvd,
    /// A Cholesky factorization failed on a matrix expected to be SPD.
    NumericalCholesky,
    /// The strong Wolfe line search could not satisfy its conditions.
    LineSearch,
    /// The bounded Brent minimization did not converge.
    BrentMinimization,
    /// A time series or artifact could not be read or written.
    Io(String),
}

impl fmt::Display for DaError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DaError::UnknownAnalysis(label) => {
                write!(f, "unknown analysis label `{}`", label)
            }
            DaError::EnsembleTooSmall(n) => {
                write!(f, "ensemble has {} member(s), need at least 2", n)
            }
            DaError::ObsDim { obs_dim, state_dim } => write!(
                f,
                "observation dimension {} not in 1..={}",
                obs_dim, state_dim
            ),
            DaError::LagShiftIncompatible { lag, shift } => write!(
                f,
                "lag {} must be a positive multiple of shift {} with MDA",
                lag, shift
            ),
            DaError::MdaWeights(msg) => write!(f, "invalid MDA weights: {}", msg),
            DaError::CovarianceNotPositiveDefinite => {
                write!(f, "observation error covariance is not positive definite")
            }
            DaError::ObsWindowMismatch { expected, found } => write!(
                f,
                "expected {} observation column(s) in the window, found {}",
                expected, found
            ),
            DaError::PosteriorLength { expected, found } => write!(
                f,
                "posterior buffer holds {} slice(s), expected {}",
                found, expected
            ),
            DaError::SchemeDriverMismatch(msg) => write!(f, "{}", msg),
            DaError::NumericalSvd => write!(f, "SVD did not converge"),
            DaError::NumericalCholesky => {
                write!(f, "Cholesky failed: matrix is not positive definite")
            }
            DaError::LineSearch => {
                write!(f, "line search could not satisfy the strong Wolfe conditions")
            }
            DaError::BrentMinimization => {
                write!(f, "Brent minimization of the dual cost did not converge")
            }
            DaError::Io(msg) => write!(f, "I/O failure: {}", msg),
        }
    }
}

impl std::error::Error for DaError {}
