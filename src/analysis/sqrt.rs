use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::errors::DaError;

/// Iteration cap and tolerance handed to nalgebra's iterative SVD. A dense
/// symmetric matrix of ensemble size converges in far fewer sweeps; failure
/// to converge here maps to a numerical error rather than a panic.
const SVD_MAX_ITER: usize = 250;

/// Selects which factors [`sym_roots`] must synthesize from its single SVD.
#[derive(Debug, Clone, Copy, Default)]
pub struct RootsRequest {
    pub sqrt: bool,
    pub sqrt_inv: bool,
    pub inverse: bool,
}

impl RootsRequest {
    pub fn sqrt_inv() -> Self {
        Self {
            sqrt_inv: true,
            ..Default::default()
        }
    }

    pub fn sqrt_inv_and_inverse() -> Self {
        Self {
            sqrt_inv: true,
            inverse: true,
            ..Default::default()
        }
    }

    pub fn all() -> Self {
        Self {
            sqrt: true,
            sqrt_inv: true,
            inverse: true,
        }
    }
}

/// The factors produced by [`sym_roots`]; only the requested ones are set.
#[derive(Debug, Clone, Default)]
pub struct SymRoots {
    pub sqrt: Option<DMatrix<f64>>,
    pub sqrt_inv: Option<DMatrix<f64>>,
    pub inverse: Option<DMatrix<f64>>,
}

/// Computes `M^{1/2}`, `M^{-1/2}` and/or `M^{-1}` of a symmetric
/// positive-definite matrix from a single SVD `M = U Σ Vᵀ`, synthesizing
/// each factor as `U f(Σ) Uᵀ` and symmetrizing the result.
pub fn sym_roots(m: &DMatrix<f64>, req: RootsRequest) -> Result<SymRoots, DaError> {
    let n = m.nrows();
    let svd = m
        .clone()
        .try_svd(true, false, f64::EPSILON, SVD_MAX_ITER)
        .ok_or(DaError::NumericalSvd)?;
    let u = svd.u.ok_or(DaError::NumericalSvd)?;
    let sigma = svd.singular_values;

    let sigma_max = sigma.max();
    if (req.sqrt_inv || req.inverse) && sigma.min() <= sigma_max * n as f64 * f64::EPSILON {
        return Err(DaError::NumericalSvd);
    }

    let synth = |f: &dyn Fn(f64) -> f64| -> DMatrix<f64> {
        let scaled = DMatrix::from_fn(n, n, |i, j| u[(i, j)] * f(sigma[j]));
        let prod = &scaled * u.transpose();
        symmetrize(&prod)
    };

    let mut out = SymRoots::default();
    if req.sqrt {
        out.sqrt = Some(synth(&|s: f64| s.sqrt()));
    }
    if req.sqrt_inv {
        out.sqrt_inv = Some(synth(&|s: f64| 1.0 / s.sqrt()));
    }
    if req.inverse {
        out.inverse = Some(synth(&|s: f64| 1.0 / s));
    }
    Ok(out)
}

pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    (m + m.transpose()) * 0.5
}

/// The observation error covariance in one of its three recognized shapes.
/// The scalar and diagonal shapes admit closed-form roots; the full
/// symmetric shape routes through [`sym_roots`].
#[derive(Debug, Clone, PartialEq)]
pub enum ObsCovar {
    /// `var * I`, with `var > 0`.
    Uniform { dim: usize, var: f64 },
    /// A diagonal with strictly positive entries.
    Diagonal(DVector<f64>),
    /// A full symmetric positive-definite matrix.
    Full(DMatrix<f64>),
}

impl ObsCovar {
    /// A scalar-times-identity covariance from an observation noise
    /// standard deviation, the common twin-experiment shape.
    pub fn from_sd(dim: usize, sd: f64) -> Self {
        ObsCovar::Uniform { dim, var: sd * sd }
    }

    pub fn dim(&self) -> usize {
        match self {
            ObsCovar::Uniform { dim, .. } => *dim,
            ObsCovar::Diagonal(d) => d.len(),
            ObsCovar::Full(m) => m.nrows(),
        }
    }

    /// Positive-definiteness check, run once at cycle entry.
    pub fn validate(&self) -> Result<(), DaError> {
        let ok = match self {
            ObsCovar::Uniform { var, .. } => *var > 0.0,
            ObsCovar::Diagonal(d) => d.iter().all(|&v| v > 0.0),
            ObsCovar::Full(m) => {
                m.nrows() == m.ncols() && m.clone().cholesky().is_some()
            }
        };
        if ok {
            Ok(())
        } else {
            Err(DaError::CovarianceNotPositiveDefinite)
        }
    }

    /// Scales the covariance by a multiple-data-assimilation weight.
    pub fn scaled(&self, weight: f64) -> Self {
        match self {
            ObsCovar::Uniform { dim, var } => ObsCovar::Uniform {
                dim: *dim,
                var: var * weight,
            },
            ObsCovar::Diagonal(d) => ObsCovar::Diagonal(d * weight),
            ObsCovar::Full(m) => ObsCovar::Full(m * weight),
        }
    }

    pub fn as_matrix(&self) -> DMatrix<f64> {
        match self {
            ObsCovar::Uniform { dim, var } => DMatrix::identity(*dim, *dim) * *var,
            ObsCovar::Diagonal(d) => DMatrix::from_diagonal(d),
            ObsCovar::Full(m) => m.clone(),
        }
    }

    pub fn sqrt(&self) -> Result<DMatrix<f64>, DaError> {
        match self {
            ObsCovar::Uniform { dim, var } => {
                Ok(DMatrix::identity(*dim, *dim) * var.sqrt())
            }
            ObsCovar::Diagonal(d) => {
                Ok(DMatrix::from_diagonal(&d.map(|v| v.sqrt())))
            }
            ObsCovar::Full(m) => Ok(sym_roots(
                m,
                RootsRequest {
                    sqrt: true,
                    ..Default::default()
                },
            )?
            .sqrt
            .unwrap()),
        }
    }

    pub fn sqrt_inv(&self) -> Result<DMatrix<f64>, DaError> {
        match self {
            ObsCovar::Uniform { dim, var } => {
                Ok(DMatrix::identity(*dim, *dim) / var.sqrt())
            }
            ObsCovar::Diagonal(d) => {
                Ok(DMatrix::from_diagonal(&d.map(|v| 1.0 / v.sqrt())))
            }
            ObsCovar::Full(m) => Ok(sym_roots(m, RootsRequest::sqrt_inv())?
                .sqrt_inv
                .unwrap()),
        }
    }

    pub fn inverse(&self) -> Result<DMatrix<f64>, DaError> {
        match self {
            ObsCovar::Uniform { dim, var } => Ok(DMatrix::identity(*dim, *dim) / *var),
            ObsCovar::Diagonal(d) => Ok(DMatrix::from_diagonal(&d.map(|v| 1.0 / v))),
            ObsCovar::Full(m) => Ok(sym_roots(
                m,
                RootsRequest {
                    inverse: true,
                    ..Default::default()
                },
            )?
            .inverse
            .unwrap()),
        }
    }

    /// Draws one perturbation from `N(0, R)`.
    pub fn sample(&self, rng: &mut StdRng) -> Result<DVector<f64>, DaError> {
        let dim = self.dim();
        let z = DVector::from_fn(dim, |_, _| rng.sample::<f64, _>(StandardNormal));
        match self {
            ObsCovar::Uniform { var, .. } => Ok(z * var.sqrt()),
            ObsCovar::Diagonal(d) => {
                Ok(DVector::from_fn(dim, |i, _| z[i] * d[i].sqrt()))
            }
            ObsCovar::Full(_) => Ok(self.sqrt()? * z),
        }
    }
}
