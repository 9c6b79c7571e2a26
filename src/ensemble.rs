use nalgebra::{DMatrix, DVector, RowDVector};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::analysis::Transform;

/// Returns the ensemble mean, i.e. the average of the member columns.
pub fn ensemble_mean(ens: &DMatrix<f64>) -> DVector<f64> {
    ens.column_mean()
}

/// Returns the anomaly matrix `X = E − x̄ 𝟙ᵀ` (not normalized).
pub fn anomalies(ens: &DMatrix<f64>) -> DMatrix<f64> {
    let mean = ens.column_mean();
    ens - &mean * RowDVector::repeat(ens.ncols(), 1.0)
}

/// Applies a right-acting analysis transform to the ensemble in place.
///
/// A plain matrix transform right-multiplies the member columns (stochastic
/// EnKF). A `(T, w, U)` triple shifts the mean by `X w` and replaces the
/// anomalies with `√(N−1) X T U`:
///
/// `E ← x̄ 𝟙ᵀ + X (w 𝟙ᵀ + √(N−1) T U)`
pub fn ensemble_update(ens: &mut DMatrix<f64>, transform: &Transform) {
    match transform {
        Transform::RightMultiply(gamma) => {
            *ens = &*ens * gamma;
        }
        Transform::Triple { t, w, u } => {
            let n_ens = ens.ncols();
            let mean = ens.column_mean();
            let ones = RowDVector::repeat(n_ens, 1.0);
            let x = &*ens - &mean * &ones;
            let mut rot = t * u * ((n_ens - 1) as f64).sqrt();
            rot += w * &ones;
            *ens = &mean * &ones + x * rot;
        }
    }
}

/// Multiplicative inflation of the state anomalies, rows `0..state_dim`.
/// Exact no-op at `alpha = 1` so an uninflated cycle is bit-reproducible.
pub fn inflate_state(ens: &mut DMatrix<f64>, alpha: f64, state_dim: usize) {
    inflate_rows(ens, alpha, 0, state_dim)
}

/// Multiplicative inflation of the parameter anomalies, rows
/// `state_dim..sys_dim`.
pub fn inflate_params(ens: &mut DMatrix<f64>, alpha: f64, state_dim: usize) {
    let sys_dim = ens.nrows();
    inflate_rows(ens, alpha, state_dim, sys_dim)
}

fn inflate_rows(ens: &mut DMatrix<f64>, alpha: f64, begin: usize, end: usize) {
    if alpha == 1.0 {
        return;
    }
    let n_ens = ens.ncols();
    for i in begin..end {
        let mean = ens.row(i).sum() / n_ens as f64;
        for j in 0..n_ens {
            ens[(i, j)] = mean + alpha * (ens[(i, j)] - mean);
        }
    }
}

/// Random-walk perturbation of the parameter sub-ensemble, with the
/// diffusion of each parameter row scaled by its current ensemble mean.
pub fn param_random_walk(ens: &mut DMatrix<f64>, wlk: f64, state_dim: usize, rng: &mut StdRng) {
    if wlk == 0.0 {
        return;
    }
    let (sys_dim, n_ens) = ens.shape();
    for i in state_dim..sys_dim {
        let mean = ens.row(i).sum() / n_ens as f64;
        for j in 0..n_ens {
            let xi: f64 = rng.sample(StandardNormal);
            ens[(i, j)] += wlk * mean * xi;
        }
    }
}

/// Draws a mean-preserving random orthogonal matrix: `U 𝟙 = 𝟙` and
/// `Uᵀ U = I`.
///
/// An `(N−1)²` standard-normal block is QR-orthogonalized and embedded as
/// `blockdiag(1, Q)` in the orthonormal basis whose first vector is
/// `𝟙/√N`; the basis itself is the Householder reflector mapping `e₁` onto
/// `𝟙/√N`, which is the closed form of extending that column to a full
/// basis by QR.
pub fn mean_preserving_orthogonal(n_ens: usize, rng: &mut StdRng) -> DMatrix<f64> {
    if n_ens == 1 {
        return DMatrix::identity(1, 1);
    }
    let m = n_ens - 1;
    let gauss = DMatrix::from_fn(m, m, |_, _| rng.sample::<f64, _>(StandardNormal));
    let q = gauss.qr().q();

    let mut block = DMatrix::zeros(n_ens, n_ens);
    block[(0, 0)] = 1.0;
    for i in 0..m {
        for j in 0..m {
            block[(i + 1, j + 1)] = q[(i, j)];
        }
    }

    let inv_sqrt_n = 1.0 / (n_ens as f64).sqrt();
    let mut v = DVector::from_element(n_ens, inv_sqrt_n);
    v[0] -= 1.0;
    let basis = DMatrix::identity(n_ens, n_ens) - &v * v.transpose() * (2.0 / v.norm_squared());

    &basis * block * basis.transpose()
}

/// Samples an initial ensemble from `N(mean, sd² I)`.
pub fn sample_gaussian_ensemble(
    mean: &DVector<f64>,
    sd: f64,
    n_ens: usize,
    rng: &mut StdRng,
) -> DMatrix<f64> {
    let dim = mean.len();
    DMatrix::from_fn(dim, n_ens, |i, _| {
        mean[i] + sd * rng.sample::<f64, _>(StandardNormal)
    })
}

/// Root-mean-square error of the ensemble mean against the truth, and the
/// ensemble spread, both over the row range `begin..end`.
pub fn rmse_spread(
    ens: &DMatrix<f64>,
    truth: &DVector<f64>,
    begin: usize,
    end: usize,
) -> (f64, f64) {
    let n_ens = ens.ncols();
    let dim = (end - begin) as f64;
    let mean = ens.column_mean();

    // The truth vector may span only the compared rows or the full system.
    let mut se = 0.0;
    for (k, i) in (begin..end).enumerate() {
        let t = if truth.len() == ens.nrows() {
            truth[i]
        } else {
            truth[k]
        };
        let err = mean[i] - t;
        se += err * err;
    }
    let rmse = (se / dim).sqrt();

    let mut var = 0.0;
    for i in begin..end {
        for j in 0..n_ens {
            let a = ens[(i, j)] - mean[i];
            var += a * a;
        }
    }
    let spread = (var / (dim * (n_ens - 1) as f64)).sqrt();
    (rmse, spread)
}
