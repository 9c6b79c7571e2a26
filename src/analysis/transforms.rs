use nalgebra::{DMatrix, DVector, RowDVector};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;

use super::optimize::{brent_min, strong_wolfe, CostModel};
use super::sqrt::{sym_roots, symmetrize, ObsCovar, RootsRequest};
use super::{Algorithm, Analysis, Conditioning, Family, Transform, TransformCtx};
use crate::ensemble::{anomalies, ensemble_mean, mean_preserving_orthogonal};
use crate::errors::DaError;
use crate::obs::ObsOperator;

/// Lower bound of the finite-size dual minimization interval.
const DUAL_ZETA_MIN: f64 = 1e-6;
const DUAL_TOL: f64 = 1e-8;
const DUAL_MAX_ITER: usize = 100;

/// Computes the analysis transform for the ensemble, observation and
/// observation error covariance under the given scheme.
///
/// The returned [`Analysis`] carries the transform together with the inner
/// iteration count of the relinearizing kernels; direct kernels report one
/// iteration. The sequential IEnKS is not dispatched here: its
/// gradient/Hessian increments only make sense inside the Gauss-Newton
/// smoother driver, which calls [`ienks_increment`] directly.
pub fn transform(
    alg: &Algorithm,
    ens: &DMatrix<f64>,
    obs: &DVector<f64>,
    obs_cov: &ObsCovar,
    ctx: &TransformCtx,
    rng: &mut StdRng,
) -> Result<Analysis, DaError> {
    let n_ens = ens.ncols();
    if n_ens < 2 {
        return Err(DaError::EnsembleTooSmall(n_ens));
    }
    obs_cov.validate()?;

    match alg.family {
        Family::Enkf => stochastic_enkf(ens, obs, obs_cov, ctx, rng),
        Family::Etkf => etkf(ens, obs, obs_cov, ctx, rng),
        Family::Mlef => mlef(alg, ens, obs, obs_cov, ctx, rng),
        Family::EnkfNPrimal => enkf_n_primal(alg, ens, obs, obs_cov, ctx, rng),
        Family::EnkfNDual => enkf_n_dual(ens, obs, obs_cov, ctx, rng),
        Family::Ienks => Err(DaError::SchemeDriverMismatch(
            "ienks transforms are built by the Gauss-Newton smoother driver".to_string(),
        )),
    }
}

/// Observed ensemble, its mean, and the `R^{-1/2}`-weighted anomalies and
/// innovation shared by the deterministic kernels.
fn observed_statistics(
    ens: &DMatrix<f64>,
    obs: &DVector<f64>,
    r_sqrt_inv: &DMatrix<f64>,
    ctx: &TransformCtx,
) -> Result<(DMatrix<f64>, DVector<f64>), DaError> {
    let n_ens = ens.ncols();
    let ones = RowDVector::repeat(n_ens, 1.0);
    let y_ens = ctx.obs_op.observe(ens, obs.len(), ctx.state_dim)?;
    let y_mean = y_ens.column_mean();
    let s = r_sqrt_inv * (&y_ens - &y_mean * &ones);
    let delta = r_sqrt_inv * (obs - &y_mean);
    Ok((s, delta))
}

/// Stochastic (perturbed-observation) EnKF: a single right-multiplier
/// built from unbiased observation perturbations.
fn stochastic_enkf(
    ens: &DMatrix<f64>,
    obs: &DVector<f64>,
    obs_cov: &ObsCovar,
    ctx: &TransformCtx,
    rng: &mut StdRng,
) -> Result<Analysis, DaError> {
    let n_ens = ens.ncols();
    let obs_dim = obs.len();
    let nfac = ((n_ens - 1) as f64).sqrt();
    let ones = RowDVector::repeat(n_ens, 1.0);

    let y_ens = ctx.obs_op.observe(ens, obs_dim, ctx.state_dim)?;
    let y_mean = y_ens.column_mean();
    let s = (&y_ens - &y_mean * &ones) / nfac;

    // Unbiased perturbations drawn from N(0, R).
    let r_sqrt = obs_cov.sqrt()?;
    let mut perts =
        &r_sqrt * DMatrix::from_fn(obs_dim, n_ens, |_, _| rng.sample::<f64, _>(StandardNormal));
    let pert_mean = perts.column_mean();
    perts -= &pert_mean * &ones;

    let c = symmetrize(&(&s * s.transpose() + obs_cov.as_matrix()));
    let chol = c.cholesky().ok_or(DaError::NumericalCholesky)?;
    let innovations = obs * &ones + perts - y_ens;
    let gamma = DMatrix::identity(n_ens, n_ens) + s.transpose() * chol.solve(&innovations) / nfac;

    Ok(Analysis {
        transform: Transform::RightMultiply(gamma),
        iterations: 1,
    })
}

/// Deterministic ensemble transform Kalman filter: right transform,
/// mean-update weights and random mean-preserving rotation from one SVD of
/// the weight-space Hessian.
fn etkf(
    ens: &DMatrix<f64>,
    obs: &DVector<f64>,
    obs_cov: &ObsCovar,
    ctx: &TransformCtx,
    rng: &mut StdRng,
) -> Result<Analysis, DaError> {
    let n_ens = ens.ncols();
    let r_sqrt_inv = obs_cov.sqrt_inv()?;
    let (s, delta) = observed_statistics(ens, obs, &r_sqrt_inv, ctx)?;

    let h_w = symmetrize(
        &(DMatrix::identity(n_ens, n_ens) * (n_ens - 1) as f64 + s.transpose() * &s),
    );
    let roots = sym_roots(&h_w, RootsRequest::sqrt_inv_and_inverse())?;
    let t = roots.sqrt_inv.unwrap();
    let h_inv = roots.inverse.unwrap();
    let w = h_inv * s.transpose() * delta;
    let u = mean_preserving_orthogonal(n_ens, rng);

    Ok(Analysis {
        transform: Transform::Triple { t, w, u },
        iterations: 1,
    })
}

/// The cost model of the MLEF family: the observation operator is
/// re-evaluated on the conditioned ensemble rebuilt around each iterate, so
/// gradient and Hessian always see the current linearization.
struct RelinearizedCost<'a> {
    mean0: DVector<f64>,
    x0: DMatrix<f64>,
    t: DMatrix<f64>,
    t_inv: DMatrix<f64>,
    r_sqrt_inv: DMatrix<f64>,
    obs: &'a DVector<f64>,
    obs_op: ObsOperator,
    state_dim: usize,
    finite_size: bool,
    /// Weighted observed anomalies of the last evaluation, kept for the
    /// post-loop adaptive-inflation Hessian.
    s: DMatrix<f64>,
}

impl<'a> CostModel for RelinearizedCost<'a> {
    fn evaluate(
        &mut self,
        w: &DVector<f64>,
        grad: Option<&mut DVector<f64>>,
        hess: Option<&mut DMatrix<f64>>,
    ) -> Result<f64, DaError> {
        let n_ens = self.x0.ncols();
        let nf = n_ens as f64;
        let ones = RowDVector::repeat(n_ens, 1.0);

        let mean_j = &self.mean0 + &self.x0 * w;
        let ens_j = &mean_j * &ones + &self.x0 * &self.t;
        let y_ens = self
            .obs_op
            .observe(&ens_j, self.obs.len(), self.state_dim)?;
        let y_mean = y_ens.column_mean();
        self.s = &self.r_sqrt_inv * (&y_ens - &y_mean * &ones) * &self.t_inv;
        let delta = &self.r_sqrt_inv * (self.obs - &y_mean);

        let wsq = w.norm_squared();
        let (prior_cost, prior_grad) = if self.finite_size {
            let eps_n = 1.0 + 1.0 / nf;
            let n_eff = nf + 1.0;
            let zeta = 1.0 / (eps_n + wsq);
            (0.5 * n_eff * (eps_n + wsq).ln(), n_eff * zeta)
        } else {
            (0.5 * (nf - 1.0) * wsq, nf - 1.0)
        };

        if let Some(g) = grad {
            *g = w * prior_grad - self.s.transpose() * &delta;
        }
        if let Some(h) = hess {
            let ridge = if self.finite_size { nf } else { nf - 1.0 };
            *h = symmetrize(
                &(DMatrix::identity(n_ens, n_ens) * ridge + self.s.transpose() * &self.s),
            );
        }
        Ok(prior_cost + 0.5 * delta.norm_squared())
    }
}

/// Maximum-likelihood ensemble filter: Newton (optionally under a strong
/// Wolfe line search) on the relinearized cost, in bundle or transform
/// conditioning, with the finite-size ("-n") adaptive-inflation exit.
fn mlef(
    alg: &Algorithm,
    ens: &DMatrix<f64>,
    obs: &DVector<f64>,
    obs_cov: &ObsCovar,
    ctx: &TransformCtx,
    rng: &mut StdRng,
) -> Result<Analysis, DaError> {
    let n_ens = ens.ncols();
    let nf = n_ens as f64;
    let identity = DMatrix::identity(n_ens, n_ens);

    let (t0, t0_inv) = match alg.conditioning {
        Conditioning::Bundle => (&identity * ctx.epsilon, &identity / ctx.epsilon),
        Conditioning::Transform => (identity.clone(), identity.clone()),
    };

    let mut model = RelinearizedCost {
        mean0: ensemble_mean(ens),
        x0: anomalies(ens),
        t: t0,
        t_inv: t0_inv,
        r_sqrt_inv: obs_cov.sqrt_inv()?,
        obs,
        obs_op: ctx.obs_op,
        state_dim: ctx.state_dim,
        finite_size: alg.finite_size,
        s: DMatrix::zeros(obs.len(), n_ens),
    };

    let mut w = DVector::zeros(n_ens);
    let mut grad = DVector::zeros(n_ens);
    let mut hess = DMatrix::zeros(n_ens, n_ens);
    let mut iterations = 0;

    for _ in 0..ctx.max_iter {
        iterations += 1;
        model.evaluate(&w, Some(&mut grad), Some(&mut hess))?;
        if grad.norm() < ctx.tol {
            break;
        }
        let chol = hess.clone().cholesky().ok_or(DaError::NumericalCholesky)?;

        let step_norm = if alg.line_search {
            let p = -chol.solve(&grad);
            let alpha = strong_wolfe(&mut model, &w, &p)?;
            let step = p * alpha;
            let norm = step.norm();
            w += step;
            norm
        } else {
            let dw = chol.solve(&grad);
            let norm = dw.norm();
            w -= dw;
            norm
        };

        if alg.conditioning == Conditioning::Transform {
            let roots = sym_roots(
                &hess,
                RootsRequest {
                    sqrt: true,
                    sqrt_inv: true,
                    ..Default::default()
                },
            )?;
            model.t = roots.sqrt_inv.unwrap();
            model.t_inv = roots.sqrt.unwrap();
        }
        if step_norm < ctx.tol {
            break;
        }
    }

    // Refresh the linearization at the accepted iterate before building the
    // exit transform.
    model.evaluate(&w, None, Some(&mut hess))?;
    let t = if alg.finite_size {
        let eps_n = 1.0 + 1.0 / nf;
        let n_eff = nf + 1.0;
        let zeta = 1.0 / (eps_n + w.norm_squared());
        let h_star = symmetrize(
            &(model.s.transpose() * &model.s
                + (DMatrix::identity(n_ens, n_ens) * zeta
                    - &w * w.transpose() * (2.0 * zeta * zeta))
                    * n_eff),
        );
        sym_roots(&h_star, RootsRequest::sqrt_inv())?.sqrt_inv.unwrap()
    } else {
        sym_roots(&hess, RootsRequest::sqrt_inv())?.sqrt_inv.unwrap()
    };

    let u = mean_preserving_orthogonal(n_ens, rng);
    Ok(Analysis {
        transform: Transform::Triple { t, w, u },
        iterations,
    })
}

/// The fixed-linearization finite-size cost of the primal EnKF-N: the
/// observed anomalies are computed once from the forecast ensemble.
struct FiniteSizeCost {
    s: DMatrix<f64>,
    delta: DVector<f64>,
    eps_n: f64,
    n_eff: f64,
}

impl FiniteSizeCost {
    fn hessian_at(&self, w: &DVector<f64>) -> DMatrix<f64> {
        let n = w.len();
        let zeta = 1.0 / (self.eps_n + w.norm_squared());
        symmetrize(
            &(self.s.transpose() * &self.s
                + (DMatrix::identity(n, n) * zeta - w * w.transpose() * (2.0 * zeta * zeta))
                    * self.n_eff),
        )
    }
}

impl CostModel for FiniteSizeCost {
    fn evaluate(
        &mut self,
        w: &DVector<f64>,
        grad: Option<&mut DVector<f64>>,
        hess: Option<&mut DMatrix<f64>>,
    ) -> Result<f64, DaError> {
        let residual = &self.delta - &self.s * w;
        let wsq = w.norm_squared();
        let zeta = 1.0 / (self.eps_n + wsq);
        if let Some(g) = grad {
            *g = w * (self.n_eff * zeta) - self.s.transpose() * &residual;
        }
        if let Some(h) = hess {
            *h = self.hessian_at(w);
        }
        Ok(0.5 * residual.norm_squared() + 0.5 * self.n_eff * (self.eps_n + wsq).ln())
    }
}

/// Primal finite-size EnKF: Newton (optionally line-searched) on the
/// finite-size cost with a fixed observation linearization.
fn enkf_n_primal(
    alg: &Algorithm,
    ens: &DMatrix<f64>,
    obs: &DVector<f64>,
    obs_cov: &ObsCovar,
    ctx: &TransformCtx,
    rng: &mut StdRng,
) -> Result<Analysis, DaError> {
    let n_ens = ens.ncols();
    let nf = n_ens as f64;
    let r_sqrt_inv = obs_cov.sqrt_inv()?;
    let (s, delta) = observed_statistics(ens, obs, &r_sqrt_inv, ctx)?;

    let mut model = FiniteSizeCost {
        s,
        delta,
        eps_n: 1.0 + 1.0 / nf,
        n_eff: nf + 1.0,
    };

    let mut w = DVector::zeros(n_ens);
    let mut grad = DVector::zeros(n_ens);
    let mut hess = DMatrix::zeros(n_ens, n_ens);
    let mut iterations = 0;
    for _ in 0..ctx.max_iter {
        iterations += 1;
        model.evaluate(&w, Some(&mut grad), Some(&mut hess))?;
        if grad.norm() < ctx.tol {
            break;
        }
        let chol = hess.clone().cholesky().ok_or(DaError::NumericalCholesky)?;
        let step_norm = if alg.line_search {
            let p = -chol.solve(&grad);
            let alpha = strong_wolfe(&mut model, &w, &p)?;
            let step = p * alpha;
            let norm = step.norm();
            w += step;
            norm
        } else {
            let dw = chol.solve(&grad);
            let norm = dw.norm();
            w -= dw;
            norm
        };
        if step_norm < ctx.tol {
            break;
        }
    }

    let t = sym_roots(&model.hessian_at(&w), RootsRequest::sqrt_inv())?
        .sqrt_inv
        .unwrap();
    let u = mean_preserving_orthogonal(n_ens, rng);
    Ok(Analysis {
        transform: Transform::Triple { t, w, u },
        iterations,
    })
}

/// Dual finite-size EnKF: the weight-space cost is reduced through the SVD
/// of the observed anomalies to a scalar dual in the effective prior
/// precision ζ, minimized by Brent over `[ζ_min, (N+1)/ε_N]`.
fn enkf_n_dual(
    ens: &DMatrix<f64>,
    obs: &DVector<f64>,
    obs_cov: &ObsCovar,
    ctx: &TransformCtx,
    rng: &mut StdRng,
) -> Result<Analysis, DaError> {
    let n_ens = ens.ncols();
    let nf = n_ens as f64;
    let eps_n = 1.0 + 1.0 / nf;
    let n_eff = nf + 1.0;

    let r_sqrt_inv = obs_cov.sqrt_inv()?;
    let (s, delta) = observed_statistics(ens, obs, &r_sqrt_inv, ctx)?;

    let svd = s
        .clone()
        .try_svd(true, true, f64::EPSILON, 250)
        .ok_or(DaError::NumericalSvd)?;
    let u_s = svd.u.ok_or(DaError::NumericalSvd)?;
    let v_t = svd.v_t.ok_or(DaError::NumericalSvd)?;
    let sigma = svd.singular_values;
    let rank = sigma.len();

    let u_delta = u_s.transpose() * &delta;
    let delta_sq = delta.norm_squared();
    let dual = |zeta: f64| {
        let mut cost = delta_sq;
        for i in 0..rank {
            let s2 = sigma[i] * sigma[i];
            cost -= s2 / (zeta + s2) * u_delta[i] * u_delta[i];
        }
        cost + eps_n * zeta + n_eff * (n_eff / zeta).ln() - n_eff
    };
    let zeta_star = brent_min(dual, DUAL_ZETA_MIN, n_eff / eps_n, DUAL_TOL, DUAL_MAX_ITER)?;

    let weights = DVector::from_fn(rank, |i, _| {
        let s2 = sigma[i] * sigma[i];
        sigma[i] / (zeta_star + s2) * u_delta[i]
    });
    let w = v_t.transpose() * weights;

    // T = ζ*^{-1/2} (I − V Vᵀ) + V diag((ζ* + σ²)^{-1/2}) Vᵀ, written as a
    // rank-correction of the scaled identity.
    let v = v_t.transpose();
    let corr = DMatrix::from_diagonal(&DVector::from_fn(rank, |i, _| {
        1.0 / (zeta_star + sigma[i] * sigma[i]).sqrt() - 1.0 / zeta_star.sqrt()
    }));
    let t = symmetrize(
        &(DMatrix::identity(n_ens, n_ens) / zeta_star.sqrt() + &v * corr * v.transpose()),
    );

    let u = mean_preserving_orthogonal(n_ens, rng);
    Ok(Analysis {
        transform: Transform::Triple { t, w, u },
        iterations: 1,
    })
}

/// One sequential IEnKS contribution: the gradient column and Hessian slab
/// of the observation at a single window position, in the conditioning of
/// the current outer iterate. The Gauss-Newton smoother driver sums these
/// across the window.
pub fn ienks_increment(
    ens: &DMatrix<f64>,
    obs: &DVector<f64>,
    obs_cov: &ObsCovar,
    t_inv: &DMatrix<f64>,
    obs_op: &ObsOperator,
    state_dim: usize,
) -> Result<(DVector<f64>, DMatrix<f64>), DaError> {
    let n_ens = ens.ncols();
    let ones = RowDVector::repeat(n_ens, 1.0);
    let y_ens = obs_op.observe(ens, obs.len(), state_dim)?;
    let y_mean = y_ens.column_mean();
    let s = (&y_ens - &y_mean * &ones) * t_inv;
    let st_r_inv = s.transpose() * obs_cov.inverse()?;
    let grad = &st_r_inv * (obs - &y_mean);
    let hess = st_r_inv * s;
    Ok((grad, hess))
}
