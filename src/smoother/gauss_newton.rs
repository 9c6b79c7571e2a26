use nalgebra::{DMatrix, DVector, RowDVector};
use rand::rngs::StdRng;

use super::{DawCtx, SmootherCycle};
use crate::analysis::sqrt::{sym_roots, symmetrize, RootsRequest};
use crate::analysis::transforms::ienks_increment;
use crate::analysis::{Algorithm, Conditioning, Family, ObsCovar};
use crate::dynamics::Dynamics;
use crate::ensemble::{
    anomalies, ensemble_mean, inflate_params, inflate_state, mean_preserving_orthogonal,
    param_random_walk,
};
use crate::errors::DaError;
use crate::propagators::propagate_ensemble;

/// The iterative ensemble Kalman smoother over the window, by Gauss-Newton
/// in the ensemble weight space.
///
/// Each outer iteration rebuilds the conditioned ensemble at the window
/// start from the current weights, propagates it across the window, and
/// sums the sequential gradient and Hessian contributions of the
/// assimilated observations. In SDA only the trailing `shift` observations
/// contribute (a spin cycle uses the whole window); with MDA the entire
/// two-stage optimization runs twice, stage 0 with the rebalancing weights
/// for the forecast/filter diagnostics and stage 1 with the MDA weights to
/// advance the posterior, the iteration count accumulating across stages.
pub fn ls_smoother_gauss_newton<D: Dynamics>(
    alg: &Algorithm,
    ens: DMatrix<f64>,
    obs: &DMatrix<f64>,
    obs_cov: &ObsCovar,
    infl: f64,
    ctx: &DawCtx<D>,
    rng: &mut StdRng,
) -> Result<SmootherCycle, DaError> {
    if alg.family != Family::Ienks {
        return Err(DaError::SchemeDriverMismatch(
            "ls_smoother_gauss_newton only runs ienks schemes".to_string(),
        ));
    }
    ctx.validate()?;
    obs_cov.validate()?;
    if obs.ncols() != ctx.lag {
        return Err(DaError::ObsWindowMismatch {
            expected: ctx.lag,
            found: obs.ncols(),
        });
    }

    if ctx.mda {
        let (reb, mda) = match (&ctx.reb_weights, &ctx.obs_weights) {
            (Some(reb), Some(mda)) => (reb, mda),
            _ => return Err(DaError::MdaWeights("missing weight vector".to_string())),
        };

        // Stage 0: rebalancing pass, diagnostics only.
        let (post_reb, iters_reb) = gauss_newton_stage(alg, &ens, obs, obs_cov, Some(reb), ctx, rng)?;
        let mut diag = window_propagation(post_reb, ctx, false, rng);
        // Stage 1: MDA pass, advances the posterior.
        let (mut post_mda, iters_mda) =
            gauss_newton_stage(alg, &ens, obs, obs_cov, Some(mda), ctx, rng)?;
        condition_posterior(&mut post_mda, infl, ctx, rng);
        let adv = window_propagation(post_mda, ctx, true, rng);

        diag.ens = adv.ens;
        diag.post = adv.post;
        diag.iterations = iters_reb + iters_mda;
        Ok(diag)
    } else {
        let (mut post, iterations) = gauss_newton_stage(alg, &ens, obs, obs_cov, None, ctx, rng)?;
        condition_posterior(&mut post, infl, ctx, rng);
        let mut out = window_propagation(post, ctx, true, rng);
        out.iterations = iterations;
        Ok(out)
    }
}

fn condition_posterior<D: Dynamics>(
    ens: &mut DMatrix<f64>,
    infl: f64,
    ctx: &DawCtx<D>,
    rng: &mut StdRng,
) {
    inflate_state(ens, infl, ctx.state_dim);
    if ens.nrows() > ctx.state_dim {
        inflate_params(ens, ctx.param_infl, ctx.state_dim);
        param_random_walk(ens, ctx.param_wlk, ctx.state_dim, rng);
    }
}

/// One full Gauss-Newton optimization over the window. Returns the
/// posterior ensemble at the window start and the iteration count.
fn gauss_newton_stage<D: Dynamics>(
    alg: &Algorithm,
    ens: &DMatrix<f64>,
    obs: &DMatrix<f64>,
    obs_cov: &ObsCovar,
    weights: Option<&DVector<f64>>,
    ctx: &DawCtx<D>,
    rng: &mut StdRng,
) -> Result<(DMatrix<f64>, usize), DaError> {
    let n_ens = ens.ncols();
    if n_ens < 2 {
        return Err(DaError::EnsembleTooSmall(n_ens));
    }
    let nf = n_ens as f64;
    let identity = DMatrix::identity(n_ens, n_ens);
    let ones = RowDVector::repeat(n_ens, 1.0);

    let mean0 = ensemble_mean(ens);
    let x0 = anomalies(ens);

    let (mut t, mut t_inv) = match alg.conditioning {
        Conditioning::Bundle => (&identity * ctx.epsilon, &identity / ctx.epsilon),
        Conditioning::Transform => (identity.clone(), identity.clone()),
    };

    let mut w = DVector::<f64>::zeros(n_ens);
    let mut hess = identity.clone();
    let mut iterations = 0;

    loop {
        // Rebuild the conditioned ensemble at the current iterate. The
        // first sweep of a spin cycle takes the incoming ensemble as-is,
        // which amounts to identity conditioning with full spread.
        let first_spin_sweep = ctx.spin && iterations == 0;
        let mut running = if first_spin_sweep {
            ens.clone()
        } else {
            (&mean0 + &x0 * &w) * &ones + &x0 * &t
        };
        let sweep_t_inv = if first_spin_sweep { &identity } else { &t_inv };

        let mut grad_sum = DVector::<f64>::zeros(n_ens);
        let mut hess_sum = DMatrix::<f64>::zeros(n_ens, n_ens);
        for l in 0..ctx.lag {
            propagate_ensemble(
                &mut running,
                ctx.dynamics,
                &ctx.opts,
                0.0,
                ctx.f_steps,
                ctx.state_dim,
                rng,
            );
            let contributes = weights.is_some() || ctx.spin || l >= ctx.lag - ctx.shift;
            if contributes {
                let cov_l = match weights {
                    Some(wl) => obs_cov.scaled(wl[l]),
                    None => obs_cov.clone(),
                };
                let (g_l, h_l) = ienks_increment(
                    &running,
                    &obs.column(l).into_owned(),
                    &cov_l,
                    sweep_t_inv,
                    &ctx.obs_op,
                    ctx.state_dim,
                )?;
                grad_sum += g_l;
                hess_sum += h_l;
            }
        }

        let (grad, ridge) = if alg.finite_size {
            let eps_n = 1.0 + 1.0 / nf;
            let n_eff = nf + 1.0;
            let zeta = 1.0 / (eps_n + w.norm_squared());
            (&w * (n_eff * zeta) - &grad_sum, nf)
        } else {
            (&w * (nf - 1.0) - &grad_sum, nf - 1.0)
        };
        hess = symmetrize(&(&identity * ridge + &hess_sum));
        iterations += 1;

        let dw = match alg.conditioning {
            Conditioning::Transform => {
                let roots = sym_roots(&hess, RootsRequest::all())?;
                t = roots.sqrt_inv.unwrap();
                t_inv = roots.sqrt.unwrap();
                roots.inverse.unwrap() * &grad
            }
            Conditioning::Bundle => hess
                .clone()
                .cholesky()
                .ok_or(DaError::NumericalCholesky)?
                .solve(&grad),
        };
        let step_norm = dw.norm();
        w -= dw;

        if step_norm < ctx.gn_tol || iterations >= ctx.gn_max_iter {
            break;
        }
    }

    // Exit transform: the adaptive-inflation Hessian for the finite-size
    // variant, the last Gauss-Newton Hessian otherwise.
    let t_final = if alg.finite_size {
        let eps_n = 1.0 + 1.0 / nf;
        let n_eff = nf + 1.0;
        let zeta = 1.0 / (eps_n + w.norm_squared());
        let h_star = symmetrize(
            &((&hess - &identity * nf)
                + (&identity * zeta - &w * w.transpose() * (2.0 * zeta * zeta)) * n_eff),
        );
        sym_roots(&h_star, RootsRequest::sqrt_inv())?.sqrt_inv.unwrap()
    } else {
        sym_roots(&hess, RootsRequest::sqrt_inv())?.sqrt_inv.unwrap()
    };

    let u = mean_preserving_orthogonal(n_ens, rng);
    let posterior =
        (&mean0 + &x0 * &w) * &ones + &x0 * t_final * u * ((n_ens - 1) as f64).sqrt();
    Ok((posterior, iterations))
}

/// Propagates the window-start posterior across the window plus one shift,
/// recording slices by position: the posterior over the leading shift (the
/// states leaving the window), the filtered estimates at the newly
/// observed times, and the forecasts at the next cycle's observation
/// times. A spin cycle records filtered estimates over the whole window
/// and forecasts from the first position on, so every observation time of
/// the experiment is covered exactly once.
fn window_propagation<D: Dynamics>(
    posterior: DMatrix<f64>,
    ctx: &DawCtx<D>,
    advance: bool,
    rng: &mut StdRng,
) -> SmootherCycle {
    let mut running = posterior;
    let mut post = Vec::new();
    let mut fore = Vec::new();
    let mut filt = Vec::new();
    let mut ens = running.clone();

    for l in 1..=ctx.lag + ctx.shift {
        propagate_ensemble(
            &mut running,
            ctx.dynamics,
            &ctx.opts,
            0.0,
            ctx.f_steps,
            ctx.state_dim,
            rng,
        );
        if advance && l <= ctx.shift {
            post.push(running.clone());
            if l == ctx.shift {
                ens = running.clone();
            }
        }
        if ctx.spin {
            if l <= ctx.lag {
                filt.push(running.clone());
            }
            fore.push(running.clone());
        } else {
            if l > ctx.lag - ctx.shift && l <= ctx.lag {
                filt.push(running.clone());
            }
            if l > ctx.lag {
                fore.push(running.clone());
            }
        }
    }

    SmootherCycle {
        ens,
        post,
        fore,
        filt,
        iterations: 0,
    }
}
