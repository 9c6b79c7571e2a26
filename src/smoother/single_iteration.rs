use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;

use super::{reject_iterative, DawCtx, SmootherCycle};
use crate::analysis::{transform, Algorithm, ObsCovar, TransformCtx};
use crate::dynamics::Dynamics;
use crate::ensemble::{ensemble_update, inflate_params, inflate_state, param_random_walk};
use crate::errors::DaError;
use crate::propagators::propagate_ensemble;

/// The single-iteration lag-shift smoother.
///
/// One cycle makes a single filtering pass over the window: the running
/// ensemble is propagated and sequentially analyzed, and every transform is
/// simultaneously applied to a copy of the window-start ensemble, which
/// thereby becomes the smoothed initial condition. In SDA only the trailing
/// `shift` observations (the ones newly entering the window) are
/// assimilated; a spin cycle assimilates the whole window. With MDA the
/// pass runs twice, first with the rebalancing weights (producing the
/// forecast/filter diagnostics) and then with the MDA weights (producing
/// the smoothed initial condition).
pub fn ls_smoother_single_iteration<D: Dynamics>(
    alg: &Algorithm,
    ens: DMatrix<f64>,
    obs: &DMatrix<f64>,
    obs_cov: &ObsCovar,
    infl: f64,
    ctx: &DawCtx<D>,
    rng: &mut StdRng,
) -> Result<SmootherCycle, DaError> {
    reject_iterative(alg, "ls_smoother_single_iteration")?;
    ctx.validate()?;
    obs_cov.validate()?;
    if obs.ncols() != ctx.lag {
        return Err(DaError::ObsWindowMismatch {
            expected: ctx.lag,
            found: obs.ncols(),
        });
    }

    let tctx = ctx.transform_ctx();
    let mut fore = Vec::new();
    let mut filt = Vec::new();
    let mut iterations = 0;

    let smoothed_start = if ctx.mda {
        let (reb, mda) = match (&ctx.reb_weights, &ctx.obs_weights) {
            (Some(reb), Some(mda)) => (reb, mda),
            _ => return Err(DaError::MdaWeights("missing weight vector".to_string())),
        };
        let (_, iters_reb) = sequential_pass(
            alg,
            &ens,
            obs,
            obs_cov,
            Some(reb),
            ctx,
            &tctx,
            Some((&mut fore, &mut filt)),
            rng,
        )?;
        let (e0, iters_mda) =
            sequential_pass(alg, &ens, obs, obs_cov, Some(mda), ctx, &tctx, None, rng)?;
        iterations += iters_reb + iters_mda;
        e0
    } else {
        let (e0, iters) = sequential_pass(
            alg,
            &ens,
            obs,
            obs_cov,
            None,
            ctx,
            &tctx,
            Some((&mut fore, &mut filt)),
            rng,
        )?;
        iterations += iters;
        e0
    };

    // Reset to the re-analyzed window start, condition it, and walk it
    // forward into the new cycle, recording the posterior along the shift.
    let mut ens = smoothed_start;
    inflate_state(&mut ens, infl, ctx.state_dim);
    if ens.nrows() > ctx.state_dim {
        inflate_params(&mut ens, ctx.param_infl, ctx.state_dim);
        param_random_walk(&mut ens, ctx.param_wlk, ctx.state_dim, rng);
    }
    let mut post = Vec::with_capacity(ctx.shift);
    for _ in 0..ctx.shift {
        propagate_ensemble(
            &mut ens,
            ctx.dynamics,
            &ctx.opts,
            0.0,
            ctx.f_steps,
            ctx.state_dim,
            rng,
        );
        post.push(ens.clone());
    }

    Ok(SmootherCycle {
        ens,
        post,
        fore,
        filt,
        iterations,
    })
}

/// One filtering pass across the window. Returns the re-analyzed copy of
/// the window-start ensemble and the accumulated iteration count. MDA
/// passes (`weights` set) assimilate every observation with its scaled
/// covariance; SDA passes assimilate only the new ones unless spinning.
#[allow(clippy::too_many_arguments)]
fn sequential_pass<D: Dynamics>(
    alg: &Algorithm,
    start: &DMatrix<f64>,
    obs: &DMatrix<f64>,
    obs_cov: &ObsCovar,
    weights: Option<&DVector<f64>>,
    ctx: &DawCtx<D>,
    tctx: &TransformCtx,
    mut record: Option<(&mut Vec<DMatrix<f64>>, &mut Vec<DMatrix<f64>>)>,
    rng: &mut StdRng,
) -> Result<(DMatrix<f64>, usize), DaError> {
    let mut running = start.clone();
    let mut window_start = start.clone();
    let mut iterations = 0;

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
        let newly_observed = ctx.spin || l >= ctx.lag - ctx.shift;
        if let Some((fore, _)) = record.as_mut() {
            if newly_observed {
                fore.push(running.clone());
            }
        }

        if weights.is_some() || newly_observed {
            let cov_l = match weights {
                Some(w) => obs_cov.scaled(w[l]),
                None => obs_cov.clone(),
            };
            let analysis = transform(
                alg,
                &running,
                &obs.column(l).into_owned(),
                &cov_l,
                tctx,
                rng,
            )?;
            iterations += analysis.iterations;
            ensemble_update(&mut running, &analysis.transform);
            ensemble_update(&mut window_start, &analysis.transform);
        }

        if let Some((_, filt)) = record.as_mut() {
            if newly_observed {
                filt.push(running.clone());
            }
        }
    }

    Ok((window_start, iterations))
}
