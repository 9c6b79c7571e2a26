use nalgebra::DMatrix;
use rand::rngs::StdRng;

use super::{reject_iterative, Daw, DawCtx, SmootherCycle};
use crate::analysis::{transform, Algorithm, ObsCovar};
use crate::dynamics::Dynamics;
use crate::ensemble::{ensemble_update, inflate_params, inflate_state, param_random_walk};
use crate::errors::DaError;
use crate::propagators::propagate_ensemble;

/// The classical lag-shift ensemble Kalman smoother.
///
/// Each cycle consumes the `shift` newly observed times. Every new
/// observation is analyzed exactly as in the sequential filter, and its
/// transform is then applied retroactively to the posterior slices still
/// inside the new observation's window, re-analyzing the stored past. The
/// posterior ring spans `lag + shift` slices so a state keeps receiving
/// transforms until every window containing it has closed.
pub fn ls_smoother_classic<D: Dynamics>(
    alg: &Algorithm,
    mut ens: DMatrix<f64>,
    obs: &DMatrix<f64>,
    obs_cov: &ObsCovar,
    infl: f64,
    ctx: &DawCtx<D>,
    posterior: &mut Daw,
    rng: &mut StdRng,
) -> Result<SmootherCycle, DaError> {
    reject_iterative(alg, "ls_smoother_classic")?;
    ctx.validate()?;
    obs_cov.validate()?;
    if obs.ncols() != ctx.shift {
        return Err(DaError::ObsWindowMismatch {
            expected: ctx.shift,
            found: obs.ncols(),
        });
    }
    if posterior.len() != ctx.lag + ctx.shift {
        return Err(DaError::PosteriorLength {
            expected: ctx.lag + ctx.shift,
            found: posterior.len(),
        });
    }

    let tctx = ctx.transform_ctx();
    let has_params = ens.nrows() > ctx.state_dim;
    let mut fore = Vec::with_capacity(ctx.shift);
    let mut filt = Vec::with_capacity(ctx.shift);
    let mut iterations = 0;

    for l in 0..ctx.shift {
        propagate_ensemble(
            &mut ens,
            ctx.dynamics,
            &ctx.opts,
            0.0,
            ctx.f_steps,
            ctx.state_dim,
            rng,
        );
        fore.push(ens.clone());

        let analysis = transform(alg, &ens, &obs.column(l).into_owned(), obs_cov, &tctx, rng)?;
        iterations += analysis.iterations;
        ensemble_update(&mut ens, &analysis.transform);
        inflate_state(&mut ens, infl, ctx.state_dim);
        if has_params {
            inflate_params(&mut ens, ctx.param_infl, ctx.state_dim);
            param_random_walk(&mut ens, ctx.param_wlk, ctx.state_dim, rng);
        }
        filt.push(ens.clone());
        posterior.push(ens.clone());

        // Re-analyze the stored slices still inside this observation's
        // window: ages 1..lag-1 behind the newest slice. Older slices have
        // left every window containing the current time and stay frozen.
        let newest = posterior.len() - 1;
        for age in 1..ctx.lag {
            posterior.apply(newest - age, &analysis.transform);
        }
    }

    let post = posterior.to_vec();
    Ok(SmootherCycle {
        ens,
        post,
        fore,
        filt,
        iterations,
    })
}
