use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;

use super::{reject_iterative, DawCtx};
use crate::analysis::{transform, Algorithm, ObsCovar};
use crate::dynamics::Dynamics;
use crate::ensemble::{ensemble_update, inflate_params, inflate_state, param_random_walk};
use crate::errors::DaError;
use crate::propagators::propagate_ensemble;

/// The product of one filter cycle: the forecast ensemble (before the
/// analysis touched it) and the analysis iteration count. The analyzed
/// ensemble is the mutated input.
#[derive(Debug, Clone)]
pub struct FilterCycle {
    pub fore: DMatrix<f64>,
    pub iterations: usize,
}

/// One sequential filter cycle: propagate to the observation time, analyze,
/// update in place, inflate, and perturb the parameter sub-ensemble when
/// parameter estimation is active.
pub fn ensemble_filter_cycle<D: Dynamics>(
    alg: &Algorithm,
    ens: &mut DMatrix<f64>,
    obs: &DVector<f64>,
    obs_cov: &ObsCovar,
    infl: f64,
    ctx: &DawCtx<D>,
    rng: &mut StdRng,
) -> Result<FilterCycle, DaError> {
    reject_iterative(alg, "ensemble_filter_cycle")?;

    propagate_ensemble(
        ens,
        ctx.dynamics,
        &ctx.opts,
        0.0,
        ctx.f_steps,
        ctx.state_dim,
        rng,
    );
    let fore = ens.clone();

    let analysis = transform(alg, ens, obs, obs_cov, &ctx.transform_ctx(), rng)?;
    ensemble_update(ens, &analysis.transform);
    inflate_state(ens, infl, ctx.state_dim);
    if ens.nrows() > ctx.state_dim {
        inflate_params(ens, ctx.param_infl, ctx.state_dim);
        param_random_walk(ens, ctx.param_wlk, ctx.state_dim, rng);
    }

    Ok(FilterCycle {
        fore,
        iterations: analysis.iterations,
    })
}
