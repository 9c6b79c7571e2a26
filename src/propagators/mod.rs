use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::dynamics::Dynamics;

/// The fixed-step integration kernels available to the drivers.
///
/// `Rk4` is the deterministic workhorse; `EulerMaruyama` handles additive
/// stochastic forcing when `diffusion > 0`, scaling its Wiener increments
/// by `√h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stepper {
    Rk4,
    EulerMaruyama,
}

/// Fixed-step propagation options shared by every driver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PropOpts {
    pub stepper: Stepper,
    /// Integration step size.
    pub h: f64,
    /// Additive noise amplitude; only consumed by `EulerMaruyama`.
    pub diffusion: f64,
}

impl PropOpts {
    pub fn with_fixed_step(h: f64) -> Self {
        Self {
            stepper: Stepper::Rk4,
            h,
            diffusion: 0.0,
        }
    }

    pub fn with_diffusion(h: f64, diffusion: f64) -> Self {
        Self {
            stepper: Stepper::EulerMaruyama,
            h,
            diffusion,
        }
    }
}

/// Advances one state column by a single step.
pub fn step<D: Dynamics>(
    dynamics: &D,
    opts: &PropOpts,
    t: f64,
    x: &mut DVector<f64>,
    params: &[f64],
    rng: &mut StdRng,
) {
    let h = opts.h;
    match opts.stepper {
        Stepper::Rk4 => {
            let k1 = dynamics.eom(t, x, params);
            let k2 = dynamics.eom(t + 0.5 * h, &(&*x + &k1 * (0.5 * h)), params);
            let k3 = dynamics.eom(t + 0.5 * h, &(&*x + &k2 * (0.5 * h)), params);
            let k4 = dynamics.eom(t + h, &(&*x + &k3 * h), params);
            *x += (k1 + k2 * 2.0 + k3 * 2.0 + k4) * (h / 6.0);
        }
        Stepper::EulerMaruyama => {
            let k = dynamics.eom(t, x, params);
            let dim = x.len();
            let xi = DVector::from_fn(dim, |_, _| rng.sample::<f64, _>(StandardNormal));
            *x += k * h + xi * (opts.diffusion * h.sqrt());
        }
    }
}

/// Advances one state column by `f_steps` steps.
pub fn propagate_state<D: Dynamics>(
    dynamics: &D,
    opts: &PropOpts,
    mut t: f64,
    x: &mut DVector<f64>,
    params: &[f64],
    f_steps: usize,
    rng: &mut StdRng,
) {
    for _ in 0..f_steps {
        step(dynamics, opts, t, x, params, rng);
        t += opts.h;
    }
}

/// Advances every ensemble member by `f_steps` steps, merging the trailing
/// parameter rows of each column into the model parameters when present.
/// Members are stepped in column order so a seeded run is reproducible.
pub fn propagate_ensemble<D: Dynamics>(
    ens: &mut DMatrix<f64>,
    dynamics: &D,
    opts: &PropOpts,
    t: f64,
    f_steps: usize,
    state_dim: usize,
    rng: &mut StdRng,
) {
    let (sys_dim, n_ens) = ens.shape();
    let param_dim = sys_dim - state_dim;
    for j in 0..n_ens {
        let mut x = ens.column(j).rows(0, state_dim).into_owned();
        let params: Vec<f64> = (0..param_dim)
            .map(|k| ens[(state_dim + k, j)])
            .collect();
        propagate_state(dynamics, opts, t, &mut x, &params, f_steps, rng);
        for i in 0..state_dim {
            ens[(i, j)] = x[i];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamics::lorenz96::Lorenz96;

    use rand::SeedableRng;

    #[test]
    fn rk4_conserves_the_lorenz96_equilibrium() {
        let model = Lorenz96::standard();
        let opts = PropOpts::with_fixed_step(0.01);
        let mut rng = StdRng::seed_from_u64(0);
        let mut x = DVector::from_element(40, 8.0);
        propagate_state(&model, &opts, 0.0, &mut x, &[], 100, &mut rng);
        for i in 0..40 {
            assert!((x[i] - 8.0).abs() < 1e-9);
        }
    }
}
