use nalgebra::{DMatrix, DVector};

use crate::analysis::{Algorithm, Family, Transform, TransformCtx};
use crate::dynamics::Dynamics;
use crate::ensemble::ensemble_update;
use crate::errors::DaError;
use crate::obs::ObsOperator;
use crate::propagators::PropOpts;

/// The classical lag-shift smoother.
pub mod classic;

/// The sequential ensemble filter cycle.
pub mod filter;

/// The iterative (Gauss-Newton) ensemble Kalman smoother.
pub mod gauss_newton;

/// The single-iteration lag-shift smoother.
pub mod single_iteration;

pub use self::classic::ls_smoother_classic;
pub use self::filter::{ensemble_filter_cycle, FilterCycle};
pub use self::gauss_newton::ls_smoother_gauss_newton;
pub use self::single_iteration::ls_smoother_single_iteration;

/// Configuration of a data-assimilation-window driver.
///
/// This is the typed replacement of the dynamically typed keyword bag of
/// older benchmark codes: every recognized option is a field, and
/// model-specific settings live inside the model handle itself.
pub struct DawCtx<'a, D: Dynamics> {
    pub dynamics: &'a D,
    pub opts: PropOpts,
    /// Integrator sub-steps between consecutive observation times.
    pub f_steps: usize,
    pub obs_op: ObsOperator,
    /// Leading rows of the ensemble holding dynamical state; trailing rows
    /// hold parameter samples.
    pub state_dim: usize,
    /// Observation times covered by the window.
    pub lag: usize,
    /// Observation times the window advances per cycle.
    pub shift: usize,
    /// Warm-up mode: the whole window is treated as newly observed.
    pub spin: bool,
    /// Multiple data assimilation.
    pub mda: bool,
    /// Stage-0 rebalancing weights, length `lag`; required when `mda`.
    pub reb_weights: Option<DVector<f64>>,
    /// Stage-1 MDA weights, length `lag`; required when `mda`.
    pub obs_weights: Option<DVector<f64>>,
    /// Multiplicative inflation of the parameter anomalies.
    pub param_infl: f64,
    /// Amplitude of the parameter random walk.
    pub param_wlk: f64,
    /// Inner-kernel Newton tolerance.
    pub tol: f64,
    /// Inner-kernel Newton iteration cap.
    pub max_iter: usize,
    /// Bundle conditioning scale ε.
    pub epsilon: f64,
    /// Gauss-Newton outer tolerance on `‖Δw‖`.
    pub gn_tol: f64,
    /// Gauss-Newton outer iteration cap.
    pub gn_max_iter: usize,
}

impl<'a, D: Dynamics> DawCtx<'a, D> {
    pub fn new(dynamics: &'a D, opts: PropOpts, f_steps: usize, obs_op: ObsOperator) -> Self {
        Self {
            dynamics,
            opts,
            f_steps,
            obs_op,
            state_dim: dynamics.state_dim(),
            lag: 1,
            shift: 1,
            spin: false,
            mda: false,
            reb_weights: None,
            obs_weights: None,
            param_infl: 1.0,
            param_wlk: 0.0,
            tol: 1e-4,
            max_iter: 40,
            epsilon: 1e-4,
            gn_tol: 1e-3,
            gn_max_iter: 5,
        }
    }

    pub fn transform_ctx(&self) -> TransformCtx {
        TransformCtx {
            obs_op: self.obs_op,
            state_dim: self.state_dim,
            tol: self.tol,
            max_iter: self.max_iter,
            epsilon: self.epsilon,
        }
    }

    /// Checks the window geometry and, with MDA, the weight vectors.
    pub fn validate(&self) -> Result<(), DaError> {
        if self.shift == 0 || self.shift > self.lag {
            return Err(DaError::LagShiftIncompatible {
                lag: self.lag,
                shift: self.shift,
            });
        }
        if self.mda {
            if self.lag % self.shift != 0 {
                return Err(DaError::LagShiftIncompatible {
                    lag: self.lag,
                    shift: self.shift,
                });
            }
            for (name, weights) in &[
                ("reb_weights", &self.reb_weights),
                ("obs_weights", &self.obs_weights),
            ] {
                match weights {
                    None => {
                        return Err(DaError::MdaWeights(format!("{} missing", name)));
                    }
                    Some(w) => {
                        if w.len() != self.lag {
                            return Err(DaError::MdaWeights(format!(
                                "{} has length {}, expected lag {}",
                                name,
                                w.len(),
                                self.lag
                            )));
                        }
                        if w.iter().any(|&v| v <= 0.0) {
                            return Err(DaError::MdaWeights(format!(
                                "{} has a non-positive entry",
                                name
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// The default single-data-assimilation weights: every observation carries
/// its full information, so the reciprocals sum to the lag.
pub fn sda_weights(lag: usize) -> DVector<f64> {
    DVector::from_element(lag, 1.0)
}

/// Uniform MDA weights and their stage-0 rebalancing companions.
///
/// Each observation is assimilated `q = lag/shift` times at weight `q`, so
/// its tempered information sums to one over its life in the window. The
/// rebalancing weight of window stage `s` is `q/s`: stage 0 then applies
/// exactly the information the MDA passes have not yet assimilated, which
/// is what makes its filter diagnostics comparable to an SDA run.
pub fn uniform_mda_weights(lag: usize, shift: usize) -> (DVector<f64>, DVector<f64>) {
    let q = (lag / shift) as f64;
    let obs_weights = DVector::from_element(lag, q);
    let reb_weights = DVector::from_fn(lag, |l, _| {
        let stage = (l / shift + 1) as f64;
        q / stage
    });
    (reb_weights, obs_weights)
}

/// A fixed-size ring of posterior ensembles over the smoother window,
/// oldest slice first. The classical smoother re-analyzes slices in place
/// and rotates the ring as the window advances.
#[derive(Debug, Clone)]
pub struct Daw {
    slices: Vec<DMatrix<f64>>,
    head: usize,
}

impl Daw {
    /// Allocates the ring with every slice set to the initial ensemble.
    pub fn new(len: usize, init: &DMatrix<f64>) -> Self {
        Self {
            slices: vec![init.clone(); len],
            head: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    fn index(&self, i: usize) -> usize {
        (self.head + i) % self.slices.len()
    }

    /// Slice `i` with 0 the oldest and `len() - 1` the newest.
    pub fn get(&self, i: usize) -> &DMatrix<f64> {
        &self.slices[self.index(i)]
    }

    /// Evicts the oldest slice and appends `m` as the newest.
    pub fn push(&mut self, m: DMatrix<f64>) {
        let h = self.head;
        self.slices[h] = m;
        self.head = (h + 1) % self.slices.len();
    }

    /// Re-analyzes slice `i` with a new transform.
    pub fn apply(&mut self, i: usize, transform: &Transform) {
        let idx = self.index(i);
        ensemble_update(&mut self.slices[idx], transform);
    }

    /// The slices in time order, oldest first.
    pub fn to_vec(&self) -> Vec<DMatrix<f64>> {
        (0..self.len()).map(|i| self.get(i).clone()).collect()
    }
}

/// The product of one smoother cycle: the ensemble advanced to the new
/// cycle time, the posterior, forecast and filtered slices recorded over
/// the window, and the accumulated inner iteration count.
#[derive(Debug, Clone)]
pub struct SmootherCycle {
    pub ens: DMatrix<f64>,
    pub post: Vec<DMatrix<f64>>,
    pub fore: Vec<DMatrix<f64>>,
    pub filt: Vec<DMatrix<f64>>,
    pub iterations: usize,
}

/// Rejects schemes a sequential-transform driver cannot run.
pub(crate) fn reject_iterative(alg: &Algorithm, driver: &str) -> Result<(), DaError> {
    if alg.family == Family::Ienks {
        Err(DaError::SchemeDriverMismatch(format!(
            "ienks schemes require ls_smoother_gauss_newton, not {}",
            driver
        )))
    } else {
        Ok(())
    }
}
