use std::path::Path;
use std::str::FromStr;

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;
use serde_derive::{Deserialize, Serialize};

use crate::analysis::{Algorithm, Family, ObsCovar};
use crate::dynamics::lorenz96::Lorenz96;
use crate::ensemble::{rmse_spread, sample_gaussian_ensemble};
use crate::errors::DaError;
use crate::obs::ObsOperator;
use crate::propagators::{propagate_state, PropOpts, Stepper};
use crate::smoother::{
    ensemble_filter_cycle, ls_smoother_classic, ls_smoother_gauss_newton,
    ls_smoother_single_iteration, uniform_mda_weights, Daw, DawCtx,
};

/// Persisted artifact writing.
pub mod artifact;

pub use self::artifact::{artifact_name, write_series, write_summary_index};

/// Number of integrator steps used to spin the truth twin onto the
/// attractor before the experiment starts.
const TRUTH_SPIN_STEPS: usize = 5_000;
/// Standard deviation of the initial ensemble perturbations.
const INIT_SPREAD: f64 = 1.0;

/// One benchmark configuration: a method, a twin-experiment geometry and
/// the noise, inflation and window knobs. Unset fields take the canonical
/// Lorenz-96 benchmark values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Analysis label, e.g. `etkf`, `enks-n-dual`, `mlef-transform-ls`,
    /// `ienks-bundle`.
    pub method: String,
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_state_dim")]
    pub state_dim: usize,
    #[serde(default = "default_state_dim")]
    pub obs_dim: usize,
    #[serde(default = "default_unit")]
    pub obs_sd: f64,
    #[serde(default = "default_unit")]
    pub gamma: f64,
    pub n_ens: usize,
    #[serde(default = "default_unit")]
    pub infl: f64,
    #[serde(default = "default_h")]
    pub h: f64,
    /// Time between analyses; `f_steps = round(tanl / h)`.
    #[serde(default = "default_tanl")]
    pub tanl: f64,
    #[serde(default)]
    pub diffusion: f64,
    #[serde(default = "default_forcing")]
    pub forcing: f64,
    #[serde(default = "default_cycles")]
    pub cycles: usize,
    /// Leading analysis times excluded from the summary statistics.
    #[serde(default)]
    pub burn: usize,
    /// Smoother window length; 0 runs the sequential filter.
    #[serde(default)]
    pub lag: usize,
    #[serde(default = "default_shift")]
    pub shift: usize,
    #[serde(default)]
    pub mda: bool,
    /// Lag-shift driver for the non-iterative schemes: `classic` (default)
    /// or `single-iteration`.
    #[serde(default)]
    pub smoother: Option<String>,
    #[serde(default)]
    pub param_est: bool,
    /// Relative error of the initial parameter guess.
    #[serde(default)]
    pub param_err: f64,
    /// Parameter random walk amplitude.
    #[serde(default)]
    pub param_wlk: f64,
    #[serde(default = "default_unit")]
    pub param_infl: f64,
}

fn default_state_dim() -> usize {
    40
}
fn default_unit() -> f64 {
    1.0
}
fn default_h() -> f64 {
    0.01
}
fn default_tanl() -> f64 {
    0.05
}
fn default_forcing() -> f64 {
    8.0
}
fn default_cycles() -> usize {
    100
}
fn default_shift() -> usize {
    1
}

/// The driver a configuration resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    Filter,
    Classic,
    SingleIteration,
    GaussNewton,
}

impl ExperimentConfig {
    pub fn algorithm(&self) -> Result<Algorithm, DaError> {
        Algorithm::from_str(&self.method)
    }

    pub fn f_steps(&self) -> usize {
        (self.tanl / self.h).round().max(1.0) as usize
    }

    pub fn driver(&self) -> Result<DriverKind, DaError> {
        let alg = self.algorithm()?;
        if alg.family == Family::Ienks {
            if self.lag == 0 {
                return Err(DaError::LagShiftIncompatible {
                    lag: self.lag,
                    shift: self.shift,
                });
            }
            return Ok(DriverKind::GaussNewton);
        }
        if self.lag == 0 {
            return Ok(DriverKind::Filter);
        }
        match self.smoother.as_deref() {
            None | Some("classic") => Ok(DriverKind::Classic),
            Some("single-iteration") => Ok(DriverKind::SingleIteration),
            Some(other) => Err(DaError::UnknownAnalysis(format!(
                "unknown smoother driver `{}`",
                other
            ))),
        }
    }

    /// The RNG seed of this configuration: the base seed mixed with every
    /// identifying parameter (FNV-1a), so sweep neighbors draw independent
    /// but reproducible streams.
    pub fn derived_seed(&self) -> u64 {
        const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0100_0000_01b3;
        let mut state = OFFSET;
        let mut mix = |bytes: &[u8]| {
            for b in bytes {
                state ^= u64::from(*b);
                state = state.wrapping_mul(PRIME);
            }
        };
        mix(&self.seed.to_le_bytes());
        mix(self.method.as_bytes());
        mix(&self.gamma.to_bits().to_le_bytes());
        mix(&(self.n_ens as u64).to_le_bytes());
        mix(&(self.obs_dim as u64).to_le_bytes());
        mix(&self.infl.to_bits().to_le_bytes());
        mix(&self.tanl.to_bits().to_le_bytes());
        mix(&self.diffusion.to_bits().to_le_bytes());
        mix(&(self.lag as u64).to_le_bytes());
        mix(&(self.shift as u64).to_le_bytes());
        mix(&[self.mda as u8, self.param_est as u8]);
        state
    }

    fn prop_opts(&self) -> PropOpts {
        if self.diffusion > 0.0 {
            PropOpts {
                stepper: Stepper::EulerMaruyama,
                h: self.h,
                diffusion: self.diffusion,
            }
        } else {
            PropOpts::with_fixed_step(self.h)
        }
    }
}

/// The truth twin of an experiment: the reference trajectory at every
/// analysis time and the noisy observations drawn from it.
#[derive(Debug, Clone)]
pub struct TruthTwin {
    /// State at the experiment start, before the first analysis time.
    pub init: DVector<f64>,
    /// State at each analysis time.
    pub states: Vec<DVector<f64>>,
    /// Observation column per analysis time.
    pub obs: DMatrix<f64>,
}

/// Spins a trajectory onto the attractor and generates the truth twin.
pub fn generate_truth(
    cfg: &ExperimentConfig,
    model: &Lorenz96,
    rng: &mut StdRng,
) -> Result<TruthTwin, DaError> {
    let opts = cfg.prop_opts();
    let obs_op = ObsOperator::with_gamma(cfg.gamma);
    let obs_cov = ObsCovar::from_sd(cfg.obs_dim, cfg.obs_sd);
    let f_steps = cfg.f_steps();

    let mut x = DVector::from_fn(cfg.state_dim, |_, _| {
        cfg.forcing + rng.sample::<f64, _>(StandardNormal)
    });
    propagate_state(model, &opts, 0.0, &mut x, &[], TRUTH_SPIN_STEPS, rng);
    let init = x.clone();

    let mut states = Vec::with_capacity(cfg.cycles);
    let mut obs = DMatrix::zeros(cfg.obs_dim, cfg.cycles);
    for k in 0..cfg.cycles {
        propagate_state(model, &opts, 0.0, &mut x, &[], f_steps, rng);
        states.push(x.clone());
        let y = obs_op.observe_state(&x, cfg.obs_dim, cfg.state_dim)? + obs_cov.sample(rng)?;
        obs.set_column(k, &y);
    }
    Ok(TruthTwin { init, states, obs })
}

/// Per-analysis-time diagnostics of a run. Fields a driver does not
/// produce at a given time stay empty.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleRecord {
    pub cycle: usize,
    pub fore_rmse: Option<f64>,
    pub fore_spread: Option<f64>,
    pub filt_rmse: Option<f64>,
    pub filt_spread: Option<f64>,
    pub post_rmse: Option<f64>,
    pub post_spread: Option<f64>,
    pub param_rmse: Option<f64>,
    pub param_spread: Option<f64>,
    pub iterations: Option<usize>,
}

/// The summary row of a configuration: means of the per-cycle diagnostics
/// past the burn-in, plus the full configuration echo.
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentSummary {
    pub method: String,
    pub seed: u64,
    pub state_dim: usize,
    pub obs_dim: usize,
    pub obs_sd: f64,
    pub gamma: f64,
    pub n_ens: usize,
    pub infl: f64,
    pub h: f64,
    pub tanl: f64,
    pub diffusion: f64,
    pub lag: usize,
    pub shift: usize,
    pub mda: bool,
    pub param_est: bool,
    pub fore_rmse: Option<f64>,
    pub fore_spread: Option<f64>,
    pub filt_rmse: Option<f64>,
    pub filt_spread: Option<f64>,
    pub post_rmse: Option<f64>,
    pub post_spread: Option<f64>,
    pub param_rmse: Option<f64>,
    pub param_spread: Option<f64>,
    pub mean_iterations: Option<f64>,
}

/// A finished experiment: its summary and the per-cycle series.
#[derive(Debug, Clone)]
pub struct ExperimentOutput {
    pub summary: ExperimentSummary,
    pub series: Vec<CycleRecord>,
}

/// Runs one twin experiment to completion.
pub fn run_experiment(cfg: &ExperimentConfig) -> Result<ExperimentOutput, DaError> {
    validate_config(cfg)?;
    let alg = cfg.algorithm()?;
    let driver = cfg.driver()?;

    let model = Lorenz96::new(cfg.state_dim, cfg.forcing);
    let mut rng = StdRng::seed_from_u64(cfg.derived_seed());
    let truth = generate_truth(cfg, &model, &mut rng)?;

    let mut ens = initial_ensemble(cfg, &truth, &mut rng);
    let obs_cov = ObsCovar::from_sd(cfg.obs_dim, cfg.obs_sd);
    let mut ctx = DawCtx::new(
        &model,
        cfg.prop_opts(),
        cfg.f_steps(),
        ObsOperator::with_gamma(cfg.gamma),
    );
    ctx.state_dim = cfg.state_dim;
    ctx.lag = cfg.lag.max(1);
    ctx.shift = cfg.shift;
    ctx.mda = cfg.mda;
    ctx.param_infl = cfg.param_infl;
    ctx.param_wlk = cfg.param_wlk;
    if cfg.mda {
        let (reb, mda) = uniform_mda_weights(cfg.lag, cfg.shift);
        ctx.reb_weights = Some(reb);
        ctx.obs_weights = Some(mda);
    }

    let mut series: Vec<CycleRecord> = (0..cfg.cycles)
        .map(|k| CycleRecord {
            cycle: k,
            ..Default::default()
        })
        .collect();

    match driver {
        DriverKind::Filter => {
            for k in 0..cfg.cycles {
                let y = truth.obs.column(k).into_owned();
                let cycle =
                    ensemble_filter_cycle(&alg, &mut ens, &y, &obs_cov, cfg.infl, &ctx, &mut rng)?;
                score_fore(&mut series[k], &cycle.fore, &truth.states[k], cfg);
                score_filt(&mut series[k], &ens, &truth.states[k], cfg);
                score_params(&mut series[k], &ens, cfg);
                series[k].iterations = Some(cycle.iterations);
            }
        }
        DriverKind::Classic => {
            let mut posterior = Daw::new(cfg.lag + cfg.shift, &ens);
            let mut k = 0;
            while k + cfg.shift <= cfg.cycles {
                let window = truth.obs.columns(k, cfg.shift).into_owned();
                let out = ls_smoother_classic(
                    &alg,
                    ens,
                    &window,
                    &obs_cov,
                    cfg.infl,
                    &ctx,
                    &mut posterior,
                    &mut rng,
                )?;
                ens = out.ens;
                for i in 0..cfg.shift {
                    let t = k + i;
                    score_fore(&mut series[t], &out.fore[i], &truth.states[t], cfg);
                    score_filt(&mut series[t], &out.filt[i], &truth.states[t], cfg);
                    series[t].iterations = Some(out.iterations);
                }
                score_params_last(&mut series, k + cfg.shift - 1, &ens, cfg);
                // Slices leaving the ring are fully re-analyzed: index i of
                // the buffer holds analysis time k + shift - 1 - (lag +
                // shift - 1 - i).
                for i in 0..cfg.shift {
                    let age = cfg.lag + cfg.shift - 1 - i;
                    if k + cfg.shift >= age + 1 {
                        let t = k + cfg.shift - 1 - age;
                        score_post(&mut series[t], &out.post[i], &truth.states[t], cfg);
                    }
                }
                k += cfg.shift;
            }
        }
        DriverKind::SingleIteration | DriverKind::GaussNewton => {
            let mut spin = true;
            let mut s = 0;
            while s + cfg.lag <= cfg.cycles {
                ctx.spin = spin;
                let window = truth.obs.columns(s, cfg.lag).into_owned();
                let out = match driver {
                    DriverKind::SingleIteration => ls_smoother_single_iteration(
                        &alg, ens, &window, &obs_cov, cfg.infl, &ctx, &mut rng,
                    )?,
                    _ => ls_smoother_gauss_newton(
                        &alg, ens, &window, &obs_cov, cfg.infl, &ctx, &mut rng,
                    )?,
                };
                ens = out.ens;

                // Forecast and filter slices map onto the newly observed
                // times; a spin cycle covers the whole window.
                let filt_start = if spin { s } else { s + cfg.lag - cfg.shift };
                for (i, slice) in out.filt.iter().enumerate() {
                    let t = filt_start + i;
                    if t < cfg.cycles {
                        score_filt(&mut series[t], slice, &truth.states[t], cfg);
                        series[t].iterations = Some(out.iterations);
                    }
                }
                let fore_start = match driver {
                    DriverKind::GaussNewton if !spin => s + cfg.lag,
                    _ => filt_start,
                };
                for (i, slice) in out.fore.iter().enumerate() {
                    let t = fore_start + i;
                    if t < cfg.cycles {
                        score_fore(&mut series[t], slice, &truth.states[t], cfg);
                    }
                }
                for (i, slice) in out.post.iter().enumerate() {
                    let t = s + i;
                    score_post(&mut series[t], slice, &truth.states[t], cfg);
                }
                score_params_last(&mut series, s + cfg.shift - 1, &ens, cfg);

                spin = false;
                s += cfg.shift;
            }
        }
    }

    let summary = summarize(cfg, &series);
    Ok(ExperimentOutput { summary, series })
}

fn validate_config(cfg: &ExperimentConfig) -> Result<(), DaError> {
    if cfg.n_ens < 2 {
        return Err(DaError::EnsembleTooSmall(cfg.n_ens));
    }
    if cfg.obs_dim == 0 || cfg.obs_dim > cfg.state_dim {
        return Err(DaError::ObsDim {
            obs_dim: cfg.obs_dim,
            state_dim: cfg.state_dim,
        });
    }
    if cfg.obs_sd <= 0.0 {
        return Err(DaError::CovarianceNotPositiveDefinite);
    }
    if cfg.lag > 0 && (cfg.shift == 0 || cfg.shift > cfg.lag) {
        return Err(DaError::LagShiftIncompatible {
            lag: cfg.lag,
            shift: cfg.shift,
        });
    }
    if cfg.mda && (cfg.lag == 0 || cfg.lag % cfg.shift != 0) {
        return Err(DaError::LagShiftIncompatible {
            lag: cfg.lag,
            shift: cfg.shift,
        });
    }
    Ok(())
}

/// Samples the initial ensemble around the initial truth, appending the
/// perturbed parameter guesses when parameter estimation is active.
fn initial_ensemble(cfg: &ExperimentConfig, truth: &TruthTwin, rng: &mut StdRng) -> DMatrix<f64> {
    let state_ens = sample_gaussian_ensemble(&truth.init, INIT_SPREAD, cfg.n_ens, rng);
    if !cfg.param_est {
        return state_ens;
    }
    let sys_dim = cfg.state_dim + 1;
    let mut ens = DMatrix::zeros(sys_dim, cfg.n_ens);
    for j in 0..cfg.n_ens {
        for i in 0..cfg.state_dim {
            ens[(i, j)] = state_ens[(i, j)];
        }
        let xi: f64 = rng.sample(StandardNormal);
        ens[(cfg.state_dim, j)] = cfg.forcing * (1.0 + cfg.param_err * xi);
    }
    ens
}

fn score_fore(rec: &mut CycleRecord, ens: &DMatrix<f64>, truth: &DVector<f64>, cfg: &ExperimentConfig) {
    let (rmse, spread) = rmse_spread(ens, truth, 0, cfg.state_dim);
    rec.fore_rmse = Some(rmse);
    rec.fore_spread = Some(spread);
}

fn score_filt(rec: &mut CycleRecord, ens: &DMatrix<f64>, truth: &DVector<f64>, cfg: &ExperimentConfig) {
    let (rmse, spread) = rmse_spread(ens, truth, 0, cfg.state_dim);
    rec.filt_rmse = Some(rmse);
    rec.filt_spread = Some(spread);
}

fn score_post(rec: &mut CycleRecord, ens: &DMatrix<f64>, truth: &DVector<f64>, cfg: &ExperimentConfig) {
    let (rmse, spread) = rmse_spread(ens, truth, 0, cfg.state_dim);
    rec.post_rmse = Some(rmse);
    rec.post_spread = Some(spread);
}

fn score_params(rec: &mut CycleRecord, ens: &DMatrix<f64>, cfg: &ExperimentConfig) {
    if !cfg.param_est {
        return;
    }
    let truth = DVector::from_element(1, cfg.forcing);
    let (rmse, spread) = rmse_spread(ens, &truth, cfg.state_dim, cfg.state_dim + 1);
    rec.param_rmse = Some(rmse);
    rec.param_spread = Some(spread);
}

fn score_params_last(
    series: &mut [CycleRecord],
    cycle: usize,
    ens: &DMatrix<f64>,
    cfg: &ExperimentConfig,
) {
    if cycle < series.len() {
        score_params(&mut series[cycle], ens, cfg);
    }
}

fn summarize(cfg: &ExperimentConfig, series: &[CycleRecord]) -> ExperimentSummary {
    let mean_of = |field: &dyn Fn(&CycleRecord) -> Option<f64>| -> Option<f64> {
        let values: Vec<f64> = series
            .iter()
            .filter(|r| r.cycle >= cfg.burn)
            .filter_map(|r| field(r))
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.iter().sum::<f64>() / values.len() as f64)
        }
    };

    ExperimentSummary {
        method: cfg.method.clone(),
        seed: cfg.seed,
        state_dim: cfg.state_dim,
        obs_dim: cfg.obs_dim,
        obs_sd: cfg.obs_sd,
        gamma: cfg.gamma,
        n_ens: cfg.n_ens,
        infl: cfg.infl,
        h: cfg.h,
        tanl: cfg.tanl,
        diffusion: cfg.diffusion,
        lag: cfg.lag,
        shift: cfg.shift,
        mda: cfg.mda,
        param_est: cfg.param_est,
        fore_rmse: mean_of(&|r| r.fore_rmse),
        fore_spread: mean_of(&|r| r.fore_spread),
        filt_rmse: mean_of(&|r| r.filt_rmse),
        filt_spread: mean_of(&|r| r.filt_spread),
        post_rmse: mean_of(&|r| r.post_rmse),
        post_spread: mean_of(&|r| r.post_spread),
        param_rmse: mean_of(&|r| r.param_rmse),
        param_spread: mean_of(&|r| r.param_spread),
        mean_iterations: mean_of(&|r| r.iterations.map(|i| i as f64)),
    }
}

/// Runs every configuration of a sweep in parallel, writing one artifact
/// per configuration and a summary index, and returns the number of failed
/// configurations. A failing configuration is logged and skipped; its
/// neighbors are unaffected, each task owning its ensemble, buffers and
/// RNG.
pub fn run_sweep(configs: &[ExperimentConfig], out_dir: &Path) -> usize {
    let results: Vec<Option<ExperimentSummary>> = configs
        .par_iter()
        .map(|cfg| {
            let name = artifact_name(cfg);
            match run_experiment(cfg) {
                Ok(out) => {
                    if let Err(e) = write_series(out_dir, cfg, &out.series) {
                        error!("could not persist `{}`: {}", name, e);
                        return None;
                    }
                    info!(
                        "{} done (filter RMSE {:.4})",
                        name,
                        out.summary.filt_rmse.unwrap_or(f64::NAN)
                    );
                    Some(out.summary)
                }
                Err(e) => {
                    error!("configuration `{}` failed: {}", name, e);
                    None
                }
            }
        })
        .collect();

    let summaries: Vec<ExperimentSummary> = results.iter().flatten().cloned().collect();
    if let Err(e) = write_summary_index(out_dir, &summaries) {
        error!("could not write the sweep summary: {}", e);
    }
    configs.len() - summaries.len()
}
