extern crate ensda;
extern crate nalgebra as na;
extern crate rand;
extern crate rand_distr;

use self::na::{DMatrix, DVector};
use ensda::analysis::{Algorithm, ObsCovar};
use ensda::dynamics::lorenz96::Lorenz96;
use ensda::ensemble::sample_gaussian_ensemble;
use ensda::obs::ObsOperator;
use ensda::propagators::PropOpts;
use ensda::smoother::{
    ensemble_filter_cycle, ls_smoother_classic, ls_smoother_gauss_newton,
    ls_smoother_single_iteration, sda_weights, uniform_mda_weights, Daw, DawCtx,
};
use ensda::DaError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::str::FromStr;

const STATE_DIM: usize = 40;
const N_ENS: usize = 21;

fn l96_setup(rng: &mut StdRng) -> (Lorenz96, DMatrix<f64>, DMatrix<f64>, ObsCovar) {
    let model = Lorenz96::standard();
    let mean = DVector::from_fn(STATE_DIM, |i, _| 8.0 + (i as f64 * 0.7).sin());
    let ens = sample_gaussian_ensemble(&mean, 1.0, N_ENS, rng);
    // A plausible observation window, one column per observation time.
    let obs = DMatrix::from_fn(STATE_DIM, 12, |i, j| {
        mean[i] + 0.1 * (i + j) as f64 + rng.sample::<f64, _>(rand_distr::StandardNormal)
    });
    let obs_cov = ObsCovar::from_sd(STATE_DIM, 1.0);
    (model, ens, obs, obs_cov)
}

fn base_ctx<'a>(model: &'a Lorenz96, lag: usize, shift: usize) -> DawCtx<'a, Lorenz96> {
    let mut ctx = DawCtx::new(
        model,
        PropOpts::with_fixed_step(0.01),
        5,
        ObsOperator::linear(),
    );
    ctx.lag = lag;
    ctx.shift = shift;
    ctx
}

#[test]
fn sda_weights_reciprocals_sum_to_the_lag() {
    for &lag in &[1usize, 4, 9, 16] {
        let w = sda_weights(lag);
        let total: f64 = w.iter().map(|v| 1.0 / v).sum();
        assert!((total - lag as f64).abs() < 1e-12);
    }
}

#[test]
fn uniform_mda_weights_temper_each_observation_to_unit_information() {
    let (reb, obs_w) = uniform_mda_weights(9, 3);
    let q = 3.0;
    // Every observation is assimilated q times at weight q.
    for l in 0..9 {
        assert!((obs_w[l] - q).abs() < 1e-12);
    }
    let tempered: f64 = (0..3).map(|_| 1.0 / q).sum();
    assert!((tempered - 1.0).abs() < 1e-12);
    // Stage-0 rebalancing weights by window stage.
    for l in 0..3 {
        assert!((reb[l] - 3.0).abs() < 1e-12, "oldest stage");
    }
    for l in 3..6 {
        assert!((reb[l] - 1.5).abs() < 1e-12, "middle stage");
    }
    for l in 6..9 {
        assert!((reb[l] - 1.0).abs() < 1e-12, "newest stage");
    }
}

#[test]
fn mda_requires_lag_multiple_of_shift() {
    let model = Lorenz96::standard();
    let mut ctx = base_ctx(&model, 10, 3);
    ctx.mda = true;
    let (reb, obs_w) = uniform_mda_weights(9, 3);
    ctx.reb_weights = Some(reb);
    ctx.obs_weights = Some(obs_w);
    match ctx.validate() {
        Err(DaError::LagShiftIncompatible { lag: 10, shift: 3 }) => (),
        other => panic!("expected LagShiftIncompatible, got {:?}", other),
    }
}

#[test]
fn mda_requires_weight_vectors_of_window_length() {
    let model = Lorenz96::standard();
    let mut ctx = base_ctx(&model, 9, 3);
    ctx.mda = true;
    ctx.reb_weights = Some(DVector::from_element(4, 1.0));
    ctx.obs_weights = Some(DVector::from_element(9, 3.0));
    match ctx.validate() {
        Err(DaError::MdaWeights(_)) => (),
        other => panic!("expected MdaWeights, got {:?}", other),
    }
}

#[test]
fn classic_smoother_checks_its_window_and_buffer() {
    let mut rng = StdRng::seed_from_u64(1);
    let (model, ens, obs, obs_cov) = l96_setup(&mut rng);
    let ctx = base_ctx(&model, 4, 2);
    let alg = Algorithm::from_str("etks").unwrap();

    // Wrong number of observation columns.
    let mut posterior = Daw::new(6, &ens);
    match ls_smoother_classic(
        &alg,
        ens.clone(),
        &obs.columns(0, 3).into_owned(),
        &obs_cov,
        1.0,
        &ctx,
        &mut posterior,
        &mut rng,
    ) {
        Err(DaError::ObsWindowMismatch {
            expected: 2,
            found: 3,
        }) => (),
        other => panic!("expected ObsWindowMismatch, got {:?}", other),
    }

    // Wrong posterior ring length.
    let mut posterior = Daw::new(4, &ens);
    match ls_smoother_classic(
        &alg,
        ens.clone(),
        &obs.columns(0, 2).into_owned(),
        &obs_cov,
        1.0,
        &ctx,
        &mut posterior,
        &mut rng,
    ) {
        Err(DaError::PosteriorLength {
            expected: 6,
            found: 4,
        }) => (),
        other => panic!("expected PosteriorLength, got {:?}", other),
    }

    // The iterative schemes do not run under the classic driver.
    let mut posterior = Daw::new(6, &ens);
    let ienks = Algorithm::from_str("ienks-bundle").unwrap();
    match ls_smoother_classic(
        &ienks,
        ens,
        &obs.columns(0, 2).into_owned(),
        &obs_cov,
        1.0,
        &ctx,
        &mut posterior,
        &mut rng,
    ) {
        Err(DaError::SchemeDriverMismatch(_)) => (),
        other => panic!("expected SchemeDriverMismatch, got {:?}", other),
    }
}

#[test]
fn classic_smoother_last_posterior_slice_is_the_current_ensemble() {
    let mut rng = StdRng::seed_from_u64(2);
    let (model, ens, obs, obs_cov) = l96_setup(&mut rng);
    let lag = 4;
    let shift = 2;
    let ctx = base_ctx(&model, lag, shift);
    let alg = Algorithm::from_str("etks").unwrap();

    let mut posterior = Daw::new(lag + shift, &ens);
    let out = ls_smoother_classic(
        &alg,
        ens,
        &obs.columns(0, shift).into_owned(),
        &obs_cov,
        1.02,
        &ctx,
        &mut posterior,
        &mut rng,
    )
    .unwrap();

    assert_eq!(out.post.len(), lag + shift);
    assert_eq!(out.fore.len(), shift);
    assert_eq!(out.filt.len(), shift);
    assert_eq!(
        out.post.last().unwrap(),
        &out.ens,
        "newest posterior slice must equal the ensemble at the current time"
    );
}

#[test]
fn single_iteration_smoother_spin_cycle_covers_the_window() {
    let mut rng = StdRng::seed_from_u64(3);
    let (model, ens, obs, obs_cov) = l96_setup(&mut rng);
    let lag = 6;
    let shift = 2;
    let mut ctx = base_ctx(&model, lag, shift);
    ctx.spin = true;
    let alg = Algorithm::from_str("etks").unwrap();

    let out = ls_smoother_single_iteration(
        &alg,
        ens,
        &obs.columns(0, lag).into_owned(),
        &obs_cov,
        1.02,
        &ctx,
        &mut rng,
    )
    .unwrap();

    assert_eq!(out.fore.len(), lag, "spin records the whole window");
    assert_eq!(out.filt.len(), lag);
    assert_eq!(out.post.len(), shift);
    assert_eq!(
        out.post.last().unwrap(),
        &out.ens,
        "the ensemble advances to the last posterior time"
    );
}

#[test]
fn single_iteration_smoother_sda_records_only_new_observations() {
    let mut rng = StdRng::seed_from_u64(4);
    let (model, ens, obs, obs_cov) = l96_setup(&mut rng);
    let lag = 6;
    let shift = 2;
    let ctx = base_ctx(&model, lag, shift);
    let alg = Algorithm::from_str("etks").unwrap();

    let out = ls_smoother_single_iteration(
        &alg,
        ens,
        &obs.columns(0, lag).into_owned(),
        &obs_cov,
        1.02,
        &ctx,
        &mut rng,
    )
    .unwrap();

    assert_eq!(out.fore.len(), shift);
    assert_eq!(out.filt.len(), shift);
    assert_eq!(out.post.len(), shift);
}

#[test]
fn gauss_newton_smoother_respects_its_iteration_cap() {
    let mut rng = StdRng::seed_from_u64(5);
    let (model, ens, obs, obs_cov) = l96_setup(&mut rng);
    let lag = 4;
    let shift = 2;
    let mut ctx = base_ctx(&model, lag, shift);
    ctx.spin = true;
    let alg = Algorithm::from_str("ienks-transform").unwrap();

    let out = ls_smoother_gauss_newton(
        &alg,
        ens.clone(),
        &obs.columns(0, lag).into_owned(),
        &obs_cov,
        1.0,
        &ctx,
        &mut rng,
    )
    .unwrap();

    assert!(out.iterations >= 1 && out.iterations <= ctx.gn_max_iter);
    assert_eq!(out.post.len(), shift);
    assert_eq!(out.filt.len(), lag, "spin records the whole window");
    assert_eq!(out.fore.len(), lag + shift);
    assert_eq!(out.post.last().unwrap(), &out.ens);

    // A non-spin cycle only touches the trailing shift.
    ctx.spin = false;
    let out = ls_smoother_gauss_newton(
        &alg,
        out.ens,
        &obs.columns(shift, lag).into_owned(),
        &obs_cov,
        1.0,
        &ctx,
        &mut rng,
    )
    .unwrap();
    assert_eq!(out.filt.len(), shift);
    assert_eq!(out.fore.len(), shift);
    assert_eq!(out.post.len(), shift);
}

#[test]
fn gauss_newton_smoother_rejects_sequential_schemes() {
    let mut rng = StdRng::seed_from_u64(6);
    let (model, ens, obs, obs_cov) = l96_setup(&mut rng);
    let ctx = base_ctx(&model, 4, 2);
    let alg = Algorithm::from_str("etks").unwrap();
    match ls_smoother_gauss_newton(
        &alg,
        ens,
        &obs.columns(0, 4).into_owned(),
        &obs_cov,
        1.0,
        &ctx,
        &mut rng,
    ) {
        Err(DaError::SchemeDriverMismatch(_)) => (),
        other => panic!("expected SchemeDriverMismatch, got {:?}", other),
    }
}

#[test]
fn filter_cycle_reports_forecast_and_iterations() {
    let mut rng = StdRng::seed_from_u64(7);
    let (model, mut ens, obs, obs_cov) = l96_setup(&mut rng);
    let ctx = base_ctx(&model, 1, 1);
    let alg = Algorithm::from_str("etkf").unwrap();
    let before = ens.clone();
    let cycle = ensemble_filter_cycle(
        &alg,
        &mut ens,
        &obs.column(0).into_owned(),
        &obs_cov,
        1.02,
        &ctx,
        &mut rng,
    )
    .unwrap();
    assert_eq!(cycle.iterations, 1);
    assert_ne!(cycle.fore, before, "the forecast must be propagated");
    assert_ne!(ens, cycle.fore, "the analysis must move the ensemble");
}
