extern crate ensda;
extern crate nalgebra as na;
extern crate rand;
extern crate rand_distr;

use self::na::{DMatrix, DVector};
use ensda::analysis::sqrt::{sym_roots, ObsCovar, RootsRequest};
use ensda::analysis::{transform, Algorithm, Transform, TransformCtx};
use ensda::ensemble::{
    anomalies, ensemble_mean, ensemble_update, inflate_state, mean_preserving_orthogonal,
};
use ensda::obs::{observed_rows, ObsOperator};
use ensda::DaError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::str::FromStr;

fn random_ensemble(sys_dim: usize, n_ens: usize, rng: &mut StdRng) -> DMatrix<f64> {
    DMatrix::from_fn(sys_dim, n_ens, |_, _| {
        rng.sample::<f64, _>(rand_distr::StandardNormal)
    })
}

fn linear_ctx() -> TransformCtx {
    TransformCtx::new(ObsOperator::linear(), 10)
}

#[test]
fn random_orthogonal_preserves_the_mean() {
    let mut rng = StdRng::seed_from_u64(7);
    for &n in &[2usize, 5, 21, 40] {
        let u = mean_preserving_orthogonal(n, &mut rng);
        let ones = DVector::from_element(n, 1.0);
        let resid = (&u * &ones - &ones).norm();
        assert!(resid < 1e-12, "U did not preserve 1 for n = {}: {:e}", n, resid);
        let ortho = (u.transpose() * &u - DMatrix::identity(n, n)).norm();
        assert!(ortho < 1e-12, "U not orthogonal for n = {}: {:e}", n, ortho);
    }
}

#[test]
fn triple_update_shifts_the_mean_by_the_weights() {
    let mut rng = StdRng::seed_from_u64(11);
    let mut ens = random_ensemble(10, 7, &mut rng);
    let prior_mean = ensemble_mean(&ens);
    let x = anomalies(&ens);

    let w = DVector::from_fn(7, |i, _| 0.1 * (i as f64 - 3.0));
    let t = DMatrix::identity(7, 7) * 0.5;
    let u = mean_preserving_orthogonal(7, &mut rng);
    ensemble_update(
        &mut ens,
        &Transform::Triple {
            t,
            w: w.clone(),
            u,
        },
    );

    let expected = &prior_mean + &x * &w;
    let posterior_mean = ensemble_mean(&ens);
    assert!(
        (posterior_mean - expected).norm() < 1e-10,
        "posterior mean is not the prior mean shifted by X w"
    );
}

#[test]
fn etkf_matches_the_kalman_filter_in_the_linear_case() {
    let mut rng = StdRng::seed_from_u64(3);
    let sys_dim = 8;
    let n_ens = 12;
    let sd = 0.7;
    let ens = random_ensemble(sys_dim, n_ens, &mut rng);
    let obs = DVector::from_fn(sys_dim, |i, _| 0.3 * i as f64);
    let obs_cov = ObsCovar::from_sd(sys_dim, sd);
    let ctx = TransformCtx::new(ObsOperator::linear(), sys_dim);

    let alg = Algorithm::from_str("etkf").unwrap();
    let analysis = transform(&alg, &ens, &obs, &obs_cov, &ctx, &mut rng).unwrap();

    let mut updated = ens.clone();
    ensemble_update(&mut updated, &analysis.transform);
    let etkf_mean = ensemble_mean(&updated);

    // Closed-form Kalman update with the sample covariance P = X Xᵀ/(N−1)
    // and an identity observation operator.
    let x = anomalies(&ens);
    let p = &x * x.transpose() / (n_ens as f64 - 1.0);
    let innov_cov = &p + DMatrix::identity(sys_dim, sys_dim) * sd * sd;
    let gain = &p * innov_cov.try_inverse().unwrap();
    let kf_mean = ensemble_mean(&ens) + &gain * (&obs - ensemble_mean(&ens));

    assert!(
        (etkf_mean - kf_mean).norm() < 1e-8,
        "ETKF mean deviates from the Kalman closed form"
    );
}

#[test]
fn unit_inflation_is_bit_exact() {
    let mut rng = StdRng::seed_from_u64(5);
    let ens = random_ensemble(12, 9, &mut rng);
    let mut inflated = ens.clone();
    inflate_state(&mut inflated, 1.0, 12);
    assert_eq!(ens, inflated, "inflation at 1.0 must not touch the ensemble");
}

#[test]
fn observing_the_prior_mean_leaves_the_mean_in_place() {
    let mut rng = StdRng::seed_from_u64(17);
    let sys_dim = 10;
    let ens = random_ensemble(sys_dim, 8, &mut rng);
    let prior_mean = ensemble_mean(&ens);
    let obs_op = ObsOperator::linear();
    let obs = obs_op.observe_state(&prior_mean, sys_dim, sys_dim).unwrap();
    let obs_cov = ObsCovar::from_sd(sys_dim, 1e-4);
    let ctx = TransformCtx::new(obs_op, sys_dim);

    let alg = Algorithm::from_str("etkf").unwrap();
    let analysis = transform(&alg, &ens, &obs, &obs_cov, &ctx, &mut rng).unwrap();
    let mut updated = ens;
    ensemble_update(&mut updated, &analysis.transform);

    assert!(
        (ensemble_mean(&updated) - prior_mean).norm() < 1e-9,
        "analysis of the prior-mean observation moved the mean"
    );
}

#[test]
fn symmetric_square_root_round_trips() {
    let mut rng = StdRng::seed_from_u64(23);
    let a = random_ensemble(9, 9, &mut rng);
    let m = &a * a.transpose() + DMatrix::identity(9, 9);
    let roots = sym_roots(&m, RootsRequest::all()).unwrap();
    let sqrt_inv = roots.sqrt_inv.unwrap();
    let resid = (&sqrt_inv * &m * sqrt_inv.transpose() - DMatrix::identity(9, 9)).norm();
    assert!(resid < 1e-9, "M^(-1/2) M M^(-T/2) != I: {:e}", resid);

    let sqrt = roots.sqrt.unwrap();
    let resid = (&sqrt * sqrt.transpose() - &m).norm();
    assert!(resid < 1e-8, "M^(1/2) does not square back to M: {:e}", resid);

    let inverse = roots.inverse.unwrap();
    let resid = (&inverse * &m - DMatrix::identity(9, 9)).norm();
    assert!(resid < 1e-9, "M^(-1) M != I: {:e}", resid);
}

#[test]
fn alternating_observation_rows_follow_the_thinning_rules() {
    for state_dim in 1..=40usize {
        for obs_dim in 1..=state_dim {
            let rows = observed_rows(state_dim, obs_dim).unwrap();
            assert_eq!(rows.len(), obs_dim, "d = {} p = {}", state_dim, obs_dim);
            assert!(
                rows.windows(2).all(|w| w[0] < w[1]),
                "rows not strictly increasing for d = {} p = {}",
                state_dim,
                obs_dim
            );
            assert!(*rows.last().unwrap() < state_dim);

            // Reconstruct the retained 1-based index set from the rules.
            let expected: Vec<usize> = if obs_dim == state_dim {
                (1..=state_dim).collect()
            } else if 2 * obs_dim > state_dim {
                let r = state_dim - obs_dim;
                let mut set: Vec<usize> = (1..=state_dim - 2 * r).collect();
                let mut row = state_dim - 2 * r + 2;
                while row <= state_dim {
                    set.push(row);
                    row += 2;
                }
                set
            } else {
                (1..=state_dim)
                    .filter(|i| i % 2 == 1)
                    .take(obs_dim)
                    .collect()
            };
            let got: Vec<usize> = rows.iter().map(|i| i + 1).collect();
            assert_eq!(got, expected, "d = {} p = {}", state_dim, obs_dim);
        }
    }
}

#[test]
fn empty_observation_vector_is_a_config_error() {
    assert_eq!(
        observed_rows(40, 0).unwrap_err(),
        DaError::ObsDim {
            obs_dim: 0,
            state_dim: 40
        }
    );
}

#[test]
fn full_rank_observation_keeps_row_order() {
    let mut rng = StdRng::seed_from_u64(29);
    let ens = random_ensemble(12, 5, &mut rng);
    let obs_op = ObsOperator::linear();
    let observed = obs_op.observe(&ens, 12, 12).unwrap();
    assert_eq!(observed, ens);
}

#[test]
fn gamma_nonlinearity_family() {
    let op = ObsOperator::with_gamma(2.0);
    let x = DVector::from_element(1, 10.0);
    let y = op.observe_state(&x, 1, 1).unwrap();
    assert!((y[0] - 10.0).abs() < 1e-12, "gamma=2 at x=10 should be 10");

    let op = ObsOperator::with_gamma(0.0);
    let y = op.observe_state(&x, 1, 1).unwrap();
    assert!((y[0] - 5.0).abs() < 1e-12, "gamma=0 is the scaled square");

    let op = ObsOperator::with_gamma(-0.1);
    let y = op.observe_state(&x, 1, 1).unwrap();
    assert!((y[0] - 10.0 * (1.0f64).exp()).abs() < 1e-9);
}

#[test]
fn every_kernel_survives_a_two_member_ensemble() {
    let mut rng = StdRng::seed_from_u64(31);
    let sys_dim = 6;
    let ens = random_ensemble(sys_dim, 2, &mut rng);
    let obs = DVector::from_element(sys_dim, 0.1);
    let obs_cov = ObsCovar::from_sd(sys_dim, 1.0);
    let ctx = TransformCtx::new(ObsOperator::linear(), sys_dim);

    for label in &[
        "enkf",
        "etkf",
        "mlef-transform",
        "mlef-bundle",
        "mlef-transform-ls",
        "mlef-n-transform",
        "enkf-n-primal",
        "enkf-n-dual",
    ] {
        let alg = Algorithm::from_str(label).unwrap();
        let analysis = transform(&alg, &ens, &obs, &obs_cov, &ctx, &mut rng)
            .unwrap_or_else(|e| panic!("{} failed on N = 2: {}", label, e));
        let mut updated = ens.clone();
        ensemble_update(&mut updated, &analysis.transform);
        assert!(
            updated.iter().all(|v| v.is_finite()),
            "{} produced a non-finite member",
            label
        );
    }
}

#[test]
fn single_member_ensemble_is_rejected() {
    let mut rng = StdRng::seed_from_u64(37);
    let ens = random_ensemble(4, 1, &mut rng);
    let obs = DVector::zeros(4);
    let obs_cov = ObsCovar::from_sd(4, 1.0);
    let alg = Algorithm::from_str("etkf").unwrap();
    match transform(&alg, &ens, &obs, &obs_cov, &linear_ctx(), &mut rng) {
        Err(DaError::EnsembleTooSmall(1)) => (),
        other => panic!("expected EnsembleTooSmall, got {:?}", other),
    }
}

#[test]
fn iterative_smoother_labels_do_not_dispatch_as_filters() {
    let mut rng = StdRng::seed_from_u64(41);
    let ens = random_ensemble(4, 3, &mut rng);
    let obs = DVector::zeros(4);
    let obs_cov = ObsCovar::from_sd(4, 1.0);
    let alg = Algorithm::from_str("ienks-transform").unwrap();
    match transform(&alg, &ens, &obs, &obs_cov, &linear_ctx(), &mut rng) {
        Err(DaError::SchemeDriverMismatch(_)) => (),
        other => panic!("expected SchemeDriverMismatch, got {:?}", other),
    }
}

#[test]
fn non_positive_definite_covariance_is_rejected() {
    let mut rng = StdRng::seed_from_u64(43);
    let ens = random_ensemble(4, 5, &mut rng);
    let obs = DVector::zeros(4);
    let mut m = DMatrix::identity(4, 4);
    m[(3, 3)] = -1.0;
    let obs_cov = ObsCovar::Full(m);
    let alg = Algorithm::from_str("etkf").unwrap();
    match transform(&alg, &ens, &obs, &obs_cov, &linear_ctx(), &mut rng) {
        Err(DaError::CovarianceNotPositiveDefinite) => (),
        other => panic!("expected CovarianceNotPositiveDefinite, got {:?}", other),
    }
}

#[test]
fn dual_finite_size_transform_is_symmetric_and_finite() {
    let mut rng = StdRng::seed_from_u64(47);
    let sys_dim = 10;
    let ens = random_ensemble(sys_dim, 15, &mut rng);
    let obs = DVector::from_fn(sys_dim, |i, _| (i as f64).sin());
    let obs_cov = ObsCovar::from_sd(sys_dim, 1.0);
    let ctx = TransformCtx::new(ObsOperator::linear(), sys_dim);

    let alg = Algorithm::from_str("enkf-n-dual").unwrap();
    let analysis = transform(&alg, &ens, &obs, &obs_cov, &ctx, &mut rng).unwrap();
    match &analysis.transform {
        Transform::Triple { t, w, .. } => {
            assert!((t - t.transpose()).norm() < 1e-10, "T is not symmetric");
            assert!(w.iter().all(|v| v.is_finite()));
        }
        _ => panic!("expected a transform triple"),
    }
}
