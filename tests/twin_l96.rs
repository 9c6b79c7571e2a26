extern crate ensda;

use ensda::experiment::{run_experiment, ExperimentConfig};

fn base_config(method: &str) -> ExperimentConfig {
    ExperimentConfig {
        method: method.to_string(),
        seed: 0,
        state_dim: 40,
        obs_dim: 40,
        obs_sd: 1.0,
        gamma: 1.0,
        n_ens: 21,
        infl: 1.02,
        h: 0.01,
        tanl: 0.05,
        diffusion: 0.0,
        forcing: 8.0,
        cycles: 100,
        burn: 10,
        lag: 0,
        shift: 1,
        mda: false,
        smoother: None,
        param_est: false,
        param_err: 0.0,
        param_wlk: 0.0,
        param_infl: 1.0,
    }
}

#[test]
fn etkf_beats_the_observation_noise_on_l96() {
    let out = run_experiment(&base_config("etkf")).unwrap();
    let filt = out.summary.filt_rmse.unwrap();
    assert!(
        filt < 0.35,
        "ETKF filter RMSE {:.3} should be well below the unit observation noise",
        filt
    );
    let fore = out.summary.fore_rmse.unwrap();
    assert!(filt < fore, "the analysis must improve on the forecast");
}

#[test]
fn classic_etks_improves_on_the_filter() {
    let mut cfg = base_config("etks");
    cfg.lag = 10;
    cfg.shift = 1;
    let out = run_experiment(&cfg).unwrap();
    let filt = out.summary.filt_rmse.unwrap();
    let post = out.summary.post_rmse.unwrap();
    assert!(
        post < 0.9 * filt,
        "smoothed RMSE {:.3} should undercut the filter RMSE {:.3} by 10%",
        post,
        filt
    );
}

#[test]
fn mlef_with_line_search_handles_a_nonlinear_observation_operator() {
    let mut cfg = base_config("mlef-transform-ls");
    cfg.gamma = 3.0;
    let out = run_experiment(&cfg).unwrap();

    let filt = out.summary.filt_rmse.unwrap();
    assert!(filt.is_finite() && filt < 1.0, "MLEF RMSE unbounded: {}", filt);

    let counted: Vec<usize> = out
        .series
        .iter()
        .filter_map(|r| r.iterations)
        .collect();
    assert!(!counted.is_empty());
    let fast = counted.iter().filter(|&&i| i <= 10).count();
    assert!(
        fast * 10 >= counted.len() * 9,
        "MLEF converged within 10 iterations on only {}/{} cycles",
        fast,
        counted.len()
    );
}

#[test]
fn dual_finite_size_filter_stays_finite_at_borderline_rank() {
    let mut cfg = base_config("enkf-n-dual");
    cfg.n_ens = 15;
    cfg.infl = 1.0;
    let out = run_experiment(&cfg).unwrap();

    for record in &out.series {
        let rmse = record.filt_rmse.unwrap();
        let spread = record.filt_spread.unwrap();
        assert!(
            rmse.is_finite() && spread.is_finite(),
            "NaN at cycle {}",
            record.cycle
        );
    }
}

#[test]
fn ienks_mda_runs_both_stages_within_the_iteration_budget() {
    let mut cfg = base_config("ienks-transform");
    cfg.lag = 9;
    cfg.shift = 3;
    cfg.mda = true;
    cfg.infl = 1.0;
    let out = run_experiment(&cfg).unwrap();

    let filt = out.summary.filt_rmse.unwrap();
    let post = out.summary.post_rmse.unwrap();
    assert!(filt.is_finite(), "stage-0 filter diverged");
    assert!(post.is_finite(), "stage-1 posterior diverged");

    for record in &out.series {
        if let Some(iters) = record.iterations {
            assert!(
                iters <= 10,
                "cycle {} used {} iterations across the two stages",
                record.cycle,
                iters
            );
        }
    }
}

#[test]
fn single_iteration_etks_tracks_and_smooths() {
    let mut cfg = base_config("etks");
    cfg.lag = 6;
    cfg.shift = 2;
    cfg.smoother = Some("single-iteration".to_string());
    let out = run_experiment(&cfg).unwrap();
    let filt = out.summary.filt_rmse.unwrap();
    let post = out.summary.post_rmse.unwrap();
    assert!(filt.is_finite() && filt < 0.5, "filter RMSE {:.3}", filt);
    assert!(post < filt, "smoothing should improve on the filter estimate");

    // The MDA configuration of the same window stays bounded.
    cfg.mda = true;
    cfg.infl = 1.0;
    let out = run_experiment(&cfg).unwrap();
    assert!(out.summary.post_rmse.unwrap().is_finite());
    assert!(out.summary.filt_rmse.unwrap().is_finite());
}

#[test]
fn etkf_learns_an_uncertain_forcing_parameter() {
    let mut cfg = base_config("etkf");
    cfg.n_ens = 25;
    cfg.cycles = 1000;
    cfg.burn = 0;
    cfg.param_est = true;
    cfg.param_err = 0.03;
    cfg.param_wlk = 0.001;
    cfg.param_infl = 1.0;
    let out = run_experiment(&cfg).unwrap();

    let series: Vec<f64> = out
        .series
        .iter()
        .filter_map(|r| r.param_rmse)
        .collect();
    assert!(series.len() >= 1000);
    let early: f64 = series[..100].iter().sum::<f64>() / 100.0;
    let late: f64 = series[series.len() - 100..].iter().sum::<f64>() / 100.0;
    assert!(
        late < early,
        "parameter RMSE moving average did not decrease: early {:.4}, late {:.4}",
        early,
        late
    );
    assert!(out.summary.filt_rmse.unwrap().is_finite());
}

#[test]
fn experiments_are_bitwise_reproducible_per_configuration() {
    let cfg = base_config("etkf");
    let a = run_experiment(&cfg).unwrap();
    let b = run_experiment(&cfg).unwrap();
    assert_eq!(
        a.summary.filt_rmse, b.summary.filt_rmse,
        "same configuration, same seed, different result"
    );
    assert_eq!(a.summary.fore_rmse, b.summary.fore_rmse);
}
