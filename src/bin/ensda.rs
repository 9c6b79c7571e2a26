extern crate clap;
extern crate config;
extern crate dialoguer;
extern crate ensda;
extern crate glob;
extern crate log;
extern crate pretty_env_logger;
extern crate serde_derive;

use std::collections::BTreeMap;
use std::env::{set_var, var};
use std::path::PathBuf;

use clap::{App, Arg};
use config::{Config, File};
use dialoguer::{theme::ColorfulTheme, Select};
use ensda::analysis::KNOWN_LABELS;
use ensda::experiment::{artifact_name, run_experiment, run_sweep, write_series, ExperimentConfig};
use ensda::DaError;
use glob::glob;
use log::{error, info};
use serde_derive::Deserialize;

const LOG_VAR: &str = "ENSDA_LOG";

/// A scenario file: named experiment configurations plus the artifact
/// directory they share.
#[derive(Debug, Deserialize)]
struct ScenarioSerde {
    experiment: BTreeMap<String, ExperimentConfig>,
    #[serde(default = "default_output_dir")]
    output_dir: String,
}

fn default_output_dir() -> String {
    "artifacts".to_string()
}

fn main() -> Result<(), DaError> {
    let app = App::new("ensda")
        .version("0.1.0")
        .about("Ensemble data assimilation twin experiments and method sweeps.")
        .arg(
            Arg::with_name("SCENARIO")
                .help("Sets the scenario file or glob to use")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::with_name("experiment")
                .short("e")
                .long("exp")
                .takes_value(true)
                .value_name("experiment name")
                .help("Run only the named experiment from the scenario"),
        )
        .arg(
            Arg::with_name("all")
                .short("a")
                .long("all")
                .takes_value(false)
                .help("Run every experiment of the scenario as a parallel sweep"),
        )
        .arg(
            Arg::with_name("methods")
                .long("methods")
                .takes_value(false)
                .help("List the recognized analysis labels and exit"),
        );

    let matches = app.get_matches();

    if var(LOG_VAR).is_err() {
        set_var(LOG_VAR, "INFO");
    }
    if pretty_env_logger::try_init_custom_env(LOG_VAR).is_err() {
        println!("could not init logger");
    }

    if matches.is_present("methods") {
        for label in KNOWN_LABELS.iter() {
            println!("{}", label);
        }
        return Ok(());
    }

    let mut s = Config::new();
    let scenario_path = matches.value_of("SCENARIO").unwrap();
    if scenario_path.contains('*') {
        s.merge(
            glob(scenario_path)
                .map_err(|e| DaError::Io(e.to_string()))?
                .map(|path| File::from(path.unwrap()))
                .collect::<Vec<_>>(),
        )
        .map_err(|e| DaError::Io(format!("could not load scenario glob: {}", e)))?;
    } else {
        s.merge(File::with_name(scenario_path))
            .map_err(|e| DaError::Io(format!("could not load scenario: {}", e)))?;
    }

    let scenario: ScenarioSerde = s
        .try_into()
        .map_err(|e| DaError::Io(format!("scenario deserialization: {}", e)))?;
    info!(
        "Loaded scenario `{}` with {} experiment(s)",
        scenario_path,
        scenario.experiment.len()
    );
    let out_dir = PathBuf::from(&scenario.output_dir);

    if matches.is_present("all") {
        let configs: Vec<ExperimentConfig> = scenario.experiment.values().cloned().collect();
        let failures = run_sweep(&configs, &out_dir);
        if failures > 0 {
            error!("{} configuration(s) failed", failures);
        }
        return Ok(());
    }

    // Select one experiment, prompting when the scenario holds several.
    let names: Vec<String> = scenario.experiment.keys().cloned().collect();
    let req_name = if let Some(name) = matches.value_of("experiment") {
        name.to_string()
    } else if names.len() == 1 {
        names[0].clone()
    } else {
        let selection = Select::with_theme(&ColorfulTheme::default())
            .with_prompt("\n\nSelect the experiment to execute")
            .default(0)
            .items(&names[..])
            .interact()
            .unwrap();
        names[selection].clone()
    };

    let cfg = scenario
        .experiment
        .get(&req_name)
        .ok_or_else(|| DaError::Io(format!("experiment `{}` not in scenario", req_name)))?;

    info!("Executing experiment `{}`", req_name);
    match run_experiment(cfg) {
        Ok(out) => {
            let path = write_series(&out_dir, cfg, &out.series)?;
            info!("artifact written to {}", path.display());
            info!(
                "fore RMSE {:.4} / filt RMSE {:.4} / post RMSE {}",
                out.summary.fore_rmse.unwrap_or(f64::NAN),
                out.summary.filt_rmse.unwrap_or(f64::NAN),
                out.summary
                    .post_rmse
                    .map(|v| format!("{:.4}", v))
                    .unwrap_or_else(|| "n/a".to_string()),
            );
            Ok(())
        }
        Err(e) => {
            error!("experiment `{}` failed: {}", artifact_name(cfg), e);
            Err(e)
        }
    }
}
