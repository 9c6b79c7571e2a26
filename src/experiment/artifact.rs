use std::fs;
use std::path::{Path, PathBuf};

use csv::Writer;

use super::{CycleRecord, ExperimentConfig, ExperimentSummary};
use crate::errors::DaError;

/// The artifact stem of a configuration, embedding every identifying
/// parameter so a sweep directory is self-describing.
pub fn artifact_name(cfg: &ExperimentConfig) -> String {
    format!(
        "{}_l96_state_{:02}_obs_{:02}_gamma_{:+04.1}_nens_{:03}_infl_{:.2}_tanl_{:.2}_h_{:.3}_diff_{:.3}_lag_{:02}_shift_{:02}_mda_{}_seed_{:04}",
        cfg.method,
        cfg.state_dim,
        cfg.obs_dim,
        cfg.gamma,
        cfg.n_ens,
        cfg.infl,
        cfg.tanl,
        cfg.h,
        cfg.diffusion,
        cfg.lag,
        cfg.shift,
        cfg.mda,
        cfg.seed
    )
}

fn prepare_dir(dir: &Path) -> Result<(), DaError> {
    fs::create_dir_all(dir).map_err(|e| DaError::Io(format!("{}: {}", dir.display(), e)))
}

/// Writes the per-cycle series of one configuration as a CSV artifact and
/// returns its path.
pub fn write_series(
    dir: &Path,
    cfg: &ExperimentConfig,
    series: &[CycleRecord],
) -> Result<PathBuf, DaError> {
    prepare_dir(dir)?;
    let path = dir.join(format!("{}.csv", artifact_name(cfg)));
    let mut wtr =
        Writer::from_path(&path).map_err(|e| DaError::Io(format!("{}: {}", path.display(), e)))?;
    for record in series {
        wtr.serialize(record)
            .map_err(|e| DaError::Io(format!("{}: {}", path.display(), e)))?;
    }
    wtr.flush()
        .map_err(|e| DaError::Io(format!("{}: {}", path.display(), e)))?;
    Ok(path)
}

/// Writes the one-row-per-configuration summary index of a sweep.
pub fn write_summary_index(
    dir: &Path,
    summaries: &[ExperimentSummary],
) -> Result<PathBuf, DaError> {
    prepare_dir(dir)?;
    let path = dir.join("sweep_summary.csv");
    let mut wtr =
        Writer::from_path(&path).map_err(|e| DaError::Io(format!("{}: {}", path.display(), e)))?;
    for summary in summaries {
        wtr.serialize(summary)
            .map_err(|e| DaError::Io(format!("{}: {}", path.display(), e)))?;
    }
    wtr.flush()
        .map_err(|e| DaError::Io(format!("{}: {}", path.display(), e)))?;
    Ok(path)
}
