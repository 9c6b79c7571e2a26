//! ensda provides ensemble-based data assimilation schemes and the twin
//! experiment machinery used to benchmark them on chaotic dynamical models.
//!
//! The crate is organized around the analysis step: the [analysis] kernels
//! map a forecast ensemble and a noisy observation into a right-acting
//! transform, and the [smoother] drivers chain transforms over a lag-shift
//! data assimilation window. Twin experiments against a known truth
//! trajectory live in [experiment].

#[macro_use]
extern crate log;

/// Provides the analysis transforms (EnKF, ETKF, MLEF, EnKF-N, IEnKS) and
/// their supporting numerics.
pub mod analysis;

/// Provides the dynamical models used for twin experiments.
pub mod dynamics;

/// Ensemble matrix manipulation: means, anomalies, updates, inflation.
pub mod ensemble;

/// Stores the error taxonomy of the crate.
pub mod errors;

/// Twin experiment drivers, sweeps and persisted artifacts.
pub mod experiment;

/// The alternating observation operator and its nonlinearity family.
pub mod obs;

/// Fixed-step integrators for deterministic and stochastic models.
pub mod propagators;

/// The lag-shift smoother drivers over a data assimilation window.
pub mod smoother;

pub use crate::errors::DaError;
