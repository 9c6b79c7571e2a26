use nalgebra::DVector;

/// The single-scale Lorenz-96 model.
pub mod lorenz96;

/// The `Dynamics` trait carries the equation of motion of a benchmark
/// model so the propagators and twin-experiment drivers can integrate it.
///
/// When parameter estimation is active, the drivers append parameter
/// samples to the ensemble state; before each step they are split off and
/// handed to `eom` per member, overriding the model's fixed values.
pub trait Dynamics: Sync {
    /// Dimension of the dynamical state.
    fn state_dim(&self) -> usize;

    /// Number of estimable parameters the model recognizes.
    fn param_dim(&self) -> usize {
        0
    }

    /// The equation of motion `dx/dt = f(x, t; params)`. An empty `params`
    /// slice means the model's own fixed parameter values apply.
    fn eom(&self, t: f64, x: &DVector<f64>, params: &[f64]) -> DVector<f64>;
}
