use nalgebra::{DMatrix, DVector};

use crate::errors::DaError;

/// The alternating observation operator used by all twin experiments.
///
/// The operator restricts an ensemble to `obs_dim` of its `state_dim` rows
/// (dropping every other row as the observation network thins, see
/// [`observed_rows`]) and then applies a componentwise nonlinearity selected
/// by `gamma`:
///
/// * `gamma = 1`: identity (the linear benchmark configuration);
/// * `gamma > 1`: `x ↦ (x/2)·(1 + |x/10|^(gamma−1))`;
/// * `gamma = 0`: `x ↦ 0.05·x²`;
/// * `gamma < 0`: `x ↦ x·exp(−gamma·x)`.
///
/// The operator is deterministic and pure; it never consumes randomness.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObsOperator {
    pub gamma: f64,
}

impl ObsOperator {
    pub fn linear() -> Self {
        Self { gamma: 1.0 }
    }

    pub fn with_gamma(gamma: f64) -> Self {
        Self { gamma }
    }

    /// Maps one component through the nonlinearity.
    fn component(&self, x: f64) -> f64 {
        if (self.gamma - 1.0).abs() < f64::EPSILON {
            x
        } else if self.gamma > 1.0 {
            (x / 2.0) * (1.0 + (x / 10.0).abs().powf(self.gamma - 1.0))
        } else if self.gamma == 0.0 {
            0.05 * x * x
        } else if self.gamma < 0.0 {
            x * (-self.gamma * x).exp()
        } else {
            // Intermediate gamma in (0, 1) falls through to the identity.
            x
        }
    }

    /// Maps a `sys_dim x N_ens` ensemble into a `obs_dim x N_ens` observed
    /// ensemble. When parameter samples are appended to the state (i.e.,
    /// the ensemble has more rows than `state_dim`), the trailing parameter
    /// rows are never observed.
    pub fn observe(
        &self,
        ens: &DMatrix<f64>,
        obs_dim: usize,
        state_dim: usize,
    ) -> Result<DMatrix<f64>, DaError> {
        let rows = observed_rows(state_dim, obs_dim)?;
        let n_ens = ens.ncols();
        Ok(DMatrix::from_fn(obs_dim, n_ens, |i, j| {
            self.component(ens[(rows[i], j)])
        }))
    }

    /// Maps a single state column; used by the relinearizing optimizers to
    /// evaluate the observation of an iterate mean.
    pub fn observe_state(
        &self,
        x: &DVector<f64>,
        obs_dim: usize,
        state_dim: usize,
    ) -> Result<DVector<f64>, DaError> {
        let rows = observed_rows(state_dim, obs_dim)?;
        Ok(DVector::from_fn(obs_dim, |i, _| self.component(x[rows[i]])))
    }
}

/// Returns the 0-based state rows retained by the alternating operator.
///
/// With `R = state_dim − obs_dim`, the rules are, in order:
/// full rank keeps every row; more than half keeps the leading
/// `state_dim − 2R` rows then every second row of the remainder; exactly
/// half keeps the odd rows (1-based); less than half keeps the first
/// `obs_dim` odd rows. An empty observation vector is rejected.
pub fn observed_rows(state_dim: usize, obs_dim: usize) -> Result<Vec<usize>, DaError> {
    if obs_dim == 0 || obs_dim > state_dim {
        return Err(DaError::ObsDim { obs_dim, state_dim });
    }
    if obs_dim == state_dim {
        return Ok((0..state_dim).collect());
    }
    let r = state_dim - obs_dim;
    let rows = if 2 * obs_dim > state_dim {
        // Dense head, then every second row of the tail.
        let mut rows: Vec<usize> = (0..state_dim - 2 * r).collect();
        rows.extend((state_dim - 2 * r + 1..state_dim).step_by(2));
        rows
    } else {
        // Odd 1-based rows, truncated to the observation dimension.
        (0..state_dim).step_by(2).take(obs_dim).collect()
    };
    debug_assert_eq!(rows.len(), obs_dim);
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_oversized_observations() {
        assert!(observed_rows(40, 0).is_err());
        assert!(observed_rows(40, 41).is_err());
    }

    #[test]
    fn full_rank_is_identity() {
        assert_eq!(observed_rows(5, 5).unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn half_rank_keeps_odd_rows() {
        assert_eq!(observed_rows(6, 3).unwrap(), vec![0, 2, 4]);
    }
}
