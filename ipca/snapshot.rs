use super::error::IpcaError;
use ndarray::{Array1, Array2, ArrayView2, Axis};

/// Fully assembled model, available on the coordinator after
/// [`IncrementalPca::materialize`](super::model::IncrementalPca::materialize).
#[derive(Clone, Debug, PartialEq)]
pub struct PcaSnapshot {
    /// Orthonormal `d × q` basis.
    pub basis: Array2<f64>,
    /// Leading `q` singular values of the centered data, descending.
    pub singular_values: Array1<f64>,
    pub mean: Array1<f64>,
    /// Per-feature sample variance (1 ddof).
    pub total_variance: Array1<f64>,
    pub n_observations: usize,
}

impl PcaSnapshot {
    pub fn n_features(&self) -> usize {
        self.basis.nrows()
    }

    pub fn n_components(&self) -> usize {
        self.basis.ncols()
    }

    /// Variance captured by each component, `s² / (n - 1)`.
    pub fn explained_variance(&self) -> Array1<f64> {
        let dof = self.n_observations.saturating_sub(1).max(1) as f64;
        self.singular_values.mapv(|s| s * s / dof)
    }

    /// Share of the total per-feature variance captured by each component.
    pub fn explained_variance_ratio(&self) -> Array1<f64> {
        let total = self.total_variance.sum();
        let explained = self.explained_variance();
        if total > 0.0 {
            explained / total
        } else {
            Array1::zeros(explained.len())
        }
    }

    /// Scores of `d × k` observations on the basis after centering with the
    /// running mean; the result is `q × k`.
    pub fn project(&self, observations: ArrayView2<'_, f64>) -> Result<Array2<f64>, IpcaError> {
        if observations.nrows() != self.n_features() {
            return Err(IpcaError::FeatureMismatch {
                expected: self.n_features(),
                found: observations.nrows(),
            });
        }
        let centered = &observations - &self.mean.view().insert_axis(Axis(1));
        Ok(self.basis.t().dot(&centered))
    }
}
