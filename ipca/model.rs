use super::comm::Communicator;
use super::context::WorkerContext;
use super::error::IpcaError;
use super::linalg::FaerSvd;
use super::merge::merge_block;
use super::snapshot::PcaSnapshot;
use super::stats::{RunningMoments, block_mean_and_variance};
use super::timing::{Stage, StageTimings};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use std::time::Instant;

/// Fixed shape parameters of a model.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModelDims {
    /// Feature dimension `d`.
    pub n_features: usize,
    /// Target rank `q`.
    pub n_components: usize,
    /// Nominal block width `m`; no block may be wider.
    pub block_width: usize,
}

impl ModelDims {
    pub fn new(
        n_features: usize,
        n_components: usize,
        block_width: usize,
    ) -> Result<Self, IpcaError> {
        if n_components == 0 || n_components > n_features {
            return Err(IpcaError::InvalidRank {
                components: n_components,
                features: n_features,
            });
        }
        if block_width == 0 {
            return Err(IpcaError::InvalidBlockWidth);
        }
        Ok(Self {
            n_features,
            n_components,
            block_width,
        })
    }
}

/// State only the coordinator holds: the authoritative running moments.
#[derive(Clone, Debug)]
pub struct CoordinatorState {
    moments: RunningMoments,
}

impl CoordinatorState {
    fn new(n_features: usize) -> Self {
        Self {
            moments: RunningMoments::new(n_features),
        }
    }

    pub fn moments(&self) -> &RunningMoments {
        &self.moments
    }

    /// Folds `block` into a copy of the running moments and builds the
    /// augmented matrix `[X - mu_m | sqrt(n m / (n + m)) (mu_m - mu_prior)]`.
    fn prepare_block(
        &self,
        block: ArrayView2<'_, f64>,
        timings: &mut StageTimings,
    ) -> (RunningMoments, Array2<f64>) {
        let n = self.moments.count();
        let m = block.ncols();

        let (moments, block_mean, prior_mean) = timings.time(Stage::Statistics, || {
            let block_moments = block_mean_and_variance(block);
            let mut moments = self.moments.clone();
            let prior_mean = moments.absorb(&block_moments);
            (moments, block_moments.mean, prior_mean)
        });

        let x_aug = timings.time(Stage::Augment, || {
            augment_block(block, block_mean.view(), prior_mean.view(), n, m)
        });

        (moments, x_aug)
    }

    /// Batch PCA of a bootstrap sample: moments plus the thin SVD of the
    /// centered data.
    fn bootstrap(
        &self,
        block: ArrayView2<'_, f64>,
        timings: &mut StageTimings,
    ) -> Result<(RunningMoments, Array2<f64>, Array1<f64>), IpcaError> {
        let block_moments = timings.time(Stage::Statistics, || block_mean_and_variance(block));
        let centered = &block - &block_moments.mean.view().insert_axis(Axis(1));
        let (basis, singular_values) = timings.time(Stage::Svd, || centered.thin_left_svd())?;
        Ok((
            RunningMoments::from_block(block_moments),
            basis,
            singular_values,
        ))
    }
}

fn augment_block(
    block: ArrayView2<'_, f64>,
    block_mean: ArrayView1<'_, f64>,
    prior_mean: ArrayView1<'_, f64>,
    n: usize,
    m: usize,
) -> Array2<f64> {
    let centered = &block - &block_mean.insert_axis(Axis(1));
    let (nf, mf) = (n as f64, m as f64);
    let scale = (nf * mf / (nf + mf)).sqrt();
    let shift = (&block_mean - &prior_mean) * scale;
    let mut x_aug = Array2::zeros((block.nrows(), m + 1));
    x_aug.slice_mut(s![.., ..m]).assign(&centered);
    x_aug.column_mut(m).assign(&shift);
    x_aug
}

/// What a rank contributes beyond the shared worker duties.
#[derive(Clone, Debug)]
pub enum Role {
    /// Owns the running moments, centers and augments each block, and runs
    /// the small factorizations.
    Coordinator(CoordinatorState),
    /// Holds only its rows of the basis and the replicated spectrum.
    Worker,
}

/// One rank's share of a streaming, row-distributed PCA model.
///
/// Every rank of the group calls [`initialize`](Self::initialize) and
/// [`update`](Self::update) with blocks of identical shape in the same order.
/// Only the coordinator reads the block's values; the other ranks use its
/// shape to size their buffers and receive their rows through the scatter.
pub struct IncrementalPca<C> {
    ctx: WorkerContext<C>,
    dims: ModelDims,
    u_local: Array2<f64>,
    singular_values: Array1<f64>,
    n_observations: usize,
    role: Role,
}

impl<C: Communicator> IncrementalPca<C> {
    pub fn new(comm: C, dims: ModelDims) -> Result<Self, IpcaError> {
        let ctx = WorkerContext::new(comm, dims.n_features)?;
        Ok(Self::with_context(ctx, dims))
    }

    /// Zero state: `U = 0`, `S = I`, `n = 0`.
    pub fn with_context(ctx: WorkerContext<C>, dims: ModelDims) -> Self {
        let role = if ctx.is_coordinator() {
            Role::Coordinator(CoordinatorState::new(dims.n_features))
        } else {
            Role::Worker
        };
        let u_local = Array2::zeros((ctx.local_row_count(), dims.n_components));
        Self {
            ctx,
            dims,
            u_local,
            singular_values: Array1::ones(dims.n_components),
            n_observations: 0,
            role,
        }
    }

    pub fn dims(&self) -> ModelDims {
        self.dims
    }

    pub fn context(&self) -> &WorkerContext<C> {
        &self.ctx
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn n_observations(&self) -> usize {
        self.n_observations
    }

    pub fn singular_values(&self) -> ArrayView1<'_, f64> {
        self.singular_values.view()
    }

    /// This rank's rows of the basis.
    pub fn local_basis(&self) -> ArrayView2<'_, f64> {
        self.u_local.view()
    }

    /// Running mean, present on the coordinator only.
    pub fn mean(&self) -> Option<&Array1<f64>> {
        match &self.role {
            Role::Coordinator(state) => Some(state.moments.mean()),
            Role::Worker => None,
        }
    }

    /// Running per-feature variance, present on the coordinator only.
    pub fn total_variance(&self) -> Option<&Array1<f64>> {
        match &self.role {
            Role::Coordinator(state) => Some(state.moments.variance()),
            Role::Worker => None,
        }
    }

    fn check_block(&self, block: ArrayView2<'_, f64>) -> Result<usize, IpcaError> {
        let (rows, cols) = block.dim();
        if rows != self.dims.n_features {
            return Err(IpcaError::FeatureMismatch {
                expected: self.dims.n_features,
                found: rows,
            });
        }
        if cols == 0 {
            return Err(IpcaError::EmptyBlock);
        }
        Ok(cols)
    }

    /// Bootstraps an empty model from a `d × q` sample with one batch SVD.
    pub fn initialize(&mut self, block: ArrayView2<'_, f64>) -> Result<StageTimings, IpcaError> {
        let cols = self.check_block(block)?;
        if self.n_observations != 0 {
            return Err(IpcaError::AlreadyInitialized(self.n_observations));
        }
        if cols != self.dims.n_components {
            return Err(IpcaError::InitializationWidth {
                expected: self.dims.n_components,
                found: cols,
            });
        }

        let started = Instant::now();
        let mut timings = StageTimings::new();
        let q = self.dims.n_components;

        let bootstrap = match &self.role {
            Role::Coordinator(state) => Some(state.bootstrap(block, &mut timings)?),
            Role::Worker => None,
        };

        let u_local = timings.time(Stage::Scatter, || {
            self.ctx
                .scatter_rows(bootstrap.as_ref().map(|(_, u, _)| u.view()), q)
        })?;
        let singular_values = timings.time(Stage::Broadcast, || {
            self.ctx
                .broadcast_vector(bootstrap.as_ref().map(|(_, _, s)| s.view()), q)
        })?;

        if let (Role::Coordinator(state), Some((moments, _, _))) = (&mut self.role, bootstrap) {
            state.moments = moments;
        }
        self.u_local = u_local;
        self.singular_values = singular_values;
        self.n_observations = q;

        timings.record(Stage::UpdateTotal, started.elapsed());
        if self.ctx.is_coordinator() {
            log::info!(
                "Initialized incremental PCA from {} observations ({} features, {} workers)",
                q,
                self.dims.n_features,
                self.ctx.size()
            );
        }
        Ok(timings)
    }

    /// Folds a `d × m'` block into the model.
    pub fn update(&mut self, block: ArrayView2<'_, f64>) -> Result<StageTimings, IpcaError> {
        let cols = self.check_block(block)?;
        if cols > self.dims.block_width {
            return Err(IpcaError::BlockTooWide {
                limit: self.dims.block_width,
                found: cols,
            });
        }

        let started = Instant::now();
        let mut timings = StageTimings::new();

        let prepared = match &self.role {
            Role::Coordinator(state) => Some(state.prepare_block(block, &mut timings)),
            Role::Worker => None,
        };

        let x_aug_local = timings.time(Stage::Scatter, || {
            self.ctx.comm().barrier()?;
            self.ctx
                .scatter_rows(prepared.as_ref().map(|(_, x_aug)| x_aug.view()), cols + 1)
        })?;

        let merged = merge_block(
            &self.ctx,
            self.u_local.view(),
            self.singular_values.view(),
            x_aug_local.view(),
            &mut timings,
        )?;

        if let (Role::Coordinator(state), Some((moments, _))) = (&mut self.role, prepared) {
            state.moments = moments;
        }
        self.u_local = merged.u_local;
        self.singular_values = merged.singular_values;
        self.n_observations += cols;

        timings.record(Stage::UpdateTotal, started.elapsed());
        if self.ctx.is_coordinator() {
            log::debug!(
                "Absorbed block of {} observations; n = {}, leading singular value {:.6e}",
                cols,
                self.n_observations,
                self.singular_values.first().copied().unwrap_or(0.0)
            );
        }
        Ok(timings)
    }

    /// Assembles the full basis on the coordinator. Other ranks take part in
    /// the gather and receive `None`.
    pub fn materialize(&self) -> Result<Option<PcaSnapshot>, IpcaError> {
        let basis = self.ctx.gather_rows(self.u_local.view())?;
        let snapshot = match (basis, &self.role) {
            (Some(basis), Role::Coordinator(state)) => Some(PcaSnapshot {
                basis,
                singular_values: self.singular_values.clone(),
                mean: state.moments.mean().clone(),
                total_variance: state.moments.variance().clone(),
                n_observations: self.n_observations,
            }),
            _ => None,
        };
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipca::comm::{COORDINATOR_RANK, LocalCommunicator, run_local_group};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn single_rank() -> LocalCommunicator {
        LocalCommunicator::group(1).remove(COORDINATOR_RANK)
    }

    #[test]
    fn dims_reject_invalid_rank_and_width() {
        assert!(matches!(
            ModelDims::new(4, 0, 3),
            Err(IpcaError::InvalidRank { .. })
        ));
        assert!(matches!(
            ModelDims::new(4, 5, 3),
            Err(IpcaError::InvalidRank { .. })
        ));
        assert!(matches!(
            ModelDims::new(4, 2, 0),
            Err(IpcaError::InvalidBlockWidth)
        ));
    }

    #[test]
    fn zero_state_matches_lifecycle_contract() {
        let model = IncrementalPca::new(single_rank(), ModelDims::new(3, 2, 4).unwrap()).unwrap();
        assert_eq!(model.n_observations(), 0);
        assert_eq!(model.singular_values(), array![1.0, 1.0]);
        assert!(model.local_basis().iter().all(|&v| v == 0.0));
        assert_eq!(model.mean().unwrap(), &Array1::<f64>::zeros(3));
    }

    #[test]
    fn preconditions_leave_state_untouched() {
        let mut model =
            IncrementalPca::new(single_rank(), ModelDims::new(3, 1, 2).unwrap()).unwrap();
        let wrong_rows = Array2::<f64>::zeros((2, 2));
        let too_wide = Array2::<f64>::ones((3, 3));
        let empty = Array2::<f64>::zeros((3, 0));

        assert!(matches!(
            model.update(wrong_rows.view()),
            Err(IpcaError::FeatureMismatch {
                expected: 3,
                found: 2
            })
        ));
        assert!(matches!(
            model.update(too_wide.view()),
            Err(IpcaError::BlockTooWide { limit: 2, found: 3 })
        ));
        assert!(matches!(
            model.update(empty.view()),
            Err(IpcaError::EmptyBlock)
        ));
        assert!(matches!(
            model.initialize(too_wide.view()),
            Err(IpcaError::InitializationWidth { .. })
        ));
        assert_eq!(model.n_observations(), 0);
        assert_eq!(model.singular_values(), array![1.0]);
    }

    #[test]
    fn initialize_twice_is_rejected() {
        let mut model =
            IncrementalPca::new(single_rank(), ModelDims::new(3, 2, 4).unwrap()).unwrap();
        let sample = array![[1.0, 2.0], [0.0, 1.0], [3.0, -1.0]];
        model.initialize(sample.view()).unwrap();
        assert_eq!(model.n_observations(), 2);
        assert!(matches!(
            model.initialize(sample.view()),
            Err(IpcaError::AlreadyInitialized(2))
        ));
    }

    #[test]
    fn augmentation_column_encodes_mean_shift() {
        let block = array![[1.0, 3.0], [2.0, 2.0]];
        let block_mean = array![2.0, 2.0];
        let prior = array![0.0, 4.0];
        let x_aug = augment_block(block.view(), block_mean.view(), prior.view(), 2, 2);
        assert_eq!(x_aug.dim(), (2, 3));
        assert_eq!(x_aug.column(0), array![-1.0, 0.0]);
        assert_eq!(x_aug.column(1), array![1.0, 0.0]);
        // sqrt(2 * 2 / 4) = 1
        assert_abs_diff_eq!(x_aug[(0, 2)], 2.0);
        assert_abs_diff_eq!(x_aug[(1, 2)], -2.0);

        let first = augment_block(block.view(), block_mean.view(), prior.view(), 0, 2);
        assert!(first.column(2).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn workers_hold_no_moments_but_share_the_spectrum() {
        let block = Array2::from_shape_fn((5, 3), |(i, j)| {
            ((i + 1) * (j + 2)) as f64 + 0.1 * (i * j * j) as f64
        });
        let results = run_local_group(2, |comm| {
            let dims = ModelDims::new(5, 2, 3).unwrap();
            let mut model = IncrementalPca::new(comm, dims).unwrap();
            model.update(block.view()).unwrap();
            (
                model.mean().is_some(),
                model.singular_values().to_owned(),
                model.n_observations(),
            )
        })
        .unwrap();

        assert!(results[0].0);
        assert!(!results[1].0);
        assert_eq!(results[0].1, results[1].1);
        assert_eq!(results[0].2, 3);
        assert_eq!(results[1].2, 3);
    }
}
