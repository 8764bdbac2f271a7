//! Tall-and-skinny QR over a row-partitioned matrix.
//!
//! Each rank factors its own rows, the small `R` factors are stacked and
//! factored once more on the coordinator, and the second-level `Q` is used to
//! rotate every rank's local `Q` into a globally orthonormal factor.
//!
//! A rank owning fewer rows than columns pads its `R` with zero rows. Those
//! rows are dropped before the coordinator factorization, so the second-level
//! `Q` never places weight on a padded column of a local `Q`.

use super::comm::Communicator;
use super::context::WorkerContext;
use super::error::IpcaError;
use super::linalg::FaerQr;
use super::partition::Partition;
use super::timing::{Stage, StageTimings};
use ndarray::{Array2, ArrayView2, s};

/// Result of [`distributed_qr`] on one rank.
#[derive(Clone, Debug)]
pub struct DistributedQr {
    /// This rank's rows of the orthonormal factor, `count[rank] × k` with
    /// `k = min(d, w)`.
    pub q_local: Array2<f64>,
    /// Upper trapezoidal `k × w` factor, identical on every rank.
    pub r: Array2<f64>,
}

/// Rows of each rank's padded `R` that can be nonzero, and where they land
/// in the compacted stack.
struct StackLayout {
    kept: Vec<usize>,
    offsets: Vec<usize>,
    total: usize,
}

impl StackLayout {
    fn new(partition: &Partition, w: usize) -> Self {
        let kept: Vec<usize> = (0..partition.n_workers())
            .map(|rank| partition.count(rank).min(w))
            .collect();
        let mut offsets = Vec::with_capacity(kept.len());
        let mut total = 0;
        for &rows in &kept {
            offsets.push(total);
            total += rows;
        }
        Self {
            kept,
            offsets,
            total,
        }
    }

    fn compact(&self, r_stack: &Array2<f64>, w: usize) -> Array2<f64> {
        let mut compact = Array2::zeros((self.total, w));
        for (rank, (&rows, &offset)) in self.kept.iter().zip(&self.offsets).enumerate() {
            compact
                .slice_mut(s![offset..offset + rows, ..])
                .assign(&r_stack.slice(s![rank * w..rank * w + rows, ..]));
        }
        compact
    }
}

/// Factors the row-partitioned matrix whose local rows are `a_local`.
///
/// Every rank must pass the same column count `w`. A rank that owns no rows
/// contributes nothing to the stack and receives an empty `Q`.
pub fn distributed_qr<C: Communicator>(
    ctx: &WorkerContext<C>,
    a_local: ArrayView2<'_, f64>,
    timings: &mut StageTimings,
) -> Result<DistributedQr, IpcaError> {
    let w = a_local.ncols();
    debug_assert_eq!(a_local.nrows(), ctx.local_row_count());

    let layout = StackLayout::new(ctx.partition(), w);
    let k = layout.total.min(w);

    let (q_first, r_first) = timings.time(Stage::QrLocal, || a_local.padded_qr());

    let stacked = timings.time(Stage::Gather, || ctx.gather_stacked(r_first.view()))?;

    let second_level = stacked.map(|r_stack| {
        timings.time(Stage::QrGlobal, || {
            let (q_stack, r) = layout.compact(&r_stack, w).padded_qr();
            (
                q_stack.slice(s![.., ..k]).to_owned(),
                r.slice(s![..k, ..]).to_owned(),
            )
        })
    });

    let (q_stack, r) = timings.time(Stage::Broadcast, || {
        let q_stack = ctx.broadcast_matrix(
            second_level.as_ref().map(|(q, _)| q.view()),
            layout.total,
            k,
        )?;
        let r = ctx.broadcast_matrix(second_level.as_ref().map(|(_, r)| r.view()), k, w)?;
        Ok::<_, IpcaError>((q_stack, r))
    })?;

    let rank = ctx.rank();
    let (offset, kept) = (layout.offsets[rank], layout.kept[rank]);
    let rotation = q_stack.slice(s![offset..offset + kept, ..]);
    let q_local = timings.time(Stage::QrLocal, || {
        q_first.slice(s![.., ..kept]).dot(&rotation)
    });

    log::debug!(
        "rank {}: distributed QR of {} local rows x {} columns",
        rank,
        a_local.nrows(),
        w
    );

    Ok(DistributedQr { q_local, r })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipca::comm::run_local_group;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, Axis, concatenate};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_matrix(rows: usize, cols: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-1.0..1.0))
    }

    fn run_distributed(a: &Array2<f64>, size: usize) -> Vec<DistributedQr> {
        run_local_group(size, |comm| {
            let ctx = WorkerContext::new(comm, a.nrows()).unwrap();
            let local = a.slice(s![ctx.local_rows(), ..]);
            let mut timings = StageTimings::new();
            distributed_qr(&ctx, local, &mut timings).unwrap()
        })
        .unwrap()
    }

    fn assemble_q(parts: &[DistributedQr]) -> Array2<f64> {
        let views: Vec<_> = parts.iter().map(|p| p.q_local.view()).collect();
        concatenate(Axis(0), &views).unwrap()
    }

    fn assert_factorization(a: &Array2<f64>, parts: &[DistributedQr]) {
        let w = a.ncols();
        let q = assemble_q(parts);
        assert_eq!(q.dim(), a.dim());

        for part in &parts[1..] {
            assert_eq!(part.r, parts[0].r);
        }
        let r = &parts[0].r;
        for i in 0..w {
            for j in 0..i {
                assert_abs_diff_eq!(r[(i, j)], 0.0, epsilon = 1e-12);
            }
        }

        let rebuilt = q.dot(r);
        for (lhs, rhs) in rebuilt.iter().zip(a.iter()) {
            assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-10);
        }

        let gram = q.t().dot(&q);
        for i in 0..w {
            for j in 0..w {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(gram[(i, j)], expected, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn tall_matrix_over_several_ranks() {
        let a = random_matrix(40, 5, 1);
        for size in [1, 2, 3, 4] {
            let parts = run_distributed(&a, size);
            assert_factorization(&a, &parts);
        }
    }

    #[test]
    fn ranks_with_fewer_rows_than_columns() {
        let a = random_matrix(9, 4, 2);
        let parts = run_distributed(&a, 4);
        assert_factorization(&a, &parts);
    }

    #[test]
    fn more_ranks_than_rows() {
        let a = random_matrix(3, 2, 3);
        let parts = run_distributed(&a, 5);
        assert_eq!(parts[4].q_local.dim(), (0, 2));
        assert_factorization(&a, &parts);
    }

    #[test]
    fn rank_deficient_matrix_keeps_an_orthonormal_factor() {
        // Rank two, and every rank of the larger groups owns fewer rows than
        // there are columns.
        let a = random_matrix(9, 2, 6).dot(&random_matrix(2, 5, 7));
        for size in [1, 2, 3, 4, 5] {
            let parts = run_distributed(&a, size);
            assert_factorization(&a, &parts);
        }
    }

    #[test]
    fn fewer_rows_than_columns_overall() {
        let a = random_matrix(3, 5, 8);
        let parts = run_distributed(&a, 2);
        let q = assemble_q(&parts);
        assert_eq!(q.dim(), (3, 3));
        assert_eq!(parts[1].r.dim(), (3, 5));

        let rebuilt = q.dot(&parts[0].r);
        for (lhs, rhs) in rebuilt.iter().zip(a.iter()) {
            assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-10);
        }
        let gram = q.t().dot(&q);
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(gram[(i, j)], expected, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn r_matches_single_rank_factor_up_to_row_signs() {
        let a = random_matrix(30, 4, 4);
        let single = run_distributed(&a, 1);
        let split = run_distributed(&a, 3);
        for i in 0..4 {
            let sign = (single[0].r[(i, i)] * split[0].r[(i, i)]).signum();
            for j in 0..4 {
                assert_abs_diff_eq!(
                    single[0].r[(i, j)],
                    sign * split[0].r[(i, j)],
                    epsilon = 1e-10
                );
            }
        }
    }

    #[test]
    fn timings_cover_each_phase() {
        let a = random_matrix(12, 3, 5);
        let stages = run_local_group(2, |comm| {
            let ctx = WorkerContext::new(comm, a.nrows()).unwrap();
            let local = a.slice(s![ctx.local_rows(), ..]);
            let mut timings = StageTimings::new();
            distributed_qr(&ctx, local, &mut timings).unwrap();
            timings
                .samples()
                .iter()
                .map(|(stage, _)| *stage)
                .collect::<Vec<_>>()
        })
        .unwrap();

        assert!(stages[0].contains(&Stage::QrGlobal));
        assert!(!stages[1].contains(&Stage::QrGlobal));
        for ranks in &stages {
            assert!(ranks.contains(&Stage::QrLocal));
            assert!(ranks.contains(&Stage::Gather));
            assert!(ranks.contains(&Stage::Broadcast));
        }
    }
}
