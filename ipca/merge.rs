use super::comm::Communicator;
use super::context::WorkerContext;
use super::error::IpcaError;
use super::linalg::FaerSvd;
use super::timing::{Stage, StageTimings};
use super::tsqr::distributed_qr;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, concatenate, s};

/// Basis and spectrum produced by one merge, truncated to the target rank.
#[derive(Clone, Debug)]
pub struct MergedBasis {
    pub u_local: Array2<f64>,
    pub singular_values: Array1<f64>,
}

/// Folds this rank's rows of the augmented block into the current rank-`q`
/// factorization.
///
/// `u_local` holds this rank's rows of `U` (`count × q`), `singular_values`
/// the replicated spectrum, and `x_aug_local` this rank's rows of the centered
/// block with the mean-shift column appended (`count × (m' + 1)`). The small
/// SVD runs on the coordinator only; its factors are broadcast so every rank
/// leaves with the same spectrum.
pub fn merge_block<C: Communicator>(
    ctx: &WorkerContext<C>,
    u_local: ArrayView2<'_, f64>,
    singular_values: ArrayView1<'_, f64>,
    x_aug_local: ArrayView2<'_, f64>,
    timings: &mut StageTimings,
) -> Result<MergedBasis, IpcaError> {
    let q = singular_values.len();
    debug_assert_eq!(u_local.ncols(), q);
    debug_assert_eq!(u_local.nrows(), x_aug_local.nrows());

    let us = &u_local * &singular_values;
    let qr_input = concatenate(Axis(1), &[us.view(), x_aug_local.view()])
        .map_err(|_| IpcaError::FeatureMismatch {
            expected: u_local.nrows(),
            found: x_aug_local.nrows(),
        })?;
    let factors = distributed_qr(ctx, qr_input.view(), timings)?;

    let small_svd = if ctx.is_coordinator() {
        Some(timings.time(Stage::Svd, || factors.r.thin_left_svd())?)
    } else {
        None
    };

    // `R` is `k × w` with `k = min(d, w)`, so its thin SVD has `k` directions.
    let k = factors.r.nrows();
    let (u_tilde, s_tilde) = timings.time(Stage::Broadcast, || {
        let u_tilde =
            ctx.broadcast_matrix(small_svd.as_ref().map(|(u, _)| u.view()), k, k)?;
        let s_tilde = ctx.broadcast_vector(small_svd.as_ref().map(|(_, s)| s.view()), k)?;
        Ok::<_, IpcaError>((u_tilde, s_tilde))
    })?;

    // Singular values arrive sorted, so the leading columns are the top-q
    // directions of the merged data.
    let u_local = timings.time(Stage::BasisUpdate, || {
        factors.q_local.dot(&u_tilde.slice(s![.., ..q]))
    });
    let singular_values = s_tilde.slice(s![..q]).to_owned();

    Ok(MergedBasis {
        u_local,
        singular_values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipca::comm::run_local_group;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn orthonormal_columns(rows: usize, cols: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let raw = Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-1.0..1.0));
        let (u, _) = raw.thin_left_svd().unwrap();
        u
    }

    #[test]
    fn merge_equals_svd_of_concatenated_factors() {
        let (d, q, m) = (10, 3, 4);
        let u = orthonormal_columns(d, q, 7);
        let sigma = ndarray::array![5.0, 2.0, 0.5];
        let mut rng = StdRng::seed_from_u64(8);
        let x_aug = Array2::from_shape_fn((d, m + 1), |_| rng.gen_range(-1.0..1.0));

        let reference = concatenate![Axis(1), &u * &sigma, x_aug];
        let (ref_u, ref_s) = reference.thin_left_svd().unwrap();

        for size in [1, 3] {
            let results = run_local_group(size, |comm| {
                let ctx = WorkerContext::new(comm, d).unwrap();
                let rows = ctx.local_rows();
                let mut timings = StageTimings::new();
                merge_block(
                    &ctx,
                    u.slice(s![rows.clone(), ..]),
                    sigma.view(),
                    x_aug.slice(s![rows, ..]),
                    &mut timings,
                )
                .unwrap()
            })
            .unwrap();

            for merged in &results {
                assert_eq!(merged.singular_values.len(), q);
                for k in 0..q {
                    assert_abs_diff_eq!(merged.singular_values[k], ref_s[k], epsilon = 1e-10);
                }
            }

            let views: Vec<_> = results.iter().map(|r| r.u_local.view()).collect();
            let merged_u = concatenate(Axis(0), &views).unwrap();
            // Columns agree with the reference up to sign.
            for k in 0..q {
                let alignment = merged_u.column(k).dot(&ref_u.column(k));
                assert_abs_diff_eq!(alignment.abs(), 1.0, epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn merged_spectrum_is_identical_on_every_rank() {
        let (d, q) = (8, 2);
        let u = orthonormal_columns(d, q, 1);
        let sigma = ndarray::array![3.0, 1.0];
        let mut rng = StdRng::seed_from_u64(2);
        let x_aug = Array2::from_shape_fn((d, 3), |_| rng.gen_range(-2.0..2.0));

        let results = run_local_group(4, |comm| {
            let ctx = WorkerContext::new(comm, d).unwrap();
            let rows = ctx.local_rows();
            let mut timings = StageTimings::new();
            merge_block(
                &ctx,
                u.slice(s![rows.clone(), ..]),
                sigma.view(),
                x_aug.slice(s![rows, ..]),
                &mut timings,
            )
            .unwrap()
            .singular_values
        })
        .unwrap();

        for spectrum in &results[1..] {
            assert_eq!(spectrum, &results[0]);
        }
        assert!(results[0][0] >= results[0][1]);
        assert!(results[0][1] >= 0.0);
    }
}
