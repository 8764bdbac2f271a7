use dyn_stack::{MemBuffer, MemStack};
use faer::diag::{Diag, DiagRef};
use faer::linalg::svd::{self, ComputeSvdVectors};
use faer::{Mat, MatRef, get_global_parallelism};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2, s};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("SVD failed to converge on a {rows}x{cols} matrix")]
    SvdNoConvergence { rows: usize, cols: usize },
}

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

fn diag_to_array(diag: DiagRef<'_, f64>) -> Array1<f64> {
    let mat = diag.column_vector().as_mat();
    Array1::from_shape_fn(mat.nrows(), |i| mat[(i, 0)])
}

enum FaerStorage<'a> {
    Borrowed(MatRef<'a, f64>),
    Owned(Mat<f64>),
}

impl<'a> FaerStorage<'a> {
    #[inline]
    fn as_ref(&self) -> MatRef<'_, f64> {
        match self {
            FaerStorage::Borrowed(view) => *view,
            FaerStorage::Owned(mat) => mat.as_ref(),
        }
    }
}

/// Zero-copy faer view of an ndarray matrix when its memory layout allows it.
pub struct FaerArrayView<'a> {
    storage: FaerStorage<'a>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let storage = if let Some(slice) = array.as_slice_memory_order() {
            if array.is_standard_layout() {
                FaerStorage::Borrowed(MatRef::from_row_major_slice(
                    slice,
                    array.nrows(),
                    array.ncols(),
                ))
            } else if array.t().is_standard_layout() {
                FaerStorage::Borrowed(MatRef::from_column_major_slice(
                    slice,
                    array.nrows(),
                    array.ncols(),
                ))
            } else {
                let (rows, cols) = array.dim();
                FaerStorage::Owned(Mat::from_fn(rows, cols, |i, j| array[(i, j)]))
            }
        } else {
            let (rows, cols) = array.dim();
            FaerStorage::Owned(Mat::from_fn(rows, cols, |i, j| array[(i, j)]))
        };
        Self { storage }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        self.storage.as_ref()
    }
}

/// Thin singular value decomposition `A = U diag(s) Vᵀ`.
///
/// `U` is `rows × min(rows, cols)` and `s` is sorted in descending order, as
/// returned by faer. The right singular vectors are never needed by the
/// incremental update, so they are not computed.
pub trait FaerSvd {
    fn thin_left_svd(&self) -> Result<(Array2<f64>, Array1<f64>), FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerSvd for ArrayBase<S, Ix2> {
    fn thin_left_svd(&self) -> Result<(Array2<f64>, Array1<f64>), FaerLinalgError> {
        let (rows, cols) = self.dim();
        let size = rows.min(cols);
        if size == 0 {
            return Ok((Array2::zeros((rows, 0)), Array1::zeros(0)));
        }

        let faer_view = FaerArrayView::new(self);
        let mut singular = Diag::<f64>::zeros(size);
        let mut u_storage = Mat::<f64>::zeros(rows, size);

        let par = get_global_parallelism();
        let mut mem = MemBuffer::new(svd::svd_scratch::<f64>(
            rows,
            cols,
            ComputeSvdVectors::Thin,
            ComputeSvdVectors::No,
            par,
            Default::default(),
        ));
        let mut stack = MemStack::new(&mut mem);

        svd::svd(
            faer_view.as_ref(),
            singular.as_mut(),
            Some(u_storage.as_mut()),
            None,
            par,
            &mut stack,
            Default::default(),
        )
        .map_err(|_| FaerLinalgError::SvdNoConvergence { rows, cols })?;

        Ok((mat_to_array(u_storage.as_ref()), diag_to_array(singular.as_ref())))
    }
}

/// Reduced QR factorization padded to the column count.
///
/// For an `m × w` input this always returns `Q` of shape `m × w` and an upper
/// triangular `R` of shape `w × w` with `A = Q R`. When `m < w` the trailing
/// columns of `Q` and rows of `R` are zero, which keeps every worker's
/// contribution to a stacked factorization the same size.
pub trait FaerQr {
    fn padded_qr(&self) -> (Array2<f64>, Array2<f64>);
}

impl<S: Data<Elem = f64>> FaerQr for ArrayBase<S, Ix2> {
    fn padded_qr(&self) -> (Array2<f64>, Array2<f64>) {
        let (rows, cols) = self.dim();
        let mut q_padded = Array2::zeros((rows, cols));
        let mut r_padded = Array2::zeros((cols, cols));
        if rows == 0 || cols == 0 {
            return (q_padded, r_padded);
        }

        let faer_view = FaerArrayView::new(self);
        let qr = faer_view.as_ref().qr();
        let q = mat_to_array(qr.compute_thin_Q().as_ref());
        let r = mat_to_array(qr.R());

        let rank = rows.min(cols).min(q.ncols()).min(r.nrows());
        q_padded
            .slice_mut(s![.., ..rank])
            .assign(&q.slice(s![.., ..rank]));
        for i in 0..rank {
            for j in i..cols {
                r_padded[(i, j)] = r[(i, j)];
            }
        }
        (q_padded, r_padded)
    }
}
