use super::comm::{COORDINATOR_RANK, CommError, Communicator};
use super::error::IpcaError;
use super::partition::Partition;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use std::ops::Range;

fn row_major(matrix: ArrayView2<'_, f64>) -> Vec<f64> {
    matrix.iter().copied().collect()
}

fn from_row_major(rows: usize, cols: usize, values: &[f64]) -> Array2<f64> {
    Array2::from_shape_fn((rows, cols), |(i, j)| values[i * cols + j])
}

/// Everything a worker needs to take part in a distributed operation: its
/// communicator and the row-assignment table shared by the whole group.
pub struct WorkerContext<C> {
    comm: C,
    partition: Partition,
}

impl<C: Communicator> WorkerContext<C> {
    pub fn new(comm: C, n_features: usize) -> Result<Self, IpcaError> {
        let partition = Partition::new(n_features, comm.size())?;
        Ok(Self { comm, partition })
    }

    /// Wraps a prebuilt table, which must describe the communicator's group.
    pub fn with_partition(comm: C, partition: Partition) -> Result<Self, IpcaError> {
        if partition.n_workers() != comm.size() {
            return Err(IpcaError::WorkerCountMismatch {
                communicator: comm.size(),
                partition: partition.n_workers(),
            });
        }
        Ok(Self { comm, partition })
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn size(&self) -> usize {
        self.comm.size()
    }

    pub fn is_coordinator(&self) -> bool {
        self.comm.rank() == COORDINATOR_RANK
    }

    pub fn local_rows(&self) -> Range<usize> {
        self.partition.rows(self.comm.rank())
    }

    pub fn local_row_count(&self) -> usize {
        self.partition.count(self.comm.rank())
    }

    /// Distributes the rows of the coordinator's `d × width` matrix so that
    /// every rank receives exactly its partition rows. Only the coordinator's
    /// `full` is read.
    pub fn scatter_rows(
        &self,
        full: Option<ArrayView2<'_, f64>>,
        width: usize,
    ) -> Result<Array2<f64>, CommError> {
        let counts = self.partition.element_counts(width);
        let send = full.map(row_major);
        let mut local = vec![0.0; self.local_row_count() * width];
        self.comm
            .scatterv(COORDINATOR_RANK, send.as_deref(), &counts, &mut local)?;
        Ok(from_row_major(self.local_row_count(), width, &local))
    }

    /// Reassembles a row-distributed matrix on the coordinator. Other ranks
    /// receive `None`.
    pub fn gather_rows(&self, local: ArrayView2<'_, f64>) -> Result<Option<Array2<f64>>, CommError> {
        let width = local.ncols();
        let counts = self.partition.element_counts(width);
        let send = row_major(local);
        if self.is_coordinator() {
            let mut full = vec![0.0; self.partition.n_features() * width];
            self.comm
                .gatherv(COORDINATOR_RANK, &send, &counts, Some(&mut full))?;
            Ok(Some(from_row_major(self.partition.n_features(), width, &full)))
        } else {
            self.comm.gatherv(COORDINATOR_RANK, &send, &counts, None)?;
            Ok(None)
        }
    }

    /// Stacks one equally sized matrix per rank on the coordinator, in rank
    /// order. Other ranks receive `None`.
    pub fn gather_stacked(
        &self,
        local: ArrayView2<'_, f64>,
    ) -> Result<Option<Array2<f64>>, CommError> {
        let (rows, cols) = local.dim();
        let counts = vec![rows * cols; self.size()];
        let send = row_major(local);
        if self.is_coordinator() {
            let mut stacked = vec![0.0; self.size() * rows * cols];
            self.comm
                .gatherv(COORDINATOR_RANK, &send, &counts, Some(&mut stacked))?;
            Ok(Some(from_row_major(self.size() * rows, cols, &stacked)))
        } else {
            self.comm.gatherv(COORDINATOR_RANK, &send, &counts, None)?;
            Ok(None)
        }
    }

    /// Replicates the coordinator's `rows × cols` matrix on every rank.
    pub fn broadcast_matrix(
        &self,
        value: Option<ArrayView2<'_, f64>>,
        rows: usize,
        cols: usize,
    ) -> Result<Array2<f64>, CommError> {
        let mut buffer = match value {
            Some(matrix) if self.is_coordinator() => row_major(matrix),
            _ => vec![0.0; rows * cols],
        };
        self.comm.broadcast(COORDINATOR_RANK, &mut buffer)?;
        Ok(from_row_major(rows, cols, &buffer))
    }

    /// Replicates the coordinator's vector of length `len` on every rank.
    pub fn broadcast_vector(
        &self,
        value: Option<ArrayView1<'_, f64>>,
        len: usize,
    ) -> Result<Array1<f64>, CommError> {
        let mut buffer = match value {
            Some(vector) if self.is_coordinator() => vector.to_vec(),
            _ => vec![0.0; len],
        };
        self.comm.broadcast(COORDINATOR_RANK, &mut buffer)?;
        Ok(Array1::from(buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipca::comm::run_local_group;
    use ndarray::{Array2, s};

    #[test]
    fn scatter_and_gather_rows_follow_the_partition() {
        let full = Array2::from_shape_fn((7, 3), |(i, j)| (10 * i + j) as f64);
        let results = run_local_group(3, |comm| {
            let ctx = WorkerContext::new(comm, 7).unwrap();
            let view = ctx.is_coordinator().then(|| full.view());
            let local = ctx.scatter_rows(view, 3).unwrap();
            let rows = ctx.local_rows();
            assert_eq!(local, full.slice(s![rows, ..]));
            ctx.gather_rows(local.view()).unwrap()
        })
        .unwrap();

        assert_eq!(results[0].as_ref().unwrap(), &full);
        assert!(results[1].is_none());
        assert!(results[2].is_none());
    }

    #[test]
    fn gather_stacked_orders_blocks_by_rank() {
        let results = run_local_group(3, |comm| {
            let ctx = WorkerContext::new(comm, 4).unwrap();
            let block = Array2::from_elem((2, 2), ctx.rank() as f64);
            ctx.gather_stacked(block.view()).unwrap()
        })
        .unwrap();

        let stacked = results[0].as_ref().unwrap();
        assert_eq!(stacked.dim(), (6, 2));
        for rank in 0..3 {
            let rows = stacked.slice(s![2 * rank..2 * rank + 2, ..]);
            assert!(rows.iter().all(|&v| v == rank as f64));
        }
    }

    #[test]
    fn broadcast_matrix_replicates_coordinator_value() {
        let source = Array2::from_shape_fn((2, 3), |(i, j)| (i * 3 + j) as f64 + 0.5);
        let results = run_local_group(4, |comm| {
            let ctx = WorkerContext::new(comm, 9).unwrap();
            let value = ctx.is_coordinator().then(|| source.view());
            ctx.broadcast_matrix(value, 2, 3).unwrap()
        })
        .unwrap();
        for matrix in results {
            assert_eq!(matrix, source);
        }
    }

    #[test]
    fn mismatched_partition_is_rejected() {
        let results = run_local_group(2, |comm| {
            let partition = Partition::new(5, 3).unwrap();
            WorkerContext::with_partition(comm, partition).is_err()
        })
        .unwrap();
        assert!(results.into_iter().all(|rejected| rejected));
    }
}
