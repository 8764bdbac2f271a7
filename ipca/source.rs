use ndarray::{ArrayView2, ErrorKind, ShapeBuilder, ShapeError};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};
use std::cmp::min;
use std::convert::Infallible;
use std::path::Path;
use thiserror::Error;

/// Streams observations in column blocks.
///
/// Blocks are written column-major into `storage`: observation `j` of the block
/// occupies `storage[j * d..(j + 1) * d]`.
pub trait BlockSource {
    type Error;

    fn n_features(&self) -> usize;
    fn n_observations(&self) -> usize;
    fn reset(&mut self) -> Result<(), Self::Error>;

    /// Fills `storage` with up to `max_cols` observations and returns how many
    /// were written. Zero means the source is exhausted.
    fn next_block_into(
        &mut self,
        max_cols: usize,
        storage: &mut [f64],
    ) -> Result<usize, Self::Error>;
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("invalid observation source: {0}")]
    InvalidInput(&'static str),
    #[error("failed to read observations: {0}")]
    Csv(#[from] csv::Error),
    #[error("line {line}: field {field} is not a number: {value:?}")]
    Parse {
        line: u64,
        field: usize,
        value: String,
    },
    #[error("line {line}: expected {expected} features, found {found}")]
    Ragged {
        line: u64,
        expected: usize,
        found: usize,
    },
}

/// A `d × n` observation matrix held in memory, column-major.
#[derive(Clone, Debug, PartialEq)]
pub struct Observations {
    values: Vec<f64>,
    n_features: usize,
    n_observations: usize,
}

impl Observations {
    pub fn new(
        values: Vec<f64>,
        n_features: usize,
        n_observations: usize,
    ) -> Result<Self, SourceError> {
        DenseBlockSource::new(&values, n_features, n_observations)?;
        Ok(Self {
            values,
            n_features,
            n_observations,
        })
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn n_observations(&self) -> usize {
        self.n_observations
    }

    /// The whole matrix as a `d × n` view.
    pub fn view(&self) -> Result<ArrayView2<'_, f64>, ShapeError> {
        column_major_view(self.n_features, self.n_observations, &self.values)
    }

    pub fn source(&self) -> DenseBlockSource<'_> {
        DenseBlockSource {
            data: &self.values,
            dims: (self.n_features, self.n_observations),
            cursor: 0,
        }
    }
}

/// Views the first `d * cols` values of a column-major buffer as `d × cols`.
pub fn column_major_view(
    n_features: usize,
    cols: usize,
    storage: &[f64],
) -> Result<ArrayView2<'_, f64>, ShapeError> {
    let values = storage
        .get(..n_features * cols)
        .ok_or_else(|| ShapeError::from_kind(ErrorKind::OutOfBounds))?;
    ArrayView2::from_shape((n_features, cols).f(), values)
}

/// Block source over a borrowed column-major buffer.
pub struct DenseBlockSource<'a> {
    data: &'a [f64],
    dims: (usize, usize),
    cursor: usize,
}

impl<'a> DenseBlockSource<'a> {
    pub fn new(
        data: &'a [f64],
        n_features: usize,
        n_observations: usize,
    ) -> Result<Self, SourceError> {
        if n_features == 0 {
            return Err(SourceError::InvalidInput("observations need at least one feature"));
        }
        let expected = n_features
            .checked_mul(n_observations)
            .ok_or(SourceError::InvalidInput("observation matrix dimensions overflow"))?;
        if data.len() != expected {
            return Err(SourceError::InvalidInput(
                "value count does not match the observation matrix dimensions",
            ));
        }
        Ok(Self {
            data,
            dims: (n_features, n_observations),
            cursor: 0,
        })
    }
}

impl BlockSource for DenseBlockSource<'_> {
    type Error = Infallible;

    fn n_features(&self) -> usize {
        self.dims.0
    }

    fn n_observations(&self) -> usize {
        self.dims.1
    }

    fn reset(&mut self) -> Result<(), Self::Error> {
        self.cursor = 0;
        Ok(())
    }

    fn next_block_into(
        &mut self,
        max_cols: usize,
        storage: &mut [f64],
    ) -> Result<usize, Self::Error> {
        let remaining = self.n_observations().saturating_sub(self.cursor);
        let d = self.n_features();
        let ncols = min(min(max_cols, remaining), storage.len() / d);
        if ncols == 0 {
            return Ok(0);
        }
        let len = d * ncols;
        let start = self.cursor * d;
        storage[..len].copy_from_slice(&self.data[start..start + len]);
        self.cursor += ncols;
        Ok(ncols)
    }
}

/// Draws `n_observations` samples of a rank-`latent_rank` signal plus
/// isotropic Gaussian noise of standard deviation `noise`.
///
/// Latent factor `k` is scaled by `1 / (k + 1)` so the population spectrum is
/// strictly decreasing, and every feature carries a random offset so the mean
/// is not zero.
pub fn synthetic_observations(
    n_features: usize,
    n_observations: usize,
    latent_rank: usize,
    noise: f64,
    seed: u64,
) -> Result<Observations, SourceError> {
    if !(noise.is_finite() && noise >= 0.0) {
        return Err(SourceError::InvalidInput(
            "noise must be a finite, non-negative standard deviation",
        ));
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut normal = || -> f64 { StandardNormal.sample(&mut rng) };

    let loadings: Vec<f64> = (0..n_features * latent_rank).map(|_| normal()).collect();
    let offsets: Vec<f64> = (0..n_features).map(|_| 2.0 * normal()).collect();

    let mut values = Vec::with_capacity(n_features * n_observations);
    let mut factors = vec![0.0; latent_rank];
    for _ in 0..n_observations {
        for (k, factor) in factors.iter_mut().enumerate() {
            *factor = normal() / (k + 1) as f64;
        }
        for (i, offset) in offsets.iter().enumerate() {
            let loading = &loadings[i * latent_rank..(i + 1) * latent_rank];
            let signal: f64 = loading.iter().zip(&factors).map(|(l, f)| l * f).sum();
            values.push(offset + signal + noise * normal());
        }
    }
    Observations::new(values, n_features, n_observations)
}

/// Reads a headerless CSV with one observation per row and one feature per
/// column.
pub fn load_observations_csv(path: &Path) -> Result<Observations, SourceError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut values = Vec::new();
    let mut n_features = None;
    let mut n_observations = 0;
    for record in reader.records() {
        let record = record?;
        let line = record.position().map_or(0, |pos| pos.line());
        let expected = *n_features.get_or_insert(record.len());
        if record.len() != expected {
            return Err(SourceError::Ragged {
                line,
                expected,
                found: record.len(),
            });
        }
        for (field, raw) in record.iter().enumerate() {
            let value = raw.parse::<f64>().map_err(|_| SourceError::Parse {
                line,
                field,
                value: raw.to_string(),
            })?;
            values.push(value);
        }
        n_observations += 1;
    }

    let n_features =
        n_features.ok_or(SourceError::InvalidInput("observation file contains no rows"))?;
    Observations::new(values, n_features, n_observations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::io::Write;

    #[test]
    fn dense_source_streams_columns_then_exhausts() {
        let data: Vec<f64> = (0..10).map(|v| v as f64).collect();
        let mut source = DenseBlockSource::new(&data, 2, 5).unwrap();
        let mut storage = vec![0.0; 4];

        assert_eq!(source.next_block_into(2, &mut storage).unwrap(), 2);
        assert_eq!(storage, vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(source.next_block_into(2, &mut storage).unwrap(), 2);
        assert_eq!(source.next_block_into(2, &mut storage).unwrap(), 1);
        assert_eq!(&storage[..2], &[8.0, 9.0]);
        assert_eq!(source.next_block_into(2, &mut storage).unwrap(), 0);

        source.reset().unwrap();
        assert_eq!(source.next_block_into(1, &mut storage).unwrap(), 1);
        assert_eq!(&storage[..2], &[0.0, 1.0]);
    }

    #[test]
    fn dense_source_rejects_mismatched_lengths() {
        let data = vec![0.0; 5];
        assert!(DenseBlockSource::new(&data, 2, 3).is_err());
        assert!(DenseBlockSource::new(&data, 0, 3).is_err());
        assert!(Observations::new(data.clone(), 2, 3).is_err());
        assert!(Observations::new(data, 5, 1).is_ok());
    }

    #[test]
    fn column_major_view_puts_observations_in_columns() {
        let storage = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 99.0];
        let view = column_major_view(3, 2, &storage).unwrap();
        assert!(column_major_view(3, 3, &storage).is_err());
        assert_eq!(view, array![[1.0, 4.0], [2.0, 5.0], [3.0, 6.0]]);
    }

    #[test]
    fn synthetic_data_is_reproducible() {
        let first = synthetic_observations(6, 20, 2, 0.1, 11).unwrap();
        let second = synthetic_observations(6, 20, 2, 0.1, 11).unwrap();
        let other = synthetic_observations(6, 20, 2, 0.1, 12).unwrap();
        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(first.view().unwrap().dim(), (6, 20));
        assert!(synthetic_observations(6, 20, 2, -1.0, 11).is_err());
    }

    #[test]
    fn csv_rows_become_columns() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "1.0, 2.0, 3.0").unwrap();
        writeln!(file, "4.0, 5.0, 6.0").unwrap();
        file.flush().unwrap();

        let observations = load_observations_csv(file.path()).unwrap();
        assert_eq!(observations.n_features(), 3);
        assert_eq!(observations.n_observations(), 2);
        assert_eq!(observations.view().unwrap(), array![[1.0, 4.0], [2.0, 5.0], [3.0, 6.0]]);
    }

    #[test]
    fn csv_reports_ragged_and_non_numeric_rows() {
        let mut ragged = tempfile::NamedTempFile::new().unwrap();
        writeln!(ragged, "1,2,3").unwrap();
        writeln!(ragged, "4,5").unwrap();
        ragged.flush().unwrap();
        assert!(matches!(
            load_observations_csv(ragged.path()),
            Err(SourceError::Ragged {
                line: 2,
                expected: 3,
                found: 2
            })
        ));

        let mut garbled = tempfile::NamedTempFile::new().unwrap();
        writeln!(garbled, "1,x").unwrap();
        garbled.flush().unwrap();
        assert!(matches!(
            load_observations_csv(garbled.path()),
            Err(SourceError::Parse { field: 1, .. })
        ));
    }
}
