use super::error::IpcaError;
use std::fmt;
use std::ops::Range;

/// Contiguous block of feature rows owned by one worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RowRange {
    pub start: usize,
    pub count: usize,
}

impl RowRange {
    pub fn end(&self) -> usize {
        self.start + self.count
    }

    pub fn as_range(&self) -> Range<usize> {
        self.start..self.end()
    }
}

/// Assignment of the feature axis `[0, d)` to workers.
///
/// Every scatter and gather in the crate takes its per-rank shapes from this
/// table, so it is built once per process and shared by reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    n_features: usize,
    ranges: Vec<RowRange>,
}

impl Partition {
    /// Splits `n_features` rows over `n_workers` ranks. The first
    /// `n_features % n_workers` ranks receive one extra row.
    pub fn new(n_features: usize, n_workers: usize) -> Result<Self, IpcaError> {
        if n_workers == 0 {
            return Err(IpcaError::NoWorkers);
        }

        let base = n_features / n_workers;
        let remainder = n_features % n_workers;
        let mut ranges = Vec::with_capacity(n_workers);
        let mut start = 0;
        for rank in 0..n_workers {
            let count = base + usize::from(rank < remainder);
            ranges.push(RowRange { start, count });
            start += count;
        }
        debug_assert_eq!(start, n_features);

        Ok(Self { n_features, ranges })
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn n_workers(&self) -> usize {
        self.ranges.len()
    }

    pub fn range(&self, rank: usize) -> RowRange {
        self.ranges[rank]
    }

    pub fn rows(&self, rank: usize) -> Range<usize> {
        self.ranges[rank].as_range()
    }

    pub fn count(&self, rank: usize) -> usize {
        self.ranges[rank].count
    }

    pub fn ranges(&self) -> &[RowRange] {
        &self.ranges
    }

    /// Element counts per rank for a row-major matrix of `width` columns.
    pub fn element_counts(&self, width: usize) -> Vec<usize> {
        self.ranges.iter().map(|range| range.count * width).collect()
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} features over {} workers",
            self.n_features,
            self.n_workers()
        )?;
        for (rank, range) in self.ranges.iter().enumerate() {
            writeln!(
                f,
                "  rank {rank:>4}: rows {:>8}..{:<8} ({} rows)",
                range.start,
                range.end(),
                range.count
            )?;
        }
        Ok(())
    }
}
