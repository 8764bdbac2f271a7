use ndarray::{Array1, ArrayView1, ArrayView2, Zip};

/// Feature count above which per-row moments are computed on the rayon pool.
const PARALLEL_ROW_THRESHOLD: usize = 4_096;

/// Per-feature mean and sample variance of one block of observations.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockMoments {
    pub mean: Array1<f64>,
    pub variance: Array1<f64>,
    pub count: usize,
}

fn row_moments(row: ArrayView1<'_, f64>) -> (f64, f64) {
    let k = row.len();
    if k == 0 {
        return (0.0, 0.0);
    }
    let mean = row.sum() / k as f64;
    if k == 1 {
        return (mean, 0.0);
    }
    let ss: f64 = row.iter().map(|&x| (x - mean) * (x - mean)).sum();
    (mean, ss / (k - 1) as f64)
}

/// Mean and 1-ddof variance of every row of a `d × k` block.
///
/// A single-column block has no defined sample variance; it reports zeros.
pub fn block_mean_and_variance(block: ArrayView2<'_, f64>) -> BlockMoments {
    let (d, k) = block.dim();
    let mut mean = Array1::zeros(d);
    let mut variance = Array1::zeros(d);

    if d >= PARALLEL_ROW_THRESHOLD {
        Zip::from(&mut mean)
            .and(&mut variance)
            .and(block.rows())
            .par_for_each(|mu, var, row| {
                (*mu, *var) = row_moments(row);
            });
    } else {
        Zip::from(&mut mean)
            .and(&mut variance)
            .and(block.rows())
            .for_each(|mu, var, row| {
                (*mu, *var) = row_moments(row);
            });
    }

    BlockMoments {
        mean,
        variance,
        count: k,
    }
}

/// Mean of `n + m` observations from the means of two disjoint groups.
pub fn combine_mean(
    mu_n: ArrayView1<'_, f64>,
    mu_m: ArrayView1<'_, f64>,
    n: usize,
    m: usize,
) -> Array1<f64> {
    if n == 0 {
        return mu_m.to_owned();
    }
    let (nf, mf) = (n as f64, m as f64);
    let total = nf + mf;
    Zip::from(mu_n)
        .and(mu_m)
        .map_collect(|&a, &b| (nf * a + mf * b) / total)
}

/// Pooled 1-ddof variance of `n + m` observations (Chan et al.), exact given
/// exact per-group means and variances.
pub fn combine_variance(
    s_n: ArrayView1<'_, f64>,
    s_m: ArrayView1<'_, f64>,
    mu_n: ArrayView1<'_, f64>,
    mu_m: ArrayView1<'_, f64>,
    n: usize,
    m: usize,
) -> Array1<f64> {
    if n == 0 {
        return s_m.to_owned();
    }
    let (nf, mf) = (n as f64, m as f64);
    let total = nf + mf;
    Zip::from(s_n)
        .and(s_m)
        .and(mu_n)
        .and(mu_m)
        .map_collect(|&sn, &sm, &an, &am| {
            let shift = an - am;
            ((nf - 1.0) * sn + (mf - 1.0) * sm + nf * mf * shift * shift / total) / (total - 1.0)
        })
}

/// Running per-feature mean and variance over every observation seen so far.
#[derive(Clone, Debug, PartialEq)]
pub struct RunningMoments {
    mean: Array1<f64>,
    variance: Array1<f64>,
    count: usize,
}

impl RunningMoments {
    pub fn new(n_features: usize) -> Self {
        Self {
            mean: Array1::zeros(n_features),
            variance: Array1::zeros(n_features),
            count: 0,
        }
    }

    pub fn from_block(block: BlockMoments) -> Self {
        Self {
            mean: block.mean,
            variance: block.variance,
            count: block.count,
        }
    }

    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    pub fn variance(&self) -> &Array1<f64> {
        &self.variance
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Folds a block into the running statistics and returns the mean that
    /// was current before the block arrived.
    pub fn absorb(&mut self, block: &BlockMoments) -> Array1<f64> {
        let (n, m) = (self.count, block.count);
        // The pooled variance needs the prior mean, so it is combined first.
        self.variance = combine_variance(
            self.variance.view(),
            block.variance.view(),
            self.mean.view(),
            block.mean.view(),
            n,
            m,
        );
        let merged = combine_mean(self.mean.view(), block.mean.view(), n, m);
        self.count += m;
        std::mem::replace(&mut self.mean, merged)
    }
}
