use super::comm::{CommError, Communicator, run_local_group};
use super::config::{ConfigError, RunConfig};
use super::error::IpcaError;
use super::model::{IncrementalPca, ModelDims};
use super::snapshot::PcaSnapshot;
use super::source::{BlockSource, Observations, SourceError, column_major_view};
use super::timing::TimingLog;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::convert::Infallible;
use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Name under which the run configuration is copied into the output directory.
pub const CONFIG_COPY_NAME: &str = "run.toml";

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("observation source error: {0}")]
    Source(#[from] SourceError),
    #[error("incremental PCA error: {0}")]
    Ipca(#[from] IpcaError),
    #[error("worker group error: {0}")]
    Comm(#[from] CommError),
    #[error("failed to write CSV output: {0}")]
    Csv(#[from] csv::Error),
    #[error("block buffer has the wrong shape: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("data has {found} features, but the model is configured for {expected}")]
    FeatureMismatch { expected: usize, found: usize },
    #[error("initialization needs {needed} observations, but the data holds only {found}")]
    InsufficientObservations { needed: usize, found: usize },
    #[error("coordinator finished without producing a model")]
    MissingSnapshot,
}

impl From<Infallible> for DriverError {
    fn from(value: Infallible) -> Self {
        match value {}
    }
}

/// Outcome of a completed streaming run.
#[derive(Clone, Debug)]
pub struct RunSummary {
    pub n_observations: usize,
    pub n_components: usize,
    pub n_blocks: usize,
    pub singular_values: Vec<f64>,
    pub explained_variance_ratio: Vec<f64>,
    pub elapsed: Duration,
    pub output_dir: PathBuf,
}

struct WorkerOutcome {
    snapshot: Option<PcaSnapshot>,
    timings: TimingLog,
}

fn create_progress_bar(len: u64) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };
    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    let style = ProgressStyle::with_template(
        "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} blocks ({eta}) {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("█▉▊▋▌▍▎▏  ");
    pb.set_style(style);
    pb
}

/// Executes the run described by `config`: fits the model across
/// `config.run.workers` in-process workers and writes every output file.
pub fn run(config: &RunConfig) -> Result<RunSummary, DriverError> {
    config.validate()?;
    let dims = config.dims()?;
    let started = Instant::now();

    let output_dir = &config.run.output_dir;
    fs::create_dir_all(output_dir)?;
    config.save(&output_dir.join(CONFIG_COPY_NAME))?;

    let observations = config.load_observations()?;
    if observations.n_features() != dims.n_features {
        return Err(DriverError::FeatureMismatch {
            expected: dims.n_features,
            found: observations.n_features(),
        });
    }
    let bootstrap = if config.run.initialize {
        dims.n_components
    } else {
        0
    };
    if observations.n_observations() < bootstrap {
        return Err(DriverError::InsufficientObservations {
            needed: bootstrap,
            found: observations.n_observations(),
        });
    }

    let n_blocks = (observations.n_observations() - bootstrap).div_ceil(dims.block_width);
    log::info!(
        "Streaming {} observations of {} features in {} blocks across {} workers",
        observations.n_observations(),
        dims.n_features,
        n_blocks,
        config.run.workers
    );

    let progress = create_progress_bar(n_blocks as u64);
    let outcomes = run_local_group(config.run.workers, |comm| {
        stream_worker(comm, dims, &observations, config.run.initialize, &progress)
    })?;
    progress.finish_and_clear();

    let outcome = first_error(outcomes)?;
    let snapshot = outcome.snapshot.ok_or(DriverError::MissingSnapshot)?;
    outcome.timings.report();

    write_outputs(output_dir, &snapshot, &outcome.timings)?;

    let summary = RunSummary {
        n_observations: snapshot.n_observations,
        n_components: snapshot.n_components(),
        n_blocks,
        singular_values: snapshot.singular_values.to_vec(),
        explained_variance_ratio: snapshot.explained_variance_ratio().to_vec(),
        elapsed: started.elapsed(),
        output_dir: output_dir.clone(),
    };
    log::info!(
        "Fitted {} components from {} observations in {:.3}s; outputs in {}",
        summary.n_components,
        summary.n_observations,
        summary.elapsed.as_secs_f64(),
        output_dir.display()
    );
    Ok(summary)
}

/// Returns the coordinator's outcome, or the most informative failure.
///
/// When one worker fails its peers usually report a lost connection, so an
/// error that is not a disconnect wins over the rest.
fn first_error(
    outcomes: Vec<Result<WorkerOutcome, DriverError>>,
) -> Result<WorkerOutcome, DriverError> {
    let mut coordinator = None;
    let mut fallback = None;
    for (rank, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            Ok(outcome) if rank == 0 => coordinator = Some(outcome),
            Ok(_) => {}
            Err(err) if is_disconnect(&err) => {
                fallback.get_or_insert(err);
            }
            Err(err) => return Err(err),
        }
    }
    match (fallback, coordinator) {
        (Some(err), _) => Err(err),
        (None, Some(outcome)) => Ok(outcome),
        (None, None) => Err(DriverError::MissingSnapshot),
    }
}

fn is_disconnect(err: &DriverError) -> bool {
    matches!(
        err,
        DriverError::Comm(CommError::Disconnected { .. })
            | DriverError::Ipca(IpcaError::Comm(CommError::Disconnected { .. }))
    )
}

/// Streams the whole observation sequence through one rank's model.
fn stream_worker<C: Communicator>(
    comm: C,
    dims: ModelDims,
    observations: &Observations,
    initialize: bool,
    progress: &ProgressBar,
) -> Result<WorkerOutcome, DriverError> {
    let d = dims.n_features;
    let coordinator = comm.is_coordinator();
    let mut model = IncrementalPca::new(comm, dims)?;
    let mut source = observations.source();
    let mut storage = vec![0.0; d * dims.block_width.max(dims.n_components)];
    let mut timings = TimingLog::new();

    source.reset()?;
    if initialize {
        let cols = source.next_block_into(dims.n_components, &mut storage)?;
        let block = column_major_view(d, cols, &storage)?;
        timings.push(model.initialize(block)?);
    }

    loop {
        let cols = source.next_block_into(dims.block_width, &mut storage)?;
        if cols == 0 {
            break;
        }
        let block = column_major_view(d, cols, &storage)?;
        timings.push(model.update(block)?);
        if coordinator {
            progress.inc(1);
        }
    }

    Ok(WorkerOutcome {
        snapshot: model.materialize()?,
        timings,
    })
}

fn write_outputs(
    output_dir: &Path,
    snapshot: &PcaSnapshot,
    timings: &TimingLog,
) -> Result<(), DriverError> {
    let mut basis = csv::Writer::from_path(output_dir.join("basis.csv"))?;
    let mut header = vec!["feature".to_string()];
    header.extend((1..=snapshot.n_components()).map(|k| format!("pc{k}")));
    basis.write_record(&header)?;
    for (feature, row) in snapshot.basis.rows().into_iter().enumerate() {
        let mut record = vec![feature.to_string()];
        record.extend(row.iter().map(|v| v.to_string()));
        basis.write_record(&record)?;
    }
    basis.flush()?;

    let mut spectrum = csv::Writer::from_path(output_dir.join("spectrum.csv"))?;
    spectrum.write_record([
        "component",
        "singular_value",
        "explained_variance",
        "explained_variance_ratio",
    ])?;
    let explained = snapshot.explained_variance();
    let ratio = snapshot.explained_variance_ratio();
    for (k, s) in snapshot.singular_values.iter().enumerate() {
        spectrum.write_record([
            format!("pc{}", k + 1),
            s.to_string(),
            explained[k].to_string(),
            ratio[k].to_string(),
        ])?;
    }
    spectrum.flush()?;

    let mut moments = csv::Writer::from_path(output_dir.join("moments.csv"))?;
    moments.write_record(["feature", "mean", "variance"])?;
    for (feature, (mean, variance)) in snapshot
        .mean
        .iter()
        .zip(snapshot.total_variance.iter())
        .enumerate()
    {
        moments.write_record([feature.to_string(), mean.to_string(), variance.to_string()])?;
    }
    moments.flush()?;

    timings.write_csv(&output_dir.join("timings.csv"))?;
    Ok(())
}
