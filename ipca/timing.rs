use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};

/// Named phases of an `initialize` or `update` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Statistics,
    Augment,
    Scatter,
    QrLocal,
    Gather,
    QrGlobal,
    Broadcast,
    Svd,
    BasisUpdate,
    UpdateTotal,
}

impl Stage {
    pub const ALL: [Stage; 10] = [
        Stage::Statistics,
        Stage::Augment,
        Stage::Scatter,
        Stage::QrLocal,
        Stage::Gather,
        Stage::QrGlobal,
        Stage::Broadcast,
        Stage::Svd,
        Stage::BasisUpdate,
        Stage::UpdateTotal,
    ];

    pub fn describe(self) -> &'static str {
        match self {
            Self::Statistics => "statistics",
            Self::Augment => "augment",
            Self::Scatter => "scatter",
            Self::QrLocal => "qr-local",
            Self::Gather => "gather",
            Self::QrGlobal => "qr-global",
            Self::Broadcast => "broadcast",
            Self::Svd => "svd",
            Self::BasisUpdate => "basis-update",
            Self::UpdateTotal => "update-total",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Ordered `(stage, duration)` samples recorded during one call.
///
/// A stage may appear more than once (a call issues several broadcasts).
#[derive(Clone, Debug, Default)]
pub struct StageTimings {
    samples: Vec<(Stage, Duration)>,
}

impl StageTimings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, stage: Stage, elapsed: Duration) {
        self.samples.push((stage, elapsed));
    }

    /// Runs `f`, recording its wall time under `stage`.
    pub fn time<T>(&mut self, stage: Stage, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        self.record(stage, start.elapsed());
        out
    }

    pub fn samples(&self) -> &[(Stage, Duration)] {
        &self.samples
    }

    pub fn total(&self, stage: Stage) -> Duration {
        self.samples
            .iter()
            .filter(|(s, _)| *s == stage)
            .map(|(_, d)| *d)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Per-stage timing history across the calls of a run.
#[derive(Clone, Debug, Default)]
pub struct TimingLog {
    calls: Vec<StageTimings>,
}

impl TimingLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, timings: StageTimings) {
        self.calls.push(timings);
    }

    pub fn n_calls(&self) -> usize {
        self.calls.len()
    }

    /// Mean time spent in `stage` per call, over calls that entered it.
    pub fn mean_seconds(&self, stage: Stage) -> Option<f64> {
        let per_call: Vec<f64> = self
            .calls
            .iter()
            .filter(|call| call.samples.iter().any(|(s, _)| *s == stage))
            .map(|call| call.total(stage).as_secs_f64())
            .collect();
        if per_call.is_empty() {
            None
        } else {
            Some(per_call.iter().sum::<f64>() / per_call.len() as f64)
        }
    }

    /// Logs the mean per-block time of every recorded stage.
    pub fn report(&self) {
        if self.calls.is_empty() {
            log::info!("No incremental PCA calls have been timed yet");
            return;
        }
        for stage in Stage::ALL {
            if let Some(mean) = self.mean_seconds(stage) {
                log::info!("Mean per-block time of stage '{stage}': {mean:.4e}s");
            }
        }
    }

    /// Writes one `call,stage,seconds` row per recorded sample.
    pub fn write_csv(&self, path: &Path) -> Result<(), csv::Error> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(["call", "stage", "seconds"])?;
        for (call_idx, call) in self.calls.iter().enumerate() {
            for (stage, elapsed) in call.samples() {
                writer.write_record([
                    call_idx.to_string(),
                    stage.describe().to_string(),
                    format!("{:.9}", elapsed.as_secs_f64()),
                ])?;
            }
        }
        writer.flush()?;
        Ok(())
    }
}
