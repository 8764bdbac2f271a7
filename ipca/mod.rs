pub mod comm;
pub mod config;
pub mod context;
pub mod error;
pub mod linalg;
pub mod main;
pub mod merge;
pub mod model;
pub mod partition;
pub mod snapshot;
pub mod source;
pub mod stats;
pub mod timing;
pub mod tsqr;

pub use comm::{COORDINATOR_RANK, CommError, Communicator, LocalCommunicator, run_local_group};
pub use config::{ConfigError, DataSection, ModelSection, RunConfig, RunSection};
pub use context::WorkerContext;
pub use error::IpcaError;
pub use model::{IncrementalPca, ModelDims, Role};
pub use partition::{Partition, RowRange};
pub use snapshot::PcaSnapshot;
pub use source::{BlockSource, DenseBlockSource, Observations, SourceError};
pub use timing::{Stage, StageTimings, TimingLog};
