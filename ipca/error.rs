use super::comm::CommError;
use super::linalg::FaerLinalgError;
use thiserror::Error;

/// Errors raised by the incremental PCA core.
///
/// Precondition variants are always reported before any collective call is
/// issued, so a rejected block leaves every worker's state untouched.
#[derive(Debug, Error)]
pub enum IpcaError {
    #[error("worker count must be at least one")]
    NoWorkers,
    #[error("target rank must satisfy 1 <= q <= d, got q = {components} for d = {features}")]
    InvalidRank { components: usize, features: usize },
    #[error("nominal block width must be at least one")]
    InvalidBlockWidth,
    #[error("block has {found} feature rows, but the model was built for {expected}")]
    FeatureMismatch { expected: usize, found: usize },
    #[error("block contains no observations")]
    EmptyBlock,
    #[error("block has {found} observations, exceeding the nominal block width of {limit}")]
    BlockTooWide { limit: usize, found: usize },
    #[error("initialization expects exactly {expected} observations, found {found}")]
    InitializationWidth { expected: usize, found: usize },
    #[error("model already holds {0} observations; initialize is only valid on an empty model")]
    AlreadyInitialized(usize),
    #[error(
        "communicator has {communicator} workers but the partition table was built for {partition}"
    )]
    WorkerCountMismatch {
        communicator: usize,
        partition: usize,
    },
    #[error("linear algebra failure: {0}")]
    Linalg(#[from] FaerLinalgError),
    #[error("collective communication failure: {0}")]
    Comm(#[from] CommError),
}
