use thiserror::Error;

/// Error taxonomy for the balance indexing pipeline.
///
/// Variants carry distinct propagation policy: `UpstreamUnavailable` and
/// `ChainInconsistency` are retried by the caller, `BacktrackLimitReached`
/// and `StoreError` are fatal, `InvalidAddress` is returned directly to the
/// query boundary and never enters the pipeline.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("upstream node unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("chain inconsistency: {0}")]
    ChainInconsistency(String),

    #[error("reorg depth exceeds backtrack limit of {limit} blocks")]
    BacktrackLimitReached { limit: u32 },

    #[error("balance store error: {0}")]
    StoreError(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

impl IndexerError {
    /// Transient errors the driver loop retries in place rather than aborting.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IndexerError::UpstreamUnavailable(_) | IndexerError::ChainInconsistency(_)
        )
    }
}

impl From<rocksdb::Error> for IndexerError {
    fn from(err: rocksdb::Error) -> Self {
        IndexerError::StoreError(err.to_string())
    }
}
