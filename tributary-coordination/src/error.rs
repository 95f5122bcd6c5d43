use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The referenced partition key does not exist in the coordination store.
    /// The caller should drop the in-progress unit and acquire a new partition.
    #[error("Partition Not Found - {0}")]
    PartitionNotFound(String),

    /// The caller no longer (or never) owned the partition. This is the
    /// expected outcome of a lease expiring mid-processing and is fatal only
    /// for that unit of work, not for the pipeline.
    #[error("Partition Not Owned - {0}")]
    PartitionNotOwned(String),

    /// The store rejected or failed a conditional write for reasons other
    /// than ownership. Retry the surrounding operation with backoff.
    #[error("Partition Update - {0}")]
    PartitionUpdate(String),

    /// The store failed a read or could not be reached.
    #[error("Store - {0}")]
    Store(String),

    /// The partition progress state could not be encoded.
    #[error("Serde - {0}")]
    Serde(String),

    #[error("initialize() must be called on the coordinator before any other operation")]
    Uninitialized,
}

impl Error {
    /// Whether the failed operation can be retried as-is. Ownership and
    /// not-found errors are not retryable, the caller has to move on to a
    /// different partition instead.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::PartitionUpdate(_) | Error::Store(_))
    }
}
