use thiserror::Error;

/// Errors raised by the document replica.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReplicaError {
    /// The bytes were not a decodable update. Nothing was applied.
    #[error("corrupt update payload: {0}")]
    CorruptPayload(String),

    /// The update decoded but could not be integrated.
    #[error("failed to integrate update: {0}")]
    Integrate(String),

    /// An observer could not be registered (document mid-transaction).
    #[error("failed to observe document: {0}")]
    Observe(String),
}

impl From<yrs::encoding::read::Error> for ReplicaError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        ReplicaError::CorruptPayload(e.to_string())
    }
}
