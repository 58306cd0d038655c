use tandem_core::ReplicaError;
use thiserror::Error;

/// Failures reported by a backing store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached. Retried.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store rejected the request due to load. Retried.
    #[error("store throttled: {0}")]
    Throttled(String),

    /// The caller may not read or write this path.
    #[error("permission denied on {0}")]
    PermissionDenied(String),

    /// Internal database failure.
    #[error("database error: {0}")]
    Database(String),

    /// A stored value could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A single document exceeds the store's size limit.
    #[error("document {path} is {size} bytes, store limit is {limit}")]
    TooLarge {
        path: String,
        size: usize,
        limit: usize,
    },
}

impl StoreError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Throttled(_))
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Failures decoding persisted snapshot records.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed record: {0}")]
    Malformed(String),

    #[error("failed to encode record: {0}")]
    Encode(String),

    /// Chunks do not reassemble into the snapshot the header describes.
    #[error("reassembly mismatch: {0}")]
    ReassemblyMismatch(String),

    #[error("decompression failed: {0}")]
    Decompression(String),

    #[error("chunk size must be positive (store limit {0} bytes is too small)")]
    ChunkSize(usize),
}

/// Top-level error for provider operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Replica(#[from] ReplicaError),

    #[error("provider already started")]
    AlreadyStarted,

    #[error("provider not started")]
    NotStarted,

    #[error("provider is disconnected")]
    Disconnected,
}

impl SyncError {
    /// Transient errors are retried by the synchronizer.
    ///
    /// A snapshot that fails to decode is usually one whose replaced
    /// generation was deleted while we read it, so decode failures count as
    /// transient. One that keeps failing is reported through
    /// [`is_corruption`](Self::is_corruption) once retries run out.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Store(e) => e.is_transient(),
            SyncError::Codec(CodecError::ChunkSize(_) | CodecError::Encode(_)) => false,
            SyncError::Codec(_) => true,
            SyncError::Replica(_) => true,
            SyncError::AlreadyStarted | SyncError::NotStarted | SyncError::Disconnected => false,
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, SyncError::Store(StoreError::PermissionDenied(_)))
    }

    /// The stored snapshot itself could not be read back.
    pub fn is_corruption(&self) -> bool {
        match self {
            SyncError::Codec(CodecError::ChunkSize(_) | CodecError::Encode(_)) => false,
            SyncError::Codec(_) | SyncError::Replica(_) => true,
            _ => false,
        }
    }
}
