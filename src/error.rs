use thiserror::Error;

/// Crate-wide error type, one variant per failure family, following the
/// flat `#[error("...")]` shape the rest of this family of crates uses.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("short read/write on file {file:?} at offset {offset}: expected {expected} bytes, got {actual}")]
    ShortTransfer {
        file: crate::io::FileId,
        offset: u64,
        expected: usize,
        actual: usize,
    },

    #[error("block entered ERROR state for file {file:?} at offset {offset}")]
    BlockError {
        file: crate::io::FileId,
        offset: u64,
    },

    #[error("cache is disabled (not initialised or resized below the minimum block count)")]
    CacheDisabled,

    #[error("resize already in progress")]
    ResizeInProgress,

    #[error("flush aborted after {attempts} consecutive identical errors")]
    FlushAborted { attempts: u32 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("wait timed out after {0:?} (debug timeout mode)")]
    WaitTimeout(std::time::Duration),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("certifier allocation/serialisation error: {0}")]
    Certifier(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;
