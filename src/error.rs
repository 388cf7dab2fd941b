use thiserror::Error;

/// Errors surfaced by the store, grouped into caller-side contract
/// violations, internal invariant violations, and I/O.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Caller-side contract violation: bad arguments, duplicate names, renaming meta, etc.
    #[error("{0}")]
    IllegalArgument(String),

    /// Internal invariant violated, or the store is in a state that forbids the operation.
    #[error("{0}")]
    IllegalState(String),

    /// A chunk referenced by a page position or by meta could not be found.
    #[error("chunk {0} not found")]
    ChunkNotFound(u32),

    /// The requested version is not known: some chunk it depends on no longer exists.
    #[error("version {0} is not known")]
    UnknownVersion(u64),

    /// The leading two header blocks and the trailing header block of the newest
    /// chunk all failed their Fletcher-32 checksum.
    #[error("file header is corrupt")]
    HeaderCorrupt,

    /// A chunk or page failed an integrity check on read.
    #[error("data corruption detected at offset 0x{offset:x}, length {len}")]
    DataCorruption { offset: u64, len: usize },

    /// `formatRead` on disk is newer than this implementation supports.
    #[error("store format {found} is newer than the supported read format {supported}")]
    UnsupportedFormat { found: u32, supported: u32 },

    /// Positioned I/O, truncate, or file-lock failure, with the operation that failed.
    #[error("I/O error during {context}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    pub(crate) fn illegal_argument(msg: impl Into<String>) -> Self {
        Self::IllegalArgument(msg.into())
    }

    pub(crate) fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }
}

/// A specialized `Result` for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
