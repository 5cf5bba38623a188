use std::io;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, UmbralError>;

/// Errors surfaced by the engine and the persistent store.
///
/// Commit conflicts are deliberately not represented here: losing the
/// commit race is reported as `Transaction::commit() == false` so the hot
/// path stays a plain boolean. Internal invariant violations panic after
/// logging a diagnostic; they indicate bugs, not recoverable states.
#[derive(Debug, Error)]
pub enum UmbralError {
    /// Underlying file or mapping operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// On-disk state failed validation (bad magic, checksum, truncation).
    #[error("corruption detected: {0}")]
    Corruption(String),
    /// The requested object id is unknown at this snapshot.
    #[error("{0} not found")]
    NotFound(&'static str),
    /// The object was removed, either by this transaction or an earlier one.
    #[error("object was removed")]
    Removed,
    /// A lookup requested a different type than the object was stored with.
    #[error("object has a different type than requested")]
    WrongType,
    /// Caller misuse that is detectable without touching disk.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The arena cannot satisfy an allocation from the mapped region.
    #[error("arena exhausted: {0}")]
    OutOfSpace(String),
    /// The mapped file declares a format this build does not understand.
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u64),
}
