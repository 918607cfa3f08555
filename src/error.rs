//! Error types for rxpool.

use thiserror::Error;

/// Result type alias using rxpool's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for buffer pool operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The buffer region was rejected at pool construction: misaligned,
    /// too small, not a whole number of bpages, or too large to address
    /// with 32-bit offsets.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The descriptor or per-core arrays could not be allocated.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// The pool could not admit the request; not enough free bpages.
    ///
    /// The caller is expected to park the message and retry after the
    /// pool's free-page hook fires.
    #[error("not enough free bpages")]
    NotEnoughFree,
}
