//! Error types for the cachetable.

use std::io;
use thiserror::Error;

use crate::types::BlockKey;

/// Result type alias for cachetable operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for cache operations.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// I/O error from a backing file.
    #[error("I/O error: {0}")]
    Io(String),

    /// Data corruption detected.
    #[error("Corruption detected: {0}")]
    Corruption(String),

    /// Block checksum mismatch.
    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A pair with this identity is already in the cache.
    #[error("Block already cached: {0}")]
    AlreadyExists(BlockKey),

    /// The request could not be satisfied without blocking; retry later.
    #[error("Try again")]
    TryAgain,

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Operation is not valid in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The cachefile has been closed or is being closed.
    #[error("Cachefile is closed: {0}")]
    CacheFileClosed(String),

    /// A resource is still in use (pinned pairs, pending jobs).
    #[error("Busy: {0}")]
    Busy(String),

    /// A caller-supplied callback failed.
    #[error("Callback failed: {0}")]
    Callback(String),

    /// The cachetable has been shut down.
    #[error("Cachetable is closed")]
    CachetableClosed,

    /// Internal error (should not happen).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl Error {
    /// Create a corruption error with the given message.
    pub fn corruption<S: Into<String>>(msg: S) -> Self {
        Error::Corruption(msg.into())
    }

    /// Create an invalid state error.
    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Error::InvalidState(msg.into())
    }

    /// Create a callback error.
    pub fn callback<S: Into<String>>(msg: S) -> Self {
        Error::Callback(msg.into())
    }

    /// Create an internal error.
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// Check if this error is the non-blocking "try again" signal.
    pub fn is_try_again(&self) -> bool {
        matches!(self, Error::TryAgain)
    }

    /// Check if this error is recoverable by retrying.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::TryAgain | Error::Busy(_))
    }

    /// Check if this error indicates corruption.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_) | Error::CrcMismatch { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlockNum, FileId};

    #[test]
    fn test_error_display() {
        let err = Error::corruption("bad node");
        assert_eq!(format!("{}", err), "Corruption detected: bad node");

        let err = Error::AlreadyExists(BlockKey::new(FileId(3), BlockNum(9)));
        assert_eq!(format!("{}", err), "Block already cached: 3:9");
    }

    #[test]
    fn test_error_is_recoverable() {
        assert!(Error::TryAgain.is_recoverable());
        assert!(Error::TryAgain.is_try_again());
        assert!(Error::Busy("pinned".into()).is_recoverable());
        assert!(!Error::Io("disk".into()).is_recoverable());
    }

    #[test]
    fn test_error_is_corruption() {
        assert!(Error::corruption("bad").is_corruption());
        assert!(Error::CrcMismatch {
            expected: 1,
            actual: 2
        }
        .is_corruption());
        assert!(!Error::TryAgain.is_corruption());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = io::Error::new(io::ErrorKind::Other, "short write");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(ref m) if m.contains("short write")));
    }
}
