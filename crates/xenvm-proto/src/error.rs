//! XenVM error types.
//!
//! A single enum covers the three recovery classes the daemon knows about:
//! transient conditions that are retried with a fixed back-off, domain
//! errors that surface to the RPC caller, and fatal errors that stop the
//! daemon.

use serde::{Deserialize, Serialize};

/// Unified error type for all XenVM operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum XvError {
    /// A ring was full or contended; retry after the back-off.
    #[error("try again")]
    Retry,
    /// The ring is suspended.
    #[error("queue is suspended")]
    Suspended,
    #[error("host {0} has not been created")]
    HostNotCreated(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    /// An allocation could not be satisfied; carries the number of extents
    /// actually free.
    #[error("only {0} extents free")]
    OnlyThisMuchFree(u64),
    #[error("volume group is not formatted")]
    NotFormatted,
    #[error("I/O error: {0}")]
    Io(String),
    #[error("{0}")]
    Msg(String),
}

/// Result type alias for XenVM operations.
pub type XvResult<T> = Result<T, XvError>;

impl XvError {
    /// Transient errors are retried in place; everything else propagates.
    pub fn is_transient(&self) -> bool {
        matches!(self, XvError::Retry | XvError::Suspended)
    }

    /// Fatal errors terminate the daemon: the single-writer discipline on
    /// the volume group makes partial-failure recovery unsafe.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            XvError::NotFormatted | XvError::Io(_) | XvError::Msg(_)
        )
    }
}

impl From<std::io::Error> for XvError {
    fn from(e: std::io::Error) -> Self {
        XvError::Io(e.to_string())
    }
}
