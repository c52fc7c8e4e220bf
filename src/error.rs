//! Crate error type.

use nix::errno::Errno;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by gadget declaration, binding and endpoint I/O.
#[derive(Debug, Error)]
pub enum Error {
    /// A declaration was rejected before touching the kernel.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The host is missing a prerequisite (configfs, kernel module,
    /// privileges, UDC hardware).
    #[error("{0}")]
    Environment(String),

    /// No entry exists under `/sys/class/udc`.
    #[error("no USB device controller found under /sys/class/udc")]
    NoUdc,

    /// More than one UDC exists and none was selected explicitly.
    #[error("multiple USB device controllers found, select one by name: {0:?}")]
    AmbiguousUdc(Vec<String>),

    /// `bind()` was called on a gadget that is already bound.
    #[error("gadget is already bound")]
    AlreadyBound,

    /// A lifecycle operation was attempted in the wrong state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A system call failed.
    #[error("{op}: {errno}")]
    Os { op: &'static str, errno: Errno },

    /// Generic I/O failure with no more specific classification.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The host sent something we cannot decode or act on.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The operation is not valid for this endpoint or topology.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// A deadline elapsed; the message names what was being awaited.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// The FunctionFS string table has differing counts across languages.
    #[error("string count differs across languages")]
    StringsDifferAcrossLanguages,

    /// A descriptor could not be serialized.
    #[error("descriptor packing failed: {0}")]
    Packing(String),
}

impl Error {
    /// Wrap an errno from a named system call.
    pub(crate) fn os(op: &'static str, errno: Errno) -> Self {
        Error::Os { op, errno }
    }

    /// The errno carried by this error, if any.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Error::Os { errno, .. } => Some(*errno),
            Error::Io(err) => err.raw_os_error().map(Errno::from_raw),
            _ => None,
        }
    }
}

impl From<libudev::Error> for Error {
    fn from(err: libudev::Error) -> Self {
        Error::Environment(err.to_string())
    }
}

impl From<packed_struct::PackingError> for Error {
    fn from(err: packed_struct::PackingError) -> Self {
        Error::Packing(err.to_string())
    }
}
