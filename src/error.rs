//! Error types for mirror operations.

use std::io;
use thiserror::Error;

/// Coarse classification of a [`MirrorError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A path or name was malformed, or the operation does not apply to it.
    InvalidArgument,
    /// The path, or a parent it depends on, is not in the index.
    NotFound,
    /// The target already exists, or is missing where it must exist.
    Conflict,
    /// A directory would end up inside its own subtree.
    InvalidTopology,
    /// The root was not granted the access the operation needs.
    PermissionDenied,
    /// A call into the external store failed.
    ExternalOperationFailed,
}

/// Errors that can occur while mirroring or mutating the external store.
#[derive(Error, Debug)]
pub enum MirrorError {
    /// Malformed path or name.
    #[error("Invalid argument for {path:?}: {reason}")]
    InvalidArgument {
        /// The offending path or name.
        path: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The path is not in the index.
    #[error("Path not found: {0}")]
    NotFound(String),

    /// A directory was required.
    #[error("Not a directory: {0}")]
    NotADirectory(String),

    /// A file was required.
    #[error("Not a file: {0}")]
    NotAFile(String),

    /// Name collision, or a file that was expected to exist.
    #[error("Conflict at {path}: {reason}")]
    Conflict {
        /// Path the operation would have produced.
        path: String,
        /// Why it cannot.
        reason: String,
    },

    /// Copying a directory into itself or one of its descendants.
    #[error("Cannot place {source_path} inside its own subtree at {destination}")]
    InvalidTopology {
        /// The directory being copied.
        source_path: String,
        /// The requested destination.
        destination: String,
    },

    /// The root is missing the access the operation needs.
    #[error("Permission denied for {0}")]
    PermissionDenied(String),

    /// No root has been opened yet.
    #[error("No root is open")]
    NoRoot,

    /// A store call failed.
    #[error("Failed to {operation} {path}: {source}")]
    External {
        /// What was attempted, e.g. `"write"`.
        operation: &'static str,
        /// Path the call was made for.
        path: String,
        /// The store's error.
        source: io::Error,
    },
}

impl MirrorError {
    pub(crate) fn invalid(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn conflict(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Conflict {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn external(operation: &'static str, path: impl Into<String>, source: io::Error) -> Self {
        Self::External {
            operation,
            path: path.into(),
            source,
        }
    }

    /// The taxonomy bucket this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::NotFound(_) | Self::NotADirectory(_) | Self::NotAFile(_) | Self::NoRoot => {
                ErrorKind::NotFound
            }
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::InvalidTopology { .. } => ErrorKind::InvalidTopology,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::External { .. } => ErrorKind::ExternalOperationFailed,
        }
    }
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, MirrorError>;
