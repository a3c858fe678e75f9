//! Sandboxed filesystem gateway: the `fs` surface.
pub mod api;
pub mod filesystem;
pub mod handle;
pub mod mount;
pub mod path;

use std::io;

use thiserror::Error;

use crate::dispatch::CallError;

pub use api::FsApi;
pub use filesystem::FileSystem;
pub use mount::{DirMount, Mount};

/// A filesystem failure, carrying the message the script sees.
///
/// Path-carrying variants hold the sandbox path without its leading
/// slash; the message adds it back.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("Invalid Path")]
    InvalidPath,
    #[error("/{0}: No such file")]
    NotFound(String),
    #[error("/{0}: Not a directory")]
    NotADirectory(String),
    #[error("/{0}: Access denied")]
    AccessDenied(String),
    #[error("/{0}: File exists")]
    Exists(String),
    #[error("/{0}: Cannot write to directory")]
    IsDirectory(String),
    #[error("Out of space")]
    OutOfSpace,
    #[error("Can't {0} a directory inside itself")]
    Recursive(&'static str),
}

impl FsError {
    /// Maps an I/O error on `path` into the failure a script sees. Raw
    /// I/O messages are never passed through.
    pub fn from_io(path: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => FsError::NotFound(path.to_string()),
            _ if err.to_string() == OUT_OF_SPACE => FsError::OutOfSpace,
            _ => FsError::AccessDenied(path.to_string()),
        }
    }

    /// Re-targets a mount-local error at the sandbox-wide `path`.
    pub fn at(self, path: &str) -> Self {
        let path = path.to_string();
        match self {
            FsError::NotFound(_) => FsError::NotFound(path),
            FsError::NotADirectory(_) => FsError::NotADirectory(path),
            FsError::AccessDenied(_) => FsError::AccessDenied(path),
            FsError::Exists(_) => FsError::Exists(path),
            FsError::IsDirectory(_) => FsError::IsDirectory(path),
            other => other,
        }
    }
}

/// Message of the I/O error raised when a capacity-limited mount fills up.
pub(crate) const OUT_OF_SPACE: &str = "Out of space";

impl From<FsError> for CallError {
    fn from(err: FsError) -> Self {
        CallError::Message(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        assert_eq!(FsError::NotFound("a/b".into()).to_string(), "/a/b: No such file");
        assert_eq!(FsError::InvalidPath.to_string(), "Invalid Path");
        assert_eq!(
            FsError::Recursive("move").to_string(),
            "Can't move a directory inside itself"
        );
    }

    #[test]
    fn test_from_io_hides_raw_messages() {
        let err = io::Error::new(io::ErrorKind::Other, "disk on fire at /home/user");
        assert_eq!(FsError::from_io("x", err), FsError::AccessDenied("x".into()));
        let err = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(FsError::from_io("x", err), FsError::NotFound("x".into()));
        let err = io::Error::new(io::ErrorKind::Other, OUT_OF_SPACE);
        assert_eq!(FsError::from_io("x", err), FsError::OutOfSpace);
    }

    #[test]
    fn test_at_rewrites_path() {
        assert_eq!(
            FsError::NotFound("a".into()).at("rom/a"),
            FsError::NotFound("rom/a".into())
        );
        assert_eq!(FsError::OutOfSpace.at("x"), FsError::OutOfSpace);
    }
}
