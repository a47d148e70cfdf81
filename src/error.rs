use std::path::Path;
use thiserror::Error;

use crate::overlay::convert::io_error_to_libc;

pub type Result<T> = std::result::Result<T, UnionError>;

#[derive(Error, Debug)]
pub enum UnionError {
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Reserved name: {0}")]
    ReservedName(String),

    #[error("Path too long: {0}")]
    PathTooLong(String),

    #[error("Name too long: {0}")]
    NameTooLong(String),

    #[error("No such file or directory: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not a directory: {0}")]
    NotDirectory(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("Inconsistent branch state: {0}")]
    Inconsistent(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("FUSE error: {0}")]
    Fuse(String),

    #[error("JSON error: {0}")]
    Json(String),
}

impl From<serde_json::Error> for UnionError {
    fn from(err: serde_json::Error) -> Self {
        UnionError::Json(err.to_string())
    }
}

impl UnionError {
    /// The errno reported to the kernel for this error.
    pub fn errno(&self) -> i32 {
        match self {
            UnionError::InvalidPath(_) | UnionError::ReservedName(_) => libc::EINVAL,
            UnionError::PathTooLong(_) | UnionError::NameTooLong(_) => libc::ENAMETOOLONG,
            UnionError::NotFound(_) => libc::ENOENT,
            UnionError::AlreadyExists(_) => libc::EEXIST,
            UnionError::PermissionDenied(_) => libc::EACCES,
            UnionError::NotDirectory(_) => libc::ENOTDIR,
            UnionError::IsDirectory(_) => libc::EISDIR,
            UnionError::DirectoryNotEmpty(_) => libc::ENOTEMPTY,
            UnionError::Inconsistent(_) => libc::EIO,
            UnionError::Io(e) => io_error_to_libc(e),
            UnionError::Config(_) | UnionError::Json(_) => libc::EINVAL,
            UnionError::Fuse(_) => libc::EIO,
        }
    }

    pub(crate) fn not_found(path: &Path) -> Self {
        UnionError::NotFound(path.display().to_string())
    }
}
