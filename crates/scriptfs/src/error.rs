//! Error type returned by filesystem operations

use libc::c_int;

use crate::config::ConfigError;
use crate::passthrough::PassthroughError;
use crate::script::ScriptError;

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error(transparent)]
    Passthrough(#[from] PassthroughError),

    /// Mutation attempted on a virtual file
    #[error("virtual file {0} is read-only")]
    PermissionDenied(String),

    /// A script tried to read the virtual file it is generating
    #[error("recursive generation of virtual file {0}")]
    RecursiveGeneration(String),

    #[error("no such entry: {0}")]
    NotFound(String),
}

impl From<std::io::Error> for FsError {
    fn from(e: std::io::Error) -> Self {
        FsError::Passthrough(PassthroughError::Io(e))
    }
}

impl FsError {
    /// The errno reported to the filesystem driver
    pub fn errno(&self) -> c_int {
        match self {
            FsError::Config(_) | FsError::Script(_) => libc::EIO,
            FsError::Passthrough(PassthroughError::Io(e)) => e.raw_os_error().unwrap_or(libc::EIO),
            FsError::Passthrough(PassthroughError::PathEscape(_)) => libc::EACCES,
            FsError::PermissionDenied(_) => libc::EACCES,
            FsError::RecursiveGeneration(_) => libc::EDEADLK,
            FsError::NotFound(_) => libc::ENOENT,
        }
    }

    /// Same error as an `io::Error`, for callers that speak std I/O
    pub fn into_io(self) -> std::io::Error {
        match self {
            FsError::Passthrough(PassthroughError::Io(e)) => e,
            other => std::io::Error::from_raw_os_error(other.errno()),
        }
    }
}
