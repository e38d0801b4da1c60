use std::io;
use thiserror::Error;

/// Error kinds reported by every adapter operation
#[derive(Error, Debug)]
pub enum FsError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Out of memory")]
    OutOfMemory,

    #[error("Feature unavailable: {0}")]
    Unavailable(String),

    #[error("Stale or unknown file handle: {0:#x}")]
    BadHandle(u64),

    #[error("OS error {0}: {msg}", msg = os_message(.0))]
    Underlying(i32),
}

fn os_message(code: &i32) -> String {
    io::Error::from_raw_os_error(*code).to_string()
}

impl FsError {
    /// Convert error to libc errno for FUSE responses
    pub fn to_errno(&self) -> i32 {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::NotADirectory(_) => libc::ENOTDIR,
            FsError::IsADirectory(_) => libc::EISDIR,
            FsError::PermissionDenied(_) => libc::EACCES,
            FsError::NotSupported(_) => libc::ENOSYS,
            FsError::OutOfMemory => libc::ENOMEM,
            FsError::Unavailable(_) => libc::ENOTSUP,
            FsError::BadHandle(_) => libc::EBADF,
            FsError::Underlying(code) => *code,
        }
    }

    /// Capture `errno` left behind by the last failed libc call
    pub fn last_os_error() -> Self {
        io::Error::last_os_error().into()
    }

    /// True if this error means the addressed entry does not exist
    pub fn is_not_found(&self) -> bool {
        self.to_errno() == libc::ENOENT
    }
}

impl From<io::Error> for FsError {
    fn from(e: io::Error) -> Self {
        FsError::Underlying(e.raw_os_error().unwrap_or(libc::EIO))
    }
}

/// Result type alias for adapter operations
pub type Result<T> = std::result::Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_underlying_code_passes_through() {
        let err: FsError = io::Error::from_raw_os_error(libc::EXDEV).into();
        assert_eq!(err.to_errno(), libc::EXDEV);
        assert!(matches!(err, FsError::Underlying(libc::EXDEV)));
    }

    #[test]
    fn test_io_error_without_code_is_eio() {
        let err: FsError = io::Error::new(io::ErrorKind::Other, "boom").into();
        assert_eq!(err.to_errno(), libc::EIO);
    }

    #[test]
    fn test_adapter_kinds() {
        assert_eq!(FsError::NotFound("x".into()).to_errno(), libc::ENOENT);
        assert_eq!(FsError::IsADirectory("/".into()).to_errno(), libc::EISDIR);
        assert_eq!(FsError::PermissionDenied("w".into()).to_errno(), libc::EACCES);
        assert_eq!(FsError::OutOfMemory.to_errno(), libc::ENOMEM);
        assert_eq!(FsError::BadHandle(7).to_errno(), libc::EBADF);
    }

    #[test]
    fn test_not_found_covers_os_enoent() {
        assert!(FsError::NotFound("a".into()).is_not_found());
        assert!(FsError::Underlying(libc::ENOENT).is_not_found());
        assert!(!FsError::Underlying(libc::EIO).is_not_found());
    }
}
