//! Error types for poolfs operations
//!
//! Every error can be reduced to one code from the fixed [`Errno`] space the
//! engine's VFS hooks understand.

use thiserror::Error;

/// Filesystem operation result type
pub type Result<T> = std::result::Result<T, FsError>;

/// Numeric error codes understood by the host engine
///
/// The values follow the engine's own errno table, not the host platform's.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Errno {
    /// Bad file descriptor
    EBADF = 8,
    /// File exists
    EEXIST = 20,
    /// Invalid argument
    EINVAL = 28,
    /// Is a directory
    EISDIR = 31,
    /// No such device (mmap of a non-file)
    ENODEV = 43,
    /// No such file or directory
    ENOENT = 44,
    /// Not a directory
    ENOTDIR = 54,
    /// Directory not empty
    ENOTEMPTY = 55,
    /// Operation not permitted (links are unsupported)
    EPERM = 63,
}

impl Errno {
    /// Raw numeric value
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Map a raw numeric value back into the enumeration
    ///
    /// Anything outside the fixed set coerces to `EINVAL`.
    pub fn from_code(code: i32) -> Self {
        match code {
            8 => Errno::EBADF,
            20 => Errno::EEXIST,
            28 => Errno::EINVAL,
            31 => Errno::EISDIR,
            43 => Errno::ENODEV,
            44 => Errno::ENOENT,
            54 => Errno::ENOTDIR,
            55 => Errno::ENOTEMPTY,
            63 => Errno::EPERM,
            _ => Errno::EINVAL,
        }
    }

    /// Default human-readable message
    pub fn message(self) -> &'static str {
        match self {
            Errno::EBADF => "Bad file descriptor",
            Errno::EEXIST => "File exists",
            Errno::EINVAL => "Invalid argument",
            Errno::EISDIR => "Is a directory",
            Errno::ENODEV => "No such device",
            Errno::ENOENT => "No such file or directory",
            Errno::ENOTDIR => "Not a directory",
            Errno::ENOTEMPTY => "Directory not empty",
            Errno::EPERM => "Operation not permitted",
        }
    }
}

impl std::fmt::Display for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

/// Filesystem errors
#[derive(Error, Debug)]
pub enum FsError {
    /// POSIX-style failure carrying an explicit code
    #[error("{message} ({})", .code.code())]
    Errno { code: Errno, message: String },

    /// No pre-allocated backing file left to hand out
    #[error("No more file handles available in the pool")]
    PoolExhausted,

    /// The durable snapshot exists but cannot be parsed
    #[error("Corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    /// Storage primitive failure (contention, closed handle, ...)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Bridge wire-protocol violation
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FsError {
    /// Error with an explicit code and the code's default message
    pub fn errno(code: Errno) -> Self {
        FsError::Errno {
            code,
            message: code.message().to_string(),
        }
    }

    /// Error with an explicit code and a custom message
    pub fn with_message(code: Errno, message: impl Into<String>) -> Self {
        FsError::Errno {
            code,
            message: message.into(),
        }
    }

    /// The errno this error reports to the engine
    pub fn code(&self) -> Errno {
        match self {
            FsError::Errno { code, .. } => *code,
            FsError::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => Errno::ENOENT,
                std::io::ErrorKind::AlreadyExists => Errno::EEXIST,
                _ => Errno::EINVAL,
            },
            FsError::PoolExhausted
            | FsError::CorruptSnapshot(_)
            | FsError::Storage(_)
            | FsError::Config(_)
            | FsError::Protocol(_)
            | FsError::Serialization(_) => Errno::EINVAL,
        }
    }
}

impl From<Errno> for FsError {
    fn from(code: Errno) -> Self {
        FsError::errno(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_codes_coerce_to_einval() {
        assert_eq!(Errno::from_code(44), Errno::ENOENT);
        assert_eq!(Errno::from_code(-1), Errno::EINVAL);
        assert_eq!(Errno::from_code(127), Errno::EINVAL);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(FsError::errno(Errno::ENOTEMPTY).code(), Errno::ENOTEMPTY);
        assert_eq!(FsError::PoolExhausted.code(), Errno::EINVAL);

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(FsError::from(io).code(), Errno::ENOENT);
    }

    #[test]
    fn test_display_keeps_message() {
        let err = FsError::with_message(Errno::ENOENT, "Path not found: /a");
        assert_eq!(err.to_string(), "Path not found: /a (44)");
    }
}
