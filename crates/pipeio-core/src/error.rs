//! Error types for pipe operations

use core::fmt;

use crate::cancel::CancellationToken;
use crate::status::NativeCode;

/// Result type for pipe operations
pub type PipeResult<T> = Result<T, PipeError>;

/// Errors surfaced to callers of the pipe engine
#[derive(Debug, Clone)]
pub enum PipeError {
    /// Read on a pipe end that cannot read
    ReadNotSupported,

    /// Write on a pipe end that cannot write
    WriteNotSupported,

    /// Handshake not finished yet
    NotConnected,

    /// Pipe was closed by its owner
    PipeClosed,

    /// Peer went away; carries the native code that reported it
    PipeBroken(NativeCode),

    /// Handle is invalid (closed or recycled underneath us)
    InvalidHandle,

    /// End of data
    EndOfFile,

    /// Operation was cancelled; carries the token that fired
    /// (`CancellationToken::none()` if no token caused it)
    Canceled(CancellationToken),

    /// Any other native failure, code attached verbatim
    Io(NativeCode),

    /// Operation not supported by pipes (seek, length, ...)
    Unsupported(&'static str),

    /// Operation not valid in the current mode or state
    InvalidOperation(&'static str),

    /// Worker pool is shut down or its queue is full
    WorkerUnavailable,

    /// Invalid configuration
    Config(&'static str),
}

impl PipeError {
    /// The native code behind this error, if one exists
    pub fn native_code(&self) -> Option<NativeCode> {
        match self {
            PipeError::PipeBroken(code) | PipeError::Io(code) => Some(*code),
            PipeError::InvalidHandle => Some(NativeCode::InvalidHandle),
            PipeError::EndOfFile => Some(NativeCode::HandleEof),
            _ => None,
        }
    }

    /// Whether this is a cancellation
    #[inline]
    pub fn is_canceled(&self) -> bool {
        matches!(self, PipeError::Canceled(_))
    }
}

impl fmt::Display for PipeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipeError::ReadNotSupported => write!(f, "pipe does not support reading"),
            PipeError::WriteNotSupported => write!(f, "pipe does not support writing"),
            PipeError::NotConnected => write!(f, "pipe has not been connected yet"),
            PipeError::PipeClosed => write!(f, "pipe is closed"),
            PipeError::PipeBroken(code) => write!(f, "pipe is broken ({})", code),
            PipeError::InvalidHandle => write!(f, "pipe handle is invalid"),
            PipeError::EndOfFile => write!(f, "unexpected end of data"),
            PipeError::Canceled(_) => write!(f, "operation canceled"),
            PipeError::Io(code) => write!(f, "pipe I/O failed: {}", code),
            PipeError::Unsupported(what) => write!(f, "{} is not supported on pipes", what),
            PipeError::InvalidOperation(msg) => write!(f, "invalid operation: {}", msg),
            PipeError::WorkerUnavailable => write!(f, "worker pool unavailable"),
            PipeError::Config(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for PipeError {}

impl From<PipeError> for std::io::Error {
    fn from(e: PipeError) -> Self {
        use std::io::ErrorKind;
        let kind = match &e {
            PipeError::ReadNotSupported
            | PipeError::WriteNotSupported
            | PipeError::Unsupported(_) => ErrorKind::Unsupported,
            PipeError::NotConnected => ErrorKind::NotConnected,
            PipeError::PipeClosed | PipeError::PipeBroken(_) => ErrorKind::BrokenPipe,
            PipeError::EndOfFile => ErrorKind::UnexpectedEof,
            PipeError::Canceled(_) => ErrorKind::Interrupted,
            PipeError::InvalidOperation(_) | PipeError::Config(_) => ErrorKind::InvalidInput,
            PipeError::WorkerUnavailable => ErrorKind::WouldBlock,
            PipeError::InvalidHandle => {
                return std::io::Error::from_raw_os_error(libc::EBADF);
            }
            PipeError::Io(code) => {
                return std::io::Error::from_raw_os_error(code.raw());
            }
        };
        std::io::Error::new(kind, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = PipeError::PipeBroken(NativeCode::BrokenPipe);
        assert_eq!(format!("{}", e), "pipe is broken (broken pipe)");

        let e = PipeError::Io(NativeCode::Os(5));
        assert_eq!(format!("{}", e), "pipe I/O failed: errno 5");
    }

    #[test]
    fn test_native_code() {
        assert_eq!(
            PipeError::Io(NativeCode::Os(7)).native_code(),
            Some(NativeCode::Os(7))
        );
        assert_eq!(PipeError::PipeClosed.native_code(), None);
    }

    #[test]
    fn test_io_error_conversion() {
        let io: std::io::Error = PipeError::PipeBroken(NativeCode::BrokenPipe).into();
        assert_eq!(io.kind(), std::io::ErrorKind::BrokenPipe);

        let io: std::io::Error = PipeError::Io(NativeCode::Os(libc::EIO)).into();
        assert_eq!(io.raw_os_error(), Some(libc::EIO));

        let io: std::io::Error = PipeError::Unsupported("seek").into();
        assert_eq!(io.kind(), std::io::ErrorKind::Unsupported);
    }
}
