//! Native status codes.
//!
//! Every transport reports the outcome of a native call through the small,
//! closed set of codes below. Classification into connection-state
//! transitions happens once, in the engine; transports only translate their
//! own error space (errno on Linux) into `NativeCode`.

use std::fmt;

/// A native failure (or non-failure) code from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeCode {
    /// Partial message: more data of the current message is pending.
    MoreData,
    /// The peer closed its end.
    BrokenPipe,
    /// The pipe is not connected (peer gone or never attached).
    PipeNotConnected,
    /// The pipe is being closed.
    NoData,
    /// The handle is not valid (closed or recycled).
    InvalidHandle,
    /// End of data reached.
    HandleEof,
    /// The call was aborted by a cancel request.
    OperationAborted,
    /// A cancel request found nothing to cancel.
    NotFound,
    /// Any other native error, carried verbatim.
    Os(i32),
}

impl NativeCode {
    /// Translate a Linux errno into a native code.
    ///
    /// `EINTR` is reported as `OperationAborted`: transports only surface
    /// it when an interrupt was requested, and retry internally otherwise.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EPIPE | libc::ECONNRESET => NativeCode::BrokenPipe,
            libc::ENOTCONN => NativeCode::PipeNotConnected,
            libc::ESHUTDOWN => NativeCode::NoData,
            libc::EBADF => NativeCode::InvalidHandle,
            libc::ECANCELED | libc::EINTR => NativeCode::OperationAborted,
            libc::ENOENT | libc::EALREADY => NativeCode::NotFound,
            other => NativeCode::Os(other),
        }
    }

    /// Read the calling thread's errno and translate it.
    #[inline]
    pub fn last_os_error() -> Self {
        Self::from_errno(last_errno())
    }

    /// The raw errno this code corresponds to.
    pub fn raw(&self) -> i32 {
        match *self {
            NativeCode::MoreData => libc::EMSGSIZE,
            NativeCode::BrokenPipe => libc::EPIPE,
            NativeCode::PipeNotConnected => libc::ENOTCONN,
            NativeCode::NoData => libc::ESHUTDOWN,
            NativeCode::InvalidHandle => libc::EBADF,
            NativeCode::HandleEof => libc::ENODATA,
            NativeCode::OperationAborted => libc::ECANCELED,
            NativeCode::NotFound => libc::ENOENT,
            NativeCode::Os(e) => e,
        }
    }

    /// Peer-disconnected class: moves the connection to Broken.
    #[inline]
    pub fn is_broken(&self) -> bool {
        matches!(
            self,
            NativeCode::BrokenPipe | NativeCode::PipeNotConnected | NativeCode::NoData
        )
    }
}

impl fmt::Display for NativeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeCode::MoreData => write!(f, "more data"),
            NativeCode::BrokenPipe => write!(f, "broken pipe"),
            NativeCode::PipeNotConnected => write!(f, "pipe not connected"),
            NativeCode::NoData => write!(f, "pipe is being closed"),
            NativeCode::InvalidHandle => write!(f, "invalid handle"),
            NativeCode::HandleEof => write!(f, "end of data"),
            NativeCode::OperationAborted => write!(f, "operation aborted"),
            NativeCode::NotFound => write!(f, "nothing to cancel"),
            NativeCode::Os(e) => write!(f, "errno {}", e),
        }
    }
}

/// Errno of the calling thread.
#[inline]
pub fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Result of one native transfer (read or write).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// Completed; `n` bytes moved.
    Done(usize),
    /// Message-mode read filled the buffer; the message continues.
    MoreData(usize),
    /// Failed with a native code.
    Failed(NativeCode),
}

impl Transfer {
    /// Decode a raw completion (`>= 0` byte count, negative errno).
    ///
    /// A zero-byte read is end-of-stream on a pipe or socket: the peer is
    /// gone, which the engine treats as `BrokenPipe`.
    pub fn from_raw_read(result: i64, more: bool) -> Self {
        if result < 0 {
            Transfer::Failed(NativeCode::from_errno((-result) as i32))
        } else if result == 0 {
            Transfer::Failed(NativeCode::BrokenPipe)
        } else if more {
            Transfer::MoreData(result as usize)
        } else {
            Transfer::Done(result as usize)
        }
    }

    /// Decode a raw write completion.
    pub fn from_raw_write(result: i64) -> Self {
        if result < 0 {
            Transfer::Failed(NativeCode::from_errno((-result) as i32))
        } else {
            Transfer::Done(result as usize)
        }
    }

    /// Bytes moved, if any.
    #[inline]
    pub fn bytes(&self) -> usize {
        match *self {
            Transfer::Done(n) | Transfer::MoreData(n) => n,
            Transfer::Failed(_) => 0,
        }
    }
}

/// Result of handing an operation to a completion port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Issue {
    /// Finished synchronously; the completion callback will not fire.
    Completed(Transfer),
    /// In flight; the completion callback fires exactly once later.
    Pending,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(NativeCode::from_errno(libc::EPIPE), NativeCode::BrokenPipe);
        assert_eq!(NativeCode::from_errno(libc::ECONNRESET), NativeCode::BrokenPipe);
        assert_eq!(NativeCode::from_errno(libc::ENOTCONN), NativeCode::PipeNotConnected);
        assert_eq!(NativeCode::from_errno(libc::EBADF), NativeCode::InvalidHandle);
        assert_eq!(NativeCode::from_errno(libc::ECANCELED), NativeCode::OperationAborted);
        assert_eq!(NativeCode::from_errno(libc::ENOENT), NativeCode::NotFound);
        assert_eq!(NativeCode::from_errno(libc::EIO), NativeCode::Os(libc::EIO));
    }

    #[test]
    fn test_broken_class() {
        assert!(NativeCode::BrokenPipe.is_broken());
        assert!(NativeCode::PipeNotConnected.is_broken());
        assert!(NativeCode::NoData.is_broken());
        assert!(!NativeCode::InvalidHandle.is_broken());
        assert!(!NativeCode::Os(5).is_broken());
    }

    #[test]
    fn test_raw_read_decoding() {
        assert_eq!(Transfer::from_raw_read(4, false), Transfer::Done(4));
        assert_eq!(Transfer::from_raw_read(4, true), Transfer::MoreData(4));
        assert_eq!(
            Transfer::from_raw_read(0, false),
            Transfer::Failed(NativeCode::BrokenPipe)
        );
        assert_eq!(
            Transfer::from_raw_read(-(libc::ECANCELED as i64), false),
            Transfer::Failed(NativeCode::OperationAborted)
        );
    }

    #[test]
    fn test_raw_write_decoding() {
        assert_eq!(Transfer::from_raw_write(0), Transfer::Done(0));
        assert_eq!(
            Transfer::from_raw_write(-(libc::EPIPE as i64)),
            Transfer::Failed(NativeCode::BrokenPipe)
        );
    }
}
