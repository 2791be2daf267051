//! Native transport abstraction.
//!
//! A `NativePipe` is one end of a duplex channel. It offers blocking
//! transfers (used by the async-over-blocking path) and, when opened with
//! overlapped capability, can be bound to a `CompletionPort` that accepts
//! in-flight operations and reports their completion through a
//! `CompletionTarget`.
//!
//! # Implementors
//!
//! - `FdPipe` (pipeio-module): Linux pipe / socket pair. Blocking calls
//!   poll the fd together with the worker's interrupt eventfd; overlapped
//!   operations go through the shared `UringPort` reactor.
//!
//! - `MemPipe` (pipeio-module): in-memory pair with deterministic
//!   completion control and native-call counters. Used by the tests.
//!
//! **Contract:**
//! - Transports never change connection state. They report a
//!   `Transfer`/`NativeCode` and the engine classifies it.
//! - `CompletionPort::issue()` returns `Issue::Completed` when the
//!   operation finished synchronously; the target is then NOT called.
//!   Otherwise the target is called exactly once, from any thread.
//! - The buffer behind a `BufferHandle` stays valid until the operation
//!   completes; the caller guarantees it.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::kind::TransmissionMode;
use crate::status::{Issue, NativeCode, Transfer};
use crate::thread_handle::ThreadHandle;

/// Raw view of a caller buffer for the duration of one operation.
#[derive(Debug, Clone, Copy)]
pub struct BufferHandle {
    /// Start of the region
    pub ptr: *mut u8,
    /// Length in bytes
    pub len: usize,
}

// Safety: a handle is a pointer + length; validity is guaranteed by the
// slot that owns the operation.
unsafe impl Send for BufferHandle {}
unsafe impl Sync for BufferHandle {}

impl BufferHandle {
    pub fn from_slice(buf: &[u8]) -> Self {
        Self {
            ptr: buf.as_ptr() as *mut u8,
            len: buf.len(),
        }
    }

    pub fn from_mut_slice(buf: &mut [u8]) -> Self {
        Self {
            ptr: buf.as_mut_ptr(),
            len: buf.len(),
        }
    }

    /// An empty handle
    pub const fn empty() -> Self {
        Self {
            ptr: std::ptr::null_mut(),
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    /// The region must be valid for reads for the returned lifetime.
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        if self.ptr.is_null() {
            return &[];
        }
        std::slice::from_raw_parts(self.ptr, self.len)
    }

    /// # Safety
    /// The region must be valid for writes and not aliased for the
    /// returned lifetime.
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [u8] {
        if self.ptr.is_null() {
            return &mut [];
        }
        std::slice::from_raw_parts_mut(self.ptr, self.len)
    }
}

/// Identifies one operation: slot id in the high half, version in the low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpId(pub u64);

impl OpId {
    #[inline]
    pub const fn new(slot: u32, version: u32) -> Self {
        OpId(((slot as u64) << 32) | version as u64)
    }

    #[inline]
    pub const fn slot(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub const fn version(&self) -> u32 {
        self.0 as u32
    }
}

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.slot(), self.version())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpKind::Read => write!(f, "read"),
            OpKind::Write => write!(f, "write"),
        }
    }
}

/// Receives the completion of a pending operation.
pub trait CompletionTarget: Send + Sync {
    fn on_complete(&self, id: OpId, result: Transfer);
}

/// One operation handed to a completion port.
pub struct IoRequest {
    pub id: OpId,
    pub kind: OpKind,
    pub buf: BufferHandle,
    /// Kept alive by the port until the completion is delivered
    pub target: Arc<dyn CompletionTarget>,
}

/// Completion mechanism a handle is bound to.
pub trait CompletionPort: Send + Sync {
    /// Start an operation. Never blocks.
    fn issue(&self, req: IoRequest) -> Issue;

    /// Ask the transport to abort a pending operation.
    ///
    /// `Err(NotFound)` if the operation is not (or no longer) pending.
    fn cancel(&self, id: OpId) -> Result<(), NativeCode>;
}

/// Live properties of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeInfo {
    pub mode: TransmissionMode,
    pub in_buffer_size: usize,
    pub out_buffer_size: usize,
}

/// One end of a native duplex channel.
pub trait NativePipe: Send + Sync {
    /// Blocking read. `thread` makes the call interruptible through
    /// `ThreadHandle::cancel_io`; an interrupted call reports
    /// `OperationAborted`.
    fn read(&self, buf: &mut [u8], thread: Option<&ThreadHandle>) -> Transfer;

    /// Blocking write of the whole buffer.
    fn write(&self, buf: &[u8], thread: Option<&ThreadHandle>) -> Transfer;

    /// Block until the peer has consumed everything written so far.
    fn drain(&self) -> Result<(), NativeCode>;

    /// Query live properties from the handle.
    fn info(&self) -> Result<PipeInfo, NativeCode>;

    fn read_mode(&self) -> TransmissionMode;

    fn set_read_mode(&self, mode: TransmissionMode) -> Result<(), NativeCode>;

    /// Whether the handle was opened with overlapped capability
    fn is_overlapped(&self) -> bool;

    /// Bind to a completion port. `Err` for non-overlapped handles.
    fn bind(&self) -> Result<Arc<dyn CompletionPort>, NativeCode>;

    /// Underlying descriptor, if the transport has one.
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }
}
