//! Per-thread I/O interrupt handles.
//!
//! A `ThreadHandle` lets one thread abort the blocking pipe call another
//! thread is currently sitting in. It is the Linux counterpart of "cancel
//! whatever this thread is blocked in":
//!
//! - every thread that performs cancellable blocking calls owns one
//!   eventfd, created lazily on first use and cached in a thread-local;
//! - a blocking transport call brackets itself with `enter()` and polls the
//!   channel fd together with the handle's eventfd;
//! - `cancel_io()` signals the eventfd while the thread is inside a call,
//!   and reports `NotFound` otherwise, so callers can retry until the call
//!   actually starts.
//!
//! Worker pools call `release_current()` when a worker leaves its loop, so
//! the handle's lifetime is tied to worker shutdown instead of thread-local
//! destruction order.

use std::cell::RefCell;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::eventfd::EventFd;
use crate::status::NativeCode;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Cached handle of the current OS thread
    static CURRENT: RefCell<Option<ThreadHandle>> = const { RefCell::new(None) };
}

/// Interrupt handle of one OS thread. Clones share state.
#[derive(Clone)]
pub struct ThreadHandle {
    inner: Arc<ThreadIo>,
}

struct ThreadIo {
    id: u64,
    efd: EventFd,
    /// Inside a blocking call right now
    in_call: AtomicBool,
    /// An interrupt was delivered to the current call
    interrupted: AtomicBool,
}

impl ThreadHandle {
    /// Handle of the calling thread, created on first use.
    ///
    /// Returns `None` if the interrupt eventfd cannot be created; the
    /// caller then proceeds without cancellation support.
    pub fn current() -> Option<ThreadHandle> {
        CURRENT.with(|cell| {
            let mut slot = cell.borrow_mut();
            if slot.is_none() {
                let efd = EventFd::new().ok()?;
                *slot = Some(ThreadHandle {
                    inner: Arc::new(ThreadIo {
                        id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
                        efd,
                        in_call: AtomicBool::new(false),
                        interrupted: AtomicBool::new(false),
                    }),
                });
            }
            slot.clone()
        })
    }

    /// Drop the calling thread's cached handle (worker shutdown).
    pub fn release_current() {
        let _ = CURRENT.try_with(|cell| cell.borrow_mut().take());
    }

    /// Whether the calling thread has a cached handle
    pub fn is_cached() -> bool {
        CURRENT
            .try_with(|cell| cell.borrow().is_some())
            .unwrap_or(false)
    }

    /// Unique id (diagnostics)
    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Eventfd to poll alongside the channel fd
    #[inline]
    pub fn event_fd(&self) -> RawFd {
        self.inner.efd.as_raw_fd()
    }

    /// Mark the start of a blocking call; the guard marks its end.
    ///
    /// Any interrupt left over from an earlier call is discarded.
    pub fn enter(&self) -> CallGuard<'_> {
        self.inner.efd.drain();
        self.inner.interrupted.store(false, Ordering::Release);
        self.inner.in_call.store(true, Ordering::Release);
        CallGuard { handle: self }
    }

    /// Whether an interrupt hit the current call
    #[inline]
    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::Acquire)
    }

    /// Whether the thread is inside a blocking call
    #[inline]
    pub fn in_call(&self) -> bool {
        self.inner.in_call.load(Ordering::Acquire)
    }

    /// Abort the blocking call the thread is in.
    ///
    /// `Err(NotFound)` if the thread is not inside a call (yet).
    pub fn cancel_io(&self) -> Result<(), NativeCode> {
        if !self.inner.in_call.load(Ordering::Acquire) {
            return Err(NativeCode::NotFound);
        }
        self.inner.interrupted.store(true, Ordering::Release);
        self.inner.efd.signal()
    }
}

impl std::fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("id", &self.inner.id)
            .field("in_call", &self.in_call())
            .finish()
    }
}

/// Marks a thread as inside a blocking call until dropped
pub struct CallGuard<'a> {
    handle: &'a ThreadHandle,
}

impl CallGuard<'_> {
    /// Whether an interrupt arrived; consumes the eventfd signal
    pub fn take_interrupt(&self) -> bool {
        self.handle.inner.efd.drain();
        self.handle.is_interrupted()
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.handle.inner.in_call.store(false, Ordering::Release);
        self.handle.inner.efd.drain();
    }
}
