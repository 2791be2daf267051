//! Owned, non-blocking eventfd.
//!
//! Used as a wake signal: the reactor parks on one while io_uring has
//! nothing to report, and every worker thread keeps one so a blocked pipe
//! call can be interrupted from another thread.
//!
//! Coalescing: several `signal()` calls before the consumer drains the
//! counter result in a single wakeup (eventfd counter semantics).

use std::os::unix::io::{AsRawFd, RawFd};

use crate::status::{last_errno, NativeCode};

pub struct EventFd {
    fd: RawFd,
}

impl EventFd {
    /// Create a new eventfd (`EFD_NONBLOCK | EFD_CLOEXEC`).
    pub fn new() -> Result<Self, NativeCode> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(NativeCode::from_errno(last_errno()));
        }
        Ok(Self { fd })
    }

    /// Add one to the counter, waking any poller.
    pub fn signal(&self) -> Result<(), NativeCode> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let errno = last_errno();
            // Counter saturated: a wakeup is already pending.
            if errno == libc::EAGAIN {
                return Ok(());
            }
            return Err(NativeCode::from_errno(errno));
        }
        Ok(())
    }

    /// Reset the counter. Returns true if a signal was pending.
    pub fn drain(&self) -> bool {
        let mut val: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        ret == std::mem::size_of::<u64>() as isize && val > 0
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }
    }
}

impl std::fmt::Debug for EventFd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EventFd({})", self.fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_and_drain() {
        let efd = EventFd::new().unwrap();
        assert!(!efd.drain());

        efd.signal().unwrap();
        efd.signal().unwrap();
        assert!(efd.drain());
        assert!(!efd.drain());
    }
}
