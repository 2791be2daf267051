//! `FdPipe` — default `NativePipe` implementation over a Linux descriptor.
//!
//! Three flavors of descriptor are supported:
//!
//! | Flavor      | Created by                          | Transmission |
//! |-------------|-------------------------------------|--------------|
//! | `Pipe`      | `pipe2(2)` or any non-socket fd     | Byte         |
//! | `Stream`    | `socketpair(AF_UNIX, SOCK_STREAM)`  | Byte         |
//! | `SeqPacket` | `socketpair(AF_UNIX, SOCK_SEQPACKET)` | Message    |
//!
//! Descriptors stay in blocking mode (io_uring arms its own poll for them).
//! Blocking calls never sit inside `read(2)`/`write(2)`: they poll the fd
//! together with the caller's interrupt eventfd and then perform a
//! non-blocking transfer, so a `ThreadHandle::cancel_io` can abort them.
//!
//! Message reads peek the size of the next datagram. A message larger than
//! the caller's buffer is received whole into a staging buffer; the caller
//! gets the head with `MoreData` and later reads drain the rest.

use pipeio_core::kind::TransmissionMode;
use pipeio_core::status::{last_errno, NativeCode, Transfer};
use pipeio_core::thread_handle::{CallGuard, ThreadHandle};
use pipeio_core::transport::{CompletionPort, NativePipe, PipeInfo};
use pipeio_core::kdebug;

use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::socket::{self, sockopt, AddressFamily, SockFlag, SockType};
use parking_lot::Mutex;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

/// Kind of descriptor behind an `FdPipe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Pipe,
    Stream,
    SeqPacket,
}

/// Outcome of one non-blocking attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Attempt {
    Ready(Transfer),
    WouldBlock,
}

/// Remainder of a message that did not fit the caller's buffer.
#[derive(Default)]
struct Staged {
    data: Vec<u8>,
    pos: usize,
}

impl Staged {
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

/// State shared between the pipe handle and in-flight reactor operations.
pub(crate) struct FdShared {
    fd: OwnedFd,
    flavor: Flavor,
    overlapped: bool,
    read_mode: AtomicU8,
    stage: Mutex<Staged>,
}

static SIGPIPE_IGNORED: Once = Once::new();

/// Writes to a pipe without readers must report EPIPE, not kill us.
fn ignore_sigpipe() {
    SIGPIPE_IGNORED.call_once(|| {
        // Safety: installing SIG_IGN has no handler code to race with.
        if let Err(e) = unsafe { signal::signal(Signal::SIGPIPE, SigHandler::SigIgn) } {
            kdebug!("fd: could not ignore SIGPIPE: {}", e);
        }
    });
}

#[inline]
fn errno_code(e: nix::errno::Errno) -> NativeCode {
    NativeCode::from_errno(e as i32)
}

/// `poll(2)`; errors come back as raw errno.
fn poll_fds(fds: &mut [libc::pollfd], timeout_ms: i32) -> Result<usize, i32> {
    let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if ret < 0 {
        return Err(last_errno());
    }
    Ok(ret as usize)
}

impl FdShared {
    #[inline]
    pub(crate) fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    #[inline]
    pub(crate) fn flavor(&self) -> Flavor {
        self.flavor
    }

    fn transmission(&self) -> TransmissionMode {
        match self.flavor {
            Flavor::SeqPacket => TransmissionMode::Message,
            _ => TransmissionMode::Byte,
        }
    }

    fn read_mode(&self) -> TransmissionMode {
        TransmissionMode::from(self.read_mode.load(Ordering::Acquire))
    }

    /// Ready events without blocking.
    fn ready_now(&self, events: libc::c_short) -> Result<libc::c_short, NativeCode> {
        let mut fds = [libc::pollfd {
            fd: self.raw_fd(),
            events,
            revents: 0,
        }];
        match poll_fds(&mut fds, 0) {
            Ok(_) if fds[0].revents & libc::POLLNVAL != 0 => Err(NativeCode::InvalidHandle),
            Ok(_) => Ok(fds[0].revents),
            Err(libc::EINTR) => Ok(0),
            Err(errno) => Err(NativeCode::from_errno(errno)),
        }
    }

    /// Decode a raw transfer return; EAGAIN/EINTR mean "try again".
    fn decode(ret: isize, read: bool) -> Attempt {
        if ret < 0 {
            let errno = last_errno();
            if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK || errno == libc::EINTR {
                return Attempt::WouldBlock;
            }
            return Attempt::Ready(Transfer::Failed(NativeCode::from_errno(errno)));
        }
        if read {
            Attempt::Ready(Transfer::from_raw_read(ret as i64, false))
        } else {
            Attempt::Ready(Transfer::from_raw_write(ret as i64))
        }
    }

    /// One non-blocking read.
    pub(crate) fn try_read(&self, buf: &mut [u8]) -> Attempt {
        if buf.is_empty() {
            return Attempt::Ready(Transfer::Done(0));
        }
        match self.flavor {
            Flavor::SeqPacket => self.try_read_message(buf),
            Flavor::Stream => {
                let ret = unsafe {
                    libc::recv(
                        self.raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                        libc::MSG_DONTWAIT,
                    )
                };
                Self::decode(ret, true)
            }
            Flavor::Pipe => {
                match self.ready_now(libc::POLLIN) {
                    Ok(0) => return Attempt::WouldBlock,
                    Ok(_) => {}
                    Err(code) => return Attempt::Ready(Transfer::Failed(code)),
                }
                let ret = unsafe {
                    libc::read(self.raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                };
                Self::decode(ret, true)
            }
        }
    }

    /// Hand out staged message bytes, if any.
    pub(crate) fn take_staged(&self, buf: &mut [u8]) -> Option<Transfer> {
        let mut stage = self.stage.lock();
        if stage.remaining() == 0 {
            return None;
        }
        Some(self.copy_staged(&mut stage, buf))
    }

    fn copy_staged(&self, stage: &mut Staged, buf: &mut [u8]) -> Transfer {
        let n = buf.len().min(stage.remaining());
        buf[..n].copy_from_slice(&stage.data[stage.pos..stage.pos + n]);
        stage.pos += n;
        let more = stage.remaining() > 0;
        if !more {
            stage.data.clear();
            stage.pos = 0;
        }
        self.partial(n, more)
    }

    fn partial(&self, n: usize, more: bool) -> Transfer {
        // Byte read mode never reports a partial message.
        if more && self.read_mode() == TransmissionMode::Message {
            Transfer::MoreData(n)
        } else {
            Transfer::Done(n)
        }
    }

    fn try_read_message(&self, buf: &mut [u8]) -> Attempt {
        let mut stage = self.stage.lock();
        if stage.remaining() > 0 {
            return Attempt::Ready(self.copy_staged(&mut stage, buf));
        }

        // Size of the next message, without consuming it.
        let size = unsafe {
            libc::recv(
                self.raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                libc::MSG_PEEK | libc::MSG_TRUNC | libc::MSG_DONTWAIT,
            )
        };
        if size <= 0 {
            return Self::decode(size, true);
        }
        let size = size as usize;

        if size <= buf.len() {
            let ret = unsafe {
                libc::recv(
                    self.raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    libc::MSG_DONTWAIT,
                )
            };
            return Self::decode(ret, true);
        }

        let mut data = vec![0u8; size];
        let ret = unsafe {
            libc::recv(
                self.raw_fd(),
                data.as_mut_ptr() as *mut libc::c_void,
                data.len(),
                libc::MSG_DONTWAIT,
            )
        };
        if ret <= 0 {
            return Self::decode(ret, true);
        }
        data.truncate(ret as usize);
        stage.data = data;
        stage.pos = 0;
        Attempt::Ready(self.copy_staged(&mut stage, buf))
    }

    /// One non-blocking write step; may transfer less than `buf`.
    fn try_write(&self, buf: &[u8]) -> Attempt {
        let ret = match self.flavor {
            Flavor::Stream | Flavor::SeqPacket => unsafe {
                libc::send(
                    self.raw_fd(),
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                    libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
                )
            },
            Flavor::Pipe => {
                match self.ready_now(libc::POLLOUT) {
                    Ok(0) => return Attempt::WouldBlock,
                    Ok(_) => {}
                    Err(code) => return Attempt::Ready(Transfer::Failed(code)),
                }
                // At most PIPE_BUF once POLLOUT is reported, so the
                // blocking descriptor cannot stall us.
                let len = buf.len().min(libc::PIPE_BUF);
                unsafe { libc::write(self.raw_fd(), buf.as_ptr() as *const libc::c_void, len) }
            }
        };
        Self::decode(ret, false)
    }

    /// Wait for `events` on the fd or an interrupt on `thread`.
    fn wait(
        &self,
        events: libc::c_short,
        thread: Option<&ThreadHandle>,
        guard: Option<&CallGuard<'_>>,
    ) -> Result<(), NativeCode> {
        let mut fds = [
            libc::pollfd {
                fd: self.raw_fd(),
                events,
                revents: 0,
            },
            libc::pollfd {
                fd: thread.map(|t| t.event_fd()).unwrap_or(-1),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        let n = if thread.is_some() { 2 } else { 1 };
        loop {
            fds[0].revents = 0;
            fds[1].revents = 0;
            match poll_fds(&mut fds[..n], -1) {
                Ok(_) => {}
                Err(libc::EINTR) => {}
                Err(errno) => return Err(NativeCode::from_errno(errno)),
            }
            if let Some(guard) = guard {
                if guard.take_interrupt() {
                    return Err(NativeCode::OperationAborted);
                }
            }
            if fds[0].revents & libc::POLLNVAL != 0 {
                return Err(NativeCode::InvalidHandle);
            }
            if fds[0].revents != 0 {
                return Ok(());
            }
        }
    }

    fn queued_bytes(&self) -> Result<libc::c_int, NativeCode> {
        let request = match self.flavor {
            Flavor::Pipe => libc::FIONREAD,
            Flavor::Stream | Flavor::SeqPacket => libc::TIOCOUTQ,
        };
        let mut pending: libc::c_int = 0;
        let ret = unsafe { libc::ioctl(self.raw_fd(), request, &mut pending) };
        if ret < 0 {
            return Err(NativeCode::last_os_error());
        }
        Ok(pending)
    }
}

/// One end of a Linux pipe or socket pair.
pub struct FdPipe {
    shared: Arc<FdShared>,
}

impl FdPipe {
    fn wrap(fd: OwnedFd, flavor: Flavor, overlapped: bool) -> Self {
        ignore_sigpipe();
        let mode = match flavor {
            Flavor::SeqPacket => TransmissionMode::Message,
            _ => TransmissionMode::Byte,
        };
        FdPipe {
            shared: Arc::new(FdShared {
                fd,
                flavor,
                overlapped,
                read_mode: AtomicU8::new(mode as u8),
                stage: Mutex::new(Staged::default()),
            }),
        }
    }

    /// Unidirectional pipe: `(read end, write end)`.
    pub fn anonymous(overlapped: bool) -> Result<(FdPipe, FdPipe), NativeCode> {
        let (r, w) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).map_err(errno_code)?;
        Ok((
            Self::wrap(r, Flavor::Pipe, overlapped),
            Self::wrap(w, Flavor::Pipe, overlapped),
        ))
    }

    /// Connected duplex pair; byte or message transmission.
    pub fn pair(mode: TransmissionMode, overlapped: bool) -> Result<(FdPipe, FdPipe), NativeCode> {
        let (ty, flavor) = match mode {
            TransmissionMode::Byte => (SockType::Stream, Flavor::Stream),
            TransmissionMode::Message => (SockType::SeqPacket, Flavor::SeqPacket),
        };
        let (a, b) = socket::socketpair(AddressFamily::Unix, ty, None, SockFlag::SOCK_CLOEXEC)
            .map_err(errno_code)?;
        Ok((
            Self::wrap(a, flavor, overlapped),
            Self::wrap(b, flavor, overlapped),
        ))
    }

    /// Adopt a descriptor created elsewhere. The flavor is probed.
    pub fn from_owned_fd(fd: OwnedFd, overlapped: bool) -> Result<FdPipe, NativeCode> {
        let flavor = match socket::getsockopt(&fd, sockopt::SockType) {
            Ok(SockType::SeqPacket) => Flavor::SeqPacket,
            Ok(SockType::Stream) => Flavor::Stream,
            Ok(_) => return Err(NativeCode::Os(libc::EPROTOTYPE)),
            Err(nix::errno::Errno::ENOTSOCK) => Flavor::Pipe,
            Err(e) => return Err(errno_code(e)),
        };
        Ok(Self::wrap(fd, flavor, overlapped))
    }

    pub fn flavor(&self) -> Flavor {
        self.shared.flavor
    }

    pub(crate) fn shared(&self) -> Arc<FdShared> {
        Arc::clone(&self.shared)
    }
}

impl NativePipe for FdPipe {
    fn read(&self, buf: &mut [u8], thread: Option<&ThreadHandle>) -> Transfer {
        let guard = thread.map(|t| t.enter());
        loop {
            if let Some(g) = &guard {
                if g.take_interrupt() {
                    return Transfer::Failed(NativeCode::OperationAborted);
                }
            }
            if let Attempt::Ready(t) = self.shared.try_read(buf) {
                return t;
            }
            if let Err(code) = self.shared.wait(libc::POLLIN, thread, guard.as_ref()) {
                return Transfer::Failed(code);
            }
        }
    }

    fn write(&self, buf: &[u8], thread: Option<&ThreadHandle>) -> Transfer {
        let guard = thread.map(|t| t.enter());
        let mut done = 0;
        while done < buf.len() {
            if let Some(g) = &guard {
                if g.take_interrupt() {
                    return Transfer::Failed(NativeCode::OperationAborted);
                }
            }
            match self.shared.try_write(&buf[done..]) {
                Attempt::Ready(Transfer::Failed(code)) => return Transfer::Failed(code),
                Attempt::Ready(t) => done += t.bytes(),
                Attempt::WouldBlock => {
                    if let Err(code) = self.shared.wait(libc::POLLOUT, thread, guard.as_ref()) {
                        return Transfer::Failed(code);
                    }
                }
            }
        }
        Transfer::Done(done)
    }

    fn drain(&self) -> Result<(), NativeCode> {
        loop {
            if self.shared.queued_bytes()? <= 0 {
                return Ok(());
            }
            let revents = self.shared.ready_now(libc::POLLOUT)?;
            if revents & (libc::POLLERR | libc::POLLHUP) != 0 {
                return Err(NativeCode::BrokenPipe);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn info(&self) -> Result<PipeInfo, NativeCode> {
        let (in_buffer_size, out_buffer_size) = match self.shared.flavor {
            Flavor::Pipe => {
                let size = unsafe { libc::fcntl(self.shared.raw_fd(), libc::F_GETPIPE_SZ) };
                if size < 0 {
                    return Err(NativeCode::last_os_error());
                }
                (size as usize, size as usize)
            }
            Flavor::Stream | Flavor::SeqPacket => (
                socket::getsockopt(&self.shared.fd, sockopt::RcvBuf).map_err(errno_code)?,
                socket::getsockopt(&self.shared.fd, sockopt::SndBuf).map_err(errno_code)?,
            ),
        };
        Ok(PipeInfo {
            mode: self.shared.transmission(),
            in_buffer_size,
            out_buffer_size,
        })
    }

    fn read_mode(&self) -> TransmissionMode {
        self.shared.read_mode()
    }

    fn set_read_mode(&self, mode: TransmissionMode) -> Result<(), NativeCode> {
        if mode == TransmissionMode::Message && self.shared.flavor != Flavor::SeqPacket {
            return Err(NativeCode::Os(libc::EINVAL));
        }
        self.shared.read_mode.store(mode as u8, Ordering::Release);
        Ok(())
    }

    fn is_overlapped(&self) -> bool {
        self.shared.overlapped
    }

    fn bind(&self) -> Result<Arc<dyn CompletionPort>, NativeCode> {
        if !self.shared.overlapped {
            return Err(NativeCode::Os(libc::EOPNOTSUPP));
        }
        cfg_if::cfg_if! {
            if #[cfg(feature = "uring")] {
                let reactor = crate::uring::global()?;
                Ok(reactor.port(Arc::clone(&self.shared)))
            } else {
                Err(NativeCode::Os(libc::ENOSYS))
            }
        }
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.shared.raw_fd())
    }
}

impl std::fmt::Debug for FdPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdPipe")
            .field("fd", &self.shared.raw_fd())
            .field("flavor", &self.shared.flavor)
            .field("overlapped", &self.shared.overlapped)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_anonymous_roundtrip() {
        let (r, w) = FdPipe::anonymous(false).unwrap();
        assert_eq!(w.write(b"ping", None), Transfer::Done(4));
        let mut buf = [0u8; 16];
        assert_eq!(r.read(&mut buf, None), Transfer::Done(4));
        assert_eq!(&buf[..4], b"ping");
    }

    #[test]
    fn test_read_after_writer_closed_is_broken() {
        let (r, w) = FdPipe::anonymous(false).unwrap();
        drop(w);
        let mut buf = [0u8; 4];
        assert_eq!(r.read(&mut buf, None), Transfer::Failed(NativeCode::BrokenPipe));
    }

    #[test]
    fn test_write_without_reader_is_epipe() {
        let (r, w) = FdPipe::anonymous(false).unwrap();
        drop(r);
        assert_eq!(w.write(b"x", None), Transfer::Failed(NativeCode::BrokenPipe));
    }

    #[test]
    fn test_large_write_through_pipe() {
        let (r, w) = FdPipe::anonymous(false).unwrap();
        let payload = vec![7u8; 256 * 1024];
        let expect = payload.len();
        let writer = thread::spawn(move || w.write(&payload, None));

        let mut total = 0;
        let mut buf = vec![0u8; 8192];
        while total < expect {
            match r.read(&mut buf, None) {
                Transfer::Done(n) => total += n,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(writer.join().unwrap(), Transfer::Done(expect));
    }

    #[test]
    fn test_message_staging() {
        let (a, b) = FdPipe::pair(TransmissionMode::Message, false).unwrap();
        assert_eq!(a.write(b"hello world", None), Transfer::Done(11));
        assert_eq!(a.write(b"next", None), Transfer::Done(4));

        let mut buf = [0u8; 5];
        assert_eq!(b.read(&mut buf, None), Transfer::MoreData(5));
        assert_eq!(&buf, b"hello");
        assert_eq!(b.read(&mut buf, None), Transfer::MoreData(5));
        assert_eq!(&buf, b" worl");
        assert_eq!(b.read(&mut buf, None), Transfer::Done(1));
        assert_eq!(&buf[..1], b"d");
        assert_eq!(b.read(&mut buf, None), Transfer::Done(4));
        assert_eq!(&buf[..4], b"next");
    }

    #[test]
    fn test_byte_read_mode_on_message_channel() {
        let (a, b) = FdPipe::pair(TransmissionMode::Message, false).unwrap();
        b.set_read_mode(TransmissionMode::Byte).unwrap();
        a.write(b"abcdef", None);
        let mut buf = [0u8; 4];
        assert_eq!(b.read(&mut buf, None), Transfer::Done(4));
        assert_eq!(b.read(&mut buf, None), Transfer::Done(2));
    }

    #[test]
    fn test_message_read_mode_rejected_on_byte_channel() {
        let (a, _b) = FdPipe::pair(TransmissionMode::Byte, false).unwrap();
        assert_eq!(
            a.set_read_mode(TransmissionMode::Message),
            Err(NativeCode::Os(libc::EINVAL))
        );
    }

    #[test]
    fn test_interrupt_blocked_read() {
        let (r, _w) = FdPipe::anonymous(false).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        let reader = thread::spawn(move || {
            let me = ThreadHandle::current().unwrap();
            tx.send(me.clone()).unwrap();
            let mut buf = [0u8; 4];
            r.read(&mut buf, Some(&me))
        });
        let handle = rx.recv().unwrap();
        while handle.cancel_io() == Err(NativeCode::NotFound) {
            thread::yield_now();
        }
        assert_eq!(
            reader.join().unwrap(),
            Transfer::Failed(NativeCode::OperationAborted)
        );
    }

    #[test]
    fn test_drain_waits_for_reader() {
        let (r, w) = FdPipe::pair(TransmissionMode::Byte, false).unwrap();
        w.write(&[1u8; 1000], None);
        let reader = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let mut buf = [0u8; 1000];
            let mut got = 0;
            while got < 1000 {
                got += r.read(&mut buf, None).bytes();
            }
            r
        });
        w.drain().unwrap();
        let _r = reader.join().unwrap();
    }

    #[test]
    fn test_info_and_probe() {
        let (r, _w) = FdPipe::anonymous(false).unwrap();
        let info = r.info().unwrap();
        assert_eq!(info.mode, TransmissionMode::Byte);
        assert!(info.in_buffer_size > 0);

        let (a, _b) = FdPipe::pair(TransmissionMode::Message, false).unwrap();
        assert_eq!(a.info().unwrap().mode, TransmissionMode::Message);
        assert_eq!(a.flavor(), Flavor::SeqPacket);
    }

    #[test]
    fn test_from_owned_fd_detects_flavor() {
        let (a, _b) = socket::socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .unwrap();
        let pipe = FdPipe::from_owned_fd(a, false).unwrap();
        assert_eq!(pipe.flavor(), Flavor::SeqPacket);

        let (r, _w) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).unwrap();
        assert_eq!(FdPipe::from_owned_fd(r, false).unwrap().flavor(), Flavor::Pipe);
    }

    #[test]
    fn test_non_overlapped_bind_fails() {
        let (r, _w) = FdPipe::anonymous(false).unwrap();
        assert!(!r.is_overlapped());
        assert!(r.bind().is_err());
    }
}
