//! # UringReactor — overlapped completion for `FdPipe`
//!
//! The reactor runs on a dedicated OS thread. It:
//! 1. Dequeues commands from a lock-free MPSC queue (submit / cancel)
//! 2. Translates them into io_uring SQEs
//! 3. Sleeps in `submit_and_wait(1)`; an eventfd poll wakes it for new work
//! 4. Resubmits partial writes and re-arms message-read polls
//! 5. Delivers each final result to the operation's `CompletionTarget`
//!
//! Every bound `FdPipe` gets a `UringPort` sharing one reactor. The port
//! keeps the descriptor and the completion target alive until the
//! operation's final completion, so neither the fd nor the caller's buffer
//! can be released while the kernel still owns them.
//!
//! Message-mode reads are readiness based: a `PollAdd` for POLLIN, then a
//! non-blocking staged read on the reactor thread. Everything else is a
//! direct `Read`/`Write`/`Send`.

use crate::fd_pipe::{Attempt, FdShared, Flavor};

use pipeio_core::eventfd::EventFd;
use pipeio_core::status::{Issue, NativeCode, Transfer};
use pipeio_core::transport::{BufferHandle, CompletionPort, CompletionTarget, IoRequest, OpId, OpKind};
use pipeio_core::{kdebug, kerror, kinfo, ktrace};

use crossbeam_queue::ArrayQueue;
use io_uring::{opcode, squeue, types, IoUring};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;

/// user_data of the wake poll.
const WAKE_TAG: u64 = u64::MAX;
/// user_data of AsyncCancel entries.
const CANCEL_TAG: u64 = u64::MAX - 1;

/// Reactor configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactorConfig {
    /// io_uring SQ size (power of 2).
    pub sq_entries: u32,
    /// MPSC queue capacity for incoming commands.
    pub queue_capacity: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            sq_entries: 256,
            queue_capacity: 4096,
        }
    }
}

enum Command {
    Submit(InFlight),
    Cancel(OpId),
}

/// One operation owned by the reactor until its final completion.
struct InFlight {
    id: OpId,
    kind: OpKind,
    pipe: Arc<FdShared>,
    buf: BufferHandle,
    /// Bytes already written (partial writes are resubmitted).
    done: usize,
    /// Poll for readiness, then read on the reactor thread.
    staged: bool,
    cancelled: bool,
    target: Arc<dyn CompletionTarget>,
}

/// Shared state between the reactor thread and its ports.
struct ReactorShared {
    requests: ArrayQueue<Command>,
    wake: EventFd,
    /// Ids issued and not yet completed.
    pending: Mutex<HashSet<u64>>,
    shutdown: AtomicBool,
}

impl ReactorShared {
    fn push(&self, cmd: Command) -> Result<(), NativeCode> {
        if self.requests.push(cmd).is_err() {
            return Err(NativeCode::Os(libc::EAGAIN));
        }
        // Already queued; it cannot be withdrawn.
        if let Err(code) = self.wake.signal() {
            kerror!("uring: wake failed: {}", code);
        }
        Ok(())
    }
}

/// Handle to a reactor thread.
pub struct UringReactor {
    shared: Arc<ReactorShared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl UringReactor {
    /// Create the ring and start the reactor thread.
    ///
    /// Fails when io_uring is unavailable (old kernel, seccomp).
    pub fn start(config: ReactorConfig) -> Result<Self, NativeCode> {
        let ring = IoUring::new(config.sq_entries)
            .map_err(|e| NativeCode::from_errno(e.raw_os_error().unwrap_or(libc::EIO)))?;
        let shared = Arc::new(ReactorShared {
            requests: ArrayQueue::new(config.queue_capacity.max(1)),
            wake: EventFd::new()?,
            pending: Mutex::new(HashSet::new()),
            shutdown: AtomicBool::new(false),
        });

        let shared_clone = Arc::clone(&shared);
        let sq_entries = config.sq_entries;
        let handle = thread::Builder::new()
            .name("pipeio-uring".into())
            .spawn(move || reactor_loop(ring, shared_clone, sq_entries))
            .map_err(|e| NativeCode::from_errno(e.raw_os_error().unwrap_or(libc::EAGAIN)))?;

        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Completion port for one descriptor.
    pub(crate) fn port(&self, pipe: Arc<FdShared>) -> Arc<dyn CompletionPort> {
        Arc::new(UringPort {
            pipe,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Operations issued and not yet completed.
    pub fn inflight(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Cancel everything in flight and join the reactor thread.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let _ = self.shared.wake.signal();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for UringReactor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

static GLOBAL_CONFIG: OnceLock<ReactorConfig> = OnceLock::new();
static GLOBAL: OnceLock<Result<UringReactor, NativeCode>> = OnceLock::new();

/// Set the configuration of the process-wide reactor.
///
/// Returns false if it is already running or was configured before.
pub fn configure_global(config: ReactorConfig) -> bool {
    if GLOBAL.get().is_some() {
        return false;
    }
    GLOBAL_CONFIG.set(config).is_ok()
}

/// The settings the process-wide reactor starts (or started) with.
pub fn global_config() -> ReactorConfig {
    GLOBAL_CONFIG.get().cloned().unwrap_or_default()
}

/// The process-wide reactor, started on first use.
pub fn global() -> Result<&'static UringReactor, NativeCode> {
    GLOBAL
        .get_or_init(|| {
            let config = global_config();
            let started = UringReactor::start(config);
            if let Err(code) = &started {
                kerror!("uring: reactor unavailable: {}", code);
            }
            started
        })
        .as_ref()
        .map_err(|code| *code)
}

/// Port binding one descriptor to the reactor.
struct UringPort {
    pipe: Arc<FdShared>,
    shared: Arc<ReactorShared>,
}

impl CompletionPort for UringPort {
    fn issue(&self, req: IoRequest) -> Issue {
        let staged = req.kind == OpKind::Read && self.pipe.flavor() == Flavor::SeqPacket;
        if staged {
            // Safety: the caller keeps the buffer alive for the operation.
            let buf = unsafe { req.buf.as_mut_slice() };
            if let Some(t) = self.pipe.take_staged(buf) {
                return Issue::Completed(t);
            }
        }
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Issue::Completed(Transfer::Failed(NativeCode::Os(libc::ENXIO)));
        }

        let id = req.id;
        self.shared.pending.lock().insert(id.0);
        let op = InFlight {
            id,
            kind: req.kind,
            pipe: Arc::clone(&self.pipe),
            buf: req.buf,
            done: 0,
            staged,
            cancelled: false,
            target: req.target,
        };
        if let Err(code) = self.shared.push(Command::Submit(op)) {
            self.shared.pending.lock().remove(&id.0);
            return Issue::Completed(Transfer::Failed(code));
        }
        ktrace!("uring: {} {} queued", req.kind, id);
        Issue::Pending
    }

    fn cancel(&self, id: OpId) -> Result<(), NativeCode> {
        if !self.shared.pending.lock().contains(&id.0) {
            return Err(NativeCode::NotFound);
        }
        self.shared.push(Command::Cancel(id))
    }
}

fn wake_sqe(wake: &EventFd) -> squeue::Entry {
    opcode::PollAdd::new(types::Fd(wake.as_raw_fd()), libc::POLLIN as u32)
        .build()
        .user_data(WAKE_TAG)
}

fn cancel_sqe(id: OpId) -> squeue::Entry {
    opcode::AsyncCancel::new(id.0).build().user_data(CANCEL_TAG)
}

fn build_sqe(op: &InFlight) -> squeue::Entry {
    let fd = types::Fd(op.pipe.raw_fd());
    let flavor = op.pipe.flavor();
    let entry = match op.kind {
        OpKind::Read if op.staged => opcode::PollAdd::new(fd, libc::POLLIN as u32).build(),
        OpKind::Read => match flavor {
            Flavor::Pipe => opcode::Read::new(fd, op.buf.ptr, op.buf.len as u32)
                .offset(u64::MAX)
                .build(),
            _ => opcode::Recv::new(fd, op.buf.ptr, op.buf.len as u32).build(),
        },
        OpKind::Write => {
            // Safety: `done <= len`, so the offset stays inside the buffer.
            let ptr = unsafe { op.buf.ptr.add(op.done) } as *const u8;
            let len = (op.buf.len - op.done) as u32;
            match flavor {
                Flavor::Pipe => opcode::Write::new(fd, ptr, len).offset(u64::MAX).build(),
                _ => opcode::Send::new(fd, ptr, len)
                    .flags(libc::MSG_NOSIGNAL)
                    .build(),
            }
        }
    };
    entry.user_data(op.id.0)
}

/// Push queued SQEs; stops early if the ring stays full.
fn flush_backlog(ring: &mut IoUring, backlog: &mut VecDeque<squeue::Entry>) {
    while let Some(sqe) = backlog.pop_front() {
        // Safety: every buffer referenced by an entry is owned by an
        // `InFlight` in the reactor map until its CQE arrives.
        if unsafe { ring.submission().push(&sqe) }.is_ok() {
            continue;
        }
        if ring.submit().is_err() || unsafe { ring.submission().push(&sqe) }.is_err() {
            backlog.push_front(sqe);
            return;
        }
    }
}

fn complete(shared: &ReactorShared, op: InFlight, result: Transfer) {
    shared.pending.lock().remove(&op.id.0);
    ktrace!("uring: {} {} -> {:?}", op.kind, op.id, result);
    op.target.on_complete(op.id, result);
}

/// Map one CQE to a final result, or `None` to resubmit.
fn advance(op: &mut InFlight, res: i32) -> Option<Transfer> {
    if res < 0 {
        return Some(Transfer::Failed(NativeCode::from_errno(-res)));
    }
    match op.kind {
        OpKind::Read if op.staged => {
            if op.cancelled {
                return Some(Transfer::Failed(NativeCode::OperationAborted));
            }
            // Safety: buffer is owned by the operation until completion.
            let buf = unsafe { op.buf.as_mut_slice() };
            match op.pipe.try_read(buf) {
                Attempt::Ready(t) => Some(t),
                Attempt::WouldBlock => None,
            }
        }
        OpKind::Read => Some(Transfer::from_raw_read(res as i64, false)),
        OpKind::Write => {
            op.done += res as usize;
            if op.done >= op.buf.len || res == 0 {
                Some(Transfer::Done(op.done))
            } else if op.cancelled {
                Some(Transfer::Failed(NativeCode::OperationAborted))
            } else {
                None
            }
        }
    }
}

/// The reactor loop. Runs on a dedicated OS thread.
fn reactor_loop(mut ring: IoUring, shared: Arc<ReactorShared>, sq_entries: u32) {
    kinfo!("uring: reactor started (sq {})", sq_entries);

    let mut inflight: HashMap<u64, InFlight> = HashMap::new();
    let mut backlog: VecDeque<squeue::Entry> = VecDeque::new();
    let mut completed: Vec<(u64, i32)> = Vec::with_capacity(256);
    let mut wake_armed = false;
    let mut draining = false;

    loop {
        if !wake_armed {
            backlog.push_back(wake_sqe(&shared.wake));
            wake_armed = true;
        }

        // ── Step 1: drain the command queue ──
        while let Some(cmd) = shared.requests.pop() {
            match cmd {
                Command::Submit(op) => {
                    if draining {
                        complete(&shared, op, Transfer::Failed(NativeCode::OperationAborted));
                        continue;
                    }
                    backlog.push_back(build_sqe(&op));
                    inflight.insert(op.id.0, op);
                }
                Command::Cancel(id) => {
                    if let Some(op) = inflight.get_mut(&id.0) {
                        op.cancelled = true;
                        backlog.push_back(cancel_sqe(id));
                    }
                }
            }
        }

        if shared.shutdown.load(Ordering::Acquire) && !draining {
            draining = true;
            for op in inflight.values_mut() {
                op.cancelled = true;
                backlog.push_back(cancel_sqe(op.id));
            }
        }
        if draining && inflight.is_empty() {
            break;
        }

        // ── Step 2: submit + wait for at least one completion ──
        flush_backlog(&mut ring, &mut backlog);
        if let Err(e) = ring.submit_and_wait(1) {
            match e.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EBUSY) | Some(libc::EAGAIN) => {}
                _ => {
                    kerror!("uring: submit failed: {}", e);
                    break;
                }
            }
        }

        // ── Step 3: reap completions ──
        completed.clear();
        completed.extend(ring.completion().map(|cqe| (cqe.user_data(), cqe.result())));

        for &(user_data, res) in &completed {
            match user_data {
                WAKE_TAG => {
                    shared.wake.drain();
                    wake_armed = false;
                }
                CANCEL_TAG => {}
                _ => {
                    let Some(mut op) = inflight.remove(&user_data) else {
                        kdebug!("uring: completion for unknown op {}", OpId(user_data));
                        continue;
                    };
                    match advance(&mut op, res) {
                        Some(result) => complete(&shared, op, result),
                        None => {
                            backlog.push_back(build_sqe(&op));
                            inflight.insert(user_data, op);
                        }
                    }
                }
            }
        }
    }

    // Only reached with operations left after a fatal ring error. Tearing
    // the ring down cancels them in the kernel before targets are told.
    drop(ring);
    for (_, op) in inflight.drain() {
        complete(&shared, op, Transfer::Failed(NativeCode::Os(libc::EIO)));
    }
    while let Some(cmd) = shared.requests.pop() {
        if let Command::Submit(op) = cmd {
            complete(&shared, op, Transfer::Failed(NativeCode::OperationAborted));
        }
    }
    kinfo!("uring: reactor shutdown");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fd_pipe::FdPipe;
    use pipeio_core::kind::TransmissionMode;
    use pipeio_core::transport::NativePipe;
    use std::sync::mpsc;
    use std::time::Duration;

    struct ChannelTarget(Mutex<mpsc::Sender<(OpId, Transfer)>>);

    impl CompletionTarget for ChannelTarget {
        fn on_complete(&self, id: OpId, result: Transfer) {
            let _ = self.0.lock().send((id, result));
        }
    }

    fn target() -> (Arc<dyn CompletionTarget>, mpsc::Receiver<(OpId, Transfer)>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(ChannelTarget(Mutex::new(tx))), rx)
    }

    fn reactor() -> Option<UringReactor> {
        match UringReactor::start(ReactorConfig::default()) {
            Ok(r) => Some(r),
            Err(code) => {
                eprintln!("io_uring unavailable ({}), skipping", code);
                None
            }
        }
    }

    fn issue(
        port: &Arc<dyn CompletionPort>,
        id: OpId,
        kind: OpKind,
        buf: &mut [u8],
        t: &Arc<dyn CompletionTarget>,
    ) -> Issue {
        port.issue(IoRequest {
            id,
            kind,
            buf: BufferHandle::from_mut_slice(buf),
            target: Arc::clone(t),
        })
    }

    #[test]
    fn test_pending_read_completes_on_write() {
        let Some(reactor) = reactor() else { return };
        let (r, w) = FdPipe::anonymous(true).unwrap();
        let port = reactor.port(r_shared(&r));
        let (t, rx) = target();

        let mut buf = vec![0u8; 16];
        let id = OpId::new(1, 1);
        assert_eq!(issue(&port, id, OpKind::Read, &mut buf, &t), Issue::Pending);

        assert_eq!(w.write(b"ping", None), Transfer::Done(4));
        let (got_id, result) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got_id, id);
        assert_eq!(result, Transfer::Done(4));
        assert_eq!(&buf[..4], b"ping");
        assert_eq!(reactor.inflight(), 0);
    }

    #[test]
    fn test_cancel_pending_read() {
        let Some(reactor) = reactor() else { return };
        let (r, _w) = FdPipe::anonymous(true).unwrap();
        let port = reactor.port(r_shared(&r));
        let (t, rx) = target();

        let mut buf = vec![0u8; 16];
        let id = OpId::new(2, 1);
        assert_eq!(issue(&port, id, OpKind::Read, &mut buf, &t), Issue::Pending);
        assert_eq!(port.cancel(id), Ok(()));

        let (_, result) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result, Transfer::Failed(NativeCode::OperationAborted));
        assert_eq!(port.cancel(id), Err(NativeCode::NotFound));
    }

    #[test]
    fn test_message_read_staged_through_reactor() {
        let Some(reactor) = reactor() else { return };
        let (a, b) = FdPipe::pair(TransmissionMode::Message, true).unwrap();
        let port = reactor.port(r_shared(&b));
        let (t, rx) = target();

        a.write(b"0123456789", None);
        let mut buf = vec![0u8; 4];
        assert_eq!(issue(&port, OpId::new(3, 1), OpKind::Read, &mut buf, &t), Issue::Pending);
        let (_, result) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result, Transfer::MoreData(4));

        // Remainder is staged: completes without the reactor.
        let issued = issue(&port, OpId::new(3, 2), OpKind::Read, &mut buf, &t);
        assert_eq!(issued, Issue::Completed(Transfer::MoreData(4)));
        let issued = issue(&port, OpId::new(3, 3), OpKind::Read, &mut buf, &t);
        assert_eq!(issued, Issue::Completed(Transfer::Done(2)));
    }

    #[test]
    fn test_large_write_is_resubmitted() {
        let Some(reactor) = reactor() else { return };
        let (r, w) = FdPipe::anonymous(true).unwrap();
        let port = reactor.port(r_shared(&w));
        let (t, rx) = target();

        let mut payload = vec![3u8; 512 * 1024];
        let expect = payload.len();
        assert_eq!(issue(&port, OpId::new(4, 1), OpKind::Write, &mut payload, &t), Issue::Pending);

        let mut total = 0;
        let mut buf = vec![0u8; 65536];
        while total < expect {
            total += r.read(&mut buf, None).bytes();
        }
        let (_, result) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result, Transfer::Done(expect));
    }

    #[test]
    fn test_shutdown_aborts_pending() {
        let Some(reactor) = reactor() else { return };
        let (r, _w) = FdPipe::anonymous(true).unwrap();
        let port = reactor.port(r_shared(&r));
        let (t, rx) = target();

        let mut buf = vec![0u8; 8];
        assert_eq!(issue(&port, OpId::new(5, 1), OpKind::Read, &mut buf, &t), Issue::Pending);
        reactor.shutdown();
        let (_, result) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result, Transfer::Failed(NativeCode::OperationAborted));
    }

    fn r_shared(pipe: &FdPipe) -> Arc<FdShared> {
        pipe.shared()
    }
}
