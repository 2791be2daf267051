//! `MemPipe` — in-memory `NativePipe` pair for deterministic tests.
//!
//! Both ends share one mutex-protected state. Every native entry point is
//! counted in `MemStats`, so tests can assert that an operation never
//! reached the transport. A `MemProbe` keeps access to an end after the
//! end itself has been moved into a stream.
//!
//! Overlapped behavior:
//! - a read with data available completes synchronously; without data it
//!   is parked and completed by the next peer write (on the writer's
//!   thread) or by the peer closing (`BrokenPipe`);
//! - with `complete_async` set, every issue returns `Pending` and the
//!   completion is delivered from a helper thread;
//! - `cancel(id)` aborts a parked read and reports `NotFound` otherwise.
//!
//! Blocking reads poll the interrupt flag of the caller's `ThreadHandle`
//! every millisecond while waiting.

use pipeio_core::kind::TransmissionMode;
use pipeio_core::status::{Issue, NativeCode, Transfer};
use pipeio_core::thread_handle::ThreadHandle;
use pipeio_core::transport::{
    BufferHandle, CompletionPort, CompletionTarget, IoRequest, NativePipe, OpId, OpKind, PipeInfo,
};

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const WAIT_SLICE: Duration = Duration::from_millis(1);

/// Native call counters of one end.
#[derive(Debug, Default)]
pub struct MemStats {
    /// Blocking reads
    pub reads: AtomicUsize,
    /// Blocking writes
    pub writes: AtomicUsize,
    /// Operations handed to the completion port
    pub issues: AtomicUsize,
    pub cancels: AtomicUsize,
    pub binds: AtomicUsize,
    /// Live property queries
    pub queries: AtomicUsize,
    /// Times the end was released (dropped)
    pub releases: AtomicUsize,
}

impl MemStats {
    /// Reads, writes and issues together.
    pub fn native_calls(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
            + self.writes.load(Ordering::SeqCst)
            + self.issues.load(Ordering::SeqCst)
    }

    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

struct PendingRead {
    id: OpId,
    buf: BufferHandle,
    target: Arc<dyn CompletionTarget>,
}

struct EndState {
    /// Messages travelling towards this end.
    inbox: VecDeque<Vec<u8>>,
    closed: bool,
    pending_read: Option<PendingRead>,
    read_error: Option<NativeCode>,
    write_error: Option<NativeCode>,
    read_mode: TransmissionMode,
    complete_async: bool,
    in_buffer_size: usize,
    out_buffer_size: usize,
}

impl EndState {
    fn new(mode: TransmissionMode) -> Self {
        Self {
            inbox: VecDeque::new(),
            closed: false,
            pending_read: None,
            read_error: None,
            write_error: None,
            read_mode: mode,
            complete_async: false,
            in_buffer_size: 4096,
            out_buffer_size: 4096,
        }
    }
}

struct Shared {
    ends: Mutex<[EndState; 2]>,
    cond: Condvar,
    mode: TransmissionMode,
    overlapped: bool,
}

/// A completion to deliver once the state lock is released.
type Delivery = (Arc<dyn CompletionTarget>, OpId, Transfer);

fn deliver(d: Option<Delivery>) {
    if let Some((target, id, result)) = d {
        target.on_complete(id, result);
    }
}

fn deliver_later(target: Arc<dyn CompletionTarget>, id: OpId, result: Transfer) {
    thread::spawn(move || target.on_complete(id, result));
}

impl Shared {
    /// Move inbox bytes of `side` into `buf`.
    fn take_inbox(&self, end: &mut EndState, buf: &mut [u8]) -> Option<Transfer> {
        if end.inbox.is_empty() {
            return None;
        }
        match self.mode {
            TransmissionMode::Byte => {
                let mut n = 0;
                while n < buf.len() {
                    let Some(front) = end.inbox.front_mut() else { break };
                    let take = front.len().min(buf.len() - n);
                    buf[n..n + take].copy_from_slice(&front[..take]);
                    front.drain(..take);
                    if front.is_empty() {
                        end.inbox.pop_front();
                    }
                    n += take;
                }
                Some(Transfer::Done(n))
            }
            TransmissionMode::Message => {
                let front = end.inbox.front_mut()?;
                let n = front.len().min(buf.len());
                buf[..n].copy_from_slice(&front[..n]);
                front.drain(..n);
                if front.is_empty() {
                    end.inbox.pop_front();
                    Some(Transfer::Done(n))
                } else if end.read_mode == TransmissionMode::Message {
                    Some(Transfer::MoreData(n))
                } else {
                    Some(Transfer::Done(n))
                }
            }
        }
    }

    /// Queue `data` for `to`, completing its parked read if there is one.
    fn push(&self, ends: &mut [EndState; 2], to: usize, data: &[u8]) -> Option<Delivery> {
        ends[to].inbox.push_back(data.to_vec());
        self.cond.notify_all();
        let pending = ends[to].pending_read.take()?;
        // Safety: the issuer keeps the buffer alive until completion.
        let buf = unsafe { pending.buf.as_mut_slice() };
        let result = self
            .take_inbox(&mut ends[to], buf)
            .unwrap_or(Transfer::Done(0));
        Some((pending.target, pending.id, result))
    }
}

/// One end of an in-memory pipe.
pub struct MemPipe {
    shared: Arc<Shared>,
    side: usize,
    stats: Arc<MemStats>,
}

/// Test-side access to an end that may have been moved elsewhere.
#[derive(Clone)]
pub struct MemProbe {
    shared: Arc<Shared>,
    side: usize,
    stats: Arc<MemStats>,
}

impl MemPipe {
    /// A connected pair.
    pub fn pair(mode: TransmissionMode, overlapped: bool) -> (MemPipe, MemPipe) {
        let shared = Arc::new(Shared {
            ends: Mutex::new([EndState::new(mode), EndState::new(mode)]),
            cond: Condvar::new(),
            mode,
            overlapped,
        });
        let end = |side| MemPipe {
            shared: Arc::clone(&shared),
            side,
            stats: Arc::new(MemStats::default()),
        };
        (end(0), end(1))
    }

    pub fn probe(&self) -> MemProbe {
        MemProbe {
            shared: Arc::clone(&self.shared),
            side: self.side,
            stats: Arc::clone(&self.stats),
        }
    }

    pub fn stats(&self) -> Arc<MemStats> {
        Arc::clone(&self.stats)
    }

    fn peer(&self) -> usize {
        1 - self.side
    }
}

impl MemProbe {
    pub fn stats(&self) -> &MemStats {
        &self.stats
    }

    fn ends(&self) -> MutexGuard<'_, [EndState; 2]> {
        self.shared.ends.lock()
    }

    /// Whether a read issued on this end is parked.
    pub fn has_pending_read(&self) -> bool {
        self.ends()[self.side].pending_read.is_some()
    }

    /// Bytes waiting to be read by this end.
    pub fn inbox_len(&self) -> usize {
        self.ends()[self.side].inbox.iter().map(Vec::len).sum()
    }

    /// Fail the next read on this end with `code`.
    pub fn inject_read_error(&self, code: NativeCode) {
        self.ends()[self.side].read_error = Some(code);
    }

    /// Fail the next write on this end with `code`.
    pub fn inject_write_error(&self, code: NativeCode) {
        self.ends()[self.side].write_error = Some(code);
    }

    /// Deliver every overlapped completion from a helper thread.
    pub fn set_complete_async(&self, on: bool) {
        self.ends()[self.side].complete_async = on;
    }

    pub fn set_buffer_sizes(&self, in_size: usize, out_size: usize) {
        let mut ends = self.ends();
        ends[self.side].in_buffer_size = in_size;
        ends[self.side].out_buffer_size = out_size;
    }

    /// Whether this end has been released.
    pub fn is_released(&self) -> bool {
        self.ends()[self.side].closed
    }
}

impl NativePipe for MemPipe {
    fn read(&self, buf: &mut [u8], thread: Option<&ThreadHandle>) -> Transfer {
        self.stats.reads.fetch_add(1, Ordering::SeqCst);
        let guard = thread.map(|t| t.enter());
        let mut ends = self.shared.ends.lock();
        if let Some(code) = ends[self.side].read_error.take() {
            return Transfer::Failed(code);
        }
        loop {
            if let Some(t) = self.shared.take_inbox(&mut ends[self.side], buf) {
                return t;
            }
            if ends[self.peer()].closed {
                return Transfer::Failed(NativeCode::BrokenPipe);
            }
            if let Some(g) = &guard {
                if g.take_interrupt() {
                    return Transfer::Failed(NativeCode::OperationAborted);
                }
            }
            self.shared.cond.wait_for(&mut ends, WAIT_SLICE);
        }
    }

    fn write(&self, buf: &[u8], _thread: Option<&ThreadHandle>) -> Transfer {
        self.stats.writes.fetch_add(1, Ordering::SeqCst);
        let delivery = {
            let mut ends = self.shared.ends.lock();
            if let Some(code) = ends[self.side].write_error.take() {
                return Transfer::Failed(code);
            }
            if ends[self.peer()].closed {
                return Transfer::Failed(NativeCode::BrokenPipe);
            }
            self.shared.push(&mut ends, self.peer(), buf)
        };
        deliver(delivery);
        Transfer::Done(buf.len())
    }

    fn drain(&self) -> Result<(), NativeCode> {
        let mut ends = self.shared.ends.lock();
        loop {
            let peer = &ends[self.peer()];
            if peer.inbox.is_empty() {
                return Ok(());
            }
            if peer.closed {
                return Err(NativeCode::BrokenPipe);
            }
            self.shared.cond.wait_for(&mut ends, WAIT_SLICE);
        }
    }

    fn info(&self) -> Result<PipeInfo, NativeCode> {
        self.stats.queries.fetch_add(1, Ordering::SeqCst);
        let ends = self.shared.ends.lock();
        Ok(PipeInfo {
            mode: self.shared.mode,
            in_buffer_size: ends[self.side].in_buffer_size,
            out_buffer_size: ends[self.side].out_buffer_size,
        })
    }

    fn read_mode(&self) -> TransmissionMode {
        self.stats.queries.fetch_add(1, Ordering::SeqCst);
        self.shared.ends.lock()[self.side].read_mode
    }

    fn set_read_mode(&self, mode: TransmissionMode) -> Result<(), NativeCode> {
        if mode == TransmissionMode::Message && self.shared.mode == TransmissionMode::Byte {
            return Err(NativeCode::Os(libc::EINVAL));
        }
        self.shared.ends.lock()[self.side].read_mode = mode;
        Ok(())
    }

    fn is_overlapped(&self) -> bool {
        self.shared.overlapped
    }

    fn bind(&self) -> Result<Arc<dyn CompletionPort>, NativeCode> {
        self.stats.binds.fetch_add(1, Ordering::SeqCst);
        if !self.shared.overlapped {
            return Err(NativeCode::Os(libc::EOPNOTSUPP));
        }
        Ok(Arc::new(MemPort {
            shared: Arc::clone(&self.shared),
            side: self.side,
            stats: Arc::clone(&self.stats),
        }))
    }
}

impl Drop for MemPipe {
    fn drop(&mut self) {
        self.stats.releases.fetch_add(1, Ordering::SeqCst);
        let (own, peer) = {
            let mut ends = self.shared.ends.lock();
            ends[self.side].closed = true;
            let own = ends[self.side].pending_read.take();
            let peer = ends[self.peer()].pending_read.take();
            self.shared.cond.notify_all();
            (own, peer)
        };
        if let Some(p) = own {
            p.target.on_complete(p.id, Transfer::Failed(NativeCode::OperationAborted));
        }
        if let Some(p) = peer {
            p.target.on_complete(p.id, Transfer::Failed(NativeCode::BrokenPipe));
        }
    }
}

/// Completion port of one `MemPipe` end.
struct MemPort {
    shared: Arc<Shared>,
    side: usize,
    stats: Arc<MemStats>,
}

impl MemPort {
    fn issue_read(&self, req: IoRequest) -> Issue {
        let mut ends = self.shared.ends.lock();
        let peer_closed = ends[1 - self.side].closed;
        let end = &mut ends[self.side];
        if let Some(code) = end.read_error.take() {
            return Issue::Completed(Transfer::Failed(code));
        }
        if end.pending_read.is_some() {
            return Issue::Completed(Transfer::Failed(NativeCode::Os(libc::EBUSY)));
        }

        // Safety: the issuer keeps the buffer alive until completion.
        let buf = unsafe { req.buf.as_mut_slice() };
        let now = match self.shared.take_inbox(end, buf) {
            Some(t) => Some(t),
            None if peer_closed => Some(Transfer::Failed(NativeCode::BrokenPipe)),
            None => None,
        };
        match now {
            Some(t) if end.complete_async => {
                drop(ends);
                deliver_later(req.target, req.id, t);
                Issue::Pending
            }
            Some(t) => Issue::Completed(t),
            None => {
                end.pending_read = Some(PendingRead {
                    id: req.id,
                    buf: req.buf,
                    target: req.target,
                });
                Issue::Pending
            }
        }
    }

    fn issue_write(&self, req: IoRequest) -> Issue {
        let (delivery, complete_async) = {
            let mut ends = self.shared.ends.lock();
            if let Some(code) = ends[self.side].write_error.take() {
                return Issue::Completed(Transfer::Failed(code));
            }
            if ends[1 - self.side].closed {
                return Issue::Completed(Transfer::Failed(NativeCode::BrokenPipe));
            }
            // Safety: the issuer keeps the buffer alive until completion.
            let data = unsafe { req.buf.as_slice() };
            let delivery = self.shared.push(&mut ends, 1 - self.side, data);
            (delivery, ends[self.side].complete_async)
        };
        deliver(delivery);
        let result = Transfer::Done(req.buf.len());
        if complete_async {
            deliver_later(req.target, req.id, result);
            return Issue::Pending;
        }
        Issue::Completed(result)
    }
}

impl CompletionPort for MemPort {
    fn issue(&self, req: IoRequest) -> Issue {
        self.stats.issues.fetch_add(1, Ordering::SeqCst);
        match req.kind {
            OpKind::Read => self.issue_read(req),
            OpKind::Write => self.issue_write(req),
        }
    }

    fn cancel(&self, id: OpId) -> Result<(), NativeCode> {
        self.stats.cancels.fetch_add(1, Ordering::SeqCst);
        let pending = {
            let mut ends = self.shared.ends.lock();
            let end = &mut ends[self.side];
            match &end.pending_read {
                Some(p) if p.id == id => end.pending_read.take(),
                _ => None,
            }
        };
        match pending {
            Some(p) => {
                p.target.on_complete(p.id, Transfer::Failed(NativeCode::OperationAborted));
                Ok(())
            }
            None => Err(NativeCode::NotFound),
        }
    }
}
