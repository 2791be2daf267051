//! `PipeStream` — one end of a native duplex channel.
//!
//! The stream owns the native handle and releases it exactly once, on
//! `close()` or drop. Every call checks direction and state before any
//! native I/O, then takes one of two paths:
//!
//! - overlapped: the handle is bound to a completion port; the call runs
//!   in an operation slot reused across calls (one idle slot per
//!   direction);
//! - async-over-blocking: the call runs as a blocking native call, on a
//!   pool thread for the async forms and on the caller's thread for the
//!   blocking forms.
//!
//! At most one operation per direction is in flight; a second one fails
//! with `InvalidOperation`. Reads and writes are independent.

use pipeio_core::cancel::CancellationToken;
use pipeio_core::error::{PipeError, PipeResult};
use pipeio_core::kind::{PipeDirection, PipeKind, PipeState, TransmissionMode};
use pipeio_core::status::{NativeCode, Transfer};
use pipeio_core::transport::{BufferHandle, CompletionPort, NativePipe, OpKind};
use pipeio_core::worker::WorkerPool;
use pipeio_core::{kdebug, ktrace, kwarn};
use pipeio_module::fd_pipe::FdPipe;

use parking_lot::RwLock;
use std::fmt;
use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::classify::classify;
use crate::dispatch::{call_blocking, dispatch};
use crate::runtime;
use crate::slot::{OpSlot, SlotBuffer, SlotOp};
use crate::state::ConnStatus;

/// Result of an owned-buffer operation; the buffer always comes back.
#[derive(Debug)]
pub struct BufResult<T>(pub PipeResult<T>, pub Vec<u8>);

impl<T> BufResult<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> BufResult<U> {
        BufResult(self.0.map(f), self.1)
    }

    /// Drop the buffer.
    pub fn into_result(self) -> PipeResult<T> {
        self.0
    }
}

#[inline]
const fn index(kind: OpKind) -> usize {
    match kind {
        OpKind::Read => 0,
        OpKind::Write => 1,
    }
}

pub(crate) struct StreamInner {
    handle: RwLock<Option<Arc<dyn NativePipe>>>,
    port: RwLock<Option<Arc<dyn CompletionPort>>>,
    pool: Option<Arc<dyn WorkerPool>>,
    direction: PipeDirection,
    kind: PipeKind,
    status: ConnStatus,
    /// Answer property queries from the values below
    trust_cache: AtomicBool,
    cached_mode: TransmissionMode,
    cached_out_buffer: usize,
    cached_read_mode: AtomicU8,
    /// Direction has an operation in flight
    busy: [AtomicBool; 2],
    /// One-deep free list per direction
    idle: [AtomicPtr<OpSlot>; 2],
    slots_allocated: [AtomicUsize; 2],
    /// Fired by `close()`; aborts in-flight calls
    close_token: CancellationToken,
}

impl StreamInner {
    #[inline]
    pub(crate) fn status(&self) -> &ConnStatus {
        &self.status
    }

    #[inline]
    pub(crate) fn close_token(&self) -> &CancellationToken {
        &self.close_token
    }

    fn pipe(&self) -> PipeResult<Arc<dyn NativePipe>> {
        self.handle.read().clone().ok_or(PipeError::PipeClosed)
    }

    fn port(&self) -> Option<Arc<dyn CompletionPort>> {
        self.port.read().clone()
    }

    fn pool(&self) -> PipeResult<Arc<dyn WorkerPool>> {
        match &self.pool {
            Some(pool) => Ok(Arc::clone(pool)),
            None => runtime::default_pool(),
        }
    }

    /// Reuse the idle slot of `kind` or allocate one.
    fn take_slot(self: &Arc<Self>, kind: OpKind) -> Arc<OpSlot> {
        let i = index(kind);
        let raw = self.idle[i].swap(ptr::null_mut(), Ordering::AcqRel);
        if !raw.is_null() {
            // Safety: installed by `recycle` from `Arc::into_raw`.
            return unsafe { Arc::from_raw(raw) };
        }
        self.slots_allocated[i].fetch_add(1, Ordering::Relaxed);
        OpSlot::new(kind, Arc::downgrade(self))
    }

    /// Offer a finished slot to the idle cell; the loser is released.
    pub(crate) fn recycle(&self, slot: Arc<OpSlot>) {
        if self.status.get() == PipeState::Closed {
            return;
        }
        let i = index(slot.kind());
        let raw = Arc::into_raw(slot) as *mut OpSlot;
        if self
            .idle[i]
            .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Safety: not installed, so still ours.
            drop(unsafe { Arc::from_raw(raw) });
        }
    }

    pub(crate) fn release_busy(&self, kind: OpKind) {
        self.busy[index(kind)].store(false, Ordering::Release);
    }

    fn drop_idle(&self) {
        for cell in &self.idle {
            let raw = cell.swap(ptr::null_mut(), Ordering::AcqRel);
            if !raw.is_null() {
                // Safety: installed by `recycle` from `Arc::into_raw`.
                drop(unsafe { Arc::from_raw(raw) });
            }
        }
    }
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        self.drop_idle();
    }
}

/// Holds one direction's in-flight flag.
pub(crate) struct DirGuard {
    owner: Arc<StreamInner>,
    kind: OpKind,
    armed: bool,
}

impl DirGuard {
    fn acquire(owner: &Arc<StreamInner>, kind: OpKind) -> PipeResult<DirGuard> {
        if owner.busy[index(kind)].swap(true, Ordering::AcqRel) {
            return Err(PipeError::InvalidOperation(match kind {
                OpKind::Read => "another read is already in flight",
                OpKind::Write => "another write is already in flight",
            }));
        }
        Ok(DirGuard {
            owner: Arc::clone(owner),
            kind,
            armed: true,
        })
    }

    /// Leave the flag set; whoever finishes the operation clears it.
    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for DirGuard {
    fn drop(&mut self) {
        if self.armed {
            self.owner.release_busy(self.kind);
        }
    }
}

/// What the entry checks decided.
enum Entry {
    Run,
    /// Finished without native I/O.
    Done(usize),
}

/// Builder for [`PipeStream`].
pub struct PipeStreamBuilder {
    pipe: Arc<dyn NativePipe>,
    direction: PipeDirection,
    kind: PipeKind,
    pool: Option<Arc<dyn WorkerPool>>,
    connected: bool,
    trust_cache: Option<bool>,
}

impl PipeStreamBuilder {
    pub fn direction(mut self, direction: PipeDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn kind(mut self, kind: PipeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Pool for async calls on the blocking path (default: runtime pool)
    pub fn pool(mut self, pool: Arc<dyn WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Start Connected instead of Unconnected
    pub fn connected(mut self, connected: bool) -> Self {
        self.connected = connected;
        self
    }

    /// Override whether property queries may use cached values
    pub fn trust_cache(mut self, trust: bool) -> Self {
        self.trust_cache = Some(trust);
        self
    }

    pub fn build(self) -> PipeStream {
        let pipe = self.pipe;
        // Reactor settings must be in place before the first bind.
        let settings = runtime::config();

        let port = if pipe.is_overlapped() {
            match pipe.bind() {
                Ok(port) => Some(port),
                Err(code) => {
                    kwarn!("pipe: bind failed ({}), using the blocking path", code);
                    None
                }
            }
        } else {
            None
        };

        let trust_cache = self
            .trust_cache
            .unwrap_or_else(|| self.kind.trusts_cache() && settings.trust_cache);
        let (cached_mode, cached_out_buffer) = match self.kind {
            PipeKind::Anonymous => (TransmissionMode::Byte, 0),
            _ if !trust_cache => (TransmissionMode::Byte, 0),
            _ => match pipe.info() {
                Ok(info) => (info.mode, info.out_buffer_size),
                Err(_) => (TransmissionMode::Byte, 0),
            },
        };
        let cached_read_mode = if trust_cache {
            pipe.read_mode()
        } else {
            TransmissionMode::Byte
        };

        kdebug!(
            "pipe: open {} {:?} ({})",
            self.kind,
            self.direction,
            if port.is_some() { "overlapped" } else { "blocking" }
        );
        PipeStream {
            inner: Arc::new(StreamInner {
                handle: RwLock::new(Some(pipe)),
                port: RwLock::new(port),
                pool: self.pool,
                direction: self.direction,
                kind: self.kind,
                status: ConnStatus::new(self.connected),
                trust_cache: AtomicBool::new(trust_cache),
                cached_mode,
                cached_out_buffer,
                cached_read_mode: AtomicU8::new(cached_read_mode as u8),
                busy: [AtomicBool::new(false), AtomicBool::new(false)],
                idle: [AtomicPtr::new(ptr::null_mut()), AtomicPtr::new(ptr::null_mut())],
                slots_allocated: [AtomicUsize::new(0), AtomicUsize::new(0)],
                close_token: CancellationToken::new(),
            }),
        }
    }
}

/// One end of a native duplex channel.
pub struct PipeStream {
    inner: Arc<StreamInner>,
}

impl PipeStream {
    /// Wrap a native pipe. Defaults: InOut, Named, Unconnected.
    pub fn builder(pipe: impl NativePipe + 'static) -> PipeStreamBuilder {
        PipeStreamBuilder {
            pipe: Arc::new(pipe),
            direction: PipeDirection::InOut,
            kind: PipeKind::Named,
            pool: None,
            connected: false,
            trust_cache: None,
        }
    }

    /// Unnamed pipe pair: (read end, write end).
    pub fn anonymous(overlapped: bool) -> PipeResult<(PipeStream, PipeStream)> {
        let (r, w) = FdPipe::anonymous(overlapped).map_err(PipeError::Io)?;
        let end = |pipe: FdPipe, direction| {
            PipeStream::builder(pipe)
                .direction(direction)
                .kind(PipeKind::Anonymous)
                .connected(true)
                .build()
        };
        Ok((end(r, PipeDirection::In), end(w, PipeDirection::Out)))
    }

    /// Connected duplex pair in the given transmission mode.
    pub fn pair(mode: TransmissionMode, overlapped: bool) -> PipeResult<(PipeStream, PipeStream)> {
        let (a, b) = FdPipe::pair(mode, overlapped).map_err(PipeError::Io)?;
        let end = |pipe: FdPipe| PipeStream::builder(pipe).connected(true).build();
        Ok((end(a), end(b)))
    }

    /// Take ownership of an existing descriptor.
    pub fn from_owned_fd(
        fd: OwnedFd,
        direction: PipeDirection,
        overlapped: bool,
    ) -> PipeResult<PipeStream> {
        let pipe = FdPipe::from_owned_fd(fd, overlapped).map_err(PipeError::Io)?;
        Ok(PipeStream::builder(pipe)
            .direction(direction)
            .kind(PipeKind::FromExistingHandle)
            .connected(true)
            .build())
    }

    /// Handshake finished: Unconnected → Connected.
    pub fn mark_connected(&self) -> PipeResult<()> {
        if self.inner.status.connect() {
            Ok(())
        } else {
            Err(PipeError::InvalidOperation("pipe is broken or closed"))
        }
    }

    fn enter(&self, kind: OpKind, len: usize, token: &CancellationToken) -> PipeResult<Entry> {
        match kind {
            OpKind::Read if !self.inner.direction.can_read() => {
                return Err(PipeError::ReadNotSupported)
            }
            OpKind::Write if !self.inner.direction.can_write() => {
                return Err(PipeError::WriteNotSupported)
            }
            _ => {}
        }
        let status = &self.inner.status;
        let state = status.check_open()?;
        if kind == OpKind::Write && state == PipeState::Broken {
            return Err(PipeError::PipeBroken(status.broken_code()));
        }
        token.check()?;

        if len == 0 {
            if kind == OpKind::Read {
                status.set_message_complete(false);
            }
            return Ok(Entry::Done(0));
        }
        if state == PipeState::Broken {
            ktrace!("pipe: read on broken pipe");
            return Ok(Entry::Done(0));
        }
        Ok(Entry::Run)
    }

    /// Blocking read.
    pub fn read(&self, buf: &mut [u8]) -> PipeResult<usize> {
        self.read_with(buf, &CancellationToken::none())
    }

    /// Blocking read that `token` can cancel.
    pub fn read_with(&self, buf: &mut [u8], token: &CancellationToken) -> PipeResult<usize> {
        if let Entry::Done(n) = self.enter(OpKind::Read, buf.len(), token)? {
            return Ok(n);
        }
        let guard = DirGuard::acquire(&self.inner, OpKind::Read)?;
        match self.inner.port() {
            Some(port) => {
                let borrowed = SlotBuffer::Borrowed(BufferHandle::from_mut_slice(buf));
                self.block_on_slot(OpKind::Read, port, borrowed, token, guard)
            }
            None => {
                let pipe = self.inner.pipe()?;
                call_blocking(&self.inner, OpKind::Read, token, |t| pipe.read(buf, t))
            }
        }
    }

    /// Blocking write of the whole buffer.
    pub fn write(&self, buf: &[u8]) -> PipeResult<()> {
        self.write_with(buf, &CancellationToken::none())
    }

    /// Blocking write that `token` can cancel.
    pub fn write_with(&self, buf: &[u8], token: &CancellationToken) -> PipeResult<()> {
        if let Entry::Done(_) = self.enter(OpKind::Write, buf.len(), token)? {
            return Ok(());
        }
        let guard = DirGuard::acquire(&self.inner, OpKind::Write)?;
        match self.inner.port() {
            Some(port) => {
                let borrowed = SlotBuffer::Borrowed(BufferHandle::from_slice(buf));
                self.block_on_slot(OpKind::Write, port, borrowed, token, guard)
                    .map(|_| ())
            }
            None => {
                let pipe = self.inner.pipe()?;
                call_blocking(&self.inner, OpKind::Write, token, |t| pipe.write(buf, t))
                    .map(|_| ())
            }
        }
    }

    /// Drive an overlapped operation on a borrowed buffer to completion.
    fn block_on_slot(
        &self,
        kind: OpKind,
        port: Arc<dyn CompletionPort>,
        buf: SlotBuffer,
        token: &CancellationToken,
        guard: DirGuard,
    ) -> PipeResult<usize> {
        let slot = self.inner.take_slot(kind);
        let op = SlotOp::start(Arc::clone(&self.inner), slot, port, buf, token, guard);
        futures::executor::block_on(op).0
    }

    /// Read into an owned buffer.
    ///
    /// The buffer comes back in the result whatever the outcome. Nothing
    /// happens until the future is first polled.
    pub async fn read_async(&self, buf: Vec<u8>, token: &CancellationToken) -> BufResult<usize> {
        let guard = match self.admit(OpKind::Read, &buf, token) {
            Ok(Ok(guard)) => guard,
            Ok(Err(n)) => return BufResult(Ok(n), buf),
            Err(e) => return BufResult(Err(e), buf),
        };
        self.submit(OpKind::Read, buf, token, guard).await
    }

    /// Write an owned buffer.
    pub async fn write_async(&self, buf: Vec<u8>, token: &CancellationToken) -> BufResult<()> {
        let guard = match self.admit(OpKind::Write, &buf, token) {
            Ok(Ok(guard)) => guard,
            Ok(Err(_)) => return BufResult(Ok(()), buf),
            Err(e) => return BufResult(Err(e), buf),
        };
        self.submit(OpKind::Write, buf, token, guard)
            .await
            .map(|_| ())
    }

    /// Entry checks plus the direction flag. `Ok(Err(n))`: done already.
    fn admit(
        &self,
        kind: OpKind,
        buf: &[u8],
        token: &CancellationToken,
    ) -> PipeResult<Result<DirGuard, usize>> {
        match self.enter(kind, buf.len(), token)? {
            Entry::Done(n) => Ok(Err(n)),
            Entry::Run => DirGuard::acquire(&self.inner, kind).map(Ok),
        }
    }

    async fn submit(
        &self,
        kind: OpKind,
        buf: Vec<u8>,
        token: &CancellationToken,
        guard: DirGuard,
    ) -> BufResult<usize> {
        if let Some(port) = self.inner.port() {
            let slot = self.inner.take_slot(kind);
            let owned = SlotBuffer::Owned(buf);
            let op = SlotOp::start(Arc::clone(&self.inner), slot, port, owned, token, guard);
            let (result, buf) = op.await;
            return BufResult(result, buf.into_vec());
        }

        let pipe = match self.inner.pipe() {
            Ok(pipe) => pipe,
            Err(e) => return BufResult(Err(e), buf),
        };
        let pool = match self.inner.pool() {
            Ok(pool) => pool,
            Err(e) => return BufResult(Err(e), buf),
        };
        dispatch(
            pool,
            Arc::clone(&self.inner),
            pipe,
            kind,
            buf,
            token.clone(),
            guard,
        )
        .await
    }

    /// Block until the peer has read everything written so far.
    pub fn drain(&self) -> PipeResult<()> {
        if !self.inner.direction.can_write() {
            return Err(PipeError::WriteNotSupported);
        }
        let status = &self.inner.status;
        if status.check_open()? == PipeState::Broken {
            return Err(PipeError::PipeBroken(status.broken_code()));
        }
        match self.inner.pipe()?.drain() {
            Ok(()) => Ok(()),
            Err(code) => classify(
                status,
                OpKind::Write,
                Transfer::Failed(code),
                &CancellationToken::none(),
            )
            .map(|_| ()),
        }
    }

    /// Close the connection and release the handle.
    ///
    /// In-flight calls are aborted and report `PipeClosed`. Closing twice
    /// is a no-op.
    pub fn close(&self) {
        if !self.inner.status.close() {
            return;
        }
        let port = self.inner.port.write().take();
        let handle = self.inner.handle.write().take();
        self.inner.close_token.cancel();
        self.inner.drop_idle();
        drop(port);
        if handle.is_some() {
            kdebug!("pipe: handle released");
        }
        drop(handle);
    }

    pub fn state(&self) -> PipeState {
        self.inner.status.get()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == PipeState::Connected
    }

    pub fn direction(&self) -> PipeDirection {
        self.inner.direction
    }

    pub fn kind(&self) -> PipeKind {
        self.inner.kind
    }

    pub fn can_read(&self) -> bool {
        self.inner.direction.can_read()
    }

    pub fn can_write(&self) -> bool {
        self.inner.direction.can_write()
    }

    /// Whether calls complete through a completion port.
    pub fn is_overlapped(&self) -> bool {
        self.inner.port.read().is_some()
    }

    fn trusts_cache(&self) -> bool {
        self.inner.trust_cache.load(Ordering::Acquire)
    }

    /// Transmission mode of the channel.
    pub fn transmission_mode(&self) -> PipeResult<TransmissionMode> {
        self.inner.status.check_open()?;
        match self.inner.kind {
            PipeKind::Anonymous => Ok(TransmissionMode::Byte),
            PipeKind::Named if self.trusts_cache() => Ok(self.inner.cached_mode),
            _ => self.live_info().map(|info| info.mode),
        }
    }

    /// Inbound buffer size; live query.
    pub fn in_buffer_size(&self) -> PipeResult<usize> {
        if !self.can_read() {
            return Err(PipeError::ReadNotSupported);
        }
        self.inner.status.check_open()?;
        self.live_info().map(|info| info.in_buffer_size)
    }

    /// Outbound buffer size; cached for write-only ends.
    pub fn out_buffer_size(&self) -> PipeResult<usize> {
        if !self.can_write() {
            return Err(PipeError::WriteNotSupported);
        }
        self.inner.status.check_open()?;
        if self.inner.direction == PipeDirection::Out
            && self.trusts_cache()
            && self.inner.cached_out_buffer != 0
        {
            return Ok(self.inner.cached_out_buffer);
        }
        self.live_info().map(|info| info.out_buffer_size)
    }

    fn live_info(&self) -> PipeResult<pipeio_core::transport::PipeInfo> {
        self.inner.pipe()?.info().map_err(PipeError::Io)
    }

    pub fn read_mode(&self) -> PipeResult<TransmissionMode> {
        self.inner.status.check_open()?;
        if self.trusts_cache() {
            return Ok(self.inner.cached_read_mode.load(Ordering::Acquire).into());
        }
        Ok(self.inner.pipe()?.read_mode())
    }

    pub fn set_read_mode(&self, mode: TransmissionMode) -> PipeResult<()> {
        self.inner.status.check_open()?;
        if mode == TransmissionMode::Message && !self.inner.kind.supports_message_mode() {
            return Err(PipeError::Unsupported("message read mode"));
        }
        match self.inner.pipe()?.set_read_mode(mode) {
            Ok(()) => {
                self.inner.cached_read_mode.store(mode as u8, Ordering::Release);
                Ok(())
            }
            Err(NativeCode::Os(libc::EINVAL)) => Err(
                PipeError::InvalidOperation("message read mode needs a message-mode channel"),
            ),
            Err(code) => Err(PipeError::Io(code)),
        }
    }

    /// Whether the last read finished its message.
    pub fn is_message_complete(&self) -> PipeResult<bool> {
        if self.read_mode()? != TransmissionMode::Message {
            return Err(PipeError::InvalidOperation(
                "message completion requires message read mode",
            ));
        }
        Ok(self.inner.status.message_complete())
    }

    /// The raw descriptor. Cached properties are no longer trusted
    /// afterwards, since the handle may be changed behind our back.
    pub fn raw_handle(&self) -> Option<RawFd> {
        self.inner.trust_cache.store(false, Ordering::Release);
        self.inner.pipe().ok()?.raw_fd()
    }

    /// Pipes have no length.
    pub fn length(&self) -> PipeResult<u64> {
        Err(PipeError::Unsupported("length"))
    }

    /// Operation slots ever allocated for `kind` (diagnostics).
    pub fn slots_allocated(&self, kind: OpKind) -> usize {
        self.inner.slots_allocated[index(kind)].load(Ordering::Relaxed)
    }
}

impl Drop for PipeStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for PipeStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeStream")
            .field("kind", &self.inner.kind)
            .field("direction", &self.inner.direction)
            .field("state", &self.state())
            .field("overlapped", &self.is_overlapped())
            .finish()
    }
}

impl io::Read for &PipeStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        PipeStream::read(*self, buf).map_err(Into::into)
    }
}

impl io::Write for &PipeStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        PipeStream::write(*self, buf)?;
        Ok(buf.len())
    }

    /// Pipes are unbuffered.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Read for PipeStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut &*self, buf)
    }
}

impl io::Write for PipeStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(&mut &*self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Seek for PipeStream {
    fn seek(&mut self, _pos: io::SeekFrom) -> io::Result<u64> {
        Err(PipeError::Unsupported("seek").into())
    }
}
