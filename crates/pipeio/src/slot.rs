//! Operation slots: reusable per-direction state of one overlapped call.
//!
//! A slot carries a version that advances on every `prepare`. The port
//! completes an operation by `OpId` (slot id + version); a completion whose
//! version does not match the slot's current one is a contract violation
//! and is dropped.
//!
//! Phase word (`version << 32 | phase`):
//!
//! ```text
//!   IDLE ──prepare──► PREPARED ──issue──► PENDING ──callback──► COMPLETING ──► COMPLETE
//!                                            │                                    │
//!                                     awaiter dropped                      awaiter takes
//!                                            ▼                              result, reset
//!                                        ABANDONED ──callback──► recycled       ▼
//!                                                                              IDLE
//! ```
//!
//! The completion callback never takes a lock. After completion the slot
//! is offered to its connection's idle cell; if the cell is occupied the
//! slot is released.

use pipeio_core::cancel::CancellationToken;
use pipeio_core::error::PipeResult;
use pipeio_core::status::{Issue, NativeCode, Transfer};
use pipeio_core::transport::{
    BufferHandle, CompletionPort, CompletionTarget, IoRequest, OpId, OpKind,
};
use pipeio_core::{ktrace, kwarn};

use futures::task::AtomicWaker;
use std::cell::UnsafeCell;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::thread;

use crate::bridge::{Armed, Bridge, CancelTarget};
use crate::classify::classify;
use crate::stream::{DirGuard, StreamInner};

const IDLE: u32 = 0;
const PREPARED: u32 = 1;
const PENDING: u32 = 2;
const COMPLETING: u32 = 3;
const COMPLETE: u32 = 4;
const ABANDONED: u32 = 5;

static NEXT_SLOT_ID: AtomicU32 = AtomicU32::new(1);

#[inline]
const fn pack(version: u32, phase: u32) -> u64 {
    ((version as u64) << 32) | phase as u64
}

#[inline]
const fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

/// Buffer an operation runs against.
pub(crate) enum SlotBuffer {
    Empty,
    /// Caller's buffer, moved in for the operation and handed back after.
    Owned(Vec<u8>),
    /// Caller's slice; the caller blocks until completion.
    Borrowed(BufferHandle),
}

impl SlotBuffer {
    fn handle(&mut self) -> BufferHandle {
        match self {
            SlotBuffer::Empty => BufferHandle::empty(),
            SlotBuffer::Owned(v) => BufferHandle::from_mut_slice(v),
            SlotBuffer::Borrowed(h) => *h,
        }
    }

    pub(crate) fn into_vec(self) -> Vec<u8> {
        match self {
            SlotBuffer::Owned(v) => v,
            _ => Vec::new(),
        }
    }
}

pub(crate) struct OpSlot {
    id: u32,
    kind: OpKind,
    state: AtomicU64,
    /// Written by the completer that won PENDING → COMPLETING.
    result: UnsafeCell<Option<Transfer>>,
    waker: AtomicWaker,
    /// Owned by whoever drives the current phase.
    buf: UnsafeCell<SlotBuffer>,
    owner: Weak<StreamInner>,
    me: Weak<OpSlot>,
}

// Safety: `result` and `buf` are only touched by the party the phase word
// hands them to (see the transitions above).
unsafe impl Send for OpSlot {}
unsafe impl Sync for OpSlot {}

impl OpSlot {
    pub(crate) fn new(kind: OpKind, owner: Weak<StreamInner>) -> Arc<OpSlot> {
        let id = NEXT_SLOT_ID.fetch_add(1, Ordering::Relaxed);
        ktrace!("slot {}: allocated for {}", id, kind);
        Arc::new_cyclic(|me| OpSlot {
            id,
            kind,
            state: AtomicU64::new(pack(0, IDLE)),
            result: UnsafeCell::new(None),
            waker: AtomicWaker::new(),
            buf: UnsafeCell::new(SlotBuffer::Empty),
            owner,
            me: me.clone(),
        })
    }

    #[inline]
    pub(crate) fn kind(&self) -> OpKind {
        self.kind
    }

    /// Arm the slot with a buffer and a fresh version.
    pub(crate) fn prepare(&self, buf: SlotBuffer) -> OpId {
        let (version, phase) = unpack(self.state.load(Ordering::Acquire));
        debug_assert_eq!(phase, IDLE, "slot {} prepared while busy", self.id);
        let version = version.wrapping_add(1);
        // Safety: an idle slot has no other user.
        unsafe {
            *self.buf.get() = buf;
            *self.result.get() = None;
        }
        self.state.store(pack(version, PREPARED), Ordering::Release);
        OpId::new(self.id, version)
    }

    /// Hand the prepared operation to `port`.
    pub(crate) fn issue(&self, port: &dyn CompletionPort, id: OpId) -> Issue {
        let Some(target) = self.me.upgrade() else {
            return self.resolve(id, Transfer::Failed(NativeCode::InvalidHandle));
        };
        // Safety: PREPARED, only the issuer touches the buffer.
        let buf = unsafe { (*self.buf.get()).handle() };
        // The callback may fire before `issue` returns.
        self.state.store(pack(id.version(), PENDING), Ordering::Release);
        ktrace!("slot {}: issue {} {}", self.id, self.kind, id);
        match port.issue(IoRequest {
            id,
            kind: self.kind,
            buf,
            target,
        }) {
            Issue::Completed(t) => self.resolve(id, t),
            Issue::Pending => Issue::Pending,
        }
    }

    /// Synchronous completion; no callback will follow.
    fn resolve(&self, id: OpId, t: Transfer) -> Issue {
        // Safety: no callback is coming, the issuer is the only user.
        unsafe { *self.result.get() = Some(t) };
        self.state.store(pack(id.version(), COMPLETE), Ordering::Release);
        Issue::Completed(t)
    }

    #[inline]
    pub(crate) fn is_pending(&self, id: OpId) -> bool {
        self.state.load(Ordering::Acquire) == pack(id.version(), PENDING)
    }

    fn take_result(&self, id: OpId) -> Option<Transfer> {
        if self.state.load(Ordering::Acquire) != pack(id.version(), COMPLETE) {
            return None;
        }
        // Safety: COMPLETE hands the result to the awaiter.
        unsafe { (*self.result.get()).take() }
    }

    fn take_buffer(&self) -> SlotBuffer {
        // Safety: called by the party that owns the finished operation.
        unsafe { std::mem::replace(&mut *self.buf.get(), SlotBuffer::Empty) }
    }

    /// Back to IDLE, keeping the version.
    fn reset(&self, id: OpId) {
        self.state.store(pack(id.version(), IDLE), Ordering::Release);
    }

    fn abandon(&self, id: OpId) -> bool {
        self.state
            .compare_exchange(
                pack(id.version(), PENDING),
                pack(id.version(), ABANDONED),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// The awaiter is gone: account for the result and recycle.
    fn finish_abandoned(&self, id: OpId, result: Transfer) {
        drop(self.take_buffer());
        let owner = self.owner.upgrade();
        if let Some(owner) = &owner {
            let outcome = classify(owner.status(), self.kind, result, &CancellationToken::none());
            ktrace!("slot {}: abandoned {} finished: {:?}", self.id, id, outcome);
        }
        self.reset(id);
        if let (Some(owner), Some(me)) = (owner, self.me.upgrade()) {
            owner.recycle(me);
            owner.release_busy(self.kind);
        }
    }
}

impl CompletionTarget for OpSlot {
    fn on_complete(&self, id: OpId, result: Transfer) {
        loop {
            let word = self.state.load(Ordering::Acquire);
            let (version, phase) = unpack(word);
            if version != id.version() || (phase != PENDING && phase != ABANDONED) {
                kwarn!(
                    "slot {}: stale completion {} dropped (at v{}, phase {})",
                    self.id,
                    id,
                    version,
                    phase
                );
                debug_assert!(false, "stale completion {} for slot {}", id, self.id);
                return;
            }
            if phase == ABANDONED {
                self.finish_abandoned(id, result);
                return;
            }
            if self
                .state
                .compare_exchange(
                    word,
                    pack(version, COMPLETING),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                // Safety: winning COMPLETING grants the result cell.
                unsafe { *self.result.get() = Some(result) };
                self.state.store(pack(version, COMPLETE), Ordering::Release);
                self.waker.wake();
                return;
            }
        }
    }
}

impl Drop for OpSlot {
    fn drop(&mut self) {
        ktrace!("slot {}: released", self.id);
    }
}

/// Future of one issued overlapped operation.
pub(crate) struct SlotOp {
    owner: Arc<StreamInner>,
    slot: Arc<OpSlot>,
    id: OpId,
    port: Arc<dyn CompletionPort>,
    token: CancellationToken,
    bridge: Option<Bridge>,
    guard: Option<DirGuard>,
    done: bool,
}

impl SlotOp {
    /// Prepare `slot` with `buf` and issue it.
    pub(crate) fn start(
        owner: Arc<StreamInner>,
        slot: Arc<OpSlot>,
        port: Arc<dyn CompletionPort>,
        buf: SlotBuffer,
        token: &CancellationToken,
        guard: DirGuard,
    ) -> SlotOp {
        let id = slot.prepare(buf);
        let issued = slot.issue(&*port, id);

        let mut op = SlotOp {
            owner,
            slot,
            id,
            port,
            token: token.clone(),
            bridge: None,
            guard: Some(guard),
            done: false,
        };
        if issued == Issue::Pending {
            op.arm();
        }
        op
    }

    fn arm(&mut self) {
        let target = CancelTarget::Port {
            port: Arc::clone(&self.port),
            id: self.id,
            slot: Arc::downgrade(&self.slot),
        };
        match Bridge::arm(target, &self.token, self.owner.close_token()) {
            Armed::Ready(bridge) => self.bridge = Some(bridge),
            // Already in flight; one request is all it takes.
            Armed::AlreadyCanceled(target) => {
                let _ = target.cancel();
            }
        }
    }

    fn complete(&mut self, t: Transfer) -> (PipeResult<usize>, SlotBuffer) {
        self.done = true;
        if let Some(bridge) = self.bridge.take() {
            bridge.finish();
        }
        let buf = self.slot.take_buffer();
        let result = classify(self.owner.status(), self.slot.kind(), t, &self.token);
        self.slot.reset(self.id);
        self.owner.recycle(Arc::clone(&self.slot));
        drop(self.guard.take());
        (result, buf)
    }
}

impl Future for SlotOp {
    type Output = (PipeResult<usize>, SlotBuffer);

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        debug_assert!(!this.done, "SlotOp polled after completion");
        this.slot.waker.register(cx.waker());
        match this.slot.take_result(this.id) {
            Some(t) => Poll::Ready(this.complete(t)),
            None => Poll::Pending,
        }
    }
}

impl Drop for SlotOp {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if self.slot.abandon(self.id) {
            ktrace!("slot: {} abandoned", self.id);
            if let Some(guard) = self.guard.take() {
                guard.disarm();
            }
            if let Some(bridge) = self.bridge.take() {
                bridge.finish();
            }
            let _ = self.port.cancel(self.id);
            return;
        }
        // The completion won the race; finish here.
        loop {
            if let Some(t) = self.slot.take_result(self.id) {
                let _ = self.complete(t);
                return;
            }
            thread::yield_now();
        }
    }
}
