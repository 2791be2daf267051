//! Connection state machine.
//!
//! States only move forward: Unconnected → Connected → {Broken | Closed}.
//! Close moves any state, Broken included, to Closed. Every transition is
//! a single `fetch_max` on the state byte, so racing completions can never
//! move a connection backwards.

use pipeio_core::error::{PipeError, PipeResult};
use pipeio_core::kind::PipeState;
use pipeio_core::status::NativeCode;
use pipeio_core::{kdebug, kwarn};

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};

/// Shared, lock-free status of one connection.
#[derive(Debug)]
pub(crate) struct ConnStatus {
    state: AtomicU8,
    /// Errno of the code that broke the connection (0 = not broken)
    broken_by: AtomicI32,
    /// Handle reported invalid; further use reports `InvalidHandle`
    poisoned: AtomicBool,
    message_complete: AtomicBool,
}

impl ConnStatus {
    pub(crate) fn new(connected: bool) -> Self {
        let state = if connected {
            PipeState::Connected
        } else {
            PipeState::Unconnected
        };
        Self {
            state: AtomicU8::new(state.into()),
            broken_by: AtomicI32::new(0),
            poisoned: AtomicBool::new(false),
            message_complete: AtomicBool::new(true),
        }
    }

    #[inline]
    pub(crate) fn get(&self) -> PipeState {
        PipeState::from(self.state.load(Ordering::Acquire))
    }

    /// Move forward to `to`; returns the previous state.
    fn advance(&self, to: PipeState) -> PipeState {
        let prev = PipeState::from(self.state.fetch_max(to.into(), Ordering::AcqRel));
        if prev < to {
            kdebug!("pipe: {} -> {}", prev, to);
        }
        prev
    }

    /// Handshake finished. No effect once broken or closed.
    pub(crate) fn connect(&self) -> bool {
        self.advance(PipeState::Connected) <= PipeState::Connected
    }

    /// Peer went away.
    pub(crate) fn mark_broken(&self, code: NativeCode) {
        let _ = self
            .broken_by
            .compare_exchange(0, code.raw(), Ordering::AcqRel, Ordering::Acquire);
        self.advance(PipeState::Broken);
    }

    /// Returns true for the call that actually closed.
    pub(crate) fn close(&self) -> bool {
        self.advance(PipeState::Closed) != PipeState::Closed
    }

    pub(crate) fn poison(&self) {
        if !self.poisoned.swap(true, Ordering::AcqRel) {
            kwarn!("pipe: handle reported invalid; connection poisoned");
        }
    }

    #[inline]
    pub(crate) fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// The code that broke the connection.
    pub(crate) fn broken_code(&self) -> NativeCode {
        match self.broken_by.load(Ordering::Acquire) {
            0 => NativeCode::BrokenPipe,
            errno => NativeCode::from_errno(errno),
        }
    }

    #[inline]
    pub(crate) fn set_message_complete(&self, complete: bool) {
        self.message_complete.store(complete, Ordering::Release);
    }

    #[inline]
    pub(crate) fn message_complete(&self) -> bool {
        self.message_complete.load(Ordering::Acquire)
    }

    /// Fail fast for states in which no I/O may start.
    ///
    /// Broken is not an error here: reads on a broken connection return 0
    /// and writes decide for themselves.
    pub(crate) fn check_open(&self) -> PipeResult<PipeState> {
        match self.get() {
            PipeState::Closed => Err(PipeError::PipeClosed),
            _ if self.is_poisoned() => Err(PipeError::InvalidHandle),
            PipeState::Unconnected => Err(PipeError::NotConnected),
            state => Ok(state),
        }
    }
}
