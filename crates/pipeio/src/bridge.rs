//! Cancellation bridge: token → native cancel request.
//!
//! Two-phase protocol:
//!
//! 1. A callback is registered on the caller's token and on the
//!    connection's close token. Until registration has finished the
//!    callback does nothing; spinning there could compete with the very
//!    thread that is still registering.
//! 2. `finished` is set. If a token fired in the meantime, the bridge
//!    reports `AlreadyCanceled` and the caller must not start the call.
//! 3. While the call is in flight a firing callback retries the native
//!    cancel until it succeeds, fails with anything but `NotFound`, or
//!    the operation is over (`finish()` or the target reports it done).
//!
//! A target is either the OS thread blocked in the call (async-over-blocking
//! path) or a pending overlapped operation keyed by its `OpId`.

use pipeio_core::cancel::{CancellationToken, Registration};
use pipeio_core::status::NativeCode;
use pipeio_core::thread_handle::ThreadHandle;
use pipeio_core::transport::{CompletionPort, OpId};
use pipeio_core::ktrace;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use crate::slot::OpSlot;

/// What a cancel request is aimed at.
pub(crate) enum CancelTarget {
    /// Whatever the thread is blocked in.
    Thread(ThreadHandle),
    /// One pending overlapped operation.
    Port {
        port: Arc<dyn CompletionPort>,
        id: OpId,
        slot: Weak<OpSlot>,
    },
}

impl CancelTarget {
    pub(crate) fn cancel(&self) -> Result<(), NativeCode> {
        match self {
            CancelTarget::Thread(t) => t.cancel_io(),
            CancelTarget::Port { port, id, .. } => port.cancel(*id),
        }
    }

    /// Whether there may still be something to cancel.
    fn in_flight(&self) -> bool {
        match self {
            CancelTarget::Thread(_) => true,
            CancelTarget::Port { id, slot, .. } => {
                slot.upgrade().map_or(false, |s| s.is_pending(*id))
            }
        }
    }
}

struct BridgeState {
    finished: AtomicBool,
    continue_trying: AtomicBool,
    target: CancelTarget,
}

impl BridgeState {
    fn fire(&self) {
        if !self.finished.load(Ordering::Acquire) {
            return;
        }
        while self.continue_trying.load(Ordering::Acquire) && self.target.in_flight() {
            match self.target.cancel() {
                Ok(()) => {
                    ktrace!("bridge: cancel delivered");
                    return;
                }
                Err(NativeCode::NotFound) => thread::yield_now(),
                Err(code) => {
                    ktrace!("bridge: cancel gave up: {}", code);
                    return;
                }
            }
        }
    }
}

/// An armed bridge for one in-flight call.
pub(crate) struct Bridge {
    state: Arc<BridgeState>,
    _user: Registration,
    _close: Registration,
}

pub(crate) enum Armed {
    Ready(Bridge),
    /// A token fired before the call could start.
    AlreadyCanceled(CancelTarget),
}

impl Bridge {
    /// Register on both tokens, then open the bridge.
    pub(crate) fn arm(
        target: CancelTarget,
        token: &CancellationToken,
        close: &CancellationToken,
    ) -> Armed {
        let state = Arc::new(BridgeState {
            finished: AtomicBool::new(false),
            continue_trying: AtomicBool::new(true),
            target,
        });

        let on_user = Arc::clone(&state);
        let user = token.register(move || on_user.fire());
        let on_close = Arc::clone(&state);
        let close_reg = close.register(move || on_close.fire());

        state.finished.store(true, Ordering::Release);
        if token.is_cancelled() || close.is_cancelled() {
            state.continue_trying.store(false, Ordering::Release);
            drop(user);
            drop(close_reg);
            return match Arc::try_unwrap(state) {
                Ok(s) => Armed::AlreadyCanceled(s.target),
                // A registration callback still owns a clone; it is
                // finishing on another thread and is a no-op now.
                Err(shared) => Armed::AlreadyCanceled(shared.detach_target()),
            };
        }

        Armed::Ready(Bridge {
            state,
            _user: user,
            _close: close_reg,
        })
    }

    /// The call returned: stop retrying, then unregister.
    pub(crate) fn finish(self) {
        self.state.continue_trying.store(false, Ordering::Release);
        // Registrations drop here, waiting out a callback that is running.
    }
}

impl BridgeState {
    fn detach_target(&self) -> CancelTarget {
        match &self.target {
            CancelTarget::Thread(t) => CancelTarget::Thread(t.clone()),
            CancelTarget::Port { port, id, slot } => CancelTarget::Port {
                port: Arc::clone(port),
                id: *id,
                slot: slot.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_precanceled_token() {
        let token = CancellationToken::new();
        token.cancel();
        let Some(me) = ThreadHandle::current() else { return };
        let armed = Bridge::arm(CancelTarget::Thread(me), &token, &CancellationToken::new());
        assert!(matches!(armed, Armed::AlreadyCanceled(_)));
        assert_eq!(token.registered(), 0);
    }

    #[test]
    fn test_finish_unregisters() {
        let token = CancellationToken::new();
        let close = CancellationToken::new();
        let Some(me) = ThreadHandle::current() else { return };
        let Armed::Ready(bridge) = Bridge::arm(CancelTarget::Thread(me), &token, &close) else {
            panic!("token was not canceled");
        };
        assert_eq!(token.registered(), 1);
        assert_eq!(close.registered(), 1);
        bridge.finish();
        assert_eq!(token.registered(), 0);
        assert_eq!(close.registered(), 0);
        // Late cancel has nothing to do.
        token.cancel();
    }

    #[test]
    fn test_cancel_reaches_blocked_thread() {
        let token = CancellationToken::new();
        let close = CancellationToken::new();
        let (tx, rx) = mpsc::channel();
        let t2 = token.clone();
        let worker = thread::spawn(move || {
            let me = ThreadHandle::current().unwrap();
            let Armed::Ready(bridge) = Bridge::arm(CancelTarget::Thread(me.clone()), &t2, &close)
            else {
                panic!("token was not canceled");
            };
            tx.send(()).unwrap();
            let guard = me.enter();
            while !guard.take_interrupt() {
                thread::yield_now();
            }
            drop(guard);
            bridge.finish();
        });
        rx.recv().unwrap();
        // Spins on NotFound until the worker is inside its call.
        token.cancel();
        worker.join().unwrap();
    }
}
