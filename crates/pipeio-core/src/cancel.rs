//! Cancellation token with callback registration
//!
//! A token is checked before an operation starts and, once the operation is
//! in flight, drives a registered callback that asks the transport to abort
//! the native call. Tokens can be linked to form parent-child relationships.
//!
//! Callbacks run on the thread that calls `cancel()`, one at a time.
//! Dropping a `Registration` removes its callback; if the callback is running
//! on another thread at that moment, the drop waits for it to return.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use crate::error::{PipeError, PipeResult};

type Callback = Box<dyn FnOnce() + Send>;

static NEXT_TOKEN_ID: AtomicU64 = AtomicU64::new(1);

/// Token for requesting and observing cancellation
#[derive(Clone)]
pub struct CancellationToken {
    inner: Option<Arc<TokenInner>>,
}

struct TokenInner {
    id: u64,
    cancelled: AtomicBool,
    /// Registration id whose callback is running now (0 = none).
    /// Written under the `callbacks` lock.
    executing: AtomicU64,
    callbacks: Mutex<Callbacks>,
}

struct Callbacks {
    next_id: u64,
    entries: Vec<(u64, Callback)>,
    canceller: Option<ThreadId>,
    /// Keeps the link to a parent token alive.
    parent: Option<Registration>,
}

impl CancellationToken {
    /// Create a new independent token
    pub fn new() -> Self {
        Self {
            inner: Some(Arc::new(TokenInner {
                id: NEXT_TOKEN_ID.fetch_add(1, Ordering::Relaxed),
                cancelled: AtomicBool::new(false),
                executing: AtomicU64::new(0),
                callbacks: Mutex::new(Callbacks {
                    next_id: 1,
                    entries: Vec::new(),
                    canceller: None,
                    parent: None,
                }),
            })),
        }
    }

    /// A token that can never be cancelled
    pub const fn none() -> Self {
        Self { inner: None }
    }

    /// Create a child token: cancelling `self` cancels the child, not the
    /// other way round.
    pub fn child(&self) -> Self {
        let child = Self::new();
        if let (Some(_), Some(child_inner)) = (&self.inner, &child.inner) {
            let weak: Weak<TokenInner> = Arc::downgrade(child_inner);
            let reg = self.register(move || {
                if let Some(inner) = weak.upgrade() {
                    CancellationToken { inner: Some(inner) }.cancel();
                }
            });
            child_inner.callbacks.lock().parent = Some(reg);
        }
        child
    }

    /// Whether `cancel()` can ever have an effect
    #[inline]
    pub fn can_be_cancelled(&self) -> bool {
        self.inner.is_some()
    }

    /// Check if cancellation was requested
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        match &self.inner {
            Some(inner) => inner.cancelled.load(Ordering::Acquire),
            None => false,
        }
    }

    /// Return `Err(Canceled(self))` if cancellation was requested
    #[inline]
    pub fn check(&self) -> PipeResult<()> {
        if self.is_cancelled() {
            Err(PipeError::Canceled(self.clone()))
        } else {
            Ok(())
        }
    }

    /// Same token (clones compare equal)
    pub fn same_as(&self, other: &CancellationToken) -> bool {
        match (&self.inner, &other.inner) {
            (Some(a), Some(b)) => a.id == b.id,
            (None, None) => true,
            _ => false,
        }
    }

    /// Request cancellation and run registered callbacks on this thread.
    ///
    /// Only the first call has an effect.
    pub fn cancel(&self) {
        let inner = match &self.inner {
            Some(inner) => inner,
            None => return,
        };
        if inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }

        loop {
            let callback = {
                let mut cbs = inner.callbacks.lock();
                cbs.canceller = Some(thread::current().id());
                match cbs.entries.pop() {
                    Some((id, cb)) => {
                        inner.executing.store(id, Ordering::Release);
                        cb
                    }
                    None => {
                        inner.executing.store(0, Ordering::Release);
                        break;
                    }
                }
            };
            callback();
            inner.executing.store(0, Ordering::Release);
        }
    }

    /// Register a callback to run when cancellation is requested.
    ///
    /// If the token is already cancelled the callback runs immediately on
    /// the calling thread and an inactive registration is returned.
    pub fn register<F>(&self, f: F) -> Registration
    where
        F: FnOnce() + Send + 'static,
    {
        let inner = match &self.inner {
            Some(inner) => inner,
            None => return Registration::empty(),
        };

        {
            let mut cbs = inner.callbacks.lock();
            if !inner.cancelled.load(Ordering::Acquire) {
                let id = cbs.next_id;
                cbs.next_id += 1;
                cbs.entries.push((id, Box::new(f)));
                return Registration {
                    token: Some(inner.clone()),
                    id,
                };
            }
        }

        f();
        Registration::empty()
    }

    /// Number of callbacks waiting for cancellation (diagnostics)
    pub fn registered(&self) -> usize {
        match &self.inner {
            Some(inner) => inner.callbacks.lock().entries.len(),
            None => 0,
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            Some(inner) => f
                .debug_struct("CancellationToken")
                .field("id", &inner.id)
                .field("cancelled", &self.is_cancelled())
                .finish(),
            None => f.write_str("CancellationToken(none)"),
        }
    }
}

/// Handle to a registered callback; dropping it unregisters.
#[must_use = "dropping a Registration unregisters the callback"]
pub struct Registration {
    token: Option<Arc<TokenInner>>,
    id: u64,
}

impl Registration {
    /// A registration that refers to nothing
    pub const fn empty() -> Self {
        Self { token: None, id: 0 }
    }

    /// Whether a callback is still attached
    pub fn is_active(&self) -> bool {
        self.token.is_some()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let inner = match self.token.take() {
            Some(inner) => inner,
            None => return,
        };

        let canceller = {
            let mut cbs = inner.callbacks.lock();
            if let Some(pos) = cbs.entries.iter().position(|(id, _)| *id == self.id) {
                cbs.entries.swap_remove(pos);
                return;
            }
            cbs.canceller
        };

        // Callback already taken by `cancel()`. Wait for it unless it is
        // this very thread running it.
        if canceller == Some(thread::current().id()) {
            return;
        }
        while inner.executing.load(Ordering::Acquire) == self.id {
            std::hint::spin_loop();
            thread::yield_now();
        }
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_basic_cancellation() {
        let token = CancellationToken::new();

        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());

        token.cancel();

        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(PipeError::Canceled(_))));
    }

    #[test]
    fn test_callback_runs_once() {
        let token = CancellationToken::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _reg = token.register(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        token.cancel();
        token.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_register_after_cancel_runs_inline() {
        let token = CancellationToken::new();
        token.cancel();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let reg = token.register(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!reg.is_active());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_registration_never_fires() {
        let token = CancellationToken::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let reg = token.register(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(token.registered(), 1);
        drop(reg);
        assert_eq!(token.registered(), 0);

        token.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_child_token() {
        let parent = CancellationToken::new();
        let child = parent.child();

        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_child_independent_cancel() {
        let parent = CancellationToken::new();
        let child = parent.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_none_token() {
        let token = CancellationToken::none();
        assert!(!token.can_be_cancelled());
        token.cancel();
        assert!(!token.is_cancelled());
        let reg = token.register(|| panic!("must not run"));
        assert!(!reg.is_active());
    }

    #[test]
    fn test_clone_shares_state() {
        let token1 = CancellationToken::new();
        let token2 = token1.clone();

        token1.cancel();
        assert!(token2.is_cancelled());
        assert!(token1.same_as(&token2));
        assert!(!token1.same_as(&CancellationToken::new()));
    }

    #[test]
    fn test_drop_waits_for_running_callback() {
        let token = CancellationToken::new();
        let entered = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));

        let (e, r, f) = (entered.clone(), release.clone(), finished.clone());
        let reg = token.register(move || {
            e.store(true, Ordering::SeqCst);
            while !r.load(Ordering::SeqCst) {
                std::thread::yield_now();
            }
            f.store(true, Ordering::SeqCst);
        });

        let t = token.clone();
        let canceller = std::thread::spawn(move || t.cancel());
        while !entered.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }

        let r = release.clone();
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            r.store(true, Ordering::SeqCst);
        });

        drop(reg);
        assert!(finished.load(Ordering::SeqCst));

        canceller.join().unwrap();
        releaser.join().unwrap();
    }
}
