//! Async-over-blocking dispatch.
//!
//! Channels without overlapped capability run each call as a blocking
//! native call on a pool thread. The returned future does nothing until
//! first polled; that poll queues the work item and the caller's thread
//! never blocks.
//!
//! On the pool thread the item arms the cancellation bridge against the
//! worker's `ThreadHandle`, runs the call, clears the bridge's retry flag
//! before unregistering, and classifies the result there. A work item
//! whose awaiter is already gone skips the call.

use pipeio_core::cancel::CancellationToken;
use pipeio_core::error::{PipeError, PipeResult};
use pipeio_core::status::Transfer;
use pipeio_core::thread_handle::ThreadHandle;
use pipeio_core::transport::{NativePipe, OpKind};
use pipeio_core::worker::WorkerPool;
use pipeio_core::{kdebug, ktrace, kwarn};

use futures::channel::oneshot;
use std::sync::Arc;

use crate::bridge::{Armed, Bridge, CancelTarget};
use crate::classify::{aborted, classify};
use crate::stream::{BufResult, DirGuard, StreamInner};

/// Run one blocking native call on the calling thread.
///
/// The call can be interrupted by `token` and by closing the connection.
pub(crate) fn call_blocking<F>(
    owner: &StreamInner,
    kind: OpKind,
    token: &CancellationToken,
    call: F,
) -> PipeResult<usize>
where
    F: FnOnce(Option<&ThreadHandle>) -> Transfer,
{
    let thread = ThreadHandle::current();
    let bridge = match &thread {
        Some(t) => {
            match Bridge::arm(CancelTarget::Thread(t.clone()), token, owner.close_token()) {
                Armed::Ready(bridge) => Some(bridge),
                Armed::AlreadyCanceled(_) => return Err(aborted(owner.status(), token)),
            }
        }
        None => {
            kwarn!("pipe: no thread handle, {} is not cancelable", kind);
            None
        }
    };

    let result = call(thread.as_ref());
    if let Some(bridge) = bridge {
        bridge.finish();
    }
    classify(owner.status(), kind, result, token)
}

/// One queued blocking call.
struct WorkItem {
    owner: Arc<StreamInner>,
    pipe: Arc<dyn NativePipe>,
    kind: OpKind,
    buf: Vec<u8>,
    token: CancellationToken,
    tx: Option<oneshot::Sender<BufResult<usize>>>,
    guard: Option<DirGuard>,
}

impl WorkItem {
    fn run(mut self) {
        let Some(tx) = self.tx.take() else { return };
        if tx.is_canceled() {
            ktrace!("pipe: {} awaiter gone, call skipped", self.kind);
            return;
        }

        let mut buf = std::mem::take(&mut self.buf);
        let pipe = Arc::clone(&self.pipe);
        let result = match self.kind {
            OpKind::Read => call_blocking(&self.owner, self.kind, &self.token, |t| {
                pipe.read(&mut buf, t)
            }),
            OpKind::Write => call_blocking(&self.owner, self.kind, &self.token, |t| {
                pipe.write(&buf, t)
            }),
        };
        // The direction is free before the awaiter resumes.
        drop(self.guard.take());
        let _ = tx.send(BufResult(result, buf));
    }
}

impl Drop for WorkItem {
    /// Dropped unrun (queue full, pool shut down): hand the buffer back.
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            drop(self.guard.take());
            let buf = std::mem::take(&mut self.buf);
            let _ = tx.send(BufResult(Err(PipeError::WorkerUnavailable), buf));
        }
    }
}

/// Queue a blocking call and wait for its result.
pub(crate) async fn dispatch(
    pool: Arc<dyn WorkerPool>,
    owner: Arc<StreamInner>,
    pipe: Arc<dyn NativePipe>,
    kind: OpKind,
    buf: Vec<u8>,
    token: CancellationToken,
    guard: DirGuard,
) -> BufResult<usize> {
    let (tx, rx) = oneshot::channel();
    let item = WorkItem {
        owner,
        pipe,
        kind,
        buf,
        token,
        tx: Some(tx),
        guard: Some(guard),
    };
    if let Err(e) = pool.enqueue(Box::new(move || item.run())) {
        kdebug!("pipe: {} not queued: {}", kind, e);
    }

    match rx.await {
        Ok(done) => done,
        Err(_) => BufResult(Err(PipeError::WorkerUnavailable), Vec::new()),
    }
}
