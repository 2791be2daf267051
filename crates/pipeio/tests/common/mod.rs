//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use parking_lot::Mutex;
use pipeio::{PipeError, PipeResult, PipeStream, TransmissionMode};
use pipeio_core::worker::{Job, WorkerPool};
use pipeio_module::mem_pipe::{MemPipe, MemProbe};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

/// A connected in-memory pair plus probes for both ends.
pub struct MemPair {
    pub a: PipeStream,
    pub a_probe: MemProbe,
    pub b: PipeStream,
    pub b_probe: MemProbe,
}

pub fn mem_pair(mode: TransmissionMode, overlapped: bool) -> MemPair {
    mem_pair_with(mode, overlapped, None)
}

pub fn mem_pair_with(
    mode: TransmissionMode,
    overlapped: bool,
    pool: Option<Arc<dyn WorkerPool>>,
) -> MemPair {
    let (a, b) = MemPipe::pair(mode, overlapped);
    let (a_probe, b_probe) = (a.probe(), b.probe());
    let build = |pipe: MemPipe| {
        let builder = PipeStream::builder(pipe).connected(true);
        match &pool {
            Some(pool) => builder.pool(Arc::clone(pool)).build(),
            None => builder.build(),
        }
    };
    MemPair {
        a: build(a),
        a_probe,
        b: build(b),
        b_probe,
    }
}

/// Pool that only runs jobs when told to.
#[derive(Default)]
pub struct ManualPool {
    jobs: Mutex<VecDeque<Job>>,
    reject: AtomicBool,
    pub enqueued: AtomicUsize,
}

impl ManualPool {
    pub fn rejecting() -> Self {
        let pool = Self::default();
        pool.reject.store(true, Ordering::SeqCst);
        pool
    }

    pub fn queued(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Run queued jobs on the calling thread.
    pub fn run_all(&self) {
        loop {
            let job = self.jobs.lock().pop_front();
            match job {
                Some(job) => job(),
                None => return,
            }
        }
    }
}

impl WorkerPool for ManualPool {
    fn enqueue(&self, job: Job) -> PipeResult<()> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(PipeError::WorkerUnavailable);
        }
        self.enqueued.fetch_add(1, Ordering::SeqCst);
        self.jobs.lock().push_back(job);
        Ok(())
    }

    fn active_workers(&self) -> usize {
        0
    }

    fn total_workers(&self) -> usize {
        1
    }

    fn shutdown(&self) {
        self.jobs.lock().clear();
    }
}

/// Spin until `cond` holds.
pub fn wait_until(mut cond: impl FnMut() -> bool) {
    while !cond() {
        thread::yield_now();
    }
}
