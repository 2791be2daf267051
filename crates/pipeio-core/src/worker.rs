//! Worker pool abstraction (async-over-blocking execution).
//!
//! A `WorkerPool` runs blocking pipe calls for channels that were opened
//! without overlapped capability. Workers may block independently; one
//! worker is tied up per in-flight blocking call.
//!
//! # Implementors
//!
//! - `FixedPool` (pipeio-module): spawns N core threads at creation time and
//!   adds threads while every worker is blocked. Each worker owns a
//!   `ThreadHandle` for the lifetime of its loop.
//!
//! **Contract:**
//! - `enqueue()` must NEVER block the caller. If the pool is full or shut
//!   down it returns `Err(WorkerUnavailable)`.
//! - A job runs exactly once, or is dropped unrun on shutdown.
//! - A queued job must not wait behind jobs that block indefinitely: a
//!   blocked read may be waiting for the very write still in the queue.

use crate::error::PipeResult;

/// A unit of work for a pool thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub trait WorkerPool: Send + Sync {
    /// Queue a job. Returns immediately.
    fn enqueue(&self, job: Job) -> PipeResult<()>;

    /// Number of workers currently executing a job.
    fn active_workers(&self) -> usize;

    /// Number of workers right now (busy + idle).
    fn total_workers(&self) -> usize;

    /// Stop accepting work and join the workers.
    fn shutdown(&self);
}
