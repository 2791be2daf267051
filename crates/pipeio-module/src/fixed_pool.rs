//! `FixedPool` — default `WorkerPool` implementation.
//!
//! Spawns a core of N OS threads at creation. Workers dequeue jobs from a
//! lock-free MPMC queue and run them; a job is typically one blocking pipe
//! call. Idle workers park with a timeout and are unparked on enqueue.
//!
//! A blocking call holds its worker until the native call returns, so the
//! core alone can starve: N pending reads would keep the write that wakes
//! them queued forever. Whenever a job is queued and no worker is idle, the
//! pool adds a worker (up to `max_workers`). Workers above the core exit
//! after `keep_alive` without work.
//!
//! Every worker owns a `ThreadHandle` from the moment its loop starts until
//! it leaves the loop, so blocking calls it runs can be interrupted by a
//! cancellation on another thread.

use pipeio_core::error::{PipeError, PipeResult};
use pipeio_core::thread_handle::ThreadHandle;
use pipeio_core::worker::{Job, WorkerPool};
use pipeio_core::{kdebug, kerror, kinfo};

use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Upper bound on pool size
pub const MAX_POOL_WORKERS: usize = 256;

/// Configuration for FixedPool.
#[derive(Debug, Clone)]
pub struct FixedPoolConfig {
    /// Number of core worker threads, kept for the pool's lifetime.
    pub workers: usize,
    /// Ceiling for core plus extra workers.
    pub max_workers: usize,
    /// Max queued jobs before `enqueue` fails.
    pub queue_depth: usize,
    /// How long an idle worker parks before re-checking the queue.
    pub idle_park: Duration,
    /// How long an extra worker stays idle before it exits.
    pub keep_alive: Duration,
    /// Thread name prefix; workers are named `<prefix>-<n>`.
    pub name_prefix: String,
}

impl Default for FixedPoolConfig {
    /// min(8, nproc/2), at least 2 core workers.
    fn default() -> Self {
        let cpus = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            workers: (cpus / 2).clamp(2, 8),
            max_workers: MAX_POOL_WORKERS,
            queue_depth: 1024,
            idle_park: Duration::from_millis(1),
            keep_alive: Duration::from_secs(5),
            name_prefix: "pipeio-pool".to_string(),
        }
    }
}

struct PoolInner {
    /// Caller → workers.
    work_queue: ArrayQueue<Job>,
    /// Workers currently running a job.
    active: AtomicUsize,
    /// Workers spawned and not yet retired. Reserved before the spawn.
    live: AtomicUsize,
    shutdown: AtomicBool,
    idle_park: Duration,
    keep_alive: Duration,
    /// Round-robin cursor for unpark.
    next_wake: AtomicUsize,
    next_id: AtomicUsize,
    core: usize,
    max: usize,
    name_prefix: String,
    /// Also the lock that orders spawns against shutdown.
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

pub struct FixedPool {
    inner: Arc<PoolInner>,
}

impl FixedPool {
    /// Create a pool with `config.workers` core workers (clamped to
    /// 1..=max_workers, and max_workers to 1..=256).
    pub fn new(config: FixedPoolConfig) -> PipeResult<Self> {
        if config.queue_depth == 0 {
            return Err(PipeError::Config("queue_depth must be at least 1"));
        }
        let max = config.max_workers.clamp(1, MAX_POOL_WORKERS);
        let n = config.workers.clamp(1, max);
        let inner = Arc::new(PoolInner {
            work_queue: ArrayQueue::new(config.queue_depth),
            active: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            idle_park: config.idle_park,
            keep_alive: config.keep_alive,
            next_wake: AtomicUsize::new(0),
            next_id: AtomicUsize::new(0),
            core: n,
            max,
            name_prefix: config.name_prefix,
            handles: Mutex::new(Vec::with_capacity(n)),
        });

        for _ in 0..n {
            inner.live.fetch_add(1, Ordering::SeqCst);
            if let Err(e) = inner.spawn_worker() {
                let pool = FixedPool { inner };
                pool.shutdown();
                return Err(e);
            }
        }

        kinfo!(
            "pool: started {} workers, up to {} (queue {})",
            n,
            max,
            config.queue_depth
        );
        Ok(FixedPool { inner })
    }

    /// Number of jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.inner.work_queue.len()
    }

    /// Workers spawned and not yet retired.
    pub fn live_workers(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    /// Workers that are never retired while the pool runs.
    pub fn core_workers(&self) -> usize {
        self.inner.core
    }
}

impl PoolInner {
    /// Start one worker. The caller has already counted it in `live`.
    fn spawn_worker(self: &Arc<Self>) -> PipeResult<()> {
        let mut handles = self.handles.lock();
        if self.shutdown.load(Ordering::SeqCst) {
            self.live.fetch_sub(1, Ordering::SeqCst);
            return Err(PipeError::WorkerUnavailable);
        }
        // Retired extra workers.
        handles.retain(|h| !h.is_finished());

        let worker_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let worker_inner = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("{}-{}", self.name_prefix, worker_id))
            .spawn(move || worker_loop(worker_inner, worker_id));
        match spawned {
            Ok(handle) => {
                handles.push(handle);
                Ok(())
            }
            Err(e) => {
                kerror!("pool: failed to spawn worker {}: {}", worker_id, e);
                self.live.fetch_sub(1, Ordering::SeqCst);
                Err(PipeError::WorkerUnavailable)
            }
        }
    }

    /// Add a worker if work is queued and every worker is busy.
    fn grow_if_starved(self: &Arc<Self>) {
        if self.work_queue.is_empty() || self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let active = self.active.load(Ordering::SeqCst);
        let reserved = self
            .live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (live <= active && live < self.max).then_some(live + 1)
            });
        if let Ok(live) = reserved {
            kdebug!("pool: all {} workers busy, adding one", live);
            // Failure is logged; the job still runs once a worker frees up.
            let _ = self.spawn_worker();
        }
    }

    fn wake_one(&self) {
        let handles = self.handles.lock();
        if handles.is_empty() {
            return;
        }
        let i = self.next_wake.fetch_add(1, Ordering::Relaxed) % handles.len();
        handles[i].thread().unpark();
    }

    /// Drop every queued job. Dropping a job notifies its awaiter.
    fn drop_queued(&self) -> usize {
        let mut dropped = 0usize;
        while self.work_queue.pop().is_some() {
            dropped += 1;
        }
        dropped
    }

    /// Give up one extra worker slot, never going below the core.
    fn try_retire(&self) -> bool {
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (live > self.core).then(|| live - 1)
            })
            .is_ok()
    }
}

impl WorkerPool for FixedPool {
    fn enqueue(&self, job: Job) -> PipeResult<()> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(PipeError::WorkerUnavailable);
        }
        self.inner
            .work_queue
            .push(job)
            .map_err(|_| PipeError::WorkerUnavailable)?;
        // Shutdown may have drained the queue between the check and the push.
        if self.inner.shutdown.load(Ordering::SeqCst) {
            self.inner.drop_queued();
            return Err(PipeError::WorkerUnavailable);
        }
        self.inner.grow_if_starved();
        self.inner.wake_one();
        Ok(())
    }

    fn active_workers(&self) -> usize {
        self.inner.active.load(Ordering::Relaxed)
    }

    fn total_workers(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let handles: Vec<_> = self.inner.handles.lock().drain(..).collect();
        for h in &handles {
            h.thread().unpark();
        }
        let current = thread::current().id();
        for h in handles {
            // A job that drops the last pool handle runs on a worker.
            if h.thread().id() == current {
                continue;
            }
            let _ = h.join();
        }
        let dropped = self.inner.drop_queued();
        kinfo!("pool: shutdown ({} queued jobs dropped)", dropped);
    }
}

impl Drop for FixedPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Worker thread main loop.
fn worker_loop(inner: Arc<PoolInner>, worker_id: usize) {
    // Interrupt handle lives for the whole loop.
    let handle = ThreadHandle::current();
    if handle.is_none() {
        kerror!("pool: worker {} has no interrupt handle; calls are uncancelable", worker_id);
    }
    kdebug!("pool: worker {} up", worker_id);

    let mut idle_since = Instant::now();
    let mut retired = false;
    loop {
        if inner.shutdown.load(Ordering::SeqCst) {
            break;
        }

        match inner.work_queue.pop() {
            Some(job) => {
                inner.active.fetch_add(1, Ordering::SeqCst);
                // This job may block; make sure the rest of the queue moves.
                inner.grow_if_starved();
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    kerror!("pool: job panicked on worker {}", worker_id);
                }
                inner.active.fetch_sub(1, Ordering::SeqCst);
                idle_since = Instant::now();
            }
            None => {
                if idle_since.elapsed() >= inner.keep_alive && inner.try_retire() {
                    retired = true;
                    break;
                }
                thread::park_timeout(inner.idle_park);
            }
        }
    }

    drop(handle);
    ThreadHandle::release_current();
    if retired {
        kdebug!("pool: worker {} retired after {:?} idle", worker_id, inner.keep_alive);
        // A job pushed while this worker still counted as idle.
        inner.grow_if_starved();
    } else {
        inner.live.fetch_sub(1, Ordering::SeqCst);
        kdebug!("pool: worker {} down", worker_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn small_pool(workers: usize, depth: usize) -> FixedPool {
        FixedPool::new(FixedPoolConfig {
            workers,
            queue_depth: depth,
            ..Default::default()
        })
        .unwrap()
    }

    fn bounded_pool(workers: usize, max_workers: usize, keep_alive: Duration) -> FixedPool {
        FixedPool::new(FixedPoolConfig {
            workers,
            max_workers,
            queue_depth: 16,
            keep_alive,
            ..Default::default()
        })
        .unwrap()
    }

    /// Queue a job that blocks until the returned sender is dropped, and
    /// wait until a worker has picked it up.
    fn block_one(pool: &FixedPool) -> mpsc::Sender<()> {
        let (block_tx, block_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel();
        pool.enqueue(Box::new(move || {
            started_tx.send(()).unwrap();
            let _ = block_rx.recv();
        }))
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        block_tx
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_runs_jobs() {
        let pool = small_pool(2, 16);
        let (tx, rx) = mpsc::channel();
        for i in 0..8 {
            let tx = tx.clone();
            pool.enqueue(Box::new(move || tx.send(i).unwrap())).unwrap();
        }
        let mut got: Vec<i32> = (0..8).map(|_| rx.recv().unwrap()).collect();
        got.sort();
        assert_eq!(got, (0..8).collect::<Vec<_>>());
        assert!(pool.total_workers() >= 2);
        assert_eq!(pool.core_workers(), 2);
    }

    #[test]
    fn test_workers_have_thread_handles() {
        let pool = small_pool(1, 4);
        let (tx, rx) = mpsc::channel();
        pool.enqueue(Box::new(move || {
            tx.send(ThreadHandle::is_cached()).unwrap();
        }))
        .unwrap();
        assert!(rx.recv().unwrap());
    }

    #[test]
    fn test_enqueue_after_shutdown_fails() {
        let pool = small_pool(1, 4);
        pool.shutdown();
        assert_eq!(pool.live_workers(), 0);
        let err = pool.enqueue(Box::new(|| {})).unwrap_err();
        assert!(matches!(err, PipeError::WorkerUnavailable));
    }

    #[test]
    fn test_queue_full_fails() {
        let pool = FixedPool::new(FixedPoolConfig {
            workers: 1,
            max_workers: 1,
            queue_depth: 1,
            ..Default::default()
        })
        .unwrap();
        let release = block_one(&pool);

        pool.enqueue(Box::new(|| {})).unwrap();
        assert!(matches!(
            pool.enqueue(Box::new(|| {})),
            Err(PipeError::WorkerUnavailable)
        ));
        drop(release);
    }

    #[test]
    fn test_grows_when_all_workers_block() {
        let pool = bounded_pool(1, 4, Duration::from_secs(5));
        let release = block_one(&pool);

        let (tx, rx) = mpsc::channel();
        pool.enqueue(Box::new(move || tx.send(1).unwrap())).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(1));
        assert_eq!(pool.total_workers(), 2);
        drop(release);
    }

    #[test]
    fn test_growth_stops_at_max_workers() {
        let pool = bounded_pool(1, 2, Duration::from_secs(5));
        let first = block_one(&pool);
        let second = block_one(&pool);
        assert_eq!(pool.total_workers(), 2);

        let (tx, rx) = mpsc::channel();
        pool.enqueue(Box::new(move || tx.send(3).unwrap())).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(pool.total_workers(), 2);

        drop(first);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(3));
        drop(second);
    }

    #[test]
    fn test_extra_workers_retire_when_idle() {
        let pool = bounded_pool(1, 4, Duration::from_millis(20));
        let first = block_one(&pool);
        let second = block_one(&pool);
        assert_eq!(pool.total_workers(), 2);
        drop(first);
        drop(second);

        assert!(wait_for(|| pool.total_workers() == 1));
        // The core worker still serves.
        let (tx, rx) = mpsc::channel();
        pool.enqueue(Box::new(move || tx.send(()).unwrap())).unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_enqueue_racing_shutdown_strands_nothing() {
        for _ in 0..20 {
            let pool = small_pool(2, 64);
            let (tx, rx) = mpsc::channel::<()>();
            thread::scope(|s| {
                for _ in 0..4 {
                    let tx = tx.clone();
                    let pool = &pool;
                    s.spawn(move || {
                        for _ in 0..32 {
                            let tx = tx.clone();
                            let _ = pool.enqueue(Box::new(move || {
                                let _ = tx.send(());
                            }));
                        }
                    });
                }
                pool.shutdown();
            });
            drop(tx);

            // Every job either ran or was dropped, so every sender is gone
            // while the pool itself is still alive.
            loop {
                match rx.recv_timeout(Duration::from_secs(5)) {
                    Ok(()) => continue,
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        panic!("job left in the queue of a shut-down pool")
                    }
                }
            }
            drop(pool);
        }
    }

    #[test]
    fn test_panicking_job_keeps_worker() {
        let pool = small_pool(1, 4);
        pool.enqueue(Box::new(|| panic!("boom"))).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.enqueue(Box::new(move || tx.send(7).unwrap())).unwrap();
        assert_eq!(rx.recv().unwrap(), 7);
    }

    #[test]
    fn test_zero_queue_depth_rejected() {
        let err = FixedPool::new(FixedPoolConfig {
            queue_depth: 0,
            ..Default::default()
        });
        assert!(matches!(err, Err(PipeError::Config(_))));
    }
}
