//! Engine configuration

use pipeio_core::env::{env_get, env_get_bool, env_get_nonzero};
use pipeio_core::error::{PipeError, PipeResult};
use pipeio_module::fixed_pool::{FixedPoolConfig, MAX_POOL_WORKERS};
use std::time::Duration;

/// Largest submission queue io_uring accepts
pub const MAX_URING_ENTRIES: u32 = 32768;

/// Configuration for the process-wide pool and reactor.
///
/// `Default` reads the environment:
///
/// | Variable                 | Field              |
/// |--------------------------|--------------------|
/// | `PIPEIO_POOL_WORKERS`    | `pool_workers`     |
/// | `PIPEIO_POOL_MAX_WORKERS`| `pool_max_workers` |
/// | `PIPEIO_POOL_KEEP_ALIVE_MS` | `pool_keep_alive` |
/// | `PIPEIO_POOL_QUEUE_DEPTH`| `pool_queue_depth` |
/// | `PIPEIO_POOL_IDLE_US`    | `pool_idle_park`   |
/// | `PIPEIO_URING_ENTRIES`   | `uring_entries`    |
/// | `PIPEIO_REACTOR_QUEUE`   | `reactor_queue`    |
/// | `PIPEIO_TRUST_CACHE`     | `trust_cache`      |
#[derive(Debug, Clone)]
pub struct PipeConfig {
    /// Core worker threads of the default pool
    pub pool_workers: usize,

    /// Ceiling the pool grows to while every worker is blocked
    pub pool_max_workers: usize,

    /// How long an extra worker stays idle before it exits
    pub pool_keep_alive: Duration,

    /// Jobs that may wait for a worker
    pub pool_queue_depth: usize,

    /// How long an idle worker parks between queue checks
    pub pool_idle_park: Duration,

    /// io_uring submission queue entries
    pub uring_entries: u32,

    /// Commands that may wait for the reactor thread
    pub reactor_queue: usize,

    /// Default trust-cache flag for Named pipes
    pub trust_cache: bool,
}

impl Default for PipeConfig {
    fn default() -> Self {
        let pool = FixedPoolConfig::default();
        Self {
            pool_workers: env_get_nonzero("PIPEIO_POOL_WORKERS", pool.workers),
            pool_max_workers: env_get_nonzero("PIPEIO_POOL_MAX_WORKERS", pool.max_workers),
            pool_keep_alive: Duration::from_millis(env_get(
                "PIPEIO_POOL_KEEP_ALIVE_MS",
                pool.keep_alive.as_millis() as u64,
            )),
            pool_queue_depth: env_get_nonzero("PIPEIO_POOL_QUEUE_DEPTH", pool.queue_depth),
            pool_idle_park: Duration::from_micros(env_get(
                "PIPEIO_POOL_IDLE_US",
                pool.idle_park.as_micros() as u64,
            )),
            uring_entries: env_get("PIPEIO_URING_ENTRIES", 256),
            reactor_queue: env_get_nonzero("PIPEIO_REACTOR_QUEUE", 4096),
            trust_cache: env_get_bool("PIPEIO_TRUST_CACHE", true),
        }
    }
}

impl PipeConfig {
    /// Configuration from the environment
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pool_workers(mut self, n: usize) -> Self {
        self.pool_workers = n;
        self
    }

    pub fn pool_max_workers(mut self, n: usize) -> Self {
        self.pool_max_workers = n;
        self
    }

    pub fn pool_keep_alive(mut self, d: Duration) -> Self {
        self.pool_keep_alive = d;
        self
    }

    pub fn pool_queue_depth(mut self, n: usize) -> Self {
        self.pool_queue_depth = n;
        self
    }

    pub fn pool_idle_park(mut self, d: Duration) -> Self {
        self.pool_idle_park = d;
        self
    }

    pub fn uring_entries(mut self, n: u32) -> Self {
        self.uring_entries = n;
        self
    }

    pub fn reactor_queue(mut self, n: usize) -> Self {
        self.reactor_queue = n;
        self
    }

    pub fn trust_cache(mut self, trust: bool) -> Self {
        self.trust_cache = trust;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> PipeResult<()> {
        if self.pool_workers == 0 {
            return Err(PipeError::Config("pool_workers must be at least 1"));
        }
        if self.pool_workers > MAX_POOL_WORKERS {
            return Err(PipeError::Config("pool_workers exceeds maximum"));
        }
        if self.pool_max_workers < self.pool_workers || self.pool_max_workers > MAX_POOL_WORKERS {
            return Err(PipeError::Config("pool_max_workers must be in pool_workers..=256"));
        }
        if self.pool_queue_depth == 0 {
            return Err(PipeError::Config("pool_queue_depth must be at least 1"));
        }
        if self.pool_idle_park.is_zero() {
            return Err(PipeError::Config("pool_idle_park must be non-zero"));
        }
        if self.uring_entries == 0 || self.uring_entries > MAX_URING_ENTRIES {
            return Err(PipeError::Config("uring_entries must be in 1..=32768"));
        }
        if self.reactor_queue == 0 {
            return Err(PipeError::Config("reactor_queue must be at least 1"));
        }
        Ok(())
    }

    /// Settings for the default worker pool
    pub fn pool_config(&self) -> FixedPoolConfig {
        FixedPoolConfig {
            workers: self.pool_workers,
            max_workers: self.pool_max_workers,
            keep_alive: self.pool_keep_alive,
            queue_depth: self.pool_queue_depth,
            idle_park: self.pool_idle_park,
            ..FixedPoolConfig::default()
        }
    }

    /// Settings for the process-wide io_uring reactor
    #[cfg(feature = "uring")]
    pub fn reactor_config(&self) -> pipeio_module::uring::ReactorConfig {
        pipeio_module::uring::ReactorConfig {
            sq_entries: self.uring_entries,
            queue_capacity: self.reactor_queue,
        }
    }

    /// Validate and make this the process-wide configuration.
    pub fn install(self) -> PipeResult<()> {
        crate::runtime::install(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> PipeConfig {
        PipeConfig {
            pool_workers: 2,
            pool_max_workers: 16,
            pool_keep_alive: Duration::from_secs(1),
            pool_queue_depth: 16,
            pool_idle_park: Duration::from_millis(1),
            uring_entries: 64,
            reactor_queue: 128,
            trust_cache: true,
        }
    }

    #[test]
    fn test_validate() {
        assert!(base().validate().is_ok());
        assert!(base().pool_workers(0).validate().is_err());
        assert!(base().pool_workers(MAX_POOL_WORKERS + 1).validate().is_err());
        assert!(base().pool_max_workers(1).validate().is_err());
        assert!(base().pool_max_workers(MAX_POOL_WORKERS + 1).validate().is_err());
        assert!(base().pool_queue_depth(0).validate().is_err());
        assert!(base().pool_idle_park(Duration::ZERO).validate().is_err());
        assert!(base().uring_entries(0).validate().is_err());
        assert!(base().uring_entries(MAX_URING_ENTRIES * 2).validate().is_err());
        assert!(matches!(
            base().reactor_queue(0).validate(),
            Err(PipeError::Config(_))
        ));
    }

    #[test]
    fn test_pool_config() {
        let pool = base()
            .pool_workers(3)
            .pool_max_workers(5)
            .pool_queue_depth(7)
            .pool_config();
        assert_eq!(pool.workers, 3);
        assert_eq!(pool.max_workers, 5);
        assert_eq!(pool.keep_alive, Duration::from_secs(1));
        assert_eq!(pool.queue_depth, 7);
        assert_eq!(pool.name_prefix, "pipeio-pool");
    }
}
