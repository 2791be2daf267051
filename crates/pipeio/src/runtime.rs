//! Process-wide defaults: configuration and the default worker pool.
//!
//! Both are created on first use. `install` must run before that to take
//! effect.

use pipeio_core::error::{PipeError, PipeResult};
use pipeio_core::worker::WorkerPool;
use pipeio_core::{kinfo, kwarn};
use pipeio_module::fixed_pool::FixedPool;

use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};

use crate::config::PipeConfig;

static CONFIG: OnceLock<PipeConfig> = OnceLock::new();
static POOL: Mutex<Option<Arc<dyn WorkerPool>>> = Mutex::new(None);

/// Make `config` the process-wide configuration.
///
/// Fails with `Config` if it is invalid or a configuration is already in
/// effect.
pub fn install(config: PipeConfig) -> PipeResult<()> {
    config.validate()?;

    let mut installed = false;
    CONFIG.get_or_init(|| {
        installed = true;
        apply(&config);
        config
    });
    if !installed {
        return Err(PipeError::Config("runtime already configured"));
    }
    kinfo!("runtime: configuration installed");
    Ok(())
}

/// The configuration in effect (from the environment unless installed).
///
/// The first call also hands the reactor settings to the process-wide
/// reactor, so it must happen before the first bind.
pub fn config() -> &'static PipeConfig {
    CONFIG.get_or_init(|| {
        let config = PipeConfig::default();
        match config.validate() {
            Ok(()) => apply(&config),
            Err(e) => kwarn!("runtime: environment ignored for the reactor: {}", e),
        }
        config
    })
}

/// Push settings owned by lower layers to where they take effect.
fn apply(_config: &PipeConfig) {
    cfg_if::cfg_if! {
        if #[cfg(feature = "uring")] {
            if !pipeio_module::uring::configure_global(_config.reactor_config()) {
                kwarn!("runtime: reactor already running, its settings stay");
            }
        }
    }
}

/// The pool used by streams built without one.
pub fn default_pool() -> PipeResult<Arc<dyn WorkerPool>> {
    let mut pool = POOL.lock();
    if let Some(p) = pool.as_ref() {
        return Ok(Arc::clone(p));
    }
    let created: Arc<dyn WorkerPool> = Arc::new(FixedPool::new(config().pool_config())?);
    *pool = Some(Arc::clone(&created));
    Ok(created)
}

/// Replace the default pool. Streams keep the pool they were built with.
pub fn set_default_pool(pool: Arc<dyn WorkerPool>) {
    let old = POOL.lock().replace(pool);
    if let Some(old) = old {
        old.shutdown();
    }
}

/// Shut the default pool down. The next use creates a new one.
pub fn shutdown() {
    let pool = POOL.lock().take();
    if let Some(pool) = pool {
        pool.shutdown();
    }
}
