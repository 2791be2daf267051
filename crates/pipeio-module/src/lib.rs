//! # pipeio-module — Default implementations
//!
//! This crate provides the default implementation for every pipeio-core
//! trait. Each impl prioritizes correctness and simplicity over
//! performance.
//!
//! ## Default stack
//!
//! | Trait           | Default Impl   | Notes                                |
//! |-----------------|----------------|--------------------------------------|
//! | NativePipe      | FdPipe         | pipe2 / socketpair descriptors       |
//! | CompletionPort  | UringPort      | io_uring reactor thread (`uring`)    |
//! | WorkerPool      | FixedPool      | N+ OS threads, lock-free job queue   |
//! | NativePipe      | MemPipe        | in-memory pair with call counters    |

pub mod fixed_pool;
pub mod fd_pipe;
pub mod mem_pipe;

cfg_if::cfg_if! {
    if #[cfg(feature = "uring")] {
        pub mod uring;
        pub use uring::{ReactorConfig, UringReactor};
    }
}

pub use fd_pipe::{FdPipe, Flavor};
pub use fixed_pool::{FixedPool, FixedPoolConfig};
pub use mem_pipe::{MemPipe, MemProbe, MemStats};
