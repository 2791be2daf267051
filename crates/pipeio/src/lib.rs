//! # pipeio — Async bidirectional pipe I/O
//!
//! One contract over two execution modes:
//!
//! - **overlapped**: the handle is bound to a completion port (io_uring on
//!   Linux) and every call runs in a reusable operation slot;
//! - **async-over-blocking**: for handles without overlapped capability,
//!   calls run as blocking native calls on a worker pool.
//!
//! Both are cancellable through a [`CancellationToken`] and both route
//! every native result through one classifier, so a given failure has the
//! same effect on the connection state whichever path produced it.
//!
//! ```ignore
//! use pipeio::{CancellationToken, PipeStream, TransmissionMode};
//!
//! let (a, b) = PipeStream::pair(TransmissionMode::Byte, true)?;
//! a.write(b"ping")?;
//! let token = CancellationToken::new();
//! let pipeio::BufResult(n, buf) =
//!     futures::executor::block_on(b.read_async(vec![0; 16], &token));
//! assert_eq!(&buf[..n?], b"ping");
//! ```
//!
//! ## Modules
//!
//! - `stream`: [`PipeStream`], its builder and property queries
//! - `slot`: operation slots for the overlapped path
//! - `dispatch`: work items for the async-over-blocking path
//! - `bridge`: token → native cancel request
//! - `classify`: native result → caller-visible outcome
//! - `state`: connection state machine
//! - `config` / `runtime`: process-wide settings and default pool

mod bridge;
mod classify;
mod dispatch;
mod slot;
mod state;
mod stream;

pub mod config;
pub mod runtime;

pub use config::PipeConfig;
pub use stream::{BufResult, PipeStream, PipeStreamBuilder};

pub use pipeio_core::{
    CancellationToken, NativeCode, OpKind, PipeDirection, PipeError, PipeKind, PipeResult,
    PipeState, TransmissionMode,
};
