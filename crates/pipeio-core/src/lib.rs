//! # pipeio-core — Trait definitions and shared types for pipeio
//!
//! This crate defines the boundaries every other pipeio crate programs
//! against:
//!
//! - `status`: the closed set of native codes a transport reports
//! - `transport`: `NativePipe`, `CompletionPort`, `CompletionTarget`
//! - `worker`: `WorkerPool` for the async-over-blocking path
//! - `thread_handle`: per-thread interrupt handles for blocking calls
//! - `cancel`: cancellation tokens with callback registration
//! - `kind`: direction, transmission mode, pipe kind, connection state
//! - `error`: `PipeError` / `PipeResult`
//!
//! Default implementations live in `pipeio-module`; the engine in `pipeio`.

pub mod kprint;
pub mod env;
pub mod status;
pub mod kind;
pub mod error;
pub mod cancel;
pub mod eventfd;
pub mod thread_handle;
pub mod transport;
pub mod worker;

pub use cancel::{CancellationToken, Registration};
pub use error::{PipeError, PipeResult};
pub use kind::{PipeDirection, PipeKind, PipeState, TransmissionMode};
pub use status::{Issue, NativeCode, Transfer};
pub use thread_handle::ThreadHandle;
pub use transport::{
    BufferHandle, CompletionPort, CompletionTarget, IoRequest, NativePipe, OpId, OpKind, PipeInfo,
};
pub use worker::{Job, WorkerPool};
