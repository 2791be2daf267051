//! Central classification of native results.
//!
//! Both execution paths hand every native result to [`classify`] at the
//! point the call returns, so a given code has the same effect on the
//! connection whichever path produced it:
//!
//! | Native result              | Effect                       | Caller sees            |
//! |----------------------------|------------------------------|------------------------|
//! | `Done(n)`                  | message complete             | `Ok(n)`                |
//! | `MoreData(n)`              | message incomplete           | `Ok(n)`                |
//! | peer gone, on read         | → Broken                     | `Ok(0)`                |
//! | broken class, on write     | → Broken                     | `PipeBroken`           |
//! | `InvalidHandle`            | poison, → Broken             | `InvalidHandle`        |
//! | `HandleEof`                |                              | `EndOfFile`            |
//! | `OperationAborted`         |                              | `Canceled` / `PipeClosed` |
//! | anything else              |                              | `Io(code)`             |

use pipeio_core::cancel::CancellationToken;
use pipeio_core::error::{PipeError, PipeResult};
use pipeio_core::kind::PipeState;
use pipeio_core::status::{NativeCode, Transfer};
use pipeio_core::transport::OpKind;
use pipeio_core::ktrace;

use crate::state::ConnStatus;

/// Map a native result to the caller-visible outcome, updating `status`.
pub(crate) fn classify(
    status: &ConnStatus,
    kind: OpKind,
    result: Transfer,
    token: &CancellationToken,
) -> PipeResult<usize> {
    match result {
        Transfer::Done(n) => {
            if kind == OpKind::Read {
                status.set_message_complete(true);
            }
            Ok(n)
        }
        Transfer::MoreData(n) => {
            status.set_message_complete(false);
            Ok(n)
        }
        Transfer::Failed(code) => {
            ktrace!("pipe: {} failed: {}", kind, code);
            classify_failure(status, kind, code, token)
        }
    }
}

fn classify_failure(
    status: &ConnStatus,
    kind: OpKind,
    code: NativeCode,
    token: &CancellationToken,
) -> PipeResult<usize> {
    match code {
        // `NoData` (closing) is not end of data for a reader.
        NativeCode::BrokenPipe | NativeCode::PipeNotConnected if kind == OpKind::Read => {
            status.mark_broken(code);
            Ok(0)
        }
        c if c.is_broken() && kind == OpKind::Write => {
            status.mark_broken(c);
            Err(PipeError::PipeBroken(c))
        }
        NativeCode::InvalidHandle => {
            status.poison();
            status.mark_broken(code);
            Err(PipeError::InvalidHandle)
        }
        NativeCode::HandleEof => Err(PipeError::EndOfFile),
        NativeCode::OperationAborted => Err(aborted(status, token)),
        other => Err(PipeError::Io(other)),
    }
}

/// The error for a call that was aborted or never started because of a
/// cancellation: the caller's token if it fired, otherwise the close.
pub(crate) fn aborted(status: &ConnStatus, token: &CancellationToken) -> PipeError {
    if token.is_cancelled() {
        PipeError::Canceled(token.clone())
    } else if status.get() == PipeState::Closed {
        PipeError::PipeClosed
    } else {
        PipeError::Canceled(CancellationToken::none())
    }
}
