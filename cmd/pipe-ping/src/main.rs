//! pipeio smoke test
//!
//! Exercises both execution paths end to end:
//!   Part A: ping-pong over an anonymous pipe and a duplex pair
//!   Part B: message mode: partial reads and completion flag
//!   Part C: cancellation: token on a pending read, close on a blocked read
//!
//! Run: ./target/release/pipe-ping [ROUNDS]
//! Set PIPEIO_LOG_LEVEL=debug for engine logging.

use futures::executor::block_on;
use pipeio::{
    BufResult, CancellationToken, PipeError, PipeResult, PipeState, PipeStream, TransmissionMode,
};

use std::thread;
use std::time::{Duration, Instant};

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self { total: 0, passed: 0, failed: 0 }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn record(&mut self, name: &str, result: PipeResult<()>) {
        self.total += 1;
        match result {
            Ok(()) => {
                self.passed += 1;
                println!("  [{:2}] {:<52} PASS", self.total, name);
            }
            Err(e) => {
                self.failed += 1;
                println!("  [{:2}] {:<52} FAIL: {}", self.total, name, e);
            }
        }
    }

    fn summary(&self) {
        println!("\n{}", LINE);
        println!(
            "  Total: {}  Passed: {}  Failed: {}",
            self.total, self.passed, self.failed
        );
        println!("{}", LINE);
    }
}

fn path_name(overlapped: bool) -> &'static str {
    if overlapped { "overlapped" } else { "blocking" }
}

fn expect(ok: bool, what: &'static str) -> PipeResult<()> {
    if ok { Ok(()) } else { Err(PipeError::InvalidOperation(what)) }
}

// ════════════════════════════════════════════════════════════
// Part A: ping-pong
// ════════════════════════════════════════════════════════════

fn anonymous_ping(overlapped: bool) -> PipeResult<()> {
    let (r, w) = PipeStream::anonymous(overlapped)?;
    w.write(b"ping")?;
    let mut buf = [0u8; 8];
    let n = r.read(&mut buf)?;
    expect(&buf[..n] == b"ping", "payload mismatch")
}

fn pair_ping_pong(overlapped: bool, rounds: usize) -> PipeResult<Duration> {
    let (a, b) = PipeStream::pair(TransmissionMode::Byte, overlapped)?;
    let token = CancellationToken::new();
    let start = Instant::now();

    thread::scope(|s| {
        // Echo until the client closes its end.
        let echo = s.spawn(|| -> PipeResult<()> {
            let mut buf = vec![0u8; 64];
            loop {
                let BufResult(n, back) = block_on(b.read_async(buf, &token));
                let n = n?;
                if n == 0 {
                    return Ok(());
                }
                b.write(&back[..n])?;
                buf = back;
            }
        });

        let mut buf = vec![0u8; 64];
        for i in 0..rounds {
            let msg = format!("ping {}", i);
            let BufResult(res, _) = block_on(a.write_async(msg.clone().into_bytes(), &token));
            res?;
            let mut got = 0;
            while got < msg.len() {
                let BufResult(n, back) = block_on(a.read_async(buf, &token));
                got += n?;
                buf = back;
            }
        }
        a.close();
        echo.join()
            .map_err(|_| PipeError::InvalidOperation("echo thread panicked"))?
    })?;

    Ok(start.elapsed())
}

// ════════════════════════════════════════════════════════════
// Part B: message mode
// ════════════════════════════════════════════════════════════

fn message_partial(overlapped: bool) -> PipeResult<()> {
    let (a, b) = PipeStream::pair(TransmissionMode::Message, overlapped)?;
    b.set_read_mode(TransmissionMode::Message)?;
    a.write(b"0123456789")?;

    let mut buf = [0u8; 4];
    let n = b.read(&mut buf)?;
    expect(n == 4 && !b.is_message_complete()?, "first chunk")?;
    let mut rest = [0u8; 16];
    let n = b.read(&mut rest)?;
    expect(&rest[..n] == b"456789" && b.is_message_complete()?, "message tail")
}

// ════════════════════════════════════════════════════════════
// Part C: cancellation
// ════════════════════════════════════════════════════════════

fn token_cancel(overlapped: bool) -> PipeResult<()> {
    let (_a, b) = PipeStream::pair(TransmissionMode::Byte, overlapped)?;
    let token = CancellationToken::new();
    let res = thread::scope(|s| {
        let reader = s.spawn(|| block_on(b.read_async(vec![0u8; 8], &token)).into_result());
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        reader.join()
    });
    match res {
        Ok(Err(PipeError::Canceled(t))) if t.same_as(&token) => {
            expect(b.state() == PipeState::Connected, "state changed")
        }
        _ => Err(PipeError::InvalidOperation("read was not canceled")),
    }
}

fn close_blocked_read(overlapped: bool) -> PipeResult<()> {
    let (_a, b) = PipeStream::pair(TransmissionMode::Byte, overlapped)?;
    let res = thread::scope(|s| {
        let reader = s.spawn(|| {
            let mut buf = [0u8; 8];
            b.read(&mut buf)
        });
        thread::sleep(Duration::from_millis(20));
        b.close();
        reader.join()
    });
    match res {
        Ok(Err(PipeError::PipeClosed)) => expect(b.state() == PipeState::Closed, "not closed"),
        _ => Err(PipeError::InvalidOperation("read was not aborted")),
    }
}

fn main() {
    let rounds: usize = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(10_000);

    let mut t = TestRunner::new();

    t.section("Part A: ping-pong");
    for overlapped in [false, true] {
        let path = path_name(overlapped);
        t.record(&format!("anonymous pipe ({})", path), anonymous_ping(overlapped));
        match pair_ping_pong(overlapped, rounds) {
            Ok(elapsed) => {
                t.record(&format!("{} round trips ({})", rounds, path), Ok(()));
                println!(
                    "       {:.2} µs per round trip",
                    elapsed.as_secs_f64() * 1e6 / rounds.max(1) as f64
                );
            }
            Err(e) => t.record(&format!("{} round trips ({})", rounds, path), Err(e)),
        }
    }

    t.section("Part B: message mode");
    for overlapped in [false, true] {
        t.record(
            &format!("partial message read ({})", path_name(overlapped)),
            message_partial(overlapped),
        );
    }

    t.section("Part C: cancellation");
    for overlapped in [false, true] {
        let path = path_name(overlapped);
        t.record(&format!("token cancels pending read ({})", path), token_cancel(overlapped));
        t.record(&format!("close aborts blocked read ({})", path), close_blocked_read(overlapped));
    }

    pipeio::runtime::shutdown();
    t.summary();
    if t.failed > 0 {
        std::process::exit(1);
    }
}
