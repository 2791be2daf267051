//! Environment settings reach the process-wide reactor.
//!
//! Kept in its own test binary: the runtime configuration is read once per
//! process, so nothing else may build a stream first.

#[cfg(feature = "uring")]
#[test]
fn test_env_reactor_settings_reach_reactor() {
    use pipeio::{PipeStream, TransmissionMode};
    use pipeio_module::uring::{self, ReactorConfig};

    std::env::set_var("PIPEIO_URING_ENTRIES", "64");
    std::env::set_var("PIPEIO_REACTOR_QUEUE", "512");

    // First stream in the process, and the first bind.
    let (a, b) = PipeStream::pair(TransmissionMode::Byte, true).unwrap();

    let expected = ReactorConfig {
        sq_entries: 64,
        queue_capacity: 512,
    };
    assert_eq!(pipeio::runtime::config().reactor_config(), expected);
    assert_eq!(uring::global_config(), expected);
    // A later install cannot change what the reactor already uses.
    assert!(!uring::configure_global(ReactorConfig::default()));

    a.write(b"ok").unwrap();
    let mut buf = [0u8; 2];
    assert_eq!(b.read(&mut buf).unwrap(), 2);
}
