//! End-to-end behavior over real descriptors.
//!
//! Overlapped streams fall back to the blocking path where io_uring is
//! unavailable, so these tests only assert what holds on both paths.

use futures::executor::block_on;
use pipeio::{
    BufResult, CancellationToken, PipeDirection, PipeError, PipeKind, PipeState, PipeStream,
    TransmissionMode,
};

use std::os::fd::{FromRawFd, OwnedFd};
use std::thread;
use std::time::Duration;

#[test]
fn test_anonymous_ping() {
    for overlapped in [false, true] {
        let (r, w) = PipeStream::anonymous(overlapped).unwrap();
        assert_eq!(r.direction(), PipeDirection::In);
        assert_eq!(w.direction(), PipeDirection::Out);
        assert_eq!(r.kind(), PipeKind::Anonymous);

        w.write(b"ping").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(r.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");
        assert_eq!(w.transmission_mode().unwrap(), TransmissionMode::Byte);
    }
}

#[test]
fn test_anonymous_writer_gone() {
    for overlapped in [false, true] {
        let (r, w) = PipeStream::anonymous(overlapped).unwrap();
        drop(w);
        let mut buf = [0u8; 4];
        assert_eq!(r.read(&mut buf).unwrap(), 0);
        assert_eq!(r.state(), PipeState::Broken);
    }
}

#[test]
fn test_anonymous_reader_gone() {
    let (r, w) = PipeStream::anonymous(true).unwrap();
    drop(r);
    assert!(matches!(w.write(b"x"), Err(PipeError::PipeBroken(_))));
    assert_eq!(w.state(), PipeState::Broken);
}

#[test]
fn test_byte_pair_async() {
    for overlapped in [false, true] {
        let (a, b) = PipeStream::pair(TransmissionMode::Byte, overlapped).unwrap();
        let token = CancellationToken::new();

        let BufResult(res, _) = block_on(a.write_async(b"hello".to_vec(), &token));
        res.unwrap();
        let BufResult(res, buf) = block_on(b.read_async(vec![0u8; 32], &token));
        let n = res.unwrap();
        assert_eq!(&buf[..n], b"hello");

        // And back.
        b.write(b"world").unwrap();
        let mut back = [0u8; 5];
        assert_eq!(a.read(&mut back).unwrap(), 5);
        assert_eq!(&back, b"world");
    }
}

#[test]
fn test_large_transfer() {
    let (a, b) = PipeStream::pair(TransmissionMode::Byte, true).unwrap();
    let data: Vec<u8> = (0..1 << 20).map(|i| (i % 251) as u8).collect();

    thread::scope(|s| {
        s.spawn(|| a.write(&data).unwrap());
        let mut got = Vec::with_capacity(data.len());
        let mut buf = vec![0u8; 64 * 1024];
        while got.len() < data.len() {
            let n = b.read(&mut buf).unwrap();
            assert!(n > 0);
            got.extend_from_slice(&buf[..n]);
        }
        assert!(got == data);
    });
}

#[test]
fn test_message_partial_reads() {
    for overlapped in [false, true] {
        let (a, b) = PipeStream::pair(TransmissionMode::Message, overlapped).unwrap();
        assert_eq!(b.transmission_mode().unwrap(), TransmissionMode::Message);
        b.set_read_mode(TransmissionMode::Message).unwrap();

        a.write(b"first message").unwrap();
        a.write(b"second").unwrap();

        let mut buf = [0u8; 5];
        assert_eq!(b.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"first");
        assert!(!b.is_message_complete().unwrap());

        let mut rest = [0u8; 32];
        let n = b.read(&mut rest).unwrap();
        assert_eq!(&rest[..n], b" message");
        assert!(b.is_message_complete().unwrap());

        let n = b.read(&mut rest).unwrap();
        assert_eq!(&rest[..n], b"second");
        assert!(b.is_message_complete().unwrap());
    }
}

#[test]
fn test_byte_pair_rejects_message_read_mode() {
    let (a, _b) = PipeStream::pair(TransmissionMode::Byte, false).unwrap();
    assert!(matches!(
        a.set_read_mode(TransmissionMode::Message),
        Err(PipeError::InvalidOperation(_))
    ));
}

#[test]
fn test_close_interrupts_blocking_read() {
    let (a, _b) = PipeStream::pair(TransmissionMode::Byte, false).unwrap();
    thread::scope(|s| {
        let reader = s.spawn(|| {
            let mut buf = [0u8; 8];
            a.read(&mut buf)
        });
        thread::sleep(Duration::from_millis(50));
        a.close();
        assert!(matches!(reader.join().unwrap(), Err(PipeError::PipeClosed)));
    });
    assert_eq!(a.state(), PipeState::Closed);
}

#[test]
fn test_token_cancels_read() {
    for overlapped in [false, true] {
        let (a, b) = PipeStream::pair(TransmissionMode::Byte, overlapped).unwrap();
        let token = CancellationToken::new();

        thread::scope(|s| {
            let reader = s.spawn(|| block_on(b.read_async(vec![0u8; 8], &token)));
            thread::sleep(Duration::from_millis(50));
            token.cancel();
            let BufResult(res, buf) = reader.join().unwrap();
            assert!(matches!(res, Err(PipeError::Canceled(t)) if t.same_as(&token)));
            assert_eq!(buf.len(), 8);
        });
        assert_eq!(b.state(), PipeState::Connected);

        // The stream stays usable.
        a.write(b"after").unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(b.read(&mut buf).unwrap(), 5);
    }
}

#[test]
fn test_from_owned_fd() {
    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    // Safety: both descriptors were just created and are owned here.
    let (r, w) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    let r = PipeStream::from_owned_fd(r, PipeDirection::In, false).unwrap();
    let w = PipeStream::from_owned_fd(w, PipeDirection::Out, false).unwrap();
    assert_eq!(r.kind(), PipeKind::FromExistingHandle);
    assert_eq!(r.raw_handle(), Some(fds[0]));

    w.write(b"adopted").unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(r.read(&mut buf).unwrap(), 7);
    assert_eq!(&buf[..7], b"adopted");
    assert!(r.in_buffer_size().unwrap() > 0);
    assert!(w.out_buffer_size().unwrap() > 0);
}

#[test]
fn test_drain_after_peer_reads() {
    let (a, b) = PipeStream::pair(TransmissionMode::Byte, false).unwrap();
    a.write(b"flush me").unwrap();
    thread::scope(|s| {
        s.spawn(|| {
            let mut buf = [0u8; 8];
            let mut got = 0;
            while got < 8 {
                got += b.read(&mut buf[got..]).unwrap();
            }
        });
        a.drain().unwrap();
    });
}

#[test]
fn test_std_io_over_fds() {
    use std::io::{Read, Write};

    let (a, b) = PipeStream::pair(TransmissionMode::Byte, true).unwrap();
    (&a).write_all(b"std io works").unwrap();
    let mut buf = [0u8; 12];
    (&b).read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"std io works");

    drop(a);
    let mut rest = Vec::new();
    (&b).read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
}

#[test]
fn test_property_queries() {
    let (a, _b) = PipeStream::pair(TransmissionMode::Byte, false).unwrap();
    assert!(a.in_buffer_size().unwrap() > 0);
    assert!(a.out_buffer_size().unwrap() > 0);
    assert_eq!(a.read_mode().unwrap(), TransmissionMode::Byte);
    assert!(a.raw_handle().is_some());
    a.close();
    assert!(matches!(a.in_buffer_size(), Err(PipeError::PipeClosed)));
    assert_eq!(a.raw_handle(), None);
}
