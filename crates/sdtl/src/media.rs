// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Media abstraction: the byte pipe underneath the transport.
//!
//! The transport treats its medium as an unreliable, in-order, full-duplex
//! byte stream — a serial port, a TCP tunnel, a radio modem, or the in-memory
//! [`TestBridge`] used by the test suite. Only three operations matter:
//!
//! ```ignore
//! pub trait Media: Send + Sync {
//!     fn read(&self, buf: &mut [u8]) -> io::Result<usize>;
//!     fn write(&self, buf: &[u8]) -> io::Result<()>;
//!     fn close(&self);
//! }
//! ```
//!
//! Opening and attachment are constructor territory of the concrete driver;
//! the service consumes an already-constructed `Arc<dyn Media>`.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Blocking byte-stream medium shared by one service.
pub trait Media: Send + Sync {
    /// Read a chunk of bytes, blocking until something arrives.
    ///
    /// `Ok(0)` is permitted and means "nothing this time". End of stream is
    /// `Err` with [`io::ErrorKind::UnexpectedEof`]; any other error
    /// terminates the service RX loop.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write `buf` in full or fail.
    ///
    /// Callers hand one complete frame per call; implementations must not
    /// interleave bytes of concurrent writes.
    fn write(&self, buf: &[u8]) -> io::Result<()>;

    /// Release the medium, unblocking any pending read.
    fn close(&self);
}

// ============================================================================
// TestBridge - in-memory full-duplex byte pipe for tests and demos
// ============================================================================

struct PipeInner {
    chunks: VecDeque<Vec<u8>>,
    /// Read offset into the front chunk; a partially consumed chunk stays
    /// queued with its remainder.
    front_offset: usize,
    closed: bool,
}

struct Pipe {
    inner: Mutex<PipeInner>,
    cond: Condvar,
}

impl Pipe {
    fn new() -> Self {
        Self {
            inner: Mutex::new(PipeInner {
                chunks: VecDeque::new(),
                front_offset: 0,
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "bridge closed"));
        }
        inner.chunks.push_back(data.to_vec());
        drop(inner);
        self.cond.notify_one();
        Ok(())
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(front) = inner.chunks.front() {
                let offset = inner.front_offset;
                let remaining = front.len() - offset;
                let n = remaining.min(buf.len());
                buf[..n].copy_from_slice(&front[offset..offset + n]);

                if n == remaining {
                    inner.chunks.pop_front();
                    inner.front_offset = 0;
                } else {
                    inner.front_offset += n;
                }
                return Ok(n);
            }
            if inner.closed {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "bridge closed",
                ));
            }
            self.cond.wait(&mut inner);
        }
    }

    fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        drop(inner);
        self.cond.notify_all();
    }
}

/// In-memory full-duplex byte bridge.
///
/// [`TestBridge::pair`] yields two connected endpoints; bytes written on one
/// are read on the other. Chunk boundaries are not preserved: a reader with a
/// small buffer consumes a queued chunk piecewise, which exercises the
/// framer's resynchronisation the way a real byte stream would.
pub struct TestBridge;

impl TestBridge {
    /// Create a connected endpoint pair.
    #[must_use]
    pub fn pair() -> (BridgeEndpoint, BridgeEndpoint) {
        let up = Arc::new(Pipe::new());
        let down = Arc::new(Pipe::new());

        (
            BridgeEndpoint {
                rx: Arc::clone(&up),
                tx: Arc::clone(&down),
            },
            BridgeEndpoint { rx: down, tx: up },
        )
    }
}

/// One side of a [`TestBridge`].
pub struct BridgeEndpoint {
    rx: Arc<Pipe>,
    tx: Arc<Pipe>,
}

impl Media for BridgeEndpoint {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.rx.read(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<()> {
        self.tx.write(buf)
    }

    fn close(&self) {
        // Close only the receive side; the peer keeps reading what it has.
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn gen_data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    #[test]
    fn test_bridge_basic_transfer() {
        let (a, b) = TestBridge::pair();
        a.write(b"hello").expect("write");

        let mut buf = [0u8; 16];
        let n = b.read(&mut buf).expect("read");
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn test_bridge_is_full_duplex() {
        let (a, b) = TestBridge::pair();
        a.write(b"ping").expect("write");
        b.write(b"pong").expect("write");

        let mut buf = [0u8; 16];
        let n = b.read(&mut buf).expect("read");
        assert_eq!(&buf[..n], b"ping");
        let n = a.read(&mut buf).expect("read");
        assert_eq!(&buf[..n], b"pong");
    }

    #[test]
    fn test_partial_reads_preserve_stream() {
        // Two 128-byte writes read back with a 100-byte buffer come out as
        // chunks of 100, 28, 100, 28 — byte-stream, not datagram, semantics.
        let (a, b) = TestBridge::pair();
        let data = gen_data(256);
        a.write(&data[..128]).expect("write");
        a.write(&data[128..]).expect("write");

        let mut readback = Vec::new();
        for expected in [100usize, 28, 100, 28] {
            let mut buf = [0u8; 100];
            let n = b.read(&mut buf).expect("read");
            assert_eq!(n, expected);
            readback.extend_from_slice(&buf[..n]);
        }
        assert_eq!(readback, data);
    }

    #[test]
    fn test_close_unblocks_blocked_reader() {
        // Shared the way a service holds its medium.
        let (a, _b) = TestBridge::pair();
        let a: Arc<BridgeEndpoint> = Arc::new(a);
        let reader_side = Arc::clone(&a);

        let reader = thread::spawn(move || {
            let mut buf = [0u8; 16];
            reader_side.read(&mut buf).map_err(|e| e.kind())
        });
        thread::sleep(Duration::from_millis(20));
        a.close();

        assert_eq!(
            reader.join().expect("join"),
            Err(io::ErrorKind::UnexpectedEof)
        );
    }

    #[test]
    fn test_reader_sees_eof_after_close() {
        let (a, _b) = TestBridge::pair();
        a.close();
        let mut buf = [0u8; 4];
        let err = a.read(&mut buf).expect_err("closed");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_queued_bytes_drain_before_eof() {
        let (a, b) = TestBridge::pair();
        b.write(b"tail").expect("write");
        a.close();

        let mut buf = [0u8; 16];
        let n = a.read(&mut buf).expect("read queued");
        assert_eq!(&buf[..n], b"tail");
        assert!(a.read(&mut buf).is_err());
    }

    #[test]
    fn test_write_after_peer_close_fails() {
        let (a, b) = TestBridge::pair();
        b.close();
        let err = a.write(b"late").expect_err("peer gone");
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
