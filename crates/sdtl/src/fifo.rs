// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bounded blocking FIFO between the RX thread and application calls.
//!
//! The single RX thread is the producer; application `send_data`/`recv_data`
//! calls are the consumers. The producer must never block on a slow consumer,
//! so a push into a full FIFO overwrites the oldest entry and the loss is
//! reported to the consumer on its next pop as [`PopError::Lagged`]. Entries
//! already accepted stay intact; only the fact of the loss matters to the
//! protocol above.
//!
//! `close` wakes every blocked consumer with [`PopError::Closed`]; this is the
//! cancellation path used by service shutdown.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Why a pop returned without an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    /// The timeout elapsed before an item arrived.
    TimedOut,
    /// The producer overwrote entries this consumer never saw.
    Lagged,
    /// The FIFO was closed; no more items will arrive.
    Closed,
}

struct Inner<T> {
    queue: VecDeque<T>,
    /// Entries overwritten since the consumer last observed the loss.
    lost: u64,
    closed: bool,
}

/// Bounded blocking FIFO.
pub struct Fifo<T> {
    inner: Mutex<Inner<T>>,
    cond: Condvar,
    capacity: usize,
}

impl<T> Fifo<T> {
    /// Create a FIFO holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "fifo capacity must be non-zero");
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                lost: 0,
                closed: false,
            }),
            cond: Condvar::new(),
            capacity,
        }
    }

    /// Push an entry, overwriting the oldest one when full.
    ///
    /// Returns `false` when the push displaced an entry or the FIFO is
    /// closed (the item is dropped in the closed case).
    pub fn push(&self, item: T) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }

        let mut clean = true;
        if inner.queue.len() >= self.capacity {
            inner.queue.pop_front();
            inner.lost += 1;
            clean = false;
        }
        inner.queue.push_back(item);
        drop(inner);

        self.cond.notify_one();
        clean
    }

    /// Pop the oldest entry, blocking until one is available.
    pub fn pop(&self) -> Result<T, PopError> {
        self.pop_inner(None)
    }

    /// Pop the oldest entry, waiting at most `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Result<T, PopError> {
        self.pop_inner(Some(timeout))
    }

    fn pop_inner(&self, timeout: Option<Duration>) -> Result<T, PopError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock();

        loop {
            if inner.lost > 0 {
                inner.lost = 0;
                return Err(PopError::Lagged);
            }
            if let Some(item) = inner.queue.pop_front() {
                return Ok(item);
            }
            if inner.closed {
                return Err(PopError::Closed);
            }

            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(PopError::TimedOut);
                    }
                    if self.cond.wait_for(&mut inner, deadline - now).timed_out() {
                        // Re-check once; an item may have raced the timeout.
                        continue;
                    }
                }
                None => self.cond.wait(&mut inner),
            }
        }
    }

    /// Drop all queued entries and any pending loss marker.
    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        inner.queue.clear();
        inner.lost = 0;
    }

    /// Close the FIFO, waking every blocked consumer.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        drop(inner);
        self.cond.notify_all();
    }

    /// Number of queued entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// True when no entries are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
