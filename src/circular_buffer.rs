//! Bounded-blocking circular byte buffer (§4.5): a ring of fixed-size
//! "pages" guarded by a condvar-based wait strategy (no-lock and
//! condvar-with-timeout variants are both expressible through the same
//! `peek`/`peek_timeout` split).
//!
//! `std::sync::Condvar` keeps this blocking and non-async rather than
//! rebuilding it on a `tokio` mpsc channel, which has no
//! `peek`-without-removing primitive.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

/// One fixed-size chunk as handed to `push_back` by a writer.
pub type Page = Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutError;

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "timeout waiting for circular buffer condition")
    }
}
impl std::error::Error for TimeoutError {}

struct Inner {
    pages: VecDeque<Page>,
    bytes: usize,
    capacity: usize,
}

/// A bounded ring of byte pages with blocking push/peek/pop, sized in
/// bytes (not page count) to match `CIRCULAR_BUFFER_SIZE`
/// (a multiple of `minimum_part_size`).
pub struct CircularBuffer {
    inner: Mutex<Inner>,
    not_full: Condvar,
    has_data: Condvar,
}

impl CircularBuffer {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                pages: VecDeque::new(),
                bytes: 0,
                capacity: capacity_bytes,
            }),
            not_full: Condvar::new(),
            has_data: Condvar::new(),
        }
    }

    /// Blocks until there is room for `page`, then appends it.
    pub fn push_back(&self, page: Page) {
        let mut guard = self.inner.lock().unwrap();
        while guard.bytes + page.len() > guard.capacity && !guard.pages.is_empty() {
            guard = self.not_full.wait(guard).unwrap();
        }
        guard.bytes += page.len();
        guard.pages.push_back(page);
        drop(guard);
        self.has_data.notify_all();
    }

    /// Blocks (optionally with a timeout) until there is room for `page`,
    /// then appends it. Used by writers feeding the upload worker so a
    /// hung consumer cannot block the caller forever.
    pub fn push_back_timeout(&self, page: Page, timeout: Duration) -> Result<(), TimeoutError> {
        let mut guard = self.inner.lock().unwrap();
        let deadline = Instant::now() + timeout;
        while guard.bytes + page.len() > guard.capacity && !guard.pages.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return Err(TimeoutError);
            }
            let (g, result) = self.not_full.wait_timeout(guard, deadline - now).unwrap();
            guard = g;
            if result.timed_out()
                && guard.bytes + page.len() > guard.capacity
                && !guard.pages.is_empty()
            {
                return Err(TimeoutError);
            }
        }
        guard.bytes += page.len();
        guard.pages.push_back(page);
        drop(guard);
        self.has_data.notify_all();
        Ok(())
    }

    /// Copies the front `n` bytes into a single contiguous buffer without
    /// removing them, blocking until at least `n` bytes are buffered.
    pub fn peek(&self, n: usize) -> Vec<u8> {
        let guard = self.inner.lock().unwrap();
        let mut guard = guard;
        while guard.bytes < n {
            guard = self.has_data.wait(guard).unwrap();
        }
        Self::copy_front(&guard.pages, n)
    }

    /// Timeout-bearing variant used by the upload worker (§4.5: "upload
    /// worker uses timeout-wait so a hung producer does not leak threads
    /// forever").
    pub fn peek_timeout(&self, n: usize, timeout: Duration) -> Result<Vec<u8>, TimeoutError> {
        let mut guard = self.inner.lock().unwrap();
        let deadline = Instant::now() + timeout;
        while guard.bytes < n {
            let now = Instant::now();
            if now >= deadline {
                return Err(TimeoutError);
            }
            let (g, result) = self.has_data.wait_timeout(guard, deadline - now).unwrap();
            guard = g;
            if result.timed_out() && guard.bytes < n {
                return Err(TimeoutError);
            }
        }
        Ok(Self::copy_front(&guard.pages, n))
    }

    /// Discards the front `n` bytes, blocking until at least `n` bytes are
    /// present.
    pub fn pop_front(&self, n: usize) {
        let mut guard = self.inner.lock().unwrap();
        while guard.bytes < n {
            guard = self.has_data.wait(guard).unwrap();
        }
        let mut remaining = n;
        while remaining > 0 {
            let front_len = guard.pages.front().map(|p| p.len()).unwrap_or(0);
            if front_len == 0 {
                break;
            }
            if front_len <= remaining {
                let popped = guard.pages.pop_front().unwrap();
                remaining -= popped.len();
                guard.bytes -= popped.len();
            } else {
                let popped = guard.pages.pop_front().unwrap();
                let keep = popped.slice(remaining..);
                guard.bytes -= remaining;
                guard.pages.push_front(keep);
                remaining = 0;
            }
        }
        drop(guard);
        self.not_full.notify_all();
    }

    pub fn len_bytes(&self) -> usize {
        self.inner.lock().unwrap().bytes
    }

    fn copy_front(pages: &VecDeque<Page>, n: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(n);
        for page in pages {
            if out.len() >= n {
                break;
            }
            let take = (n - out.len()).min(page.len());
            out.extend_from_slice(&page[..take]);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn push_peek_pop_roundtrip() {
        let cb = CircularBuffer::new(1024);
        cb.push_back(Bytes::from_static(b"hello "));
        cb.push_back(Bytes::from_static(b"world"));
        assert_eq!(cb.peek(11), b"hello world".to_vec());
        cb.pop_front(6);
        assert_eq!(cb.peek(5), b"world".to_vec());
        assert_eq!(cb.len_bytes(), 5);
    }

    #[test]
    fn push_back_timeout_fails_when_full_and_uncomsumed() {
        let cb = CircularBuffer::new(4);
        cb.push_back(Bytes::from_static(b"abcd"));
        let result = cb.push_back_timeout(Bytes::from_static(b"e"), Duration::from_millis(50));
        assert!(result.is_err());
    }

    #[test]
    fn peek_timeout_fails_without_enough_data() {
        let cb = CircularBuffer::new(1024);
        cb.push_back(Bytes::from_static(b"ab"));
        let result = cb.peek_timeout(10, Duration::from_millis(50));
        assert!(result.is_err());
    }

    #[test]
    fn producer_consumer_across_threads() {
        let cb = Arc::new(CircularBuffer::new(16));
        let producer = {
            let cb = cb.clone();
            thread::spawn(move || {
                for _ in 0..8 {
                    cb.push_back(Bytes::from_static(b"xyz1"));
                }
            })
        };
        let consumer = {
            let cb = cb.clone();
            thread::spawn(move || {
                let mut total = 0;
                while total < 32 {
                    cb.pop_front(4);
                    total += 4;
                }
                total
            })
        };
        producer.join().unwrap();
        assert_eq!(consumer.join().unwrap(), 32);
    }
}
