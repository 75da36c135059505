//! Bounded capture of a child process's combined output.
//!
//! Agent processes can run for a long time and produce unbounded output.
//! [`BoundedBuffer`] caps memory usage by keeping only the most recent bytes
//! once the limit is exceeded, since the tail carries the final result and
//! is what matters when diagnosing a failed run. A fixed literal marker
//! replaces whatever was dropped, rather than a window of genuine head
//! bytes — there's nothing sampled from the start of the stream to show.
use std::sync::{Arc, Mutex};

/// Marker prepended to the retained tail once a stream has been truncated.
pub const TRIM_MARKER: &str = "[trim]\n";

/// A capture buffer with a hard byte ceiling.
///
/// While the total written bytes fit within `limit`, the buffer holds the
/// exact stream content. Once it would overflow, the buffer keeps
/// [`TRIM_MARKER`] followed by the most recent `limit - TRIM_MARKER.len()`
/// bytes of the logical concatenation of everything ever written.
#[derive(Clone)]
pub struct BoundedBuffer {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    limit: usize,
    tail: std::collections::VecDeque<u8>,
    total_written: usize,
    truncated: bool,
}

impl BoundedBuffer {
    /// Create a buffer that caps total retained bytes at `limit`.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                limit,
                tail: std::collections::VecDeque::new(),
                total_written: 0,
                truncated: false,
            })),
        }
    }

    /// Append bytes as they are read from the child process.
    #[allow(clippy::missing_panics_doc)]
    pub fn write(&self, chunk: &[u8]) {
        let mut inner = self.inner.lock().expect("bounded buffer mutex poisoned");
        inner.total_written += chunk.len();

        if !inner.truncated && inner.tail.len() + chunk.len() <= inner.limit {
            inner.tail.extend(chunk.iter().copied());
            return;
        }

        inner.truncated = true;
        inner.tail.extend(chunk.iter().copied());

        let tail_budget = inner.limit.saturating_sub(TRIM_MARKER.len());
        while inner.tail.len() > tail_budget {
            inner.tail.pop_front();
        }
    }

    /// True if any bytes were dropped to stay within the limit.
    #[allow(clippy::missing_panics_doc)]
    #[must_use]
    pub fn is_truncated(&self) -> bool {
        self.inner.lock().expect("bounded buffer mutex poisoned").truncated
    }

    /// The total number of bytes ever written, including dropped ones.
    #[allow(clippy::missing_panics_doc)]
    #[must_use]
    pub fn total_written(&self) -> usize {
        self.inner.lock().expect("bounded buffer mutex poisoned").total_written
    }

    /// Render the captured content as a lossy UTF-8 string.
    #[allow(clippy::missing_panics_doc)]
    #[must_use]
    pub fn to_string_lossy(&self) -> String {
        let inner = self.inner.lock().expect("bounded buffer mutex poisoned");
        let tail_bytes: Vec<u8> = inner.tail.iter().copied().collect();
        if !inner.truncated {
            return String::from_utf8_lossy(&tail_bytes).into_owned();
        }
        if inner.limit <= TRIM_MARKER.len() {
            return String::from_utf8_lossy(&TRIM_MARKER.as_bytes()[..inner.limit]).into_owned();
        }
        let mut out = TRIM_MARKER.to_owned();
        out.push_str(&String::from_utf8_lossy(&tail_bytes));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits_within_limit_is_not_truncated() {
        let buf = BoundedBuffer::new(100);
        buf.write(b"hello world");
        assert!(!buf.is_truncated());
        assert_eq!(buf.to_string_lossy(), "hello world");
    }

    #[test]
    fn overflow_keeps_marker_and_recent_tail() {
        let buf = BoundedBuffer::new(20);
        buf.write(b"0123456789");
        buf.write(b"abcdefghijklmnopqrstuvwxyz");
        assert!(buf.is_truncated());
        let out = buf.to_string_lossy();
        assert!(out.starts_with(TRIM_MARKER));
        assert!(out.ends_with("vwxyz"));
        assert!(!out.contains("01234"));
    }

    #[test]
    fn limit_less_equal_marker_yields_truncated_marker_only() {
        let buf = BoundedBuffer::new(4);
        buf.write(b"0123456789extra-bytes-here");
        assert!(buf.is_truncated());
        let out = buf.to_string_lossy();
        assert_eq!(out, TRIM_MARKER[..4]);
    }

    #[test]
    fn total_written_counts_dropped_bytes() {
        let buf = BoundedBuffer::new(5);
        buf.write(b"abcdefghij");
        assert_eq!(buf.total_written(), 10);
    }

    #[test]
    fn many_small_writes_eventually_truncate() {
        let buf = BoundedBuffer::new(16);
        for _ in 0..20 {
            buf.write(b"xy");
        }
        assert!(buf.is_truncated());
        assert_eq!(buf.total_written(), 40);
        let out = buf.to_string_lossy();
        assert!(out.len() <= 16);
        assert!(out.starts_with(TRIM_MARKER));
    }
}
