//! Output coalescing for high-volume shell output.
//!
//! A shell can emit thousands of small chunks per second (`cat` of a large
//! file). [`OutputCoalescer`] batches them: bytes accumulate until either
//! [`HIGH_WATER_MARK`] is reached (flush immediately) or [`FLUSH_DELAY`] has
//! elapsed since the first unflushed chunk (flush on the timer). Bytes are
//! never reordered, only batched.
//!
//! The coalescer owns no timer itself. It reports a [`deadline`] and the
//! connection task sleeps until it, which keeps all scheduling in one place.
//!
//! [`deadline`]: OutputCoalescer::deadline

use std::time::Duration;

use tokio::time::Instant;

/// Buffered bytes at which a flush happens immediately.
pub const HIGH_WATER_MARK: usize = 8 * 1024;

/// Longest time output waits for more bytes to coalesce with.
pub const FLUSH_DELAY: Duration = Duration::from_millis(5);

#[derive(Debug)]
pub struct OutputCoalescer {
    buf: Vec<u8>,
    deadline: Option<Instant>,
}

impl OutputCoalescer {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(HIGH_WATER_MARK),
            deadline: None,
        }
    }

    /// Append shell output. Returns text to send right away when the buffer
    /// crossed the high-water mark; otherwise arms the flush deadline if it
    /// is not armed yet.
    pub fn push(&mut self, data: &[u8], now: Instant) -> Option<String> {
        self.buf.extend_from_slice(data);
        if self.buf.len() >= HIGH_WATER_MARK {
            self.deadline = None;
            return self.take_complete();
        }
        if self.deadline.is_none() && !self.buf.is_empty() {
            self.deadline = Some(now + FLUSH_DELAY);
        }
        None
    }

    /// When the pending delayed flush is due, if one is scheduled.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Timer flush: emit everything except a trailing incomplete UTF-8
    /// sequence, which waits for the rest of its bytes.
    pub fn flush(&mut self) -> Option<String> {
        self.deadline = None;
        self.take_complete()
    }

    /// Final flush: emit everything, replacing any incomplete sequence.
    pub fn flush_all(&mut self) -> Option<String> {
        self.deadline = None;
        if self.buf.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Some(text)
    }

    /// Drop pending output and cancel the scheduled flush.
    pub fn clear(&mut self) {
        self.buf = Vec::new();
        self.deadline = None;
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    fn take_complete(&mut self) -> Option<String> {
        let keep = incomplete_suffix_len(&self.buf);
        let split = self.buf.len() - keep;
        if split == 0 {
            return None;
        }
        let tail = self.buf.split_off(split);
        let text = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf = tail;
        Some(text)
    }
}

impl Default for OutputCoalescer {
    fn default() -> Self {
        Self::new()
    }
}

/// Length of a UTF-8 sequence at the end of `buf` that has started but not
/// finished (0 when the buffer ends on a character boundary).
fn incomplete_suffix_len(buf: &[u8]) -> usize {
    // A sequence is at most 4 bytes, so only the last 3 can be a partial one.
    for back in 1..=buf.len().min(3) {
        let byte = buf[buf.len() - back];
        if byte & 0xC0 == 0x80 {
            continue; // continuation byte, keep looking for the lead
        }
        let needed = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => return 0,
        };
        return if back < needed { back } else { 0 };
    }
    0
}
