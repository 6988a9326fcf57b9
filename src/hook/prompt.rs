//! Dynamic prompt tracking for the line-editing behavior.
//!
//! Whatever the peer last wrote to the console after the final line break is
//! the prompt the user is looking at ("Password: ", "ftp> "). The ring keeps
//! exactly that: the suffix of observed output since the last `\r` or `\n`,
//! truncated to the ring's capacity. The line editor redraws it in front of
//! the input, and echo suppression matches patterns against it.

// Rust guideline compliant 2026-02

use std::collections::VecDeque;

use crate::constants::PROMPT_CAPACITY;

/// Bounded byte ring holding the current partial output line.
///
/// Pushing more than `capacity` bytes drops the oldest ones.
#[derive(Debug, Clone)]
pub struct PromptRing {
    buf: VecDeque<u8>,
    capacity: usize,
}

impl Default for PromptRing {
    fn default() -> Self {
        Self::new(PROMPT_CAPACITY)
    }
}

impl PromptRing {
    /// Creates an empty ring. A zero capacity is raised to one byte.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Feeds bytes just written to the console.
    ///
    /// A line break in `data` starts a new prompt: the ring is cleared and
    /// only the bytes after the last break are kept.
    pub fn observe(&mut self, data: &[u8]) {
        let tail = match data.iter().rposition(|&b| b == b'\r' || b == b'\n') {
            Some(pos) => {
                self.buf.clear();
                &data[pos + 1..]
            }
            None => data,
        };
        self.push(tail);
    }

    /// Appends `data`, evicting the oldest bytes if needed.
    pub fn push(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if data.len() >= self.capacity {
            self.buf.clear();
            self.buf.extend(&data[data.len() - self.capacity..]);
            return;
        }
        let needed = self.buf.len() + data.len();
        if needed > self.capacity {
            self.buf.drain(..needed - self.capacity);
        }
        self.buf.extend(data);
    }

    /// Contiguous copy of the tracked bytes, oldest first.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let (a, b) = self.buf.as_slices();
        let mut v = Vec::with_capacity(a.len() + b.len());
        v.extend_from_slice(a);
        v.extend_from_slice(b);
        v
    }

    /// The tracked bytes as text for the line editor.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.to_vec()).into_owned()
    }

    /// Number of tracked bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Forgets the tracked prompt.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Maximum number of tracked bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Suffix of everything observed since the last line break, capped.
    fn expected(history: &[u8], capacity: usize) -> Vec<u8> {
        let start = history
            .iter()
            .rposition(|&b| b == b'\r' || b == b'\n')
            .map_or(0, |p| p + 1);
        let line = &history[start..];
        line[line.len().saturating_sub(capacity)..].to_vec()
    }

    #[test]
    fn test_partial_line_is_tracked() {
        let mut ring = PromptRing::default();
        ring.observe(b"welcome\nftp");
        ring.observe(b"> ");
        assert_eq!(ring.text(), "ftp> ");
        assert_eq!(ring.capacity(), 512);
    }

    #[test]
    fn test_line_break_starts_over() {
        let mut ring = PromptRing::new(64);
        ring.observe(b"Password: ");
        ring.observe(b"\r\n");
        assert!(ring.is_empty());
        ring.observe(b"ok\r\n$ ");
        assert_eq!(ring.to_vec(), b"$ ");
    }

    #[test]
    fn test_long_line_without_break_keeps_newest_bytes() {
        let mut ring = PromptRing::new(512);
        let data: Vec<u8> = (0..1000u32).map(|i| b'a' + (i % 26) as u8).collect();
        ring.observe(&data);
        assert_eq!(ring.len(), 512);
        assert_eq!(ring.to_vec(), &data[488..]);
    }

    #[test]
    fn test_small_writes_evict_from_front() {
        let mut ring = PromptRing::new(4);
        ring.observe(b"ab");
        ring.observe(b"cd");
        ring.observe(b"ef");
        assert_eq!(ring.to_vec(), b"cdef");
    }

    #[test]
    fn test_ring_matches_suffix_model() {
        let writes: [&[u8]; 7] = [
            b"login: ",
            b"root\r\n",
            b"Pass",
            b"word: ",
            b"xxxxxxxxxxxxxxxxxxxxxxxx",
            b"\nlast\rline",
            b"",
        ];
        let mut ring = PromptRing::new(8);
        let mut history = Vec::new();
        for w in writes {
            ring.observe(w);
            history.extend_from_slice(w);
            assert_eq!(ring.to_vec(), expected(&history, 8));
        }
    }

    #[test]
    fn test_zero_capacity_is_raised() {
        let mut ring = PromptRing::new(0);
        ring.observe(b"xyz");
        assert_eq!(ring.to_vec(), b"z");
    }
}
