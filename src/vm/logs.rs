//! Bounded buffer of captured VM output.
//!
//! The cap counts characters (Unicode scalar values), not bytes or lines.
//! Eviction removes whole lines from the front; a single line longer than
//! the cap is cut down to its trailing characters.

use parking_lot::Mutex;
use std::collections::VecDeque;

/// Default cap, in characters.
pub const DEFAULT_LOG_CAP: usize = 10_000;

#[derive(Debug)]
struct Lines {
    lines: VecDeque<String>,
    /// Total characters across `lines`.
    chars: usize,
}

/// Thread-safe ring buffer of output lines.
///
/// One reader thread appends; any number of callers take snapshots. The
/// lock is independent of the lifecycle lock so log reads never wait on a
/// slow start or stop.
#[derive(Debug)]
pub struct LogBuffer {
    inner: Mutex<Lines>,
    cap: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAP)
    }
}

impl LogBuffer {
    /// Create a buffer retaining at most `cap` characters.
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(Lines {
                lines: VecDeque::new(),
                chars: 0,
            }),
            cap: cap.max(1),
        }
    }

    /// Cap in characters.
    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Append one line (without its terminator), evicting the oldest lines
    /// until the total fits under the cap again.
    pub fn append(&self, line: impl Into<String>) {
        let mut line = line.into();
        let mut len = line.chars().count();

        if len > self.cap {
            let skip = len - self.cap;
            line = line.chars().skip(skip).collect();
            len = self.cap;
        }

        let mut inner = self.inner.lock();
        inner.lines.push_back(line);
        inner.chars += len;

        while inner.chars > self.cap {
            match inner.lines.pop_front() {
                Some(old) => inner.chars -= old.chars().count(),
                None => break,
            }
        }
    }

    /// Copy of the last `max_lines` lines, oldest first.
    pub fn snapshot(&self, max_lines: usize) -> Vec<String> {
        let inner = self.inner.lock();
        let start = inner.lines.len().saturating_sub(max_lines);
        inner.lines.iter().skip(start).cloned().collect()
    }

    /// Number of retained lines.
    pub fn len(&self) -> usize {
        self.inner.lock().lines.len()
    }

    /// Whether nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().lines.is_empty()
    }

    /// Number of retained characters.
    pub fn char_count(&self) -> usize {
        self.inner.lock().chars
    }
}
