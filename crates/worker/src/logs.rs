//! Bounded, drop-oldest buffer of captured process output.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

/// Default number of lines kept.
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Shared ring buffer of output lines.
///
/// Writers are the stdout/stderr reader tasks, readers are requests
/// composing a diagnostic. Cloning shares the same buffer.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Append a line, evicting the oldest when full.
    pub fn push(&self, line: impl Into<String>) {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    /// The last `n` lines, oldest first. Does not drain the buffer.
    pub fn recent(&self, n: usize) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = lines.len().saturating_sub(n);
        lines.iter().skip(skip).cloned().collect()
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_oldest_when_full() {
        let buf = LogBuffer::new(3);
        for i in 0..5 {
            buf.push(format!("line {i}"));
        }
        assert_eq!(buf.recent(10), ["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn recent_is_a_snapshot() {
        let buf = LogBuffer::new(10);
        buf.push("a");
        buf.push("b");
        buf.push("c");
        assert_eq!(buf.recent(2), ["b", "c"]);
        assert_eq!(buf.recent(10), ["a", "b", "c"]);
    }

    #[test]
    fn clones_share_storage() {
        let buf = LogBuffer::default();
        let writer = buf.clone();
        writer.push("from writer");
        assert_eq!(buf.recent(1), ["from writer"]);
    }
}
